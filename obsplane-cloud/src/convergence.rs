//! The convergence primitive: ensure-exists / ensure-absent loops.
//!
//! Both directions share one loop shape: probe observed state, decide an
//! action, execute it, sleep, repeat, until a terminal condition holds. The
//! loops have no iteration bound; callers impose timeouts or cancellation
//! externally through the shutdown signal, which is observed at every
//! suspension point.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ApiError, CloudError, ErrorClass};
use crate::pending::{OperationStatus, PendingOperation};
use crate::resource::{ConvergenceState, ResourceDescriptor, Tuning};

/// Observed existence of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Exists,
    Absent,
}

/// One resource kind's connection between the convergence loops and the
/// provider API. Drivers are stateless between convergence calls except for
/// the pending-operation handle held by an in-flight delete loop.
#[async_trait]
pub trait Driver: Send {
    fn descriptor(&self) -> &ResourceDescriptor;
    fn tuning(&self) -> &Tuning;

    async fn probe(&mut self) -> Result<Probe, CloudError>;
    async fn create(&mut self) -> Result<(), ApiError>;

    /// Idempotent follow-up work applied once per convergence attempt after
    /// existence is confirmed (e.g. lifecycle policy, IAM bindings).
    async fn post_exists(&mut self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Deletion precondition, re-evaluated on every iteration because
    /// preconditions can regress. Returning false postpones the delete.
    async fn pre_delete(&mut self) -> Result<bool, CloudError> {
        Ok(true)
    }

    /// Issues the delete. May return a handle when the provider only
    /// acknowledged the request.
    async fn delete(&mut self) -> Result<Option<PendingOperation>, ApiError>;

    async fn operation_status(
        &mut self,
        op: &PendingOperation,
    ) -> Result<OperationStatus, ApiError> {
        let _ = op;
        Ok(OperationStatus::Done)
    }

    /// Maps this resource kind's provider errors onto the closed taxonomy.
    fn classify(&self, err: &ApiError) -> ErrorClass;
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleeps for `duration` unless shutdown is signalled first. Returns false
/// on shutdown.
pub async fn sleep_unless_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if duration.is_zero() {
        return !shutdown_requested(shutdown);
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

/// Resolves once shutdown is signalled (or the sender is gone).
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        // A dropped sender counts as shutdown.
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Drives the resource to `Present`. Idempotent: safe to call any number of
/// times. Success is only declared after a probe confirms existence, since
/// creation may be asynchronous or rejected silently by the provider.
pub async fn ensure_exists<D: Driver + ?Sized>(
    driver: &mut D,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ConvergenceState, CloudError> {
    let descriptor = driver.descriptor().clone();
    let tuning = driver.tuning().clone();
    debug!(resource = %descriptor, "converging towards present");

    loop {
        if shutdown_requested(shutdown) {
            return Err(CloudError::Cancelled { descriptor });
        }

        match driver.probe().await? {
            Probe::Exists => match driver.post_exists().await {
                Ok(()) => {
                    info!(resource = %descriptor, "present");
                    return Ok(ConvergenceState::Present);
                }
                Err(e) => match driver.classify(&e) {
                    ErrorClass::Conflict => {
                        // A concurrent actor applied the same follow-up.
                        info!(resource = %descriptor, "present");
                        return Ok(ConvergenceState::Present);
                    }
                    ErrorClass::NotFound => {
                        // Resource vanished between probe and follow-up.
                        debug!(resource = %descriptor, "disappeared during follow-up, re-probing");
                    }
                    ErrorClass::DependencyNotReady => {
                        info!(resource = %descriptor, error = %e, "follow-up not ready, backing off");
                        if !sleep_unless_shutdown(tuning.dependency_backoff, shutdown).await {
                            return Err(CloudError::Cancelled { descriptor });
                        }
                        continue;
                    }
                    ErrorClass::Fatal => {
                        return Err(CloudError::Fatal {
                            descriptor,
                            source: e,
                        });
                    }
                },
            },
            Probe::Absent => {
                debug!(resource = %descriptor, state = %ConvergenceState::Creating, "issuing create");
                match driver.create().await {
                    Ok(()) => {
                        debug!(resource = %descriptor, "create accepted, confirming with re-probe");
                    }
                    Err(e) => match driver.classify(&e) {
                        ErrorClass::Conflict => {
                            debug!(resource = %descriptor, "create conflicted, assuming concurrent creator");
                        }
                        ErrorClass::DependencyNotReady => {
                            info!(resource = %descriptor, error = %e, "dependency not ready, retrying create");
                            if !sleep_unless_shutdown(tuning.dependency_backoff, shutdown).await {
                                return Err(CloudError::Cancelled { descriptor });
                            }
                            continue;
                        }
                        ErrorClass::NotFound | ErrorClass::Fatal => {
                            warn!(resource = %descriptor, error = %e, "create failed");
                            return Err(CloudError::Fatal {
                                descriptor,
                                source: e,
                            });
                        }
                    },
                }
            }
        }

        if !sleep_unless_shutdown(tuning.poll_interval, shutdown).await {
            return Err(CloudError::Cancelled { descriptor });
        }
    }
}

/// Drives the resource to `Gone`. Never re-issues a delete while an
/// asynchronous one is outstanding, and never declares success until a probe
/// confirms absence: the provider may acknowledge a delete request long
/// before the resource actually disappears.
pub async fn ensure_absent<D: Driver + ?Sized>(
    driver: &mut D,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ConvergenceState, CloudError> {
    let descriptor = driver.descriptor().clone();
    let tuning = driver.tuning().clone();
    let mut pending: Option<PendingOperation> = None;
    let mut settled = tuning.pre_delete_settle.is_zero();
    debug!(resource = %descriptor, "converging towards absent");

    loop {
        if shutdown_requested(shutdown) {
            if pending.take().is_some() {
                debug!(resource = %descriptor, "releasing pending operation on shutdown");
            }
            return Err(CloudError::Cancelled { descriptor });
        }

        if let Probe::Absent = driver.probe().await? {
            info!(resource = %descriptor, "gone");
            return Ok(ConvergenceState::Gone);
        }

        if let Some(op) = pending.clone() {
            match driver.operation_status(&op).await {
                Ok(OperationStatus::Running) => {
                    debug!(resource = %descriptor, operation = %op.handle, "delete still running");
                }
                Ok(OperationStatus::Done) => {
                    // Acknowledged complete; the next probe confirms.
                    debug!(resource = %descriptor, operation = %op.handle, "delete reported done");
                    pending = None;
                }
                Ok(OperationStatus::Failed(e)) => {
                    return Err(CloudError::OperationFailed {
                        descriptor,
                        operation: op.handle,
                        source: e,
                    });
                }
                Err(e) => match driver.classify(&e) {
                    ErrorClass::NotFound => {
                        pending = None;
                    }
                    _ => {
                        return Err(CloudError::Fatal {
                            descriptor,
                            source: e,
                        });
                    }
                },
            }
            if !sleep_unless_shutdown(tuning.poll_interval, shutdown).await {
                return Err(CloudError::Cancelled { descriptor });
            }
            continue;
        }

        if !settled {
            debug!(resource = %descriptor, settle = ?tuning.pre_delete_settle, "waiting for provider to settle");
            if !sleep_unless_shutdown(tuning.pre_delete_settle, shutdown).await {
                return Err(CloudError::Cancelled { descriptor });
            }
            settled = true;
        }

        if !driver.pre_delete().await? {
            debug!(resource = %descriptor, "delete precondition not met yet");
            if !sleep_unless_shutdown(tuning.poll_interval, shutdown).await {
                return Err(CloudError::Cancelled { descriptor });
            }
            continue;
        }

        debug!(resource = %descriptor, state = %ConvergenceState::Deleting, "issuing delete");
        match driver.delete().await {
            Ok(op) => {
                pending = op;
            }
            Err(e) => match driver.classify(&e) {
                ErrorClass::NotFound => {
                    debug!(resource = %descriptor, "already deleted by a concurrent actor");
                }
                ErrorClass::DependencyNotReady => {
                    info!(resource = %descriptor, error = %e, "delete not ready, backing off");
                    if !sleep_unless_shutdown(tuning.dependency_backoff, shutdown).await {
                        return Err(CloudError::Cancelled { descriptor });
                    }
                    continue;
                }
                ErrorClass::Conflict | ErrorClass::Fatal => {
                    warn!(resource = %descriptor, error = %e, "delete failed");
                    return Err(CloudError::Fatal {
                        descriptor,
                        source: e,
                    });
                }
            },
        }

        if !sleep_unless_shutdown(tuning.poll_interval, shutdown).await {
            return Err(CloudError::Cancelled { descriptor });
        }
    }
}
