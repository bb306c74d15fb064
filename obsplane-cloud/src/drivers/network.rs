//! VPC network driver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::convergence::{Driver, Probe};
use crate::error::{ApiError, CloudError, ErrorClass, classify_compute_create};
use crate::pending::{OperationStatus, PendingOperation};
use crate::provider::ComputeProvider;
use crate::resource::{ResourceDescriptor, ResourceKind, Tuning};
use crate::sequencer::drain_network_routes;

/// Networks settle quickly, but the provider needs time to detach routes
/// after a dependent subnetwork deletion before the network itself can go.
fn default_tuning() -> Tuning {
    Tuning::new(Duration::from_secs(1), Duration::from_secs(5))
        .with_settle(Duration::from_secs(20))
}

pub struct NetworkDriver {
    compute: Arc<dyn ComputeProvider>,
    descriptor: ResourceDescriptor,
    tuning: Tuning,
}

impl NetworkDriver {
    pub fn new(compute: Arc<dyn ComputeProvider>, name: &str, project: &str) -> Self {
        Self {
            compute,
            descriptor: ResourceDescriptor::global(ResourceKind::Network, name, project),
            tuning: default_tuning(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    fn fatal(&self, source: ApiError) -> CloudError {
        CloudError::Fatal {
            descriptor: self.descriptor.clone(),
            source,
        }
    }
}

#[async_trait]
impl Driver for NetworkDriver {
    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    async fn probe(&mut self) -> Result<Probe, CloudError> {
        let exists = self
            .compute
            .network_exists(&self.descriptor.name)
            .await
            .map_err(|e| self.fatal(e))?;
        Ok(if exists { Probe::Exists } else { Probe::Absent })
    }

    async fn create(&mut self) -> Result<(), ApiError> {
        self.compute.create_network(&self.descriptor.name).await
    }

    /// Routes referencing the network must be gone before its delete is
    /// accepted. Re-checked every iteration.
    async fn pre_delete(&mut self) -> Result<bool, CloudError> {
        drain_network_routes(
            self.compute.as_ref(),
            &self.descriptor,
            &self.descriptor.name,
        )
        .await
    }

    async fn delete(&mut self) -> Result<Option<PendingOperation>, ApiError> {
        let op = self.compute.delete_network(&self.descriptor.name).await?;
        Ok(Some(op))
    }

    async fn operation_status(
        &mut self,
        op: &PendingOperation,
    ) -> Result<OperationStatus, ApiError> {
        self.compute.operation_status(op).await
    }

    fn classify(&self, err: &ApiError) -> ErrorClass {
        classify_compute_create(err)
    }
}
