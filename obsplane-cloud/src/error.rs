//! Error taxonomy for provider interactions.
//!
//! Provider APIs report failures as HTTP status codes plus a message. Each
//! driver maps those raw errors onto a closed classification that the
//! convergence loops act on, so the retry/ignore/abort decision is encoded
//! in one testable place per resource kind instead of scattered status-code
//! checks.

use thiserror::Error;

use crate::resource::ResourceDescriptor;

/// Raw error returned by a provider API call.
///
/// `status` is the HTTP status code; `0` means the request never produced a
/// response (transport failure, malformed body).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error (status {status}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Transport-level failure: no HTTP status available.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }
}

/// Semantic classification of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Resource already exists (concurrent or duplicate create). Benign:
    /// re-probe and continue.
    Conflict,
    /// Resource already gone (concurrent or duplicate delete). Benign:
    /// treat as success.
    NotFound,
    /// A prerequisite resource is not yet usable. Back off and retry.
    DependencyNotReady,
    /// Everything else: auth failure, malformed response, quota, permanent
    /// rejection. Aborts convergence for this resource.
    Fatal,
}

/// Default status-code classification shared by the compute drivers.
pub fn classify_http(err: &ApiError) -> ErrorClass {
    match err.status {
        409 => ErrorClass::Conflict,
        404 => ErrorClass::NotFound,
        _ => ErrorClass::Fatal,
    }
}

/// Classification for network/subnetwork creates, where the provider rejects
/// with 400 while a referenced parent resource is still materializing.
pub fn classify_compute_create(err: &ApiError) -> ErrorClass {
    if err.status == 400 && err.message.contains("not ready") {
        return ErrorClass::DependencyNotReady;
    }
    classify_http(err)
}

/// Errors surfaced by a convergence attempt.
#[derive(Debug, Error)]
pub enum CloudError {
    /// A provider call failed with an error classified as fatal.
    #[error("{descriptor}: {source}")]
    Fatal {
        descriptor: ResourceDescriptor,
        #[source]
        source: ApiError,
    },

    /// An asynchronous provider-side operation was accepted and later
    /// reported failure.
    #[error("{descriptor}: operation {operation} failed: {source}")]
    OperationFailed {
        descriptor: ResourceDescriptor,
        operation: String,
        #[source]
        source: ApiError,
    },

    /// The provider returned a response shape we refuse to interpret.
    /// Deliberately fatal rather than a silent "not found".
    #[error("{descriptor}: unexpected provider response: {detail}")]
    MalformedResponse {
        descriptor: ResourceDescriptor,
        detail: String,
    },

    /// Observed state contradicts an assumption this system relies on.
    #[error("{descriptor}: invariant violated: {detail}")]
    InvariantViolation {
        descriptor: ResourceDescriptor,
        detail: String,
    },

    /// Shutdown was requested while the convergence loop was in flight.
    #[error("{descriptor}: convergence cancelled")]
    Cancelled { descriptor: ResourceDescriptor },

    /// A dependency failed to converge, so this resource was never driven.
    #[error("{descriptor}: dependency {dependency} did not converge")]
    DependencyFailed {
        descriptor: ResourceDescriptor,
        dependency: String,
    },
}

impl CloudError {
    pub fn descriptor(&self) -> &ResourceDescriptor {
        match self {
            CloudError::Fatal { descriptor, .. }
            | CloudError::OperationFailed { descriptor, .. }
            | CloudError::MalformedResponse { descriptor, .. }
            | CloudError::InvariantViolation { descriptor, .. }
            | CloudError::Cancelled { descriptor }
            | CloudError::DependencyFailed { descriptor, .. } => descriptor,
        }
    }
}
