//! Storage bucket driver.
//!
//! Ensure-exists also pins the retention lifecycle: the whole rule set is
//! replaced with a single delete-after-N-days rule once per convergence
//! attempt, so a retention change converges without recreating the bucket.
//! "Emptying" a bucket is expressed as a 0-day retention lifecycle; objects
//! are never deleted one by one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::convergence::{Driver, Probe};
use crate::error::{ApiError, CloudError, ErrorClass, classify_http};
use crate::pending::PendingOperation;
use crate::provider::StorageProvider;
use crate::resource::{ResourceDescriptor, ResourceKind, Tuning};

fn default_tuning() -> Tuning {
    Tuning::new(Duration::from_secs(1), Duration::from_secs(5))
}

pub struct BucketDriver {
    storage: Arc<dyn StorageProvider>,
    descriptor: ResourceDescriptor,
    tuning: Tuning,
    location: String,
    retention_days: u32,
    lifecycle_applied: bool,
}

impl BucketDriver {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        name: &str,
        project: &str,
        location: &str,
        retention_days: u32,
    ) -> Self {
        Self {
            storage,
            descriptor: ResourceDescriptor::regional(ResourceKind::Bucket, name, project, location),
            tuning: default_tuning(),
            location: location.to_string(),
            retention_days,
            lifecycle_applied: false,
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }
}

#[async_trait]
impl Driver for BucketDriver {
    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    async fn probe(&mut self) -> Result<Probe, CloudError> {
        let buckets = self
            .storage
            .list_buckets()
            .await
            .map_err(|e| CloudError::Fatal {
                descriptor: self.descriptor.clone(),
                source: e,
            })?;
        Ok(if buckets.iter().any(|b| b.name == self.descriptor.name) {
            Probe::Exists
        } else {
            Probe::Absent
        })
    }

    async fn create(&mut self) -> Result<(), ApiError> {
        self.storage
            .create_bucket(&self.descriptor.name, &self.location)
            .await?;
        self.storage
            .set_bucket_lifecycle(&self.descriptor.name, self.retention_days)
            .await?;
        self.lifecycle_applied = true;
        Ok(())
    }

    /// The retention rule is re-asserted once per convergence attempt even
    /// when the bucket already existed, so retention changes take effect.
    async fn post_exists(&mut self) -> Result<(), ApiError> {
        if self.lifecycle_applied {
            return Ok(());
        }
        debug!(bucket = %self.descriptor.name, days = self.retention_days, "setting lifecycle");
        self.storage
            .set_bucket_lifecycle(&self.descriptor.name, self.retention_days)
            .await?;
        self.lifecycle_applied = true;
        Ok(())
    }

    async fn delete(&mut self) -> Result<Option<PendingOperation>, ApiError> {
        // Buckets are never torn down directly; see `empty_bucket`.
        Err(ApiError::new(400, "bucket teardown goes through empty_bucket"))
    }

    fn classify(&self, err: &ApiError) -> ErrorClass {
        classify_http(err)
    }
}

/// Sets a 0-day retention lifecycle on the bucket so the provider drains its
/// contents. Idempotent; succeeds if the bucket is already gone.
pub async fn empty_bucket(
    storage: &dyn StorageProvider,
    name: &str,
    project: &str,
) -> Result<(), CloudError> {
    let descriptor = ResourceDescriptor::global(ResourceKind::Bucket, name, project);
    let buckets = storage.list_buckets().await.map_err(|e| CloudError::Fatal {
        descriptor: descriptor.clone(),
        source: e,
    })?;
    if !buckets.iter().any(|b| b.name == name) {
        return Ok(());
    }

    info!(bucket = %name, "emptying via 0-day retention lifecycle");
    match storage.set_bucket_lifecycle(name, 0).await {
        Ok(()) => Ok(()),
        Err(e) => match classify_http(&e) {
            ErrorClass::Conflict | ErrorClass::NotFound => Ok(()),
            _ => Err(CloudError::Fatal {
                descriptor,
                source: e,
            }),
        },
    }
}
