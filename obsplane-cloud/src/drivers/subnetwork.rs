//! Subnetwork driver.
//!
//! The provider offers no direct get-by-name for subnetworks, so existence
//! is determined by listing every subnetwork in the project and matching on
//! the parent network name. A list response we cannot interpret is a fatal
//! error, never a silent "not found".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::convergence::{Driver, Probe};
use crate::error::{ApiError, CloudError, ErrorClass, classify_compute_create};
use crate::pending::{OperationStatus, PendingOperation};
use crate::provider::ComputeProvider;
use crate::resource::{ResourceDescriptor, ResourceKind, Tuning};

fn default_tuning() -> Tuning {
    Tuning::new(Duration::from_secs(1), Duration::from_secs(5))
}

pub struct SubnetworkDriver {
    compute: Arc<dyn ComputeProvider>,
    descriptor: ResourceDescriptor,
    tuning: Tuning,
    network: String,
    cidr: String,
    /// Region the probe last observed the subnetwork in.
    observed_region: Option<String>,
}

impl SubnetworkDriver {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        name: &str,
        project: &str,
        region: &str,
        network: &str,
        cidr: &str,
    ) -> Self {
        let descriptor = ResourceDescriptor::regional(ResourceKind::Subnetwork, name, project, region)
            .with_dependency(network);
        Self {
            compute,
            descriptor,
            tuning: default_tuning(),
            network: network.to_string(),
            cidr: cidr.to_string(),
            observed_region: None,
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

    fn region(&self) -> &str {
        self.descriptor.region.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl Driver for SubnetworkDriver {
    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    async fn probe(&mut self) -> Result<Probe, CloudError> {
        let subnets = self
            .compute
            .list_subnetworks()
            .await
            .map_err(|e| self.fatal(e))?;

        // One subnetwork per network by construction; match on the parent
        // network name, not the subnetwork name.
        match subnets.iter().find(|s| s.network_name() == self.network) {
            Some(found) => {
                self.observed_region = Some(found.region.clone());
                Ok(Probe::Exists)
            }
            None => {
                self.observed_region = None;
                Ok(Probe::Absent)
            }
        }
    }

    async fn create(&mut self) -> Result<(), ApiError> {
        let network_path = format!(
            "projects/{}/global/networks/{}",
            self.descriptor.project, self.network
        );
        self.compute
            .create_subnetwork(
                self.region(),
                &network_path,
                &self.descriptor.name,
                &self.cidr,
            )
            .await
    }

    /// Deleting a subnetwork observed in a different region than the one we
    /// were asked to tear down in would mean our naming assumptions broke;
    /// refuse rather than delete someone else's subnetwork.
    async fn pre_delete(&mut self) -> Result<bool, CloudError> {
        if let Some(observed) = &self.observed_region {
            if observed != self.region() {
                return Err(CloudError::InvariantViolation {
                    descriptor: self.descriptor.clone(),
                    detail: format!(
                        "observed in region {} but tearing down in {}",
                        observed,
                        self.region()
                    ),
                });
            }
        }
        Ok(true)
    }

    async fn delete(&mut self) -> Result<Option<PendingOperation>, ApiError> {
        let op = self
            .compute
            .delete_subnetwork(self.region(), &self.descriptor.name)
            .await?;
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
