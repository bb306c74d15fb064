//! NAT gateway driver.
//!
//! The gateway is a router with a single auto-allocating NAT configuration.
//! Creation is rate limited on the provider side, so the poll cadence is
//! slower than for networks. A 409 on create and a 404 on delete are both
//! success paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::convergence::{Driver, Probe};
use crate::error::{ApiError, CloudError, ErrorClass, classify_http};
use crate::pending::PendingOperation;
use crate::provider::ComputeProvider;
use crate::resource::{ResourceDescriptor, ResourceKind, Tuning};

fn default_tuning() -> Tuning {
    Tuning::new(Duration::from_secs(10), Duration::from_secs(5))
}

/// Teardown re-polls slowly; router deletion can take a while to be
/// reflected by the probe.
fn default_teardown_tuning() -> Tuning {
    Tuning::new(Duration::from_secs(30), Duration::from_secs(5))
}

pub struct NatGatewayDriver {
    compute: Arc<dyn ComputeProvider>,
    descriptor: ResourceDescriptor,
    tuning: Tuning,
    network: String,
}

impl NatGatewayDriver {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        name: &str,
        project: &str,
        region: &str,
        network: &str,
    ) -> Self {
        let descriptor = ResourceDescriptor::regional(ResourceKind::NatGateway, name, project, region)
            .with_dependency(network);
        Self {
            compute,
            descriptor,
            tuning: default_tuning(),
            network: network.to_string(),
        }
    }

    pub fn for_teardown(mut self) -> Self {
        self.tuning = default_teardown_tuning();
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    fn region(&self) -> &str {
        self.descriptor.region.as_deref().unwrap_or_default()
    }
}

#[async_trait]
impl Driver for NatGatewayDriver {
    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    async fn probe(&mut self) -> Result<Probe, CloudError> {
        let exists = self
            .compute
            .router_exists(self.region(), &self.descriptor.name)
            .await
            .map_err(|e| CloudError::Fatal {
                descriptor: self.descriptor.clone(),
                source: e,
            })?;
        Ok(if exists { Probe::Exists } else { Probe::Absent })
    }

    async fn create(&mut self) -> Result<(), ApiError> {
        self.compute
            .create_router(self.region(), &self.descriptor.name, &self.network)
            .await
    }

    async fn delete(&mut self) -> Result<Option<PendingOperation>, ApiError> {
        self.compute
            .delete_router(self.region(), &self.descriptor.name)
            .await?;
        Ok(None)
    }

    fn classify(&self, err: &ApiError) -> ErrorClass {
        classify_http(err)
    }
}
