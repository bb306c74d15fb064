//! Controller configuration.

use std::time::Duration;

use obsplane_cloud::sequencer::{BucketSpec, CloudSpec, ServiceAccountSpec};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Canonical cluster name; doubles as the name of the network,
    /// subnetwork and NAT gateway.
    pub cluster_name: String,
    pub project: String,
    pub region: String,
    pub subnet_cidr: String,
    /// Namespace holding the controller's own objects (tenant store).
    pub namespace: String,
    pub metrics_retention_days: u32,
    pub logs_retention_days: u32,
    /// Timer-tick cadence for drift-catching reconciliation passes.
    pub reconcile_interval: Duration,
    /// `0` disables the metrics endpoint.
    pub metrics_port: u16,
}

impl ControllerConfig {
    /// The cloud footprint derived from this configuration.
    pub fn cloud_spec(&self) -> CloudSpec {
        CloudSpec {
            cluster_name: self.cluster_name.clone(),
            project: self.project.clone(),
            region: self.region.clone(),
            subnet_cidr: self.subnet_cidr.clone(),
            buckets: vec![
                BucketSpec {
                    name: format!("{}-metrics", self.cluster_name),
                    retention_days: self.metrics_retention_days,
                },
                BucketSpec {
                    name: format!("{}-logs", self.cluster_name),
                    retention_days: self.logs_retention_days,
                },
            ],
            service_accounts: vec![
                ServiceAccountSpec {
                    account_id: format!("{}-metrics", self.cluster_name),
                    role: "roles/storage.admin".into(),
                    cluster_service_account: format!("{}/metrics-writer", self.namespace),
                },
                ServiceAccountSpec {
                    account_id: format!("{}-logs", self.cluster_name),
                    role: "roles/storage.admin".into(),
                    cluster_service_account: format!("{}/logs-writer", self.namespace),
                },
            ],
        }
    }
}
