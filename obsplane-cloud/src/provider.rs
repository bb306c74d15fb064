//! Opaque provider API boundary.
//!
//! The cloud provider is a black box beyond its documented status codes and
//! payload shapes. Drivers talk to it through these traits; production code
//! injects the HTTP implementation from [`crate::http`], tests inject
//! in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::pending::{OperationStatus, PendingOperation};

/// A subnetwork as reported by the provider's list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetworkInfo {
    pub name: String,
    pub region: String,
    /// Full or partial URL of the parent network.
    pub network: String,
}

impl SubnetworkInfo {
    /// Trailing path segment of the parent network URL.
    pub fn network_name(&self) -> &str {
        self.network.rsplit('/').next().unwrap_or(&self.network)
    }
}

/// A route as reported by the provider's list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    pub name: String,
    pub network: String,
    /// Set when the route forwards into another network; such routes belong
    /// to the network itself and disappear with it.
    #[serde(default, rename = "nextHopNetwork")]
    pub next_hop_network: Option<String>,
}

impl RouteInfo {
    pub fn network_name(&self) -> &str {
        self.network.rsplit('/').next().unwrap_or(&self.network)
    }

    /// Provider-generated peering routes cannot be deleted by anyone but the
    /// provider. They are recognized by naming convention only.
    pub fn is_auto_generated_peering(&self) -> bool {
        self.name.starts_with("peering-route-")
    }
}

/// A bucket as reported by the provider's list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub location: String,
}

/// A service account as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountInfo {
    pub name: String,
    pub email: String,
    #[serde(default, rename = "projectId")]
    pub project_id: String,
}

/// One role-to-members binding in a project IAM policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// A project IAM policy. Bindings can only be replaced wholesale: read the
/// policy, modify, write the whole thing back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IamPolicy {
    #[serde(default)]
    pub bindings: Vec<PolicyBinding>,
}

/// Compute-plane operations: networks, subnetworks, routers, routes.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn network_exists(&self, name: &str) -> Result<bool, ApiError>;
    async fn create_network(&self, name: &str) -> Result<(), ApiError>;
    /// Returns a handle for the asynchronous delete.
    async fn delete_network(&self, name: &str) -> Result<PendingOperation, ApiError>;

    /// Lists every subnetwork visible in the project. There is no direct
    /// get-by-name for this resource kind.
    async fn list_subnetworks(&self) -> Result<Vec<SubnetworkInfo>, ApiError>;
    async fn create_subnetwork(
        &self,
        region: &str,
        network: &str,
        name: &str,
        cidr: &str,
    ) -> Result<(), ApiError>;
    async fn delete_subnetwork(
        &self,
        region: &str,
        name: &str,
    ) -> Result<PendingOperation, ApiError>;

    async fn router_exists(&self, region: &str, name: &str) -> Result<bool, ApiError>;
    /// Creates a router carrying a single auto-allocating NAT configuration.
    async fn create_router(&self, region: &str, name: &str, network: &str)
    -> Result<(), ApiError>;
    async fn delete_router(&self, region: &str, name: &str) -> Result<(), ApiError>;

    async fn list_routes(&self) -> Result<Vec<RouteInfo>, ApiError>;
    async fn delete_route(&self, name: &str) -> Result<(), ApiError>;

    async fn operation_status(&self, op: &PendingOperation) -> Result<OperationStatus, ApiError>;
}

/// Object-storage operations.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, ApiError>;
    async fn create_bucket(&self, name: &str, location: &str) -> Result<(), ApiError>;
    /// Replaces the bucket's whole lifecycle rule set with a single
    /// delete-after-`days` rule. Replace, not merge.
    async fn set_bucket_lifecycle(&self, name: &str, days: u32) -> Result<(), ApiError>;
}

/// IAM operations.
#[async_trait]
pub trait IamProvider: Send + Sync {
    /// Lookup by email; the opaque unique id is unknown before creation.
    async fn get_service_account(&self, email: &str)
    -> Result<Option<ServiceAccountInfo>, ApiError>;
    async fn create_service_account(
        &self,
        account_id: &str,
    ) -> Result<ServiceAccountInfo, ApiError>;
    async fn delete_service_account(&self, email: &str) -> Result<(), ApiError>;

    async fn get_project_policy(&self) -> Result<IamPolicy, ApiError>;
    async fn set_project_policy(&self, policy: &IamPolicy) -> Result<(), ApiError>;
    /// Grants the workload-identity role on the service account to the given
    /// in-cluster service account.
    async fn set_workload_identity_binding(
        &self,
        sa_email: &str,
        cluster_service_account: &str,
    ) -> Result<(), ApiError>;
}
