//! obsplane reconciliation controller.
//!
//! Watches the cluster through per-kind informers merged into one event
//! stream, mirrors what it sees into an in-memory cache, and on every event
//! (or timer tick) diffs the desired state for the configured tenants
//! against the cache, issuing corrective create/update/delete calls and
//! driving the cloud footprint through the convergence engine.

pub mod cluster;
pub mod config;
pub mod desired;
pub mod informer;
pub mod metrics;
pub mod reconciler;
pub mod state;
pub mod tenants;

#[cfg(test)]
mod testutil;

pub use cluster::{ClusterApi, ClusterError, ClusterKind, ClusterObject, ObjectKey, WatchEvent};
pub use config::ControllerConfig;
pub use state::{ObservedClusterState, SharedState};
pub use tenants::{TenantRecord, TenantStore, TenantType};
