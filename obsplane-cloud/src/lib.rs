//! Cloud resource convergence engine for obsplane.
//!
//! This crate drives individual cloud resources (VPC network, subnetwork,
//! NAT gateway, storage buckets, IAM service accounts) from their observed
//! state to a declared target state via repeated probe/act cycles. The
//! provider control plane is eventually consistent and failure prone, so
//! nothing here trusts the return value of a create or delete call: success
//! is only ever declared after a subsequent probe confirms it.

pub mod convergence;
pub mod drivers;
pub mod error;
pub mod http;
pub mod pending;
pub mod provider;
pub mod resource;
pub mod sequencer;

pub use convergence::{Driver, Probe, ensure_absent, ensure_exists};
pub use error::{ApiError, CloudError, ErrorClass};
pub use pending::{OperationStatus, PendingOperation};
pub use provider::{ComputeProvider, IamProvider, StorageProvider};
pub use resource::{ConvergenceState, ResourceDescriptor, ResourceKind, Tuning};
pub use sequencer::{CloudProviders, CloudSpec, DependencySequencer};
