//! Resource identity and convergence lifecycle types.

use std::fmt;
use std::time::Duration;

/// Kinds of external resources this engine converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Network,
    Subnetwork,
    NatGateway,
    Bucket,
    ServiceAccount,
    TenantRecord,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnetwork => "subnetwork",
            ResourceKind::NatGateway => "nat-gateway",
            ResourceKind::Bucket => "bucket",
            ResourceKind::ServiceAccount => "service-account",
            ResourceKind::TenantRecord => "tenant-record",
        };
        f.write_str(s)
    }
}

/// Identity of a single external resource instance for one convergence
/// attempt. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub name: String,
    pub project: String,
    /// Region scope; global resources (network, service account) leave this
    /// empty.
    pub region: Option<String>,
    /// Names of resources that must exist before this one can be created.
    pub depends_on: Vec<String>,
}

impl ResourceDescriptor {
    pub fn global(kind: ResourceKind, name: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            project: project.into(),
            region: None,
            depends_on: Vec::new(),
        }
    }

    pub fn regional(
        kind: ResourceKind,
        name: impl Into<String>,
        project: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            project: project.into(),
            region: Some(region.into()),
            depends_on: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{} {}/{}/{}", self.kind, self.project, region, self.name),
            None => write!(f, "{} {}/{}", self.kind, self.project, self.name),
        }
    }
}

/// Lifecycle of one convergence attempt. Transitions are driven only by
/// probe results and action outcomes, never assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceState {
    Absent,
    Creating,
    Present,
    Deleting,
    Gone,
    Failed(String),
}

impl fmt::Display for ConvergenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceState::Absent => f.write_str("absent"),
            ConvergenceState::Creating => f.write_str("creating"),
            ConvergenceState::Present => f.write_str("present"),
            ConvergenceState::Deleting => f.write_str("deleting"),
            ConvergenceState::Gone => f.write_str("gone"),
            ConvergenceState::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Per-driver timing knobs. The values are policy, not correctness; each
/// driver ships defaults matching how fast its resource kind settles.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Sleep between probe iterations when no immediate retry is scheduled.
    pub poll_interval: Duration,
    /// Sleep before retrying a create rejected with DependencyNotReady.
    pub dependency_backoff: Duration,
    /// Grace period before the first delete attempt, for providers that need
    /// settle time after a dependent deletion.
    pub pre_delete_settle: Duration,
}

impl Tuning {
    pub fn new(poll_interval: Duration, dependency_backoff: Duration) -> Self {
        Self {
            poll_interval,
            dependency_backoff,
            pre_delete_settle: Duration::ZERO,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.pre_delete_settle = settle;
        self
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(5))
    }
}
