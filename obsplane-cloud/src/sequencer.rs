//! Cross-resource ordering.
//!
//! Individual drivers cannot see ordering invariants that span resource
//! kinds; this component owns them. Creation runs Network → Subnetwork →
//! NAT gateway, teardown runs the reverse, and a network delete is gated on
//! its routes being drained first. Preconditions are re-evaluated on every
//! iteration rather than cached, because they can regress underneath us.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::convergence::{Driver, ensure_absent, ensure_exists};
use crate::drivers::{
    BucketDriver, NatGatewayDriver, NetworkDriver, ServiceAccountDriver, SubnetworkDriver,
    empty_bucket,
};
use crate::error::{ApiError, CloudError};
use crate::provider::{ComputeProvider, IamProvider, StorageProvider};
use crate::resource::{ConvergenceState, ResourceDescriptor, ResourceKind};

/// The injected provider API surfaces.
#[derive(Clone)]
pub struct CloudProviders {
    pub compute: Arc<dyn ComputeProvider>,
    pub storage: Arc<dyn StorageProvider>,
    pub iam: Arc<dyn IamProvider>,
}

#[derive(Debug, Clone)]
pub struct BucketSpec {
    pub name: String,
    pub retention_days: u32,
}

#[derive(Debug, Clone)]
pub struct ServiceAccountSpec {
    pub account_id: String,
    pub role: String,
    pub cluster_service_account: String,
}

/// Desired cloud-side footprint for one cluster.
#[derive(Debug, Clone)]
pub struct CloudSpec {
    pub cluster_name: String,
    pub project: String,
    pub region: String,
    pub subnet_cidr: String,
    pub buckets: Vec<BucketSpec>,
    pub service_accounts: Vec<ServiceAccountSpec>,
}

pub type ConvergenceOutcome = (ResourceDescriptor, Result<ConvergenceState, CloudError>);

/// Deletes every regular route referencing `network`. Provider-generated
/// `peering-route-*` entries cannot be deleted by anyone but the provider
/// and are skipped; a lone remaining one does not block. Returns true once a
/// fresh listing shows zero regular routes.
pub async fn drain_network_routes(
    compute: &dyn ComputeProvider,
    descriptor: &ResourceDescriptor,
    network: &str,
) -> Result<bool, CloudError> {
    let fatal = |source: ApiError| CloudError::Fatal {
        descriptor: descriptor.clone(),
        source,
    };

    let routes = compute.list_routes().await.map_err(fatal)?;

    // Routes whose next hop is the network itself belong to the network and
    // disappear with it; they are not ours to drain.
    let referencing: Vec<_> = routes
        .iter()
        .filter(|r| {
            r.network_name() == network
                && r.next_hop_network
                    .as_deref()
                    .map(|n| n.rsplit('/').next().unwrap_or(n) != network)
                    .unwrap_or(true)
        })
        .collect();

    let drained = referencing.iter().all(|r| r.is_auto_generated_peering());

    for route in referencing {
        if route.is_auto_generated_peering() {
            continue;
        }
        info!(route = %route.name, network = %network, "deleting route");
        match compute.delete_route(&route.name).await {
            Ok(()) => {}
            Err(e) if e.status == 404 => {}
            Err(e) => return Err(fatal(e)),
        }
    }

    Ok(drained)
}

pub struct DependencySequencer {
    providers: CloudProviders,
}

impl DependencySequencer {
    pub fn new(providers: CloudProviders) -> Self {
        Self { providers }
    }

    /// Converges the whole cloud footprint towards present. The
    /// network/subnetwork/NAT chain is strictly sequential; buckets and
    /// service accounts have no ordering constraints and converge
    /// concurrently. One resource's failure never blocks unrelated
    /// resources, but it does withhold its dependents.
    pub async fn provision(
        &self,
        spec: &CloudSpec,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<ConvergenceOutcome> {
        let mut results = Vec::new();

        let mut side = JoinSet::new();
        for bucket in &spec.buckets {
            let mut driver = BucketDriver::new(
                self.providers.storage.clone(),
                &bucket.name,
                &spec.project,
                &spec.region,
                bucket.retention_days,
            );
            let mut shutdown = shutdown.clone();
            side.spawn(async move {
                let result = ensure_exists(&mut driver, &mut shutdown).await;
                (driver.descriptor().clone(), result)
            });
        }
        for account in &spec.service_accounts {
            let mut driver = ServiceAccountDriver::new(
                self.providers.iam.clone(),
                &account.account_id,
                &spec.project,
                &account.role,
                &account.cluster_service_account,
            );
            let mut shutdown = shutdown.clone();
            side.spawn(async move {
                let result = ensure_exists(&mut driver, &mut shutdown).await;
                (driver.descriptor().clone(), result)
            });
        }

        let mut network = NetworkDriver::new(
            self.providers.compute.clone(),
            &spec.cluster_name,
            &spec.project,
        );
        let mut sd = shutdown.clone();
        let network_result = ensure_exists(&mut network, &mut sd).await;
        let network_ok = network_result.is_ok();
        results.push((network.descriptor().clone(), network_result));

        let subnetwork_descriptor = ResourceDescriptor::regional(
            ResourceKind::Subnetwork,
            &spec.cluster_name,
            &spec.project,
            &spec.region,
        );
        let nat_descriptor = ResourceDescriptor::regional(
            ResourceKind::NatGateway,
            &spec.cluster_name,
            &spec.project,
            &spec.region,
        );

        if network_ok {
            let mut subnetwork = SubnetworkDriver::new(
                self.providers.compute.clone(),
                &spec.cluster_name,
                &spec.project,
                &spec.region,
                &spec.cluster_name,
                &spec.subnet_cidr,
            );
            let mut sd = shutdown.clone();
            let subnetwork_result = ensure_exists(&mut subnetwork, &mut sd).await;
            let subnetwork_ok = subnetwork_result.is_ok();
            results.push((subnetwork.descriptor().clone(), subnetwork_result));

            if subnetwork_ok {
                let mut nat = NatGatewayDriver::new(
                    self.providers.compute.clone(),
                    &spec.cluster_name,
                    &spec.project,
                    &spec.region,
                    &spec.cluster_name,
                );
                let mut sd = shutdown.clone();
                let nat_result = ensure_exists(&mut nat, &mut sd).await;
                results.push((nat.descriptor().clone(), nat_result));
            } else {
                results.push((
                    nat_descriptor.clone(),
                    Err(CloudError::DependencyFailed {
                        descriptor: nat_descriptor,
                        dependency: spec.cluster_name.clone(),
                    }),
                ));
            }
        } else {
            for descriptor in [subnetwork_descriptor, nat_descriptor] {
                results.push((
                    descriptor.clone(),
                    Err(CloudError::DependencyFailed {
                        descriptor,
                        dependency: spec.cluster_name.clone(),
                    }),
                ));
            }
        }

        while let Some(joined) = side.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!(error = %e, "convergence task panicked"),
            }
        }

        results
    }

    /// Converges the whole cloud footprint towards absent, in reverse
    /// dependency order: NAT gateway, then subnetwork, then the network
    /// (whose delete is gated on route drain). Buckets are emptied rather
    /// than deleted; service accounts are removed concurrently.
    pub async fn teardown(
        &self,
        spec: &CloudSpec,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<ConvergenceOutcome> {
        let mut results = Vec::new();

        let mut side = JoinSet::new();
        for bucket in &spec.buckets {
            let storage = self.providers.storage.clone();
            let name = bucket.name.clone();
            let project = spec.project.clone();
            side.spawn(async move {
                let descriptor =
                    ResourceDescriptor::global(ResourceKind::Bucket, &name, &project);
                let result = empty_bucket(storage.as_ref(), &name, &project)
                    .await
                    .map(|_| ConvergenceState::Gone);
                (descriptor, result)
            });
        }
        for account in &spec.service_accounts {
            let mut driver = ServiceAccountDriver::new(
                self.providers.iam.clone(),
                &account.account_id,
                &spec.project,
                &account.role,
                &account.cluster_service_account,
            );
            let mut shutdown = shutdown.clone();
            side.spawn(async move {
                let result = ensure_absent(&mut driver, &mut shutdown).await;
                (driver.descriptor().clone(), result)
            });
        }

        let mut nat = NatGatewayDriver::new(
            self.providers.compute.clone(),
            &spec.cluster_name,
            &spec.project,
            &spec.region,
            &spec.cluster_name,
        )
        .for_teardown();
        let mut sd = shutdown.clone();
        let nat_result = ensure_absent(&mut nat, &mut sd).await;
        let nat_ok = nat_result.is_ok();
        results.push((nat.descriptor().clone(), nat_result));

        let mut blocked = !nat_ok;

        if !blocked {
            let mut subnetwork = SubnetworkDriver::new(
                self.providers.compute.clone(),
                &spec.cluster_name,
                &spec.project,
                &spec.region,
                &spec.cluster_name,
                &spec.subnet_cidr,
            );
            let mut sd = shutdown.clone();
            let subnetwork_result = ensure_absent(&mut subnetwork, &mut sd).await;
            blocked = subnetwork_result.is_err();
            results.push((subnetwork.descriptor().clone(), subnetwork_result));
        } else {
            let descriptor = ResourceDescriptor::regional(
                ResourceKind::Subnetwork,
                &spec.cluster_name,
                &spec.project,
                &spec.region,
            );
            results.push((
                descriptor.clone(),
                Err(CloudError::DependencyFailed {
                    descriptor,
                    dependency: spec.cluster_name.clone(),
                }),
            ));
        }

        if !blocked {
            let mut network = NetworkDriver::new(
                self.providers.compute.clone(),
                &spec.cluster_name,
                &spec.project,
            );
            let mut sd = shutdown.clone();
            let network_result = ensure_absent(&mut network, &mut sd).await;
            results.push((network.descriptor().clone(), network_result));
        } else {
            let descriptor = ResourceDescriptor::global(
                ResourceKind::Network,
                &spec.cluster_name,
                &spec.project,
            );
            results.push((
                descriptor.clone(),
                Err(CloudError::DependencyFailed {
                    descriptor,
                    dependency: spec.cluster_name.clone(),
                }),
            ));
        }

        while let Some(joined) = side.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!(error = %e, "teardown task panicked"),
            }
        }

        results
    }
}
