//! Top-level reconciliation loop.
//!
//! Starts in a hydrating phase, blocked until every subscribed kind has
//! delivered its initial listing. From then on every multiplexed event (or
//! a periodic timer tick, to catch externally-induced drift) triggers a
//! pass: recompute the desired object set for the current tenants, diff it
//! against the observed cache, apply corrections in rate-limited chunks,
//! and drive the cloud footprint through the dependency sequencer. One
//! resource's failure never stops the rest of the pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use obsplane_cloud::convergence::{sleep_unless_shutdown, wait_for_shutdown};
use obsplane_cloud::error::CloudError;
use obsplane_cloud::sequencer::DependencySequencer;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError, ClusterKind, ClusterObject, ObjectKey, WatchEvent};
use crate::config::ControllerConfig;
use crate::desired::{self, WATCHED_KINDS};
use crate::informer::wait_until_hydrated;
use crate::metrics::Metrics;
use crate::state::{ObservedClusterState, SharedState};
use crate::tenants::{TenantRecord, TenantStore};

const APPLY_CHUNK: usize = 10;
const CHUNK_DELAY: Duration = Duration::from_secs(1);

/// Corrections one pass wants to apply.
#[derive(Debug, Default)]
pub struct DiffPlan {
    pub create: Vec<ClusterObject>,
    pub update: Vec<ClusterObject>,
    pub delete: Vec<ObjectKey>,
}

impl DiffPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// True when every field `desired` specifies is present with the same value
/// in `actual`. Server-populated extras in `actual` are ignored.
fn payload_satisfied(desired: &Value, actual: &Value) -> bool {
    match desired {
        Value::Null => true,
        Value::Object(map) => map.iter().all(|(key, value)| {
            actual
                .get(key)
                .map(|actual_value| payload_satisfied(value, actual_value))
                .unwrap_or(false)
        }),
        other => other == actual,
    }
}

fn labels_satisfied(desired: &ClusterObject, actual: &ClusterObject) -> bool {
    desired
        .labels
        .iter()
        .all(|(k, v)| actual.labels.get(k) == Some(v))
}

/// Diffs desired against observed. Deletions only ever touch objects we
/// manage, that are not protected and not already terminating; namespaces
/// are never pruned.
pub fn diff(desired: &[ClusterObject], observed: &ObservedClusterState) -> DiffPlan {
    let mut plan = DiffPlan::default();
    let desired_keys: HashSet<ObjectKey> = desired.iter().map(ClusterObject::key).collect();

    for object in desired {
        match observed.get(&object.key()) {
            None => plan.create.push(object.clone()),
            Some(existing) => {
                let in_sync = labels_satisfied(object, existing)
                    && payload_satisfied(&object.payload, &existing.payload);
                if !in_sync && !existing.prevents_update() {
                    plan.update.push(object.clone());
                }
            }
        }
    }

    for &kind in WATCHED_KINDS {
        if kind == ClusterKind::Namespace {
            continue;
        }
        for existing in observed.of_kind(kind) {
            if !desired_keys.contains(&existing.key())
                && existing.is_ours()
                && !existing.is_terminating()
                && !existing.is_protected()
            {
                plan.delete.push(existing.key());
            }
        }
    }

    plan
}

pub struct Reconciler {
    api: Arc<dyn ClusterApi>,
    state: SharedState,
    store: TenantStore,
    metrics: Arc<Metrics>,
    sequencer: DependencySequencer,
    config: ControllerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        state: SharedState,
        store: TenantStore,
        metrics: Arc<Metrics>,
        sequencer: DependencySequencer,
        config: ControllerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            api,
            state,
            store,
            metrics,
            sequencer,
            config,
            shutdown,
        }
    }

    pub async fn run(self, mut events: mpsc::Receiver<WatchEvent>) -> Result<()> {
        let mut shutdown = self.shutdown.clone();

        if !wait_until_hydrated(&self.state, WATCHED_KINDS, &mut shutdown).await {
            info!("shutdown while waiting for cache hydration");
            return Ok(());
        }
        info!("cache hydrated, starting reconciliation");

        let mut tick = tokio::time::interval(self.config.reconcile_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("reconciliation loop stopping");
                    break;
                }
                _ = tick.tick() => {
                    debug!("timer tick");
                    self.reconcile_pass().await;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        Metrics::inc(&self.metrics.events_processed);
                        let object = event.object();
                        debug!(kind = %object.kind, name = %object.name, "cluster event");
                        self.reconcile_pass().await;
                    }
                    None => {
                        info!("event stream closed, reconciliation loop stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn reconcile_pass(&self) {
        Metrics::inc(&self.metrics.reconcile_passes);

        // The store is authoritative for tenants; the system tenant always
        // exists.
        let tenants = match self.store.ensure(&[TenantRecord::system("system")]).await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "tenant store unavailable, skipping pass");
                Metrics::inc(&self.metrics.convergence_failures);
                return;
            }
        };

        let desired = desired::cluster_objects(&self.config, &tenants);
        let plan = {
            let observed = self.state.read().await;
            diff(&desired, &observed)
        };
        if !plan.is_empty() {
            info!(
                create = plan.create.len(),
                update = plan.update.len(),
                delete = plan.delete.len(),
                "applying corrections"
            );
        }
        self.apply_plan(plan).await;

        let outcomes = self
            .sequencer
            .provision(&self.config.cloud_spec(), &self.shutdown)
            .await;
        for (descriptor, result) in outcomes {
            match result {
                Ok(_) => {}
                Err(CloudError::Cancelled { .. }) => {}
                Err(e) => {
                    warn!(resource = %descriptor, error = %e, "cloud convergence failed");
                    Metrics::inc(&self.metrics.convergence_failures);
                }
            }
        }
    }

    /// Applies corrections in chunks so a large diff does not hammer the
    /// cluster API. Individual failures are logged and counted, never
    /// propagated: the rest of the pass continues.
    async fn apply_plan(&self, plan: DiffPlan) {
        let mut shutdown = self.shutdown.clone();

        for (index, chunk) in plan.create.chunks(APPLY_CHUNK).enumerate() {
            if index > 0 && !sleep_unless_shutdown(CHUNK_DELAY, &mut shutdown).await {
                return;
            }
            for object in chunk {
                info!(object = %object.key(), "creating");
                match self.api.create(object).await {
                    Ok(()) => Metrics::inc(&self.metrics.resources_created),
                    Err(ClusterError::Api { status: 409, .. }) => {
                        debug!(object = %object.key(), "already created by a concurrent actor");
                    }
                    Err(e) => {
                        warn!(object = %object.key(), error = %e, "create failed");
                        Metrics::inc(&self.metrics.convergence_failures);
                    }
                }
            }
        }

        for (index, chunk) in plan.update.chunks(APPLY_CHUNK).enumerate() {
            if index > 0 && !sleep_unless_shutdown(CHUNK_DELAY, &mut shutdown).await {
                return;
            }
            for object in chunk {
                info!(object = %object.key(), "updating");
                match self.api.update(object).await {
                    Ok(()) => Metrics::inc(&self.metrics.resources_updated),
                    Err(e) => {
                        warn!(object = %object.key(), error = %e, "update failed");
                        Metrics::inc(&self.metrics.convergence_failures);
                    }
                }
            }
        }

        for (index, chunk) in plan.delete.chunks(APPLY_CHUNK).enumerate() {
            if index > 0 && !sleep_unless_shutdown(CHUNK_DELAY, &mut shutdown).await {
                return;
            }
            for key in chunk {
                info!(object = %key, "deleting");
                match self
                    .api
                    .delete(key.kind, key.namespace.as_deref(), &key.name)
                    .await
                {
                    Ok(()) => Metrics::inc(&self.metrics.resources_deleted),
                    Err(e) => {
                        warn!(object = %key, error = %e, "delete failed");
                        Metrics::inc(&self.metrics.convergence_failures);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WatchEvent;
    use crate::tenants::{TENANTS_CONFIGMAP, TENANTS_KEY, serialize_tenants};
    use crate::testutil::FakeClusterApi;
    use async_trait::async_trait;
    use obsplane_cloud::error::ApiError;
    use obsplane_cloud::pending::{OperationStatus, PendingOperation};
    use obsplane_cloud::provider::{
        BucketInfo, ComputeProvider, IamPolicy, IamProvider, RouteInfo, ServiceAccountInfo,
        StorageProvider, SubnetworkInfo,
    };
    use obsplane_cloud::sequencer::CloudProviders;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn managed(kind: ClusterKind, ns: Option<&str>, name: &str) -> ClusterObject {
        ClusterObject::new(kind, ns, name).managed()
    }

    #[test]
    fn diff_creates_missing_objects() {
        let observed = ObservedClusterState::default();
        let desired = vec![managed(ClusterKind::Namespace, None, "a-tenant")];
        let plan = diff(&desired, &observed);
        assert_eq!(plan.create.len(), 1);
        assert!(plan.update.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn diff_updates_on_label_drift_unless_prevented() {
        let mut observed = ObservedClusterState::default();
        observed.upsert(managed(ClusterKind::ConfigMap, Some("ns"), "cfg"));
        let desired =
            vec![managed(ClusterKind::ConfigMap, Some("ns"), "cfg").with_label("extra", "v")];

        let plan = diff(&desired, &observed);
        assert_eq!(plan.update.len(), 1);

        let mut observed = ObservedClusterState::default();
        let mut existing = managed(ClusterKind::ConfigMap, Some("ns"), "cfg");
        existing.annotations.insert(
            crate::cluster::PREVENT_UPDATE_ANNOTATION.into(),
            "true".into(),
        );
        observed.upsert(existing);
        let plan = diff(&desired, &observed);
        assert!(plan.update.is_empty());
    }

    #[test]
    fn diff_treats_server_populated_extras_as_in_sync() {
        let mut observed = ObservedClusterState::default();
        observed.upsert(
            managed(ClusterKind::MetricsBackend, Some("ns"), "metrics").with_payload(json!({
                "spec": { "tenant": "a", "retentionDays": 14 },
                "status": { "readyReplicas": 1 },
            })),
        );
        let desired = vec![
            managed(ClusterKind::MetricsBackend, Some("ns"), "metrics")
                .with_payload(json!({ "spec": { "tenant": "a", "retentionDays": 14 } })),
        ];
        assert!(diff(&desired, &observed).is_empty());

        // A real spec change is detected underneath the extras.
        let desired = vec![
            managed(ClusterKind::MetricsBackend, Some("ns"), "metrics")
                .with_payload(json!({ "spec": { "tenant": "a", "retentionDays": 7 } })),
        ];
        assert_eq!(diff(&desired, &observed).update.len(), 1);
    }

    #[test]
    fn diff_prunes_only_our_unprotected_live_objects() {
        let mut observed = ObservedClusterState::default();
        observed.upsert(managed(ClusterKind::Deployment, Some("ns"), "stray"));
        observed.upsert(ClusterObject::new(
            ClusterKind::Deployment,
            Some("ns"),
            "foreign",
        ));
        observed.upsert(managed(ClusterKind::ConfigMap, Some("ns"), "guarded").protected());
        let mut terminating = managed(ClusterKind::Secret, Some("ns"), "dying");
        terminating.deletion_timestamp = Some("2021-03-01T00:00:00Z".into());
        observed.upsert(terminating);

        let plan = diff(&[], &observed);
        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].name, "stray");
    }

    #[test]
    fn diff_never_prunes_namespaces() {
        let mut observed = ObservedClusterState::default();
        observed.upsert(managed(ClusterKind::Namespace, None, "left-behind"));
        let plan = diff(&[], &observed);
        assert!(plan.delete.is_empty());
    }

    /// Cloud fake where the whole footprint already exists, so provisioning
    /// converges without any mutation.
    struct AllPresentCloud;

    #[async_trait]
    impl ComputeProvider for AllPresentCloud {
        async fn network_exists(&self, _name: &str) -> Result<bool, ApiError> {
            Ok(true)
        }
        async fn create_network(&self, _name: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn delete_network(&self, _name: &str) -> Result<PendingOperation, ApiError> {
            Ok(PendingOperation::new("op"))
        }
        async fn list_subnetworks(&self) -> Result<Vec<SubnetworkInfo>, ApiError> {
            Ok(vec![SubnetworkInfo {
                name: "obs1".into(),
                region: "region-1".into(),
                network: "projects/p/global/networks/obs1".into(),
            }])
        }
        async fn create_subnetwork(
            &self,
            _region: &str,
            _network: &str,
            _name: &str,
            _cidr: &str,
        ) -> Result<(), ApiError> {
            Ok(())
        }
        async fn delete_subnetwork(
            &self,
            _region: &str,
            _name: &str,
        ) -> Result<PendingOperation, ApiError> {
            Ok(PendingOperation::new("op"))
        }
        async fn router_exists(&self, _region: &str, _name: &str) -> Result<bool, ApiError> {
            Ok(true)
        }
        async fn create_router(
            &self,
            _region: &str,
            _name: &str,
            _network: &str,
        ) -> Result<(), ApiError> {
            Ok(())
        }
        async fn delete_router(&self, _region: &str, _name: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn list_routes(&self) -> Result<Vec<RouteInfo>, ApiError> {
            Ok(vec![])
        }
        async fn delete_route(&self, _name: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn operation_status(
            &self,
            _op: &PendingOperation,
        ) -> Result<OperationStatus, ApiError> {
            Ok(OperationStatus::Done)
        }
    }

    #[async_trait]
    impl StorageProvider for AllPresentCloud {
        async fn list_buckets(&self) -> Result<Vec<BucketInfo>, ApiError> {
            Ok(vec![
                BucketInfo {
                    name: "obs1-metrics".into(),
                    location: "region-1".into(),
                },
                BucketInfo {
                    name: "obs1-logs".into(),
                    location: "region-1".into(),
                },
            ])
        }
        async fn create_bucket(&self, _name: &str, _location: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn set_bucket_lifecycle(&self, _name: &str, _days: u32) -> Result<(), ApiError> {
            Ok(())
        }
    }

    #[async_trait]
    impl IamProvider for AllPresentCloud {
        async fn get_service_account(
            &self,
            email: &str,
        ) -> Result<Option<ServiceAccountInfo>, ApiError> {
            Ok(Some(ServiceAccountInfo {
                name: format!("projects/p/serviceAccounts/{}", email),
                email: email.to_string(),
                project_id: "p".into(),
            }))
        }
        async fn create_service_account(
            &self,
            account_id: &str,
        ) -> Result<ServiceAccountInfo, ApiError> {
            Ok(ServiceAccountInfo {
                name: format!("projects/p/serviceAccounts/{}", account_id),
                email: format!("{}@p.iam.gserviceaccount.com", account_id),
                project_id: "p".into(),
            })
        }
        async fn delete_service_account(&self, _email: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn get_project_policy(&self) -> Result<IamPolicy, ApiError> {
            Ok(IamPolicy::default())
        }
        async fn set_project_policy(&self, _policy: &IamPolicy) -> Result<(), ApiError> {
            Ok(())
        }
        async fn set_workload_identity_binding(
            &self,
            _sa_email: &str,
            _cluster_service_account: &str,
        ) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            cluster_name: "obs1".into(),
            project: "p".into(),
            region: "region-1".into(),
            subnet_cidr: "10.0.0.0/20".into(),
            namespace: "obsplane-system".into(),
            metrics_retention_days: 14,
            logs_retention_days: 30,
            reconcile_interval: Duration::from_secs(300),
            metrics_port: 0,
        }
    }

    fn cloud_providers() -> CloudProviders {
        CloudProviders {
            compute: Arc::new(AllPresentCloud),
            storage: Arc::new(AllPresentCloud),
            iam: Arc::new(AllPresentCloud),
        }
    }

    fn tenants_store_object(tenants: &[TenantRecord]) -> ClusterObject {
        let raw = serialize_tenants(tenants).unwrap();
        ClusterObject::new(
            ClusterKind::ConfigMap,
            Some("obsplane-system"),
            TENANTS_CONFIGMAP,
        )
        .managed()
        .protected()
        .with_payload(json!({ "data": { "tenants.json": raw } }))
    }

    fn build_reconciler(
        api: Arc<FakeClusterApi>,
        state: SharedState,
        shutdown: watch::Receiver<bool>,
    ) -> (Reconciler, Arc<Metrics>) {
        let metrics = Metrics::shared();
        let reconciler = Reconciler::new(
            api.clone(),
            state,
            TenantStore::new(api, "obsplane-system"),
            metrics.clone(),
            DependencySequencer::new(cloud_providers()),
            test_config(),
            shutdown,
        );
        (reconciler, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn pass_creates_missing_prunes_strays_and_spares_the_rest() {
        let api = Arc::new(FakeClusterApi::new());
        let store_object = tenants_store_object(&[
            TenantRecord::system("system"),
            TenantRecord::user("a"),
        ]);
        api.seed(store_object.clone());

        let state = ObservedClusterState::shared();
        {
            let mut cache = state.write().await;
            for &kind in WATCHED_KINDS {
                cache.replace_kind(kind, vec![]);
            }
            cache.upsert(store_object);
            cache.upsert(managed(ClusterKind::Deployment, Some("a-tenant"), "stray"));
            cache.upsert(ClusterObject::new(
                ClusterKind::Deployment,
                Some("other"),
                "foreign",
            ));
        }

        let (_tx, rx) = watch::channel(false);
        let (reconciler, metrics) = build_reconciler(api.clone(), state, rx);
        reconciler.reconcile_pass().await;

        // Both tenants' namespaces and backends were created.
        assert!(api.count("create:Namespace a-tenant") > 0);
        assert!(api.count("create:Namespace system-tenant") > 0);
        assert!(api.count("create:MetricsBackend a-tenant/metrics") > 0);
        assert!(api.count("create:LogsBackend system-tenant/logs") > 0);

        // The stray managed object went away; the foreign one survived, and
        // the protected tenant store was never touched.
        assert_eq!(api.count("delete:Deployment:stray"), 1);
        assert_eq!(api.count("delete:Deployment:foreign"), 0);
        assert_eq!(api.count(&format!("delete:ConfigMap:{}", TENANTS_CONFIGMAP)), 0);

        assert_eq!(metrics.reconcile_passes.load(Ordering::Relaxed), 1);
        assert!(metrics.resources_created.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.resources_deleted.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.convergence_failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pass_seeds_tenant_store_when_absent() {
        let api = Arc::new(FakeClusterApi::new());
        let state = ObservedClusterState::shared();
        {
            let mut cache = state.write().await;
            for &kind in WATCHED_KINDS {
                cache.replace_kind(kind, vec![]);
            }
        }

        let (_tx, rx) = watch::channel(false);
        let (reconciler, _metrics) = build_reconciler(api.clone(), state, rx);
        reconciler.reconcile_pass().await;

        let stored = api
            .get(
                ClusterKind::ConfigMap,
                Some("obsplane-system"),
                TENANTS_CONFIGMAP,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_protected());
        let raw = stored.payload["data"][TENANTS_KEY].as_str().unwrap();
        assert!(raw.contains("system"));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_waits_for_hydration_then_reacts_to_events() {
        let api = Arc::new(FakeClusterApi::new());
        api.seed(tenants_store_object(&[TenantRecord::system("system")]));
        let state = ObservedClusterState::shared();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (reconciler, metrics) = build_reconciler(api.clone(), state.clone(), shutdown_rx);
        let handle = tokio::spawn(reconciler.run(events_rx));

        // Still hydrating: no passes yet.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(metrics.reconcile_passes.load(Ordering::Relaxed), 0);

        {
            let mut cache = state.write().await;
            for &kind in WATCHED_KINDS {
                cache.replace_kind(kind, vec![]);
            }
        }

        // Hydrated: the immediate timer tick runs the first pass.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let after_hydration = metrics.reconcile_passes.load(Ordering::Relaxed);
        assert!(after_hydration >= 1);

        events_tx
            .send(WatchEvent::Added(managed(
                ClusterKind::Secret,
                Some("x"),
                "s",
            )))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(metrics.events_processed.load(Ordering::Relaxed), 1);
        assert!(metrics.reconcile_passes.load(Ordering::Relaxed) > after_hydration);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
