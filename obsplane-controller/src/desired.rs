//! Desired cluster state for the current tenant configuration.
//!
//! Every object built here carries the managed-by label so the prune path
//! can tell our objects apart from everything else living in the cluster.

use serde_json::json;

use crate::cluster::{ClusterKind, ClusterObject};
use crate::config::ControllerConfig;
use crate::tenants::TenantRecord;

pub const TENANT_LABEL: &str = "obsplane.io/tenant";

/// The kinds the reconciliation loop subscribes to and prunes within.
pub const WATCHED_KINDS: &[ClusterKind] = &[
    ClusterKind::Namespace,
    ClusterKind::Deployment,
    ClusterKind::StatefulSet,
    ClusterKind::DaemonSet,
    ClusterKind::Service,
    ClusterKind::ServiceAccount,
    ClusterKind::ConfigMap,
    ClusterKind::Secret,
    ClusterKind::MetricsBackend,
    ClusterKind::LogsBackend,
];

pub fn tenant_namespace(tenant: &TenantRecord) -> String {
    format!("{}-tenant", tenant.name)
}

/// Recomputes the full desired object set for the given tenants.
pub fn cluster_objects(config: &ControllerConfig, tenants: &[TenantRecord]) -> Vec<ClusterObject> {
    let mut objects = Vec::new();

    objects.push(
        ClusterObject::new(ClusterKind::Namespace, None, &config.namespace)
            .managed()
            .protected(),
    );

    for tenant in tenants {
        let ns = tenant_namespace(tenant);

        objects.push(
            ClusterObject::new(ClusterKind::Namespace, None, &ns)
                .managed()
                .with_label(TENANT_LABEL, &tenant.name),
        );

        objects.push(
            ClusterObject::new(ClusterKind::MetricsBackend, Some(&ns), "metrics")
                .managed()
                .with_label(TENANT_LABEL, &tenant.name)
                .with_payload(json!({
                    "spec": {
                        "tenant": tenant.name,
                        "retentionDays": config.metrics_retention_days,
                        "storageBucket": format!("{}-metrics", config.cluster_name),
                    },
                })),
        );

        objects.push(
            ClusterObject::new(ClusterKind::LogsBackend, Some(&ns), "logs")
                .managed()
                .with_label(TENANT_LABEL, &tenant.name)
                .with_payload(json!({
                    "spec": {
                        "tenant": tenant.name,
                        "retentionDays": config.logs_retention_days,
                        "storageBucket": format!("{}-logs", config.cluster_name),
                    },
                })),
        );

        objects.push(
            ClusterObject::new(ClusterKind::ConfigMap, Some(&ns), "tenant-config")
                .managed()
                .with_label(TENANT_LABEL, &tenant.name)
                .with_payload(json!({
                    "data": {
                        "tenant": tenant.name,
                        "cluster": config.cluster_name,
                    },
                })),
        );

        objects.push(
            ClusterObject::new(ClusterKind::ServiceAccount, Some(&ns), "backend-writer")
                .managed()
                .with_label(TENANT_LABEL, &tenant.name),
        );
    }

    objects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenants::TenantRecord;
    use std::time::Duration;

    fn config() -> ControllerConfig {
        ControllerConfig {
            cluster_name: "obs1".into(),
            project: "proj".into(),
            region: "region-1".into(),
            subnet_cidr: "10.0.0.0/20".into(),
            namespace: "obsplane-system".into(),
            metrics_retention_days: 14,
            logs_retention_days: 30,
            reconcile_interval: Duration::from_secs(300),
            metrics_port: 0,
        }
    }

    #[test]
    fn every_desired_object_is_marked_managed() {
        let tenants = [TenantRecord::system("system"), TenantRecord::user("a")];
        let objects = cluster_objects(&config(), &tenants);
        assert!(!objects.is_empty());
        assert!(objects.iter().all(|o| o.is_ours()));
    }

    #[test]
    fn each_tenant_gets_namespace_and_backends() {
        let tenants = [TenantRecord::user("a")];
        let objects = cluster_objects(&config(), &tenants);

        assert!(
            objects
                .iter()
                .any(|o| o.kind == ClusterKind::Namespace && o.name == "a-tenant")
        );
        let metrics = objects
            .iter()
            .find(|o| o.kind == ClusterKind::MetricsBackend)
            .unwrap();
        assert_eq!(metrics.namespace.as_deref(), Some("a-tenant"));
        assert_eq!(metrics.payload["spec"]["retentionDays"], 14);
        assert!(
            objects
                .iter()
                .any(|o| o.kind == ClusterKind::LogsBackend && o.namespace.as_deref() == Some("a-tenant"))
        );
    }

    #[test]
    fn controller_namespace_is_protected() {
        let objects = cluster_objects(&config(), &[]);
        let ns = objects
            .iter()
            .find(|o| o.kind == ClusterKind::Namespace && o.name == "obsplane-system")
            .unwrap();
        assert!(ns.is_protected());
    }
}
