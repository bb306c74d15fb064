//! ConfigMap-backed tenant store.
//!
//! The authoritative tenant collection is one JSON array stored under a
//! single key of a single ConfigMap. Writes are read-modify-write over the
//! whole blob; concurrent writers race with last-write-wins semantics and
//! the periodic sync heals any lost update. The ConfigMap itself is marked
//! protected so the reconciliation loop never prunes it as an unexpected
//! object.

use std::sync::Arc;
use std::time::Duration;

use obsplane_cloud::convergence::sleep_unless_shutdown;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cluster::{ClusterApi, ClusterError, ClusterKind, ClusterObject};

/// Conventional name of the persisted tenant state object.
pub const TENANTS_CONFIGMAP: &str = "opstrace-tenants-database";
pub const TENANTS_KEY: &str = "tenants.json";

const SYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantType {
    #[serde(rename = "SYSTEM")]
    System,
    #[serde(rename = "USER")]
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub tenant_type: TenantType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl TenantRecord {
    pub fn system(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tenant_type: TenantType::System,
            id: None,
        }
    }

    pub fn user(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tenant_type: TenantType::User,
            id: None,
        }
    }
}

pub fn parse_tenants(raw: &str) -> Result<Vec<TenantRecord>, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn serialize_tenants(tenants: &[TenantRecord]) -> Result<String, serde_json::Error> {
    serde_json::to_string(tenants)
}

/// Unions `additions` into `existing` by tenant name. Returns true when
/// anything was added.
pub fn union_tenants(existing: &mut Vec<TenantRecord>, additions: &[TenantRecord]) -> bool {
    let mut changed = false;
    for addition in additions {
        if !existing.iter().any(|t| t.name == addition.name) {
            existing.push(addition.clone());
            changed = true;
        }
    }
    changed
}

pub struct TenantStore {
    api: Arc<dyn ClusterApi>,
    namespace: String,
}

impl TenantStore {
    pub fn new(api: Arc<dyn ClusterApi>, namespace: &str) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
        }
    }

    fn store_object(&self, tenants: &[TenantRecord]) -> Result<ClusterObject, ClusterError> {
        let raw = serialize_tenants(tenants)
            .map_err(|e| ClusterError::Malformed(format!("tenant serialization: {}", e)))?;
        let mut data = serde_json::Map::new();
        data.insert(TENANTS_KEY.to_string(), serde_json::Value::String(raw));
        Ok(
            ClusterObject::new(ClusterKind::ConfigMap, Some(&self.namespace), TENANTS_CONFIGMAP)
                .managed()
                .protected()
                .with_payload(json!({ "data": data })),
        )
    }

    fn tenants_of(&self, object: &ClusterObject) -> Result<Vec<TenantRecord>, ClusterError> {
        let raw = object.payload["data"][TENANTS_KEY]
            .as_str()
            .ok_or_else(|| {
                ClusterError::Malformed(format!("tenant store without {} key", TENANTS_KEY))
            })?;
        parse_tenants(raw).map_err(|e| ClusterError::Malformed(format!("tenant store: {}", e)))
    }

    /// Current tenant collection; an absent store reads as empty.
    pub async fn fetch(&self) -> Result<Vec<TenantRecord>, ClusterError> {
        match self
            .api
            .get(ClusterKind::ConfigMap, Some(&self.namespace), TENANTS_CONFIGMAP)
            .await?
        {
            Some(object) => self.tenants_of(&object),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write ensure: every tenant in `desired` ends up present
    /// (unioned by name), and the store object itself exists and is
    /// protected. Returns the merged collection.
    pub async fn ensure(
        &self,
        desired: &[TenantRecord],
    ) -> Result<Vec<TenantRecord>, ClusterError> {
        let existing = self
            .api
            .get(ClusterKind::ConfigMap, Some(&self.namespace), TENANTS_CONFIGMAP)
            .await?;

        match existing {
            Some(object) => {
                let mut tenants = self.tenants_of(&object)?;
                if union_tenants(&mut tenants, desired) {
                    info!(count = tenants.len(), "updating tenant store");
                    self.api.update(&self.store_object(&tenants)?).await?;
                }
                Ok(tenants)
            }
            None => {
                let tenants: Vec<TenantRecord> = desired.to_vec();
                info!(count = tenants.len(), "creating tenant store");
                match self.api.create(&self.store_object(&tenants)?).await {
                    Ok(()) => Ok(tenants),
                    // A concurrent creator won; their contents stand.
                    Err(ClusterError::Api { status: 409, .. }) => self.fetch().await,
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Periodic drift heal: re-asserts the store every few seconds so a lost
/// read-modify-write or an out-of-band deletion converges back.
pub async fn run_tenant_sync(
    store: TenantStore,
    seed: Vec<TenantRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_known = seed;
    loop {
        match store.ensure(&last_known).await {
            Ok(tenants) => {
                if tenants != last_known {
                    info!(count = tenants.len(), "tenant collection changed");
                    last_known = tenants;
                }
            }
            Err(e) => {
                warn!(error = %e, "tenant sync failed, retrying");
            }
        }
        if !sleep_unless_shutdown(SYNC_INTERVAL, &mut shutdown).await {
            return;
        }
    }
}
