//! Cluster API boundary: typed objects, watch events, and the client trait.
//!
//! The cluster is consumed through list/watch/mutate calls per resource
//! kind. Reconnection and resync are handled by the informer layer; a full
//! re-list is diffed idempotently, so the client here stays a thin
//! request/response mapping.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Label marking an object as managed by this controller.
pub const MANAGED_LABEL: &str = "obsplane";
pub const MANAGED_LABEL_VALUE: &str = "owned";

/// Annotation protecting an object from being pruned as "unexpected".
pub const PROTECTED_ANNOTATION: &str = "obsplane.io/protected";

/// Annotation opting an object out of in-place updates.
pub const PREVENT_UPDATE_ANNOTATION: &str = "obsplane.io/prevent-update";

/// Cluster resource kinds this controller subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterKind {
    Namespace,
    Deployment,
    StatefulSet,
    DaemonSet,
    Service,
    ServiceAccount,
    ConfigMap,
    Secret,
    MetricsBackend,
    LogsBackend,
}

impl ClusterKind {
    pub const ALL: [ClusterKind; 10] = [
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

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Namespace => "Namespace",
            ClusterKind::Deployment => "Deployment",
            ClusterKind::StatefulSet => "StatefulSet",
            ClusterKind::DaemonSet => "DaemonSet",
            ClusterKind::Service => "Service",
            ClusterKind::ServiceAccount => "ServiceAccount",
            ClusterKind::ConfigMap => "ConfigMap",
            ClusterKind::Secret => "Secret",
            ClusterKind::MetricsBackend => "MetricsBackend",
            ClusterKind::LogsBackend => "LogsBackend",
        }
    }

    /// Namespace-scoped kinds carry a namespace in their identity.
    pub fn namespaced(&self) -> bool {
        !matches!(self, ClusterKind::Namespace)
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cluster object: kind + namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ClusterKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A cluster object with its management markers and an opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterObject {
    pub kind: ClusterKind,
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
    /// Everything outside the metadata, verbatim.
    #[serde(default)]
    pub payload: Value,
}

impl ClusterObject {
    pub fn new(kind: ClusterKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            deletion_timestamp: None,
            payload: Value::Null,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn managed(mut self) -> Self {
        self.labels
            .insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());
        self
    }

    pub fn protected(mut self) -> Self {
        self.annotations
            .insert(PROTECTED_ANNOTATION.to_string(), "true".to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_ours(&self) -> bool {
        self.labels.get(MANAGED_LABEL).map(String::as_str) == Some(MANAGED_LABEL_VALUE)
    }

    pub fn is_protected(&self) -> bool {
        self.annotations.get(PROTECTED_ANNOTATION).map(String::as_str) == Some("true")
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn prevents_update(&self) -> bool {
        self.annotations
            .get(PREVENT_UPDATE_ANNOTATION)
            .map(String::as_str)
            == Some("true")
    }

    /// Parses the wire shape: metadata block plus arbitrary payload fields.
    pub fn from_api_json(kind: ClusterKind, value: &Value) -> Result<Self, ClusterError> {
        let metadata = value
            .get("metadata")
            .ok_or_else(|| ClusterError::Malformed("object without metadata".into()))?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::Malformed("object without metadata.name".into()))?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        let string_map = |key: &str| -> BTreeMap<String, String> {
            metadata
                .get(key)
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };
        let deletion_timestamp = metadata
            .get("deletionTimestamp")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut payload = value.clone();
        if let Some(map) = payload.as_object_mut() {
            map.remove("metadata");
            map.remove("kind");
            map.remove("apiVersion");
        }

        Ok(Self {
            kind,
            namespace,
            name,
            labels: string_map("labels"),
            annotations: string_map("annotations"),
            deletion_timestamp,
            payload,
        })
    }

    /// Serializes back to the wire shape.
    pub fn to_api_json(&self) -> Value {
        let mut root = match &self.payload {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => Value::Object(serde_json::Map::new()),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("spec".to_string(), other.clone());
                Value::Object(map)
            }
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("name".into(), Value::String(self.name.clone()));
        if let Some(ns) = &self.namespace {
            metadata.insert("namespace".into(), Value::String(ns.clone()));
        }
        if !self.labels.is_empty() {
            metadata.insert(
                "labels".into(),
                Value::Object(
                    self.labels
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            );
        }
        if !self.annotations.is_empty() {
            metadata.insert(
                "annotations".into(),
                Value::Object(
                    self.annotations
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            );
        }
        if let Some(map) = root.as_object_mut() {
            map.insert("kind".into(), Value::String(self.kind.as_str().to_string()));
            map.insert("metadata".into(), Value::Object(metadata));
        }
        root
    }
}

/// A change notification from a watch subscription.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(ClusterObject),
    Modified(ClusterObject),
    Deleted(ClusterObject),
}

impl WatchEvent {
    pub fn object(&self) -> &ClusterObject {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("cluster API transport error: {0}")]
    Transport(String),

    #[error("unexpected cluster API response: {0}")]
    Malformed(String),
}

/// The cluster API as this controller consumes it.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Full listing of one kind across the cluster.
    async fn list(&self, kind: ClusterKind) -> Result<Vec<ClusterObject>, ClusterError>;

    /// Opens a long-lived subscription for one kind. Events flow into the
    /// returned channel until the connection ends or the receiver is
    /// dropped (which unsubscribes).
    async fn watch(&self, kind: ClusterKind) -> Result<mpsc::Receiver<WatchEvent>, ClusterError>;

    async fn get(
        &self,
        kind: ClusterKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ClusterObject>, ClusterError>;

    async fn create(&self, object: &ClusterObject) -> Result<(), ClusterError>;
    async fn update(&self, object: &ClusterObject) -> Result<(), ClusterError>;
    async fn delete(
        &self,
        kind: ClusterKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError>;
}

fn api_prefix(kind: ClusterKind) -> &'static str {
    match kind {
        ClusterKind::Namespace
        | ClusterKind::Service
        | ClusterKind::ServiceAccount
        | ClusterKind::ConfigMap
        | ClusterKind::Secret => "api/v1",
        ClusterKind::Deployment | ClusterKind::StatefulSet | ClusterKind::DaemonSet => {
            "apis/apps/v1"
        }
        ClusterKind::MetricsBackend | ClusterKind::LogsBackend => "apis/obsplane.io/v1",
    }
}

fn plural(kind: ClusterKind) -> &'static str {
    match kind {
        ClusterKind::Namespace => "namespaces",
        ClusterKind::Deployment => "deployments",
        ClusterKind::StatefulSet => "statefulsets",
        ClusterKind::DaemonSet => "daemonsets",
        ClusterKind::Service => "services",
        ClusterKind::ServiceAccount => "serviceaccounts",
        ClusterKind::ConfigMap => "configmaps",
        ClusterKind::Secret => "secrets",
        ClusterKind::MetricsBackend => "metricsbackends",
        ClusterKind::LogsBackend => "logsbackends",
    }
}

/// HTTP implementation over the cluster's REST surface with JSON-lines
/// watch streaming.
pub struct HttpClusterClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpClusterClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn collection_url(&self, kind: ClusterKind) -> String {
        format!("{}/{}/{}", self.base_url, api_prefix(kind), plural(kind))
    }

    fn namespaced_collection_url(&self, kind: ClusterKind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if kind.namespaced() => format!(
                "{}/{}/namespaces/{}/{}",
                self.base_url,
                api_prefix(kind),
                ns,
                plural(kind)
            ),
            _ => self.collection_url(kind),
        }
    }

    fn object_url(&self, kind: ClusterKind, namespace: Option<&str>, name: &str) -> String {
        format!(
            "{}/{}",
            self.namespaced_collection_url(kind, namespace),
            name
        )
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, ClusterError> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(ClusterError::Api {
                status,
                message: body,
            });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ClusterError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn list(&self, kind: ClusterKind) -> Result<Vec<ClusterObject>, ClusterError> {
        let value = self.send(self.client.get(self.collection_url(kind))).await?;
        let items = value
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| ClusterError::Malformed("list response without items".into()))?;
        items
            .iter()
            .map(|item| ClusterObject::from_api_json(kind, item))
            .collect()
    }

    async fn watch(&self, kind: ClusterKind) -> Result<mpsc::Receiver<WatchEvent>, ClusterError> {
        let url = format!("{}?watch=true", self.collection_url(kind));
        let resp = self
            .authed(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(ClusterError::Api {
                status,
                message: format!("watch subscription rejected for {}", kind),
            });
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "watch stream error");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_watch_line(kind, line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                // Receiver dropped: unsubscribed.
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(kind = %kind, error = %e, "skipping unparseable watch line");
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn get(
        &self,
        kind: ClusterKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ClusterObject>, ClusterError> {
        let url = self.object_url(kind, namespace, name);
        match self.send(self.client.get(&url)).await {
            Ok(value) => ClusterObject::from_api_json(kind, &value).map(Some),
            Err(ClusterError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        let url = self.namespaced_collection_url(object.kind, object.namespace.as_deref());
        self.send(self.client.post(&url).json(&object.to_api_json()))
            .await?;
        Ok(())
    }

    async fn update(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        let url = self.object_url(object.kind, object.namespace.as_deref(), &object.name);
        self.send(self.client.put(&url).json(&object.to_api_json()))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        kind: ClusterKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        let url = self.object_url(kind, namespace, name);
        match self.send(self.client.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(ClusterError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn parse_watch_line(kind: ClusterKind, line: &str) -> Result<WatchEvent, ClusterError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ClusterError::Malformed(e.to_string()))?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ClusterError::Malformed("watch line without type".into()))?;
    let object = value
        .get("object")
        .ok_or_else(|| ClusterError::Malformed("watch line without object".into()))?;
    let object = ClusterObject::from_api_json(kind, object)?;
    match event_type {
        "ADDED" => Ok(WatchEvent::Added(object)),
        "MODIFIED" => Ok(WatchEvent::Modified(object)),
        "DELETED" => Ok(WatchEvent::Deleted(object)),
        other => Err(ClusterError::Malformed(format!(
            "unknown watch event type {}",
            other
        ))),
    }
}
