//! In-memory cluster API fake shared by the controller tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cluster::{
    ClusterApi, ClusterError, ClusterKind, ClusterObject, ObjectKey, WatchEvent,
};

#[derive(Default)]
pub struct FakeClusterApi {
    pub objects: Mutex<HashMap<ObjectKey, ClusterObject>>,
    pub calls: Mutex<Vec<String>>,
    watch_txs: Mutex<Vec<(ClusterKind, mpsc::Sender<WatchEvent>)>>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, object: ClusterObject) {
        self.objects.lock().unwrap().insert(object.key(), object);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Pushes an event into every open subscription for `kind`. Returns the
    /// number of subscriptions reached.
    pub async fn push(&self, kind: ClusterKind, event: WatchEvent) -> usize {
        let txs: Vec<mpsc::Sender<WatchEvent>> = self
            .watch_txs
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, tx)| tx.clone())
            .collect();
        let mut delivered = 0;
        for tx in txs {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Ends every open subscription for `kind`, as a dropped connection
    /// would.
    pub fn close_watches(&self, kind: ClusterKind) {
        self.watch_txs.lock().unwrap().retain(|(k, _)| *k != kind);
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list(&self, kind: ClusterKind) -> Result<Vec<ClusterObject>, ClusterError> {
        self.log(format!("list:{}", kind));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.kind == kind)
            .cloned()
            .collect())
    }

    async fn watch(&self, kind: ClusterKind) -> Result<mpsc::Receiver<WatchEvent>, ClusterError> {
        self.log(format!("watch:{}", kind));
        let (tx, rx) = mpsc::channel(16);
        self.watch_txs.lock().unwrap().push((kind, tx));
        Ok(rx)
    }

    async fn get(
        &self,
        kind: ClusterKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ClusterObject>, ClusterError> {
        self.log(format!("get:{}:{}", kind, name));
        let key = ObjectKey {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        Ok(self.objects.lock().unwrap().get(&key).cloned())
    }

    async fn create(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        self.log(format!("create:{}", object.key()));
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&object.key()) {
            return Err(ClusterError::Api {
                status: 409,
                message: "already exists".into(),
            });
        }
        objects.insert(object.key(), object.clone());
        Ok(())
    }

    async fn update(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        self.log(format!("update:{}", object.key()));
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&object.key()) {
            return Err(ClusterError::Api {
                status: 404,
                message: "not found".into(),
            });
        }
        objects.insert(object.key(), object.clone());
        Ok(())
    }

    async fn delete(
        &self,
        kind: ClusterKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.log(format!("delete:{}:{}", kind, name));
        let key = ObjectKey {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        };
        self.objects.lock().unwrap().remove(&key);
        Ok(())
    }
}
