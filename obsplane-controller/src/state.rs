//! Process-wide observed cluster state.
//!
//! Populated by the informer multiplexer, consulted (never mutated) by the
//! reconciliation loop. Single-writer/many-reader: only the multiplexer
//! consumer task writes; everyone else takes read snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::cluster::{ClusterKind, ClusterObject, ObjectKey};

pub type SharedState = Arc<RwLock<ObservedClusterState>>;

#[derive(Default)]
pub struct ObservedClusterState {
    objects: HashMap<ObjectKey, ClusterObject>,
    hydrated: HashSet<ClusterKind>,
}

impl ObservedClusterState {
    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Inserts or replaces by identity. Replaying the same object (e.g.
    /// during a resync) is a no-op in effect.
    pub fn upsert(&mut self, object: ClusterObject) {
        self.objects.insert(object.key(), object);
    }

    pub fn remove(&mut self, key: &ObjectKey) {
        self.objects.remove(key);
    }

    /// Replaces everything known for one kind with a fresh full listing and
    /// marks the kind hydrated.
    pub fn replace_kind(&mut self, kind: ClusterKind, objects: Vec<ClusterObject>) {
        self.objects.retain(|key, _| key.kind != kind);
        for object in objects {
            self.upsert(object);
        }
        self.hydrated.insert(kind);
    }

    pub fn is_hydrated(&self, kinds: &[ClusterKind]) -> bool {
        kinds.iter().all(|kind| self.hydrated.contains(kind))
    }

    pub fn hydrated_count(&self, kinds: &[ClusterKind]) -> usize {
        kinds
            .iter()
            .filter(|kind| self.hydrated.contains(kind))
            .count()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ClusterObject> {
        self.objects.get(key)
    }

    pub fn of_kind(&self, kind: ClusterKind) -> Vec<ClusterObject> {
        self.objects
            .values()
            .filter(|o| o.kind == kind)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
