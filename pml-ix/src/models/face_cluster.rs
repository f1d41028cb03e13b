//! Face clusters and the signature registry
//!
//! A cluster groups items showing the same person. Clusters are created when
//! the analyzer reports a previously-unseen face signature, can be labeled by
//! the user, and can be merged when two clusters are later judged to be the
//! same person (the merge judgment itself is an analyzer concern).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

/// One recognized person across the library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceCluster {
    pub id: Uuid,
    /// Optional user-assigned name
    pub label: Option<String>,
    /// Item ids this cluster appears in
    pub members: BTreeSet<Uuid>,
}

#[derive(Default)]
struct RegistryInner {
    by_signature: HashMap<String, Uuid>,
    clusters: HashMap<Uuid, FaceCluster>,
}

/// Registry resolving analyzer face signatures to stable cluster ids
#[derive(Default)]
pub struct FaceClusterRegistry {
    inner: RwLock<RegistryInner>,
}

impl FaceClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the signatures reported for one item into cluster ids,
    /// creating clusters for unseen signatures and recording membership.
    pub fn observe(&self, item_id: Uuid, signatures: &[String]) -> BTreeSet<Uuid> {
        let mut inner = self.inner.write().unwrap();
        let mut cluster_ids = BTreeSet::new();

        for signature in signatures {
            let cluster_id = match inner.by_signature.get(signature) {
                Some(id) => *id,
                None => {
                    let id = Uuid::new_v4();
                    inner.by_signature.insert(signature.clone(), id);
                    inner.clusters.insert(
                        id,
                        FaceCluster {
                            id,
                            label: None,
                            members: BTreeSet::new(),
                        },
                    );
                    tracing::debug!(cluster_id = %id, "Created face cluster for new signature");
                    id
                }
            };
            if let Some(cluster) = inner.clusters.get_mut(&cluster_id) {
                cluster.members.insert(item_id);
            }
            cluster_ids.insert(cluster_id);
        }

        cluster_ids
    }

    /// Re-establish cluster membership from persisted item attrs.
    ///
    /// Signatures are not persisted, so restored clusters have no signature
    /// mapping until re-analysis observes them again.
    pub fn restore_membership(&self, cluster_id: Uuid, item_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        inner
            .clusters
            .entry(cluster_id)
            .or_insert_with(|| FaceCluster {
                id: cluster_id,
                label: None,
                members: BTreeSet::new(),
            })
            .members
            .insert(item_id);
    }

    /// Drop an item from all clusters (item removed or re-analyzed)
    pub fn forget_item(&self, item_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        for cluster in inner.clusters.values_mut() {
            cluster.members.remove(&item_id);
        }
    }

    /// Assign a user label to a cluster
    pub fn set_label(&self, cluster_id: Uuid, label: Option<String>) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.clusters.get_mut(&cluster_id) {
            Some(cluster) => {
                cluster.label = label;
                true
            }
            None => false,
        }
    }

    /// Merge `from` into `into`: membership union, signatures repointed,
    /// `from` removed. Returns the item ids that were members of `from`
    /// so the caller can rewrite their attrs in the index.
    pub fn merge(&self, into: Uuid, from: Uuid) -> Option<Vec<Uuid>> {
        if into == from {
            return None;
        }
        let mut inner = self.inner.write().unwrap();
        if !inner.clusters.contains_key(&into) {
            return None;
        }
        let removed = inner.clusters.remove(&from)?;

        for target in inner.by_signature.values_mut() {
            if *target == from {
                *target = into;
            }
        }
        if let Some(cluster) = inner.clusters.get_mut(&into) {
            cluster.members.extend(removed.members.iter().copied());
            if cluster.label.is_none() {
                cluster.label = removed.label;
            }
        }

        tracing::info!(into = %into, from = %from, moved = removed.members.len(), "Merged face clusters");
        Some(removed.members.into_iter().collect())
    }

    pub fn get(&self, cluster_id: Uuid) -> Option<FaceCluster> {
        self.inner.read().unwrap().clusters.get(&cluster_id).cloned()
    }

    pub fn list(&self) -> Vec<FaceCluster> {
        let inner = self.inner.read().unwrap();
        let mut clusters: Vec<_> = inner.clusters.values().cloned().collect();
        clusters.sort_by_key(|c| c.id);
        clusters
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
