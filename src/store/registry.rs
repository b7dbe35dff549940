//! Partition Store Registry
//!
//! Concurrent map from partition to its store. Presence in the registry is
//! independent of whether the store is started.
//!
//! Insert-if-absent runs the factory while holding the write lock, so two
//! racing adds for the same partition construct exactly one store. Factories
//! must therefore only do local setup; anything that waits on a destination
//! belongs in [`Store::start`](super::Store::start).

use crate::clustermap::PartitionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of the stores this node currently owns
#[derive(Debug)]
pub struct PartitionStoreRegistry<S> {
    stores: RwLock<HashMap<PartitionId, Arc<S>>>,
}

impl<S> PartitionStoreRegistry<S> {
    pub fn new() -> Self {
        PartitionStoreRegistry {
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Return the store for `partition_id`, constructing it with `factory` if
    /// none is registered
    pub fn add_if_absent<F>(&self, partition_id: PartitionId, factory: F) -> Arc<S>
    where
        F: FnOnce() -> S,
    {
        if let Some(store) = self.stores.read().get(&partition_id) {
            return Arc::clone(store);
        }

        let mut stores = self.stores.write();
        Arc::clone(
            stores
                .entry(partition_id)
                .or_insert_with(|| Arc::new(factory())),
        )
    }

    pub fn get(&self, partition_id: PartitionId) -> Option<Arc<S>> {
        self.stores.read().get(&partition_id).cloned()
    }

    /// Detach the store for `partition_id`; true iff one was registered
    pub fn remove(&self, partition_id: PartitionId) -> bool {
        self.stores.write().remove(&partition_id).is_some()
    }

    pub fn contains(&self, partition_id: PartitionId) -> bool {
        self.stores.read().contains_key(&partition_id)
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }

    /// Registered partitions, sorted
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.stores.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every registered store
    pub fn stores(&self) -> Vec<Arc<S>> {
        self.stores.read().values().cloned().collect()
    }
}

impl<S> Default for PartitionStoreRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
