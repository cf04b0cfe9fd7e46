//! Tessera store (Milestone 1): snapshot differ input, in-RAM object store
//! and the coalescing requeue queue.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use tessera_core::labels;
use tessera_core::{ObjectKind, Owner, Result};
use tessera_graph::Snapshot;
use tessera_kubehub::{ClusterKey, ObjectStore};
use tracing::debug;

mod mem;

pub use mem::{MemStore, StoreOp};

/// Read every live object of an ownable kind that belongs to `owner`.
///
/// Objects are listed by the instance label, then kept only if an owner
/// reference points back at `owner`, so a foreign object that happens to
/// carry the same label never enters the snapshot.
pub async fn read_snapshot<S: ObjectStore + ?Sized>(store: &S, owner: &Owner) -> Result<Snapshot> {
    let selector = labels::instance(&owner.name);
    let mut snap = Snapshot::new();
    let mut skipped = 0usize;
    for kind in ObjectKind::OWNED {
        for obj in store.list(*kind, &owner.namespace, &selector).await? {
            if owner.owns(obj.meta()) {
                snap.insert(obj);
            } else {
                skipped += 1;
            }
        }
    }
    debug!(owner = %owner.name, objects = snap.len(), skipped, "snapshot read");
    Ok(snap)
}

/// Coalescing queue keyed by cluster with FIFO order and fixed capacity.
/// A key already queued keeps its position.
pub struct KeyQueue {
    queued: FxHashSet<ClusterKey>,
    order: VecDeque<ClusterKey>,
    cap: usize,
    dropped: u64,
}

impl KeyQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self { queued: FxHashSet::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, key: ClusterKey) {
        if self.queued.contains(&key) { return; }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.queued.remove(&old);
                self.dropped += 1;
            }
        }
        self.queued.insert(key.clone());
        self.order.push_back(key);
    }

    /// Drain all currently queued keys in arrival order.
    pub fn drain_ready(&mut self) -> Vec<ClusterKey> {
        self.queued.clear();
        self.order.drain(..).collect()
    }
}
