use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tessera_core::crd::Cluster;
use tessera_core::labels::{self, Labels};
use tessera_core::{Error, ManagedObject, ObjectKey, ObjectKind, Result};
use tessera_kubehub::{ClusterKey, ObjectStore};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Create(ObjectKey),
    Update(ObjectKey),
    Delete(ObjectKey),
    UpdateClusterStatus(ClusterKey),
}

/// In-RAM [`ObjectStore`] with resourceVersion conflict detection.
///
/// Writes bump a store-wide resourceVersion. Updates that change anything
/// outside `metadata` and `status` bump `metadata.generation`, like the API
/// server does for spec changes.
#[derive(Default)]
pub struct MemStore {
    objects: ArcSwap<FxHashMap<ObjectKey, ManagedObject>>,
    clusters: ArcSwap<FxHashMap<ClusterKey, Cluster>>,
    ops: ArcSwap<Vec<StoreOp>>,
    rv: AtomicU64,
}

fn body(obj: &ManagedObject) -> Result<Json> {
    let mut v = obj.to_json()?;
    if let Some(o) = v.as_object_mut() {
        o.remove("metadata");
        o.remove("status");
    }
    Ok(v)
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn next_rv(&self) -> String { (self.rv.fetch_add(1, Ordering::Relaxed) + 1).to_string() }

    fn record(&self, op: StoreOp) {
        self.ops.rcu(|ops| {
            let mut next = Vec::clone(ops);
            next.push(op.clone());
            next
        });
    }

    /// Write operations performed so far, in order.
    pub fn ops(&self) -> Vec<StoreOp> { Vec::clone(&self.ops.load()) }

    pub fn clear_ops(&self) { self.ops.store(Arc::new(Vec::new())); }

    /// Store `obj` as-is (seeding live state); fills in server-set metadata.
    pub fn insert(&self, mut obj: ManagedObject) -> ManagedObject {
        let rv = self.next_rv();
        let m = obj.meta_mut();
        m.resource_version = Some(rv);
        if m.uid.is_none() { m.uid = Some(uuid::Uuid::new_v4().to_string()); }
        if m.generation.is_none() { m.generation = Some(1); }
        if m.creation_timestamp.is_none() { m.creation_timestamp = Some(Time(chrono::Utc::now())); }
        let key = obj.key();
        let stored = obj.clone();
        self.objects.rcu(|objs| {
            let mut next = FxHashMap::clone(objs);
            next.insert(key.clone(), stored.clone());
            next
        });
        obj
    }

    /// Mutate a stored object in place (simulating other controllers).
    /// Returns false when the key is absent.
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut ManagedObject)) -> bool {
        let Some(mut obj) = self.objects.load().get(key).cloned() else { return false };
        f(&mut obj);
        obj.meta_mut().resource_version = None;
        let stored = self.insert(obj);
        trace!(obj = %stored.key(), "modified");
        true
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<ManagedObject> {
        let prev = self.objects.load().get(key).cloned();
        self.objects.rcu(|objs| {
            let mut next = FxHashMap::clone(objs);
            next.remove(key);
            next
        });
        prev
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> { self.objects.load().get(key).cloned() }

    pub fn objects_of(&self, kind: ObjectKind) -> Vec<ManagedObject> {
        let mut out: Vec<ManagedObject> = self.objects.load().values().filter(|o| o.kind() == kind).cloned().collect();
        out.sort_by_key(|o| o.key());
        out
    }

    pub fn insert_cluster(&self, mut cluster: Cluster) -> Cluster {
        cluster.metadata.resource_version = Some(self.next_rv());
        if cluster.metadata.generation.is_none() { cluster.metadata.generation = Some(1); }
        if cluster.metadata.uid.is_none() { cluster.metadata.uid = Some(uuid::Uuid::new_v4().to_string()); }
        let key = ClusterKey::new(
            cluster.metadata.namespace.clone().unwrap_or_default(),
            cluster.metadata.name.clone().unwrap_or_default(),
        );
        let stored = cluster.clone();
        self.clusters.rcu(|cs| {
            let mut next = FxHashMap::clone(cs);
            next.insert(key.clone(), stored.clone());
            next
        });
        cluster
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<Cluster> {
        self.clusters.load().get(&ClusterKey::new(namespace, name)).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> { Ok(self.object(key)) }

    async fn list(&self, kind: ObjectKind, namespace: &str, selector: &Labels) -> Result<Vec<ManagedObject>> {
        Ok(self
            .objects_of(kind)
            .into_iter()
            .filter(|o| !kind.namespaced() || o.key().namespace == namespace)
            .filter(|o| labels::matches(o.labels(), selector))
            .collect())
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        if key.name.is_empty() {
            return Err(Error::Invariant(format!("create {} without a name", key.kind)));
        }
        if self.objects.load().contains_key(&key) {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }
        let mut fresh = obj.clone();
        let m = fresh.meta_mut();
        m.uid = None;
        m.generation = None;
        m.creation_timestamp = None;
        let stored = self.insert(fresh);
        self.record(StoreOp::Create(key));
        Ok(stored)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let Some(cur) = self.object(&key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        if let Some(rv) = obj.resource_version() {
            if Some(rv) != cur.resource_version() {
                return Err(Error::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        let mut next = obj.clone();
        let changed = body(&next)? != body(&cur)?;
        let (cm, m) = (cur.meta(), next.meta_mut());
        m.uid = cm.uid.clone();
        m.creation_timestamp = cm.creation_timestamp.clone();
        m.generation = cm.generation.map(|g| if changed { g + 1 } else { g });
        let stored = self.insert(next);
        self.record(StoreOp::Update(key));
        Ok(stored)
    }

    async fn delete(&self, obj: &ManagedObject, _orphan: bool) -> Result<()> {
        let key = obj.key();
        if self.remove(&key).is_some() {
            self.record(StoreOp::Delete(key));
        }
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> { Ok(self.cluster(namespace, name)) }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let ns = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let Some(mut cur) = self.cluster(&ns, &name) else {
            return Err(Error::NotFound(format!("Cluster/{}/{}", ns, name)));
        };
        if cluster.metadata.resource_version.is_some() && cluster.metadata.resource_version != cur.metadata.resource_version {
            return Err(Error::Conflict(format!("Cluster/{}/{}: stale resourceVersion", ns, name)));
        }
        cur.status = cluster.status.clone();
        let stored = self.insert_cluster(cur);
        self.record(StoreOp::UpdateClusterStatus(ClusterKey::new(ns, name)));
        Ok(stored)
    }
}
