//! Tessera kubehub (Milestone 0) – object store access and watcher wiring

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tessera_core::crd::Cluster;
use tessera_core::labels::{self, Labels};
use tessera_core::{ManagedObject, ObjectKey, ObjectKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod kube_store;

pub use kube_store::KubeStore;

/// Reads and writes managed objects.
///
/// `get` reports absence as `Ok(None)`; `delete` tolerates an object that is
/// already gone. Every call is a single request: retries belong to the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> tessera_core::Result<Option<ManagedObject>>;
    /// List `kind` in `namespace` (ignored for cluster-scoped kinds) matching `selector`.
    async fn list(&self, kind: ObjectKind, namespace: &str, selector: &Labels) -> tessera_core::Result<Vec<ManagedObject>>;
    async fn create(&self, obj: &ManagedObject) -> tessera_core::Result<ManagedObject>;
    /// Replace; the object's resourceVersion guards against lost updates.
    async fn update(&self, obj: &ManagedObject) -> tessera_core::Result<ManagedObject>;
    async fn delete(&self, obj: &ManagedObject, orphan: bool) -> tessera_core::Result<()>;
    async fn get_cluster(&self, namespace: &str, name: &str) -> tessera_core::Result<Option<Cluster>>;
    async fn update_cluster_status(&self, cluster: &Cluster) -> tessera_core::Result<Cluster>;
}

/// Identity of a Cluster to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

/// Kube client from the default kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Key of the Cluster a watched object belongs to.
pub fn cluster_key_of<K>(obj: &K) -> Option<ClusterKey>
where
    K: Resource,
    K::DynamicType: Default,
{
    let meta = obj.meta();
    let ns = meta.namespace.clone().unwrap_or_default();
    if K::kind(&Default::default()) == "Cluster" {
        return meta.name.clone().map(|n| ClusterKey::new(ns, n));
    }
    meta.labels.as_ref().and_then(|l| l.get(labels::INSTANCE)).map(|n| ClusterKey::new(ns, n.clone()))
}

/// List+watch `api` and forward the owning cluster's key for every event.
pub async fn start_watcher<K>(api: Api<K>, cfg: watcher::Config, key_tx: mpsc::Sender<ClusterKey>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) | Event::Deleted(o) => {
                if let Some(k) = cluster_key_of(&o) {
                    debug!(kind = %kind, obj = %o.name_any(), cluster = %k, "watch event");
                    metrics::counter!("watch_events", 1u64);
                    if key_tx.send(k).await.is_err() { break; }
                }
            }
            Event::Restarted(list) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                for o in list.iter() {
                    if let Some(k) = cluster_key_of(o) {
                        if key_tx.send(k).await.is_err() { return Ok(()); }
                    }
                }
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

/// Watch Clusters plus the workloads and pods the engine manages, feeding
/// reconcile keys into `key_tx` until any stream ends.
pub async fn watch_all(client: Client, namespace: Option<&str>, manager: &str, key_tx: mpsc::Sender<ClusterKey>) -> Result<()> {
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::Pod;

    fn api<K>(client: &Client, ns: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match ns {
            Some(n) => Api::namespaced(client.clone(), n),
            None => Api::all(client.clone()),
        }
    }

    let managed = watcher::Config::default().labels(&format!("{}={}", labels::MANAGED_BY, manager));
    let clusters = start_watcher(api::<Cluster>(&client, namespace), watcher::Config::default(), key_tx.clone());
    let workloads = start_watcher(api::<StatefulSet>(&client, namespace), managed.clone(), key_tx.clone());
    let pods = start_watcher(api::<Pod>(&client, namespace), managed, key_tx);
    tokio::try_join!(clusters, workloads, pods)?;
    Ok(())
}
