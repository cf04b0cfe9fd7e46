use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::{de::DeserializeOwned, Serialize};
use tessera_core::crd::{Backup, BackupPolicy, BackupPolicyTemplate, BackupTool, Cluster, VolumeSnapshot};
use tessera_core::labels::{self, Labels};
use tessera_core::{Error, ManagedObject, ObjectKey, ObjectKind, Result};
use tracing::debug;

use crate::ObjectStore;

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    manager: String,
}

fn map_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message),
        other => Error::store(other),
    }
}

async fn get_in<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get_opt(name).await.map_err(map_err)
}

async fn list_in<K>(api: Api<K>, selector: &Labels) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    let mut lp = ListParams::default();
    if !selector.is_empty() {
        lp = lp.labels(&labels::to_selector_string(selector));
    }
    Ok(api.list(&lp).await.map_err(map_err)?.items)
}

fn name_of<K: Resource>(o: &K) -> Result<&str> {
    o.meta().name.as_deref().ok_or_else(|| Error::Invariant("object without metadata.name".into()))
}

async fn create_in<K>(api: Api<K>, obj: &K, manager: &str) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let pp = PostParams { field_manager: Some(manager.to_string()), ..Default::default() };
    api.create(&pp, obj).await.map_err(map_err)
}

async fn replace_in<K>(api: Api<K>, obj: &K, manager: &str) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let pp = PostParams { field_manager: Some(manager.to_string()), ..Default::default() };
    api.replace(name_of(obj)?, &pp, obj).await.map_err(map_err)
}

async fn delete_in<K>(api: Api<K>, obj: &K, orphan: bool) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let dp = if orphan { DeleteParams::orphan() } else { DeleteParams::background() };
    match api.delete(name_of(obj)?, &dp).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(map_err(e)),
    }
}

macro_rules! by_kind {
    ($self:ident, $kind:expr, $ns:expr, |$api:ident| $body:expr) => {
        match $kind {
            ObjectKind::Workload => { let $api = $self.namespaced::<StatefulSet>($ns); $body }
            ObjectKind::Service => { let $api = $self.namespaced::<Service>($ns); $body }
            ObjectKind::Secret => { let $api = $self.namespaced::<Secret>($ns); $body }
            ObjectKind::ConfigMap => { let $api = $self.namespaced::<ConfigMap>($ns); $body }
            ObjectKind::VolumeClaim => { let $api = $self.namespaced::<PersistentVolumeClaim>($ns); $body }
            ObjectKind::DisruptionBudget => { let $api = $self.namespaced::<PodDisruptionBudget>($ns); $body }
            ObjectKind::Job => { let $api = $self.namespaced::<Job>($ns); $body }
            ObjectKind::CronJob => { let $api = $self.namespaced::<CronJob>($ns); $body }
            ObjectKind::Pod => { let $api = $self.namespaced::<Pod>($ns); $body }
            ObjectKind::Backup => { let $api = $self.namespaced::<Backup>($ns); $body }
            ObjectKind::BackupPolicy => { let $api = $self.namespaced::<BackupPolicy>($ns); $body }
            ObjectKind::BackupPolicyTemplate => { let $api = $self.cluster_wide::<BackupPolicyTemplate>(); $body }
            ObjectKind::BackupTool => { let $api = $self.cluster_wide::<BackupTool>(); $body }
            ObjectKind::Snapshot => { let $api = $self.namespaced::<VolumeSnapshot>($ns); $body }
        }
    };
}

macro_rules! by_object {
    ($self:ident, $obj:expr, |$api:ident, $o:ident| $body:expr) => {{
        let ns = $obj.meta().namespace.clone().unwrap_or_default();
        match $obj {
            ManagedObject::Workload($o) => { let $api = $self.namespaced::<StatefulSet>(&ns); $body }
            ManagedObject::Service($o) => { let $api = $self.namespaced::<Service>(&ns); $body }
            ManagedObject::Secret($o) => { let $api = $self.namespaced::<Secret>(&ns); $body }
            ManagedObject::ConfigMap($o) => { let $api = $self.namespaced::<ConfigMap>(&ns); $body }
            ManagedObject::VolumeClaim($o) => { let $api = $self.namespaced::<PersistentVolumeClaim>(&ns); $body }
            ManagedObject::DisruptionBudget($o) => { let $api = $self.namespaced::<PodDisruptionBudget>(&ns); $body }
            ManagedObject::Job($o) => { let $api = $self.namespaced::<Job>(&ns); $body }
            ManagedObject::CronJob($o) => { let $api = $self.namespaced::<CronJob>(&ns); $body }
            ManagedObject::Pod($o) => { let $api = $self.namespaced::<Pod>(&ns); $body }
            ManagedObject::Backup($o) => { let $api = $self.namespaced::<Backup>(&ns); $body }
            ManagedObject::BackupPolicy($o) => { let $api = $self.namespaced::<BackupPolicy>(&ns); $body }
            ManagedObject::BackupPolicyTemplate($o) => { let $api = $self.cluster_wide::<BackupPolicyTemplate>(); $body }
            ManagedObject::BackupTool($o) => { let $api = $self.cluster_wide::<BackupTool>(); $body }
            ManagedObject::Snapshot($o) => { let $api = $self.namespaced::<VolumeSnapshot>(&ns); $body }
        }
    }};
}

impl KubeStore {
    pub fn new(client: Client, manager: impl Into<String>) -> Self {
        Self { client, manager: manager.into() }
    }

    fn namespaced<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }

    fn cluster_wide<K>(&self) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        by_kind!(self, key.kind, &key.namespace, |api| Ok(get_in(api, &key.name).await?.map(ManagedObject::from)))
    }

    async fn list(&self, kind: ObjectKind, namespace: &str, selector: &Labels) -> Result<Vec<ManagedObject>> {
        by_kind!(self, kind, namespace, |api| Ok(list_in(api, selector).await?.into_iter().map(ManagedObject::from).collect()))
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        debug!(obj = %obj.key(), "create");
        by_object!(self, obj, |api, o| create_in(api, o, &self.manager).await.map(ManagedObject::from))
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        debug!(obj = %obj.key(), "update");
        by_object!(self, obj, |api, o| replace_in(api, o, &self.manager).await.map(ManagedObject::from))
    }

    async fn delete(&self, obj: &ManagedObject, orphan: bool) -> Result<()> {
        debug!(obj = %obj.key(), orphan, "delete");
        by_object!(self, obj, |api, o| delete_in(api, o, orphan).await)
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        get_in(self.namespaced::<Cluster>(namespace), name).await
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let ns = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = name_of(cluster)?;
        // Merge patch carrying resourceVersion keeps optimistic concurrency.
        let body = serde_json::json!({
            "metadata": { "resourceVersion": cluster.metadata.resource_version },
            "status": cluster.status,
        });
        let pp = PatchParams { field_manager: Some(self.manager.clone()), ..Default::default() };
        self.namespaced::<Cluster>(&ns).patch_status(name, &pp, &Patch::Merge(&body)).await.map_err(map_err)
    }
}
