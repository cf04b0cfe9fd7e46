//! Closed set of objects the engine manages, keyed by (kind, namespace, name).

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::crd::{Backup, BackupPolicy, BackupPolicyTemplate, BackupTool, Cluster, VolumeSnapshot};
use crate::error::{Error, Result};

macro_rules! managed_objects {
    ($($variant:ident($ty:ty) => $api_kind:literal, namespaced = $ns:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ObjectKind { $($variant),* }

        impl ObjectKind {
            pub const ALL: &'static [ObjectKind] = &[$(ObjectKind::$variant),*];

            /// Kind name as the API server spells it.
            pub fn api_kind(self) -> &'static str {
                match self { $(ObjectKind::$variant => $api_kind),* }
            }

            pub fn namespaced(self) -> bool {
                match self { $(ObjectKind::$variant => $ns),* }
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum ManagedObject { $($variant($ty)),* }

        impl ManagedObject {
            pub fn kind(&self) -> ObjectKind {
                match self { $(ManagedObject::$variant(_) => ObjectKind::$variant),* }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self { $(ManagedObject::$variant(o) => o.meta()),* }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self { $(ManagedObject::$variant(o) => o.meta_mut()),* }
            }

            pub fn to_json(&self) -> Result<serde_json::Value> {
                let v = match self { $(ManagedObject::$variant(o) => serde_json::to_value(o)),* };
                v.map_err(|e| Error::Invariant(format!("serializing {}: {}", self.key(), e)))
            }
        }

        $(
            impl From<$ty> for ManagedObject {
                fn from(o: $ty) -> Self { ManagedObject::$variant(o) }
            }

            impl TryFrom<ManagedObject> for $ty {
                type Error = ManagedObject;
                fn try_from(o: ManagedObject) -> std::result::Result<Self, ManagedObject> {
                    match o {
                        ManagedObject::$variant(x) => Ok(x),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

managed_objects! {
    Workload(StatefulSet) => "StatefulSet", namespaced = true;
    Service(Service) => "Service", namespaced = true;
    Secret(Secret) => "Secret", namespaced = true;
    ConfigMap(ConfigMap) => "ConfigMap", namespaced = true;
    VolumeClaim(PersistentVolumeClaim) => "PersistentVolumeClaim", namespaced = true;
    DisruptionBudget(PodDisruptionBudget) => "PodDisruptionBudget", namespaced = true;
    Job(Job) => "Job", namespaced = true;
    CronJob(CronJob) => "CronJob", namespaced = true;
    Pod(Pod) => "Pod", namespaced = true;
    Backup(Backup) => "Backup", namespaced = true;
    BackupPolicy(BackupPolicy) => "BackupPolicy", namespaced = true;
    BackupPolicyTemplate(BackupPolicyTemplate) => "BackupPolicyTemplate", namespaced = false;
    BackupTool(BackupTool) => "BackupTool", namespaced = false;
    Snapshot(VolumeSnapshot) => "VolumeSnapshot", namespaced = true;
}

impl ObjectKind {
    /// Kinds a component owns and the differ indexes.
    pub const OWNED: &'static [ObjectKind] = &[
        ObjectKind::Workload,
        ObjectKind::Service,
        ObjectKind::Secret,
        ObjectKind::ConfigMap,
        ObjectKind::VolumeClaim,
        ObjectKind::DisruptionBudget,
    ];
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.api_kind()) }
}

/// Identity of a managed object. Cluster-scoped kinds use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = if kind.namespaced() { namespace.into() } else { String::new() };
        Self { kind, namespace, name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

impl ManagedObject {
    pub fn key(&self) -> ObjectKey {
        let m = self.meta();
        ObjectKey::new(self.kind(), m.namespace.clone().unwrap_or_default(), m.name.clone().unwrap_or_default())
    }

    pub fn name(&self) -> &str { self.meta().name.as_deref().unwrap_or("") }

    pub fn labels(&self) -> Option<&BTreeMap<String, String>> { self.meta().labels.as_ref() }

    pub fn is_terminating(&self) -> bool { self.meta().deletion_timestamp.is_some() }

    pub fn resource_version(&self) -> Option<&str> { self.meta().resource_version.as_deref() }
}

/// The entity that owns every object of a component (the Cluster resource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl Owner {
    pub fn from_cluster(cluster: &Cluster) -> Result<Self> {
        let name = cluster.metadata.name.clone().ok_or_else(|| Error::Config("cluster has no name".into()))?;
        Ok(Self {
            api_version: Cluster::api_version(&()).to_string(),
            kind: Cluster::kind(&()).to_string(),
            namespace: cluster.metadata.namespace.clone().unwrap_or_default(),
            name,
            uid: cluster.metadata.uid.clone().unwrap_or_default(),
        })
    }

    fn group(api_version: &str) -> &str {
        api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
    }

    /// Owner references carry a version, which may change across upgrades;
    /// only group, kind and name are compared.
    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        let group = Self::group(&self.api_version);
        meta.owner_references.iter().flatten().any(|r| {
            Self::group(&r.api_version) == group && r.kind == self.kind && r.name == self.name
        })
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}
