//! Component specification: what the Cluster resource declares per component,
//! and the synthesized view the engine works from.

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodTemplateSpec, ServicePort};
use serde::{Deserialize, Serialize};

use crate::crd::Cluster;
use crate::error::{Error, Result};
use crate::labels::{self, Labels};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    None,
    Readonly,
    ReadWrite,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::None => "None",
            AccessMode::Readonly => "Readonly",
            AccessMode::ReadWrite => "ReadWrite",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusMember {
    pub name: String,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

impl ConsensusMember {
    pub fn new(name: &str, access_mode: AccessMode) -> Self {
        Self { name: name.to_string(), access_mode, replicas: None }
    }
}

/// Order in which replicas are recreated during a rolling update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateStrategy {
    #[default]
    Serial,
    Parallel,
    BestEffortParallel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSpec {
    pub leader: ConsensusMember,
    #[serde(default)]
    pub followers: Vec<ConsensusMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner: Option<ConsensusMember>,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HScalePolicyType {
    /// New replicas start with empty volumes.
    #[default]
    None,
    /// Seed new volumes from a volume snapshot of replica 0.
    Snapshot,
    /// Seed new volumes by running a restore job from a datafile backup.
    Backup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScalePolicy {
    #[serde(rename = "type", default)]
    pub policy_type: HScalePolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_policy_template_name: Option<String>,
    /// Volume template whose data is cloned; defaults to the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentService {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    pub name: String,
    #[serde(default)]
    pub component_def_ref: String,
    pub replicas: i32,
    pub consensus_spec: ConsensusSpec,
    #[serde(default)]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scale_policy: Option<HorizontalScalePolicy>,
    #[serde(default)]
    pub template: PodTemplateSpec,
    #[serde(default)]
    pub services: Vec<ComponentService>,
}

/// Flattened component view: cluster identity plus the component's declared spec.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedComponent {
    pub cluster_name: String,
    pub namespace: String,
    pub name: String,
    pub component_def: String,
    pub replicas: i32,
    pub consensus: ConsensusSpec,
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    pub horizontal_scale_policy: Option<HorizontalScalePolicy>,
    pub template: PodTemplateSpec,
    pub services: Vec<ComponentService>,
}

impl SynthesizedComponent {
    pub fn compose(cluster: &Cluster, spec: &ClusterComponentSpec) -> Result<Self> {
        let cluster_name = cluster.metadata.name.clone().ok_or_else(|| Error::Config("cluster has no name".into()))?;
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        if spec.name.is_empty() {
            return Err(Error::Config(format!("cluster {} declares a component without a name", cluster_name)));
        }
        if spec.replicas < 0 {
            return Err(Error::Config(format!("component {} has negative replicas", spec.name)));
        }
        Ok(Self {
            cluster_name,
            namespace,
            name: spec.name.clone(),
            component_def: spec.component_def_ref.clone(),
            replicas: spec.replicas,
            consensus: spec.consensus_spec.clone(),
            volume_claim_templates: spec.volume_claim_templates.clone(),
            horizontal_scale_policy: spec.horizontal_scale_policy.clone(),
            template: spec.template.clone(),
            services: spec.services.clone(),
        })
    }

    /// Name shared by the workload and the headless service.
    pub fn workload_name(&self) -> String { format!("{}-{}", self.cluster_name, self.name) }

    pub fn match_labels(&self) -> Labels { labels::component(&self.cluster_name, &self.name) }

    pub fn hscale_policy_type(&self) -> HScalePolicyType {
        self.horizontal_scale_policy.as_ref().map(|p| p.policy_type).unwrap_or_default()
    }
}
