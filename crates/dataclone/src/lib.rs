//! Tessera dataclone (Milestone 3): seeds the volumes of replicas added by a
//! horizontal scale-out with data from an existing replica.
//!
//! Each pass asks the strategy whether the clone already succeeded; if not,
//! `clone_data` returns the objects to create next. Nothing is awaited in
//! place: the caller applies the objects and comes back on a later pass.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tessera_core::crd::{Backup, BackupPolicy};
use tessera_core::labels::{self, Labels};
use tessera_core::spec::{HScalePolicyType, SynthesizedComponent, VolumeClaimTemplate};
use tessera_core::status::ClonePhase;
use tessera_core::{EngineConfig, Error, ManagedObject, ObjectKey, ObjectKind, Owner, Result};
use tessera_kubehub::ObjectStore;
use tracing::{debug, info};

pub mod build;
mod backup;
mod snapshot;
mod state;

pub use backup::BackupClone;
pub use snapshot::SnapshotClone;
pub use state::{is_scale_out_failed, CloneTracker, ReplicaCloneState};

/// A volume claim a new replica needs before it can start.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVolume {
    pub claim: String,
    pub template: VolumeClaimTemplate,
    pub ordinal: i32,
    /// Only the data template is cloned; other templates get blank claims.
    pub carries_data: bool,
}

impl PendingVolume {
    pub fn key(&self, namespace: &str) -> ObjectKey { ObjectKey::new(ObjectKind::VolumeClaim, namespace, &self.claim) }
}

/// Everything a strategy reads during one pass.
#[derive(Clone, Copy)]
pub struct CloneContext<'a> {
    pub store: &'a dyn ObjectStore,
    pub component: &'a SynthesizedComponent,
    pub owner: &'a Owner,
    /// Live workload; its replica count is where new ordinals start.
    pub live: &'a StatefulSet,
    pub desired_replicas: i32,
    pub config: &'a EngineConfig,
}

impl<'a> CloneContext<'a> {
    pub fn namespace(&self) -> &str { &self.component.namespace }

    pub fn workload_name(&self) -> String {
        self.live.metadata.name.clone().unwrap_or_else(|| self.component.workload_name())
    }

    pub fn live_replicas(&self) -> i32 { self.live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1) }

    /// Name shared by the Backup or VolumeSnapshot taken for this scale-out.
    pub fn backup_name(&self) -> String { format!("{}-scaling", self.workload_name()) }

    pub fn backup_labels(&self) -> Labels { labels::backup(&self.component.cluster_name, &self.component.name) }

    pub fn backup_policy_template(&self) -> Option<&str> {
        self.component
            .horizontal_scale_policy
            .as_ref()
            .and_then(|p| p.backup_policy_template_name.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// The template named by the policy, or the first one.
    pub fn data_template(&self) -> Option<&VolumeClaimTemplate> {
        let tpls = &self.component.volume_claim_templates;
        let named = self.component.horizontal_scale_policy.as_ref().and_then(|p| p.volume_mounts_name.as_deref());
        named.and_then(|n| tpls.iter().find(|t| t.name == n)).or_else(|| tpls.first())
    }

    pub fn claim_name(&self, template: &str, ordinal: i32) -> String {
        format!("{}-{}-{}", template, self.workload_name(), ordinal)
    }

    /// Every (template × new ordinal) claim, ordinals `[live, desired)`.
    pub fn pending_volumes(&self) -> Vec<PendingVolume> {
        let data = self.data_template().map(|t| t.name.clone());
        let mut out = Vec::new();
        for ordinal in self.live_replicas()..self.desired_replicas {
            for t in self.component.volume_claim_templates.iter() {
                out.push(PendingVolume {
                    claim: self.claim_name(&t.name, ordinal),
                    template: t.clone(),
                    ordinal,
                    carries_data: data.as_deref() == Some(t.name.as_str()),
                });
            }
        }
        out
    }

    pub async fn claim(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let key = ObjectKey::new(ObjectKind::VolumeClaim, self.namespace(), name);
        Ok(self.store.get(&key).await?.and_then(|o| PersistentVolumeClaim::try_from(o).ok()))
    }

    pub async fn all_claims_exist(&self) -> Result<bool> {
        for pv in self.pending_volumes() {
            if self.claim(&pv.claim).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Claims of ordinals `[0, desired)` on the data template are all Bound.
    pub async fn all_claims_bound(&self) -> Result<bool> {
        let Some(tpl) = self.data_template() else { return Ok(true) };
        for ordinal in 0..self.desired_replicas {
            let bound = self
                .claim(&self.claim_name(&tpl.name, ordinal))
                .await?
                .and_then(|c| c.status)
                .and_then(|s| s.phase)
                .map(|p| p == "Bound")
                .unwrap_or(false);
            if !bound {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Blank claim for `pv` unless it exists already.
    pub async fn blank_claim(&self, pv: &PendingVolume) -> Result<Vec<ManagedObject>> {
        if self.claim(&pv.claim).await?.is_some() {
            return Ok(Vec::new());
        }
        Ok(vec![build::claim(self, pv, None).into()])
    }

    pub async fn get_backup(&self) -> Result<Option<Backup>> {
        let key = ObjectKey::new(ObjectKind::Backup, self.namespace(), self.backup_name());
        Ok(self.store.get(&key).await?.and_then(|o| Backup::try_from(o).ok()))
    }

    /// The BackupPolicy provisioned for this cluster from the policy's template.
    pub async fn backup_policy(&self) -> Result<BackupPolicy> {
        let Some(tpl) = self.backup_policy_template() else {
            return Err(Error::NotFound(format!("component {} names no backup policy template", self.component.name)));
        };
        let mut selector = labels::instance(&self.component.cluster_name);
        selector.insert(labels::COMPONENT_DEF.to_string(), self.component.component_def.clone());
        for obj in self.store.list(ObjectKind::BackupPolicy, self.namespace(), &selector).await? {
            let from_tpl = obj.meta().annotations.as_ref().and_then(|a| a.get(labels::BACKUP_POLICY_TEMPLATE)).map(String::as_str);
            if from_tpl == Some(tpl) {
                if let Ok(p) = BackupPolicy::try_from(obj) {
                    return Ok(p);
                }
            }
        }
        Err(Error::NotFound(format!("no backup policy created from template {}", tpl)))
    }

    /// Temporary objects of `kind` labelled for this component's scale-out.
    pub async fn list_tmp(&self, kind: ObjectKind) -> Result<Vec<ManagedObject>> {
        self.store.list(kind, self.namespace(), &self.backup_labels()).await
    }
}

/// One way of seeding new replicas' volumes.
#[async_trait]
pub trait DataClone: Send + Sync {
    fn context(&self) -> &CloneContext<'_>;

    /// True once every new replica has its volumes and no restore is pending.
    async fn succeed(&self) -> Result<bool>;

    /// Backup-side objects to delete once the scale-out has settled.
    async fn clear_tmp_resources(&self) -> Result<Vec<ManagedObject>>;

    async fn check_backup_status(&self) -> Result<ClonePhase>;
    async fn backup(&self) -> Result<Vec<ManagedObject>>;
    async fn check_restore_status(&self, pv: &PendingVolume) -> Result<ClonePhase>;
    async fn restore(&self, pv: &PendingVolume) -> Result<Vec<ManagedObject>>;

    async fn clone_data(&self) -> Result<Vec<ManagedObject>> {
        let mut tracker = CloneTracker::default();
        self.clone_data_tracked(&mut tracker).await
    }

    /// Objects to create this pass. Observed phases are merged into
    /// `tracker` so a phase recorded by an earlier pass never regresses.
    async fn clone_data_tracked(&self, tracker: &mut CloneTracker) -> Result<Vec<ManagedObject>> {
        let backup_name = self.context().backup_name();
        let observed = self.check_backup_status().await?;
        match tracker.observe(&backup_name, observed) {
            ClonePhase::NotCreated => {
                let objs = self.backup().await?;
                info!(backup = %backup_name, objects = objs.len(), "scale-out backup requested");
                metrics::counter!("clone_objects_created", objs.len() as u64);
                return Ok(objs);
            }
            ClonePhase::Processing => {
                debug!(backup = %backup_name, "waiting for scale-out backup");
                return Ok(Vec::new());
            }
            ClonePhase::Failed => return Err(Error::CloneFailed(format!("backup {} failed", backup_name))),
            ClonePhase::ReadyToUse => {}
        }
        let mut objs = Vec::new();
        for pv in self.context().pending_volumes() {
            let observed = self.check_restore_status(&pv).await?;
            match tracker.observe(&pv.claim, observed) {
                ClonePhase::NotCreated => objs.extend(self.restore(&pv).await?),
                ClonePhase::Processing | ClonePhase::ReadyToUse => {}
                ClonePhase::Failed => return Err(Error::CloneFailed(format!("restore of {} failed", pv.claim))),
            }
        }
        if !objs.is_empty() {
            info!(backup = %backup_name, objects = objs.len(), "scale-out restore requested");
            metrics::counter!("clone_objects_created", objs.len() as u64);
        }
        Ok(objs)
    }
}

/// Strategy for the component's horizontal-scale policy, or `None` when new
/// replicas start with empty volumes.
pub fn new_data_clone<'a>(ctx: CloneContext<'a>) -> Result<Option<Box<dyn DataClone + 'a>>> {
    match ctx.component.hscale_policy_type() {
        HScalePolicyType::None => Ok(None),
        HScalePolicyType::Snapshot => {
            if ctx.config.volume_snapshot_enabled {
                Ok(Some(Box::new(SnapshotClone::new(ctx))))
            } else if ctx.backup_policy_template().is_some() {
                Ok(Some(Box::new(BackupClone::new(ctx))))
            } else {
                Err(Error::Config("h-scale policy is Snapshot but neither volume snapshots nor a backup tool is enabled".into()))
            }
        }
        HScalePolicyType::Backup => {
            if ctx.backup_policy_template().is_some() {
                Ok(Some(Box::new(BackupClone::new(ctx))))
            } else {
                Err(Error::Config("h-scale policy is Backup but names no backup policy template".into()))
            }
        }
    }
}
