use async_trait::async_trait;
use tessera_core::crd::{BackupPhase, BackupType, VolumeSnapshot};
use tessera_core::labels::{self, Labels};
use tessera_core::status::ClonePhase;
use tessera_core::{Error, ManagedObject, ObjectKey, ObjectKind, Result};
use tracing::{debug, warn};

use crate::{build, CloneContext, DataClone, PendingVolume};

/// Clones the data template of replica 0 through a volume snapshot; new
/// claims are provisioned with the snapshot as their data source.
pub struct SnapshotClone<'a> {
    ctx: CloneContext<'a>,
}

impl<'a> SnapshotClone<'a> {
    pub fn new(ctx: CloneContext<'a>) -> Self { Self { ctx } }

    fn snapshot_selector(&self) -> Labels {
        let mut l = Labels::new();
        l.insert(labels::BACKUP_NAME.to_string(), self.ctx.backup_name());
        l
    }

    async fn snapshots(&self) -> Result<Vec<VolumeSnapshot>> {
        let objs = self.ctx.store.list(ObjectKind::Snapshot, self.ctx.namespace(), &self.snapshot_selector()).await?;
        Ok(objs.into_iter().filter_map(|o| VolumeSnapshot::try_from(o).ok()).collect())
    }

    fn snapshot_phase(&self, vs: &VolumeSnapshot) -> ClonePhase {
        let status = vs.status.as_ref();
        if let Some(msg) = status.and_then(|s| s.error.as_ref()).and_then(|e| e.message.as_deref()).filter(|m| !m.is_empty()) {
            warn!(snapshot = ?vs.metadata.name, error = %msg, "volume snapshot failed");
            return ClonePhase::Failed;
        }
        if status.and_then(|s| s.ready_to_use).unwrap_or(false) {
            ClonePhase::ReadyToUse
        } else {
            ClonePhase::Processing
        }
    }
}

#[async_trait]
impl<'a> DataClone for SnapshotClone<'a> {
    fn context(&self) -> &CloneContext<'_> { &self.ctx }

    async fn succeed(&self) -> Result<bool> {
        if self.ctx.component.volume_claim_templates.is_empty() {
            debug!(component = %self.ctx.component.name, "no volume templates, nothing to clone");
            return Ok(true);
        }
        self.ctx.all_claims_exist().await
    }

    async fn clear_tmp_resources(&self) -> Result<Vec<ManagedObject>> {
        if !self.ctx.all_claims_bound().await? {
            return Ok(Vec::new());
        }
        let mut objs = self.ctx.list_tmp(ObjectKind::Backup).await?;
        objs.extend(self.snapshots().await?.into_iter().map(ManagedObject::from));
        Ok(objs)
    }

    async fn check_backup_status(&self) -> Result<ClonePhase> {
        if self.ctx.backup_policy_template().is_some() {
            let Some(b) = self.ctx.get_backup().await? else { return Ok(ClonePhase::NotCreated) };
            match b.status.as_ref().and_then(|s| s.phase) {
                Some(BackupPhase::Failed) => {
                    let reason = b.status.as_ref().and_then(|s| s.failure_reason.clone()).unwrap_or_default();
                    warn!(backup = %self.ctx.backup_name(), %reason, "backup for horizontal scaling failed");
                    return Ok(ClonePhase::Failed);
                }
                Some(BackupPhase::Completed) => {}
                _ => return Ok(ClonePhase::Processing),
            }
            // The backup controller takes the snapshot; wait until it shows up.
            return Ok(self
                .snapshots()
                .await?
                .iter()
                .find(|vs| vs.metadata.deletion_timestamp.is_none())
                .map(|vs| self.snapshot_phase(vs))
                .unwrap_or(ClonePhase::Processing));
        }
        let key = ObjectKey::new(ObjectKind::Snapshot, self.ctx.namespace(), self.ctx.backup_name());
        match self.ctx.store.get(&key).await? {
            Some(ManagedObject::Snapshot(vs)) => Ok(self.snapshot_phase(&vs)),
            _ => Ok(ClonePhase::NotCreated),
        }
    }

    async fn backup(&self) -> Result<Vec<ManagedObject>> {
        if self.ctx.backup_policy_template().is_some() {
            let policy = self.ctx.backup_policy().await?;
            let name = policy.metadata.name.clone().unwrap_or_default();
            return Ok(vec![build::backup(&self.ctx, &name, BackupType::Snapshot).into()]);
        }
        let Some(tpl) = self.ctx.data_template() else { return Ok(Vec::new()) };
        let source = self.ctx.claim_name(&tpl.name, 0);
        Ok(vec![build::volume_snapshot(&self.ctx, &source).into()])
    }

    async fn check_restore_status(&self, pv: &PendingVolume) -> Result<ClonePhase> {
        Ok(if self.ctx.claim(&pv.claim).await?.is_some() { ClonePhase::ReadyToUse } else { ClonePhase::NotCreated })
    }

    async fn restore(&self, pv: &PendingVolume) -> Result<Vec<ManagedObject>> {
        if !pv.carries_data {
            return self.ctx.blank_claim(pv).await;
        }
        if self.ctx.claim(&pv.claim).await?.is_some() {
            return Ok(Vec::new());
        }
        let snapshots = self.snapshots().await?;
        let Some(source) = snapshots.iter().find(|vs| vs.metadata.deletion_timestamp.is_none()).and_then(|vs| vs.metadata.name.as_deref()) else {
            return Err(Error::NotFound(format!(
                "volume snapshot for cluster {} component {}",
                self.ctx.component.cluster_name, self.ctx.component.name
            )));
        };
        Ok(vec![build::claim(&self.ctx, pv, Some(source)).into()])
    }
}
