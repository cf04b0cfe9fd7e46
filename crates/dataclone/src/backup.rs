use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use tessera_core::crd::{BackupPhase, BackupPolicy, BackupTool, BackupType};
use tessera_core::status::ClonePhase;
use tessera_core::{Error, ManagedObject, ObjectKey, ObjectKind, Result};
use tracing::warn;

use crate::{build, CloneContext, DataClone, PendingVolume};

/// Clones through a datafile backup; each new data claim is filled by a
/// restore job built from the policy's backup tool.
pub struct BackupClone<'a> {
    ctx: CloneContext<'a>,
}

impl<'a> BackupClone<'a> {
    pub fn new(ctx: CloneContext<'a>) -> Self { Self { ctx } }

    async fn restore_job(&self, claim: &str) -> Result<Option<Job>> {
        let key = ObjectKey::new(ObjectKind::Job, self.ctx.namespace(), build::restore_job_name(claim));
        Ok(self.ctx.store.get(&key).await?.and_then(|o| Job::try_from(o).ok()))
    }

    async fn backup_tool(&self, policy_name: &str) -> Result<BackupTool> {
        let key = ObjectKey::new(ObjectKind::BackupPolicy, self.ctx.namespace(), policy_name);
        let policy = self
            .ctx
            .store
            .get(&key)
            .await?
            .and_then(|o| BackupPolicy::try_from(o).ok())
            .ok_or_else(|| Error::NotFound(format!("backup policy {}", policy_name)))?;
        let Some(tool_name) = policy.spec.backup_tool_name.filter(|n| !n.is_empty()) else {
            return Err(Error::NotFound(format!("backup policy {} names no backup tool", policy_name)));
        };
        let key = ObjectKey::new(ObjectKind::BackupTool, "", &tool_name);
        self.ctx
            .store
            .get(&key)
            .await?
            .and_then(|o| BackupTool::try_from(o).ok())
            .ok_or_else(|| Error::NotFound(format!("backup tool {}", tool_name)))
    }
}

fn job_phase(job: &Job) -> ClonePhase {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) >= 1 {
        return ClonePhase::ReadyToUse;
    }
    let failed = status
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Failed" && c.status == "True"))
        .unwrap_or(false);
    if failed { ClonePhase::Failed } else { ClonePhase::Processing }
}

#[async_trait]
impl<'a> DataClone for BackupClone<'a> {
    fn context(&self) -> &CloneContext<'_> { &self.ctx }

    async fn succeed(&self) -> Result<bool> {
        if !self.ctx.all_claims_exist().await? {
            return Ok(false);
        }
        for pv in self.ctx.pending_volumes().iter().filter(|pv| pv.carries_data) {
            if self.check_restore_status(pv).await? != ClonePhase::ReadyToUse {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clear_tmp_resources(&self) -> Result<Vec<ManagedObject>> {
        let mut objs = self.ctx.list_tmp(ObjectKind::Backup).await?;
        objs.extend(self.ctx.list_tmp(ObjectKind::Job).await?);
        Ok(objs)
    }

    async fn check_backup_status(&self) -> Result<ClonePhase> {
        let Some(b) = self.ctx.get_backup().await? else { return Ok(ClonePhase::NotCreated) };
        Ok(match b.status.as_ref().and_then(|s| s.phase) {
            Some(BackupPhase::Failed) => {
                let reason = b.status.as_ref().and_then(|s| s.failure_reason.clone()).unwrap_or_default();
                warn!(backup = %self.ctx.backup_name(), %reason, "backup for horizontal scaling failed");
                ClonePhase::Failed
            }
            Some(BackupPhase::Completed) => ClonePhase::ReadyToUse,
            _ => ClonePhase::Processing,
        })
    }

    async fn backup(&self) -> Result<Vec<ManagedObject>> {
        let policy = self.ctx.backup_policy().await?;
        let name = policy.metadata.name.clone().unwrap_or_default();
        Ok(vec![build::backup(&self.ctx, &name, BackupType::Datafile).into()])
    }

    async fn check_restore_status(&self, pv: &PendingVolume) -> Result<ClonePhase> {
        if !pv.carries_data {
            return Ok(if self.ctx.claim(&pv.claim).await?.is_some() { ClonePhase::ReadyToUse } else { ClonePhase::NotCreated });
        }
        Ok(match self.restore_job(&pv.claim).await? {
            None => ClonePhase::NotCreated,
            Some(job) => job_phase(&job),
        })
    }

    async fn restore(&self, pv: &PendingVolume) -> Result<Vec<ManagedObject>> {
        let mut objs = self.ctx.blank_claim(pv).await?;
        if !pv.carries_data || self.restore_job(&pv.claim).await?.is_some() {
            return Ok(objs);
        }
        let Some(backup) = self.ctx.get_backup().await? else {
            return Err(Error::NotFound(format!("backup {}", self.ctx.backup_name())));
        };
        let tool = self.backup_tool(&backup.spec.backup_policy_name).await?;
        objs.push(build::restore_job(&self.ctx, pv, &backup, &tool).into());
        Ok(objs)
    }
}
