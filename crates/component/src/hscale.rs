//! Horizontal scaling: volume cleanup after scale-in, data cloning before
//! scale-out, and removal of the temporary objects once things settle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use tessera_core::status::{message_key, ClonePhase, ComponentPhase, MessageMap};
use tessera_core::{Error, ManagedObject, ObjectKey, ObjectKind, Result};
use tessera_dataclone::{build, is_scale_out_failed, new_data_clone, CloneContext, CloneTracker};
use tracing::{debug, info, warn};

/// What one pass of horizontal scaling asks of the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleOutcome {
    /// Created before the workload is touched.
    pub create: Vec<ManagedObject>,
    pub delete: Vec<ManagedObject>,
    /// Replica count the workload must keep this pass.
    pub pinned_replicas: Option<i32>,
    /// Clone progress to persist in the component status.
    pub data_clone: BTreeMap<String, ClonePhase>,
    pub phase: Option<ComponentPhase>,
    pub messages: MessageMap,
}

fn job_failed(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Failed" && c.status == "True"))
        .unwrap_or(false)
}

pub async fn plan_horizontal_scale(ctx: CloneContext<'_>, recorded: &BTreeMap<String, ClonePhase>, now: DateTime<Utc>) -> Result<ScaleOutcome> {
    let (live, desired) = (ctx.live_replicas(), ctx.desired_replicas);
    let mut out = ScaleOutcome::default();
    if desired < live {
        scale_in(&ctx, now, &mut out)?;
    } else if desired > live {
        scale_out(ctx, recorded, &mut out).await?;
    } else {
        settle(ctx, &mut out).await?;
    }
    Ok(out)
}

fn scale_in(ctx: &CloneContext<'_>, now: DateTime<Utc>, out: &mut ScaleOutcome) -> Result<()> {
    let comp = ctx.component;
    if ctx.desired_replicas == 0 || comp.volume_claim_templates.is_empty() {
        return Ok(());
    }
    let delay = chrono::Duration::from_std(ctx.config.pvc_cleanup_delay).map_err(|e| Error::Config(format!("pvc cleanup delay: {}", e)))?;
    let at = now + delay;
    for ordinal in ctx.desired_replicas..ctx.live_replicas() {
        for t in comp.volume_claim_templates.iter() {
            let claim = ctx.claim_name(&t.name, ordinal);
            out.create.push(build::pvc_cleanup_cron_job(ctx.namespace(), &claim, comp.match_labels(), ctx.owner, at).into());
        }
    }
    info!(component = %comp.name, from = ctx.live_replicas(), to = ctx.desired_replicas, jobs = out.create.len(), "scale-in volume cleanup scheduled");
    Ok(())
}

async fn scale_out(ctx: CloneContext<'_>, recorded: &BTreeMap<String, ClonePhase>, out: &mut ScaleOutcome) -> Result<()> {
    for pv in ctx.pending_volumes() {
        let key = ObjectKey::new(ObjectKind::CronJob, ctx.namespace(), build::cleanup_cron_job_name(&pv.claim));
        if let Some(cj) = ctx.store.get(&key).await? {
            debug!(cron_job = %key, "claim needed again, cancelling its cleanup");
            out.delete.push(cj);
        }
    }
    let Some(dc) = new_data_clone(ctx)? else { return Ok(()) };
    if dc.succeed().await? {
        out.delete.extend(dc.clear_tmp_resources().await?);
        return Ok(());
    }
    out.pinned_replicas = Some(ctx.live_replicas());
    let mut tracker = CloneTracker::from_status(recorded);
    let failure = match dc.clone_data_tracked(&mut tracker).await {
        Ok(objs) => {
            out.create.extend(objs);
            None
        }
        Err(Error::CloneFailed(msg)) => Some(msg),
        Err(e) => return Err(e),
    };
    out.data_clone = tracker.into_map();
    let failure = failure.or_else(|| is_scale_out_failed(&out.data_clone).then(|| "data clone failed".to_string()));
    if let Some(msg) = failure {
        warn!(component = %ctx.component.name, %msg, "scale-out failed");
        out.phase = Some(ComponentPhase::Failed);
        out.messages.insert(message_key("Backup", &ctx.backup_name()), msg);
    }
    Ok(())
}

/// Replica count matches: retire finished cleanup CronJobs, surface failed
/// cleanup jobs, and drop clone leftovers once no cleanup is pending.
async fn settle(ctx: CloneContext<'_>, out: &mut ScaleOutcome) -> Result<()> {
    let selector = ctx.component.match_labels();
    let prefix = build::cleanup_cron_job_name("");
    let mut pending = 0usize;
    for cj in ctx.store.list(ObjectKind::CronJob, ctx.namespace(), &selector).await? {
        let Some(claim) = cj.name().strip_prefix(prefix.as_str()) else { continue };
        if ctx.claim(claim).await?.is_some() {
            pending += 1;
        } else {
            out.delete.push(cj);
        }
    }
    for obj in ctx.store.list(ObjectKind::Job, ctx.namespace(), &selector).await? {
        if !obj.name().starts_with(prefix.as_str()) {
            continue;
        }
        let name = obj.name().to_string();
        if let Ok(job) = Job::try_from(obj) {
            if job_failed(&job) {
                out.messages.insert(message_key("Job", &name), "failed to delete the volume claim of a scaled-in replica".into());
            }
        }
    }
    if !out.messages.is_empty() {
        out.phase = Some(ComponentPhase::Abnormal);
    }
    if pending > 0 {
        return Ok(());
    }
    if let Ok(Some(dc)) = new_data_clone(ctx) {
        out.delete.extend(dc.clear_tmp_resources().await?);
    }
    Ok(())
}
