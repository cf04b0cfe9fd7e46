//! Builders for the temporary and volume objects a clone creates.

use chrono::{DateTime, Datelike, Timelike, Utc};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    TypedLocalObjectReference, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tessera_core::crd::{Backup, BackupSpec, BackupTool, BackupType, VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use tessera_core::labels::{self, Labels};
use tessera_core::Owner;

use crate::{CloneContext, PendingVolume};

/// Image running the delayed claim deletion.
pub const PVC_CLEANUP_IMAGE: &str = "bitnami/kubectl:1.29";
const DATA_MOUNT: &str = "/data";
const BACKUP_MOUNT: &str = "/backupdata";

pub fn restore_job_name(claim: &str) -> String { format!("restore-{}", claim) }

pub fn cleanup_cron_job_name(claim: &str) -> String { format!("delete-pvc-{}", claim) }

fn meta(namespace: &str, name: &str, labels: Labels, owner: &Owner) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: Some(vec![owner.owner_reference()]),
        ..Default::default()
    }
}

/// Native snapshot of `source_claim`, named after the scale-out backup.
pub fn volume_snapshot(ctx: &CloneContext<'_>, source_claim: &str) -> VolumeSnapshot {
    let name = ctx.backup_name();
    let mut l = ctx.backup_labels();
    l.insert(labels::BACKUP_NAME.to_string(), name.clone());
    let mut vs = VolumeSnapshot::new(
        &name,
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource { persistent_volume_claim_name: Some(source_claim.to_string()), ..Default::default() },
            volume_snapshot_class_name: None,
        },
    );
    vs.metadata = meta(ctx.namespace(), &name, l, ctx.owner);
    vs
}

pub fn backup(ctx: &CloneContext<'_>, policy: &str, backup_type: BackupType) -> Backup {
    let name = ctx.backup_name();
    let mut b = Backup::new(&name, BackupSpec { backup_policy_name: policy.to_string(), backup_type });
    b.metadata = meta(ctx.namespace(), &name, ctx.backup_labels(), ctx.owner);
    b
}

/// Claim for a new replica, restored from `snapshot` when given.
pub fn claim(ctx: &CloneContext<'_>, pv: &PendingVolume, snapshot: Option<&str>) -> PersistentVolumeClaim {
    let mut spec = pv.template.spec.clone();
    spec.data_source = snapshot.map(|s| TypedLocalObjectReference {
        api_group: Some("snapshot.storage.k8s.io".to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: s.to_string(),
    });
    PersistentVolumeClaim {
        metadata: meta(ctx.namespace(), &pv.claim, ctx.component.match_labels(), ctx.owner),
        spec: Some(spec),
        status: None,
    }
}

fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: claim.to_string(), read_only: None }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

/// Job restoring `backup` into the new claim with the backup tool's commands.
pub fn restore_job(ctx: &CloneContext<'_>, pv: &PendingVolume, backup: &Backup, tool: &BackupTool) -> Job {
    let backup_name = backup.metadata.name.clone().unwrap_or_default();
    let mut env = tool.spec.env.clone();
    env.push(EnvVar { name: "BACKUP_NAME".into(), value: Some(backup_name), ..Default::default() });
    env.push(EnvVar { name: "BACKUP_DIR".into(), value: Some(BACKUP_MOUNT.into()), ..Default::default() });
    env.push(EnvVar { name: "DATA_DIR".into(), value: Some(DATA_MOUNT.into()), ..Default::default() });

    let mut volumes = vec![claim_volume("data", &pv.claim)];
    let mut mounts = vec![mount("data", DATA_MOUNT)];
    if let Some(repo) = backup.status.as_ref().and_then(|s| s.persistent_volume_claim_name.as_deref()) {
        volumes.push(claim_volume("backup-data", repo));
        mounts.push(mount("backup-data", BACKUP_MOUNT));
    }

    let container = Container {
        name: "restore".into(),
        image: Some(tool.spec.image.clone()),
        command: Some(vec!["sh".into(), "-c".into()]),
        args: Some(vec![tool.spec.restore_commands.join("\n")]),
        env: Some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    let name = restore_job_name(&pv.claim);
    Job {
        metadata: meta(ctx.namespace(), &name, ctx.backup_labels(), ctx.owner),
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(ctx.backup_labels()), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("Never".into()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Cron expression firing once at minute precision on `at` (UTC).
pub fn schedule_at(at: DateTime<Utc>) -> String {
    format!("{} {} {} {} *", at.minute(), at.hour(), at.day(), at.month())
}

/// CronJob deleting `claim` at `at`, left behind when a replica is scaled in.
pub fn pvc_cleanup_cron_job(namespace: &str, claim: &str, labels: Labels, owner: &Owner, at: DateTime<Utc>) -> CronJob {
    let container = Container {
        name: "delete-pvc".into(),
        image: Some(PVC_CLEANUP_IMAGE.into()),
        command: Some(vec![
            "kubectl".into(),
            "-n".into(),
            namespace.to_string(),
            "delete".into(),
            "pvc".into(),
            claim.to_string(),
            "--ignore-not-found".into(),
        ]),
        ..Default::default()
    };
    let job_meta = ObjectMeta { labels: Some(labels.clone()), ..Default::default() };
    CronJob {
        metadata: meta(namespace, &cleanup_cron_job_name(claim), labels, owner),
        spec: Some(CronJobSpec {
            schedule: schedule_at(at),
            concurrency_policy: Some("Forbid".into()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: Some(job_meta),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec {
                            containers: vec![container],
                            restart_policy: Some("OnFailure".into()),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schedule_is_minute_hour_day_month() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 42).unwrap();
        assert_eq!(schedule_at(at), "5 17 9 3 *");
    }

    #[test]
    fn cleanup_cron_job_targets_claim() {
        let owner = Owner {
            api_version: "apps.tessera.io/v1alpha1".into(),
            kind: "Cluster".into(),
            namespace: "default".into(),
            name: "mycluster".into(),
            uid: "u".into(),
        };
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let cj = pvc_cleanup_cron_job("default", "data-mycluster-mysql-2", labels::instance("mycluster"), &owner, at);
        assert_eq!(cj.metadata.name.as_deref(), Some("delete-pvc-data-mycluster-mysql-2"));
        let spec = cj.spec.unwrap();
        assert_eq!(spec.schedule, "30 0 1 1 *");
        let job_labels = spec.job_template.metadata.as_ref().and_then(|m| m.labels.clone()).unwrap();
        assert_eq!(job_labels.get(labels::INSTANCE).map(String::as_str), Some("mycluster"));
        let pod = spec.job_template.spec.unwrap().template.spec.unwrap();
        let cmd = pod.containers[0].command.clone().unwrap();
        assert!(cmd.contains(&"data-mycluster-mysql-2".to_string()));
    }
}
