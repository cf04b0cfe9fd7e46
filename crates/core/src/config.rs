//! Engine configuration read from `TESSERA_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// A failed pod older than this counts as failed-and-timed-out.
    pub pod_failure_timeout: Duration,
    /// Ready pods still lacking a role label after this are flagged.
    pub role_probe_timeout: Duration,
    /// Requeue hint while waiting on a pod failure to time out.
    pub requeue_after: Duration,
    /// Whether the cluster serves VolumeSnapshot objects.
    pub volume_snapshot_enabled: bool,
    pub queue_cap: usize,
    /// Delay before a scaled-in replica's volume claims are deleted.
    pub pvc_cleanup_delay: Duration,
    /// Field manager and `managed-by` label value.
    pub manager_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pod_failure_timeout: Duration::from_secs(60),
            role_probe_timeout: Duration::from_secs(60),
            requeue_after: Duration::from_secs(30),
            volume_snapshot_enabled: true,
            queue_cap: 1024,
            pvc_cleanup_delay: Duration::from_secs(30 * 60),
            manager_name: "tessera".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            pod_failure_timeout: Duration::from_secs(env_or("TESSERA_POD_FAILURE_TIMEOUT_SECS", d.pod_failure_timeout.as_secs())),
            role_probe_timeout: Duration::from_secs(env_or("TESSERA_ROLE_PROBE_TIMEOUT_SECS", d.role_probe_timeout.as_secs())),
            requeue_after: Duration::from_secs(env_or("TESSERA_REQUEUE_AFTER_SECS", d.requeue_after.as_secs())),
            volume_snapshot_enabled: env_flag("TESSERA_VOLUME_SNAPSHOT", d.volume_snapshot_enabled),
            queue_cap: env_or("TESSERA_QUEUE_CAP", d.queue_cap).max(1),
            pvc_cleanup_delay: Duration::from_secs(60 * env_or("TESSERA_PVC_CLEANUP_DELAY_MINS", 30u64)),
            manager_name: std::env::var("TESSERA_MANAGER_NAME").unwrap_or(d.manager_name),
        }
    }
}
