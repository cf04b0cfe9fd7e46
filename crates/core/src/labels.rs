//! Well-known label and annotation keys.

use std::collections::BTreeMap;

pub type Labels = BTreeMap<String, String>;

pub const INSTANCE: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_NAME: &str = "apps.tessera.io/component-name";
pub const COMPONENT_DEF: &str = "apps.tessera.io/component-def";
/// Role name reported by the probing sidecar; empty until probed.
pub const ROLE: &str = "tessera.io/role";
pub const ACCESS_MODE: &str = "cs.apps.tessera.io/access-mode";
/// Set by the StatefulSet controller on every pod it creates.
pub const REVISION: &str = "controller-revision-hash";
pub const BACKUP_MANAGED_BY: &str = "apps.tessera.io/managed-by";
pub const BACKUP_POLICY_TEMPLATE: &str = "apps.tessera.io/backup-policy-template";
/// Names the Backup a VolumeSnapshot was taken for.
pub const BACKUP_NAME: &str = "dataprotection.tessera.io/backup-name";
pub const LEADER_ANNOTATION: &str = "cs.apps.tessera.io/leader";

pub fn instance(cluster: &str) -> Labels {
    let mut l = Labels::new();
    l.insert(INSTANCE.to_string(), cluster.to_string());
    l
}

pub fn component(cluster: &str, component: &str) -> Labels {
    let mut l = instance(cluster);
    l.insert(COMPONENT_NAME.to_string(), component.to_string());
    l
}

/// Selector shared by every temporary backup/restore object of a component.
pub fn backup(cluster: &str, component_name: &str) -> Labels {
    let mut l = component(cluster, component_name);
    l.insert(BACKUP_MANAGED_BY.to_string(), "cluster".to_string());
    l
}

/// Equality-based selector match; an empty selector matches everything.
pub fn matches(labels: Option<&BTreeMap<String, String>>, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

pub fn to_selector_string(selector: &Labels) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}
