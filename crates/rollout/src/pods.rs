//! Pod predicates shared by the planner and status aggregation.

use k8s_openapi::api::core::v1::Pod;
use once_cell::sync::Lazy;
use regex::Regex;
use tessera_core::labels;

static ORDINAL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(.*)-([0-9]+)$").ok());

/// Trailing `-<digits>` of a pod name, or -1.
pub fn ordinal(name: &str) -> i32 {
    ORDINAL
        .as_ref()
        .and_then(|re| re.captures(name))
        .and_then(|c| c.get(2))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .unwrap_or(-1)
}

pub fn name(pod: &Pod) -> &str { pod.metadata.name.as_deref().unwrap_or("") }

/// Role label value; empty when the pod has not been probed yet.
pub fn role(pod: &Pod) -> &str {
    pod.metadata.labels.as_ref().and_then(|l| l.get(labels::ROLE)).map(String::as_str).unwrap_or("")
}

pub fn has_role_label(pod: &Pod) -> bool {
    pod.metadata.labels.as_ref().map(|l| l.contains_key(labels::ROLE)).unwrap_or(false)
}

pub fn revision(pod: &Pod) -> Option<&str> {
    pod.metadata.labels.as_ref().and_then(|l| l.get(labels::REVISION)).map(String::as_str)
}

pub fn is_terminating(pod: &Pod) -> bool { pod.metadata.deletion_timestamp.is_some() }

pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

pub fn is_ready_with_role(pod: &Pod) -> bool { is_ready(pod) && has_role_label(pod) }
