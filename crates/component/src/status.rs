//! Component status derived from the live workload and its pods.
//!
//! Every check is a pure function of the observed objects and `now`; the
//! phases they propose are collected in a [`StatusTransaction`] and committed
//! once per pass.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tessera_core::spec::SynthesizedComponent;
use tessera_core::status::{message_key, ComponentPhase, ComponentStatus, MessageMap};
use tessera_core::EngineConfig;
use tessera_rollout::pods;
use tracing::debug;

pub const PROBE_TIMEOUT_MESSAGE: &str = "Role probe timeout, check whether the application is available";

fn condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status.as_ref()?.conditions.as_ref()?.iter().find(|c| c.type_ == type_)
}

fn older_than(since: Option<&Time>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(t) = since else { return false };
    (now - t.0).to_std().map(|age| age > timeout).unwrap_or(false)
}

/// Workload rolled out to its update revision with every replica available.
pub fn workload_ready(workload: &StatefulSet, pod_list: &[Pod], replicas: i32) -> bool {
    let Some(st) = workload.status.as_ref() else { return false };
    if st.observed_generation != workload.metadata.generation {
        return false;
    }
    if st.replicas != replicas || st.available_replicas.unwrap_or(0) != replicas {
        return false;
    }
    if st.current_revision != st.update_revision {
        return false;
    }
    let update = st.update_revision.as_deref();
    pod_list.iter().all(|p| pods::revision(p) == update)
}

pub fn is_running(workload: &StatefulSet, pod_list: &[Pod], replicas: i32) -> bool {
    workload_ready(workload, pod_list, replicas)
        && pod_list.len() == replicas.max(0) as usize
        && pod_list.iter().all(pods::is_ready_with_role)
}

pub fn pods_ready(workload: &StatefulSet, replicas: i32) -> bool {
    workload.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0) == replicas
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodFailureReport {
    /// Messages of pods failed for longer than the timeout, keyed `Pod/<name>`.
    pub messages: MessageMap,
    pub timed_out: bool,
    /// Set while some failed pod has not timed out yet.
    pub requeue_after: Option<Duration>,
}

fn container_failure(statuses: Option<&Vec<ContainerStatus>>) -> Option<String> {
    statuses?.iter().find_map(|cs| {
        let state = cs.state.as_ref()?;
        let msg = state
            .waiting
            .as_ref()
            .and_then(|w| w.message.clone())
            .or_else(|| state.terminated.as_ref().and_then(|t| t.message.clone()))?;
        if msg.is_empty() { None } else { Some(msg) }
    })
}

/// Failure message and the time the failure was first observed.
fn pod_failure(pod: &Pod) -> Option<(String, Option<&Time>)> {
    if let Some(c) = condition(pod, "PodScheduled").filter(|c| c.status == "False") {
        let msg = c.message.clone().unwrap_or_else(|| "pod cannot be scheduled".into());
        return Some((msg, c.last_transition_time.as_ref()));
    }
    let st = pod.status.as_ref()?;
    let msg = container_failure(st.init_container_statuses.as_ref()).or_else(|| container_failure(st.container_statuses.as_ref()))?;
    let since = condition(pod, "ContainersReady")
        .and_then(|c| c.last_transition_time.as_ref())
        .or(pod.metadata.creation_timestamp.as_ref());
    Some((msg, since))
}

pub fn failed_and_timed_out_pods(pod_list: &[Pod], now: DateTime<Utc>, config: &EngineConfig) -> PodFailureReport {
    let mut report = PodFailureReport::default();
    for pod in pod_list {
        let Some((msg, since)) = pod_failure(pod) else { continue };
        if older_than(since, now, config.pod_failure_timeout) {
            report.messages.insert(message_key("Pod", pods::name(pod)), msg);
            report.timed_out = true;
        } else {
            report.requeue_after = Some(config.requeue_after);
        }
    }
    report
}

/// Phase for ready pods whose role was never reported within `timeout`.
pub fn probe_timeout_phase(pod_list: &[Pod], leader: &str, now: DateTime<Utc>, timeout: Duration) -> Option<(ComponentPhase, MessageMap)> {
    let mut messages = MessageMap::new();
    for pod in pod_list.iter().filter(|p| pods::is_ready(p) && !pods::has_role_label(p)) {
        let since = condition(pod, "Ready").and_then(|c| c.last_transition_time.as_ref());
        if older_than(since, now, timeout) {
            messages.insert(message_key("Pod", pods::name(pod)), PROBE_TIMEOUT_MESSAGE.to_string());
        }
    }
    if messages.is_empty() {
        return None;
    }
    let has_leader = !leader.is_empty() && pod_list.iter().any(|p| pods::role(p) == leader);
    if !has_leader {
        return Some((ComponentPhase::Failed, messages));
    }
    if pod_list.iter().any(|p| pods::role(p).is_empty()) {
        return Some((ComponentPhase::Abnormal, messages));
    }
    None
}

pub fn phase_when_pods_not_ready(workload: &StatefulSet, pod_list: &[Pod], replicas: i32, leader: &str) -> Option<ComponentPhase> {
    if replicas == 0 {
        return None;
    }
    let st = workload.status.as_ref();
    let available = st.and_then(|s| s.available_replicas).unwrap_or(0);
    if pod_list.is_empty() || available == 0 {
        return Some(ComponentPhase::Failed);
    }
    if pod_list.iter().any(pods::is_terminating) {
        return None;
    }
    let update = st.and_then(|s| s.update_revision.as_deref());
    let latest_revision_failed = pod_list.iter().any(|p| !pods::is_ready(p) && pods::revision(p) == update);
    if !latest_revision_failed {
        return None;
    }
    let leader_ready = pod_list.iter().any(|p| pods::is_ready(p) && pods::role(p) == leader);
    if !leader_ready {
        return Some(ComponentPhase::Failed);
    }
    if available != replicas || pod_list.len() != replicas as usize {
        return Some(ComponentPhase::Abnormal);
    }
    None
}

/// Phases proposed during one pass; the most severe one is committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusTransaction {
    phase: Option<ComponentPhase>,
    messages: MessageMap,
}

impl StatusTransaction {
    pub fn new() -> Self { Self::default() }
    pub fn phase(&self) -> Option<ComponentPhase> { self.phase }
    pub fn messages(&self) -> &MessageMap { &self.messages }

    pub fn propose(&mut self, phase: ComponentPhase, messages: MessageMap) {
        if self.phase.map(|p| phase.severity() > p.severity()).unwrap_or(true) {
            self.phase = Some(phase);
        }
        self.messages.extend(messages);
    }

    /// Write the winning phase through the guarded transition. Healthy
    /// phases drop the messages left by earlier problems.
    pub fn commit(self, status: &mut ComponentStatus) -> bool {
        let Some(phase) = self.phase else { return false };
        if matches!(phase, ComponentPhase::Running | ComponentPhase::Stopped) {
            status.message.clear();
        }
        status.set_phase(phase, self.messages)
    }
}

/// Fold the observed workload and pods into `status` and `tx`.
/// Returns a requeue hint while a pod failure is waiting to time out.
pub fn aggregate(
    comp: &SynthesizedComponent,
    workload: &StatefulSet,
    pod_list: &[Pod],
    status: &mut ComponentStatus,
    tx: &mut StatusTransaction,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let replicas = comp.replicas;
    let leader = comp.consensus.leader.name.as_str();
    let ready = pods_ready(workload, replicas);
    status.pods_ready = Some(ready);
    if !ready {
        status.pods_ready_time = None;
    } else if status.pods_ready_time.is_none() {
        status.pods_ready_time = Some(Time(now));
    }

    if is_running(workload, pod_list, replicas) {
        let phase = if replicas == 0 { ComponentPhase::Stopped } else { ComponentPhase::Running };
        tx.propose(phase, MessageMap::new());
        return None;
    }
    if ready {
        if let Some((phase, messages)) = probe_timeout_phase(pod_list, leader, now, config.role_probe_timeout) {
            debug!(component = %comp.name, ?phase, pods = messages.len(), "role probe timed out");
            tx.propose(phase, messages);
        }
        return None;
    }
    let report = failed_and_timed_out_pods(pod_list, now, config);
    let was_up = status.phase.map(ComponentPhase::is_up).unwrap_or(false);
    if report.timed_out || was_up {
        if let Some(phase) = phase_when_pods_not_ready(workload, pod_list, replicas, leader) {
            tx.propose(phase, report.messages);
        }
    }
    report.requeue_after
}
