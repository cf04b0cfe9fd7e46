//! Component status block written into `Cluster.status.components`.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

use crate::spec::AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentPhase {
    Creating,
    SpecReconciling,
    Running,
    Stopped,
    Abnormal,
    Failed,
}

impl ComponentPhase {
    /// Rank used when several checks in one pass propose different phases.
    pub fn severity(self) -> u8 {
        match self {
            ComponentPhase::Running => 0,
            ComponentPhase::Stopped => 1,
            ComponentPhase::Creating => 2,
            ComponentPhase::SpecReconciling => 3,
            ComponentPhase::Abnormal => 4,
            ComponentPhase::Failed => 5,
        }
    }

    pub fn is_up(self) -> bool {
        matches!(self, ComponentPhase::Running | ComponentPhase::Abnormal | ComponentPhase::Failed)
    }
}

/// Messages keyed by `"{kind}/{name}"` of the offending object.
pub type MessageMap = BTreeMap<String, String>;

pub fn message_key(kind: &str, name: &str) -> String { format!("{}/{}", kind, name) }

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusMemberStatus {
    pub name: String,
    pub access_mode: AccessMode,
    pub pod: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSetStatus {
    pub leader: ConsensusMemberStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub followers: Vec<ConsensusMemberStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner: Option<ConsensusMemberStatus>,
}

/// Progress of cloning data onto one new volume claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClonePhase {
    NotCreated,
    Processing,
    ReadyToUse,
    Failed,
}

impl ClonePhase {
    pub fn rank(self) -> u8 {
        match self {
            ClonePhase::NotCreated => 0,
            ClonePhase::Processing => 1,
            ClonePhase::ReadyToUse => 2,
            ClonePhase::Failed => 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: MessageMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_set_status: Option<ConsensusSetStatus>,
    /// Clone progress per volume claim name while a scale-out is in flight.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_clone: BTreeMap<String, ClonePhase>,
}

impl ComponentStatus {
    /// Guarded phase transition. Returns whether the phase changed.
    ///
    /// SpecReconciling is only entered from Running; anything else in flight
    /// keeps its phase until it settles.
    pub fn set_phase(&mut self, phase: ComponentPhase, messages: MessageMap) -> bool {
        if self.phase == Some(phase) {
            self.message.extend(messages);
            return false;
        }
        if phase == ComponentPhase::SpecReconciling && self.phase != Some(ComponentPhase::Running) {
            return false;
        }
        self.phase = Some(phase);
        self.message.extend(messages);
        true
    }

    pub fn set_object_message(&mut self, kind: &str, name: &str, msg: &str) {
        self.message.insert(message_key(kind, name), msg.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_reconciling_only_from_running() {
        let mut st = ComponentStatus::default();
        assert!(!st.set_phase(ComponentPhase::SpecReconciling, MessageMap::new()));
        assert_eq!(st.phase, None);

        assert!(st.set_phase(ComponentPhase::Creating, MessageMap::new()));
        assert!(!st.set_phase(ComponentPhase::SpecReconciling, MessageMap::new()));
        assert_eq!(st.phase, Some(ComponentPhase::Creating));

        assert!(st.set_phase(ComponentPhase::Running, MessageMap::new()));
        assert!(st.set_phase(ComponentPhase::SpecReconciling, MessageMap::new()));
        assert_eq!(st.phase, Some(ComponentPhase::SpecReconciling));
    }

    #[test]
    fn same_phase_merges_messages() {
        let mut st = ComponentStatus::default();
        st.set_phase(ComponentPhase::Abnormal, MessageMap::new());
        let mut m = MessageMap::new();
        m.insert(message_key("Pod", "a-0"), "crash".into());
        assert!(!st.set_phase(ComponentPhase::Abnormal, m));
        assert_eq!(st.message.get("Pod/a-0").map(String::as_str), Some("crash"));
    }

    #[test]
    fn status_serializes_camel_case() {
        let mut st = ComponentStatus::default();
        st.pods_ready = Some(true);
        st.data_clone.insert("data-c-mysql-3".into(), ClonePhase::Processing);
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["podsReady"], serde_json::json!(true));
        assert_eq!(v["dataClone"]["data-c-mysql-3"], serde_json::json!("Processing"));
        assert!(v.get("phase").is_none());
    }
}
