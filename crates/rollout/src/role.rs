use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use tessera_core::spec::{AccessMode, ConsensusMember, ConsensusSpec};
use tessera_core::status::{ConsensusMemberStatus, ConsensusSetStatus};

use crate::pods;

/// Leader pod name reported before any pod has been probed as leader.
pub const DEFAULT_POD_NAME: &str = "Unknown";

fn member(m: &ConsensusMember, pod: &Pod) -> ConsensusMemberStatus {
    ConsensusMemberStatus { name: m.name.clone(), access_mode: m.access_mode, pod: pods::name(pod).to_string() }
}

/// Per-role status block built from pods that are ready and role-labelled.
pub fn build_role_status(spec: &ConsensusSpec, pod_list: &[Pod]) -> ConsensusSetStatus {
    let mut st = ConsensusSetStatus {
        leader: ConsensusMemberStatus { name: String::new(), access_mode: AccessMode::None, pod: DEFAULT_POD_NAME.to_string() },
        ..Default::default()
    };
    for pod in pod_list.iter().filter(|p| pods::is_ready_with_role(p)) {
        let role = pods::role(pod);
        if role == spec.leader.name {
            st.leader = member(&spec.leader, pod);
        } else if let Some(f) = spec.followers.iter().find(|f| f.name == role) {
            st.followers.push(member(f, pod));
        } else if let Some(l) = spec.learner.as_ref().filter(|l| l.name == role) {
            st.learner = Some(member(l, pod));
        }
    }
    st.followers.sort_by(|a, b| a.pod.cmp(&b.pod));
    st
}

/// Env entries published to the component's env ConfigMap.
pub fn role_env(component: &str, st: &ConsensusSetStatus) -> BTreeMap<String, String> {
    let prefix = format!("TESSERA_{}", component.to_uppercase().replace('-', "_"));
    let followers = st.followers.iter().map(|f| f.pod.as_str()).collect::<Vec<_>>().join(",");
    let mut env = BTreeMap::new();
    env.insert(format!("{}_LEADER", prefix), st.leader.pod.clone());
    env.insert(format!("{}_FOLLOWERS", prefix), followers);
    env
}
