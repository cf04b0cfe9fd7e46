#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tessera_core::labels;
use tessera_core::spec::{AccessMode, ConsensusMember, ConsensusSpec, UpdateStrategy};
use tessera_rollout::{build_plan, build_role_status, plan_restart, pods, role_env, walk_one_step, RolePriority, StepState, DEFAULT_POD_NAME};

fn pod(ordinal: usize, role: &str, revision: &str, ready: bool) -> Pod {
    let mut p = Pod::default();
    p.metadata.name = Some(format!("mycluster-mysql-{}", ordinal));
    let mut l = BTreeMap::new();
    l.insert(labels::ROLE.to_string(), role.to_string());
    l.insert(labels::REVISION.to_string(), revision.to_string());
    p.metadata.labels = Some(l);
    p.status = Some(PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: if ready { "True" } else { "False" }.into(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    p
}

fn spec() -> ConsensusSpec {
    ConsensusSpec {
        leader: ConsensusMember::new("leader", AccessMode::ReadWrite),
        followers: vec![ConsensusMember::new("follower", AccessMode::Readonly)],
        learner: None,
        update_strategy: UpdateStrategy::Serial,
    }
}

fn sts(replicas: i32, generation: i64, observed: i64) -> StatefulSet {
    let mut s = StatefulSet::default();
    s.metadata.name = Some("mycluster-mysql".into());
    s.metadata.generation = Some(generation);
    s.spec = Some(StatefulSetSpec { replicas: Some(replicas), ..Default::default() });
    s.status = Some(StatefulSetStatus {
        observed_generation: Some(observed),
        update_revision: Some("rev-2".into()),
        ..Default::default()
    });
    s
}

fn deleted(ps: &[Pod]) -> Vec<&str> { ps.iter().map(pods::name).collect() }

#[test]
fn restart_walks_one_replica_at_a_time_leader_last() {
    let prio = RolePriority::from_spec(&spec()).unwrap();
    let w = sts(3, 2, 2);

    let mut ps = vec![pod(0, "leader", "rev-1", true), pod(1, "follower", "rev-1", true), pod(2, "follower", "rev-1", true)];
    let out = plan_restart(&w, &ps, &prio, UpdateStrategy::Serial).unwrap();
    assert_eq!(deleted(&out), vec!["mycluster-mysql-1"]);

    // Recreated but not yet ready: wait, delete nothing.
    ps[1] = pod(1, "follower", "rev-2", false);
    assert!(plan_restart(&w, &ps, &prio, UpdateStrategy::Serial).unwrap().is_empty());

    ps[1] = pod(1, "follower", "rev-2", true);
    let out = plan_restart(&w, &ps, &prio, UpdateStrategy::Serial).unwrap();
    assert_eq!(deleted(&out), vec!["mycluster-mysql-2"]);

    ps[2] = pod(2, "follower", "rev-2", true);
    let out = plan_restart(&w, &ps, &prio, UpdateStrategy::Serial).unwrap();
    assert_eq!(deleted(&out), vec!["mycluster-mysql-0"]);

    ps[0] = pod(0, "leader", "rev-2", true);
    assert!(plan_restart(&w, &ps, &prio, UpdateStrategy::Serial).unwrap().is_empty());
}

#[test]
fn restart_is_a_noop_while_workload_is_unsettled() {
    let prio = RolePriority::from_spec(&spec()).unwrap();
    let ps = vec![pod(0, "leader", "rev-1", true), pod(1, "follower", "rev-1", true)];
    assert!(plan_restart(&sts(2, 3, 2), &ps, &prio, UpdateStrategy::Serial).unwrap().is_empty());
    assert!(plan_restart(&sts(3, 2, 2), &ps, &prio, UpdateStrategy::Serial).unwrap().is_empty());
    assert_eq!(plan_restart(&sts(2, 2, 2), &ps, &prio, UpdateStrategy::Parallel).unwrap().len(), 2);
}

#[test]
fn terminating_replica_holds_the_stage() {
    let prio = RolePriority::from_spec(&spec()).unwrap();
    let mut terminating = pod(1, "follower", "rev-1", true);
    terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    let ps = vec![pod(0, "leader", "rev-1", true), terminating];
    assert!(plan_restart(&sts(2, 2, 2), &ps, &prio, UpdateStrategy::Serial).unwrap().is_empty());
}

#[test]
fn walk_reports_done_when_every_stage_completes() {
    let prio = RolePriority::from_spec(&spec()).unwrap();
    let plan = build_plan(vec![pod(0, "leader", "r", true), pod(1, "follower", "r", true)], &prio, UpdateStrategy::Serial);
    let mut visited = Vec::new();
    let done = walk_one_step(&plan, |p| {
        visited.push(pods::name(p).to_string());
        Ok(StepState::Complete)
    })
    .unwrap();
    assert!(done);
    assert_eq!(visited, vec!["mycluster-mysql-1", "mycluster-mysql-0"]);

    let err = walk_one_step(&plan, |_| Err(tessera_core::Error::Store("boom".into()))).unwrap_err();
    assert!(err.is_transient());
}

#[test]
fn role_status_from_ready_labelled_pods() {
    let s = ConsensusSpec {
        followers: vec![ConsensusMember::new("follower", AccessMode::Readonly)],
        learner: Some(ConsensusMember::new("learner", AccessMode::None)),
        ..spec()
    };
    let ps = vec![
        pod(2, "follower", "r", true),
        pod(0, "leader", "r", true),
        pod(1, "follower", "r", true),
        pod(3, "learner", "r", true),
        pod(4, "follower", "r", false),
    ];
    let st = build_role_status(&s, &ps);
    assert_eq!(st.leader.pod, "mycluster-mysql-0");
    assert_eq!(st.leader.access_mode, AccessMode::ReadWrite);
    let followers: Vec<&str> = st.followers.iter().map(|f| f.pod.as_str()).collect();
    assert_eq!(followers, vec!["mycluster-mysql-1", "mycluster-mysql-2"]);
    assert_eq!(st.learner.as_ref().map(|l| l.pod.as_str()), Some("mycluster-mysql-3"));

    let env = role_env("mysql", &st);
    assert_eq!(env.get("TESSERA_MYSQL_LEADER").map(String::as_str), Some("mycluster-mysql-0"));
    assert_eq!(env.get("TESSERA_MYSQL_FOLLOWERS").map(String::as_str), Some("mycluster-mysql-1,mycluster-mysql-2"));

    let none = build_role_status(&s, &[pod(0, "leader", "r", false)]);
    assert_eq!(none.leader.pod, DEFAULT_POD_NAME);
}
