#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration as Span, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PersistentVolumeClaim, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec, Service, ServicePort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tessera_apply::Outcome;
use tessera_component::{ComponentOutcome, Reconciler, PROBE_TIMEOUT_MESSAGE};
use tessera_core::crd::{Cluster, ClusterSpec, VolumeSnapshotStatus};
use tessera_core::labels;
use tessera_core::spec::{
    AccessMode, ClusterComponentSpec, ComponentService, ConsensusMember, ConsensusSpec, HScalePolicyType, HorizontalScalePolicy,
    UpdateStrategy, VolumeClaimTemplate,
};
use tessera_core::status::{ComponentPhase, ComponentStatus};
use tessera_core::{EngineConfig, ManagedObject, ObjectKey, ObjectKind};
use tessera_dataclone::build::{cleanup_cron_job_name, schedule_at};
use tessera_kubehub::ClusterKey;
use tessera_store::{MemStore, StoreOp};

const NS: &str = "default";

fn component_spec(replicas: i32, policy: Option<HScalePolicyType>) -> ClusterComponentSpec {
    ClusterComponentSpec {
        name: "mysql".into(),
        component_def_ref: "mysql".into(),
        replicas,
        consensus_spec: ConsensusSpec {
            leader: ConsensusMember::new("leader", AccessMode::ReadWrite),
            followers: vec![ConsensusMember::new("follower", AccessMode::Readonly)],
            learner: None,
            update_strategy: UpdateStrategy::Serial,
        },
        volume_claim_templates: vec![VolumeClaimTemplate { name: "data".into(), spec: Default::default() }],
        horizontal_scale_policy: policy.map(|p| HorizontalScalePolicy { policy_type: p, ..Default::default() }),
        template: Default::default(),
        services: vec![ComponentService {
            name: String::new(),
            ports: vec![ServicePort { port: 3306, ..Default::default() }],
            service_type: None,
        }],
    }
}

fn seed(store: &MemStore, spec: ClusterComponentSpec) -> ClusterKey {
    let mut c = Cluster::new("mycluster", ClusterSpec { cluster_definition_ref: "mysql".into(), component_specs: vec![spec] });
    c.metadata.namespace = Some(NS.into());
    store.insert_cluster(c);
    ClusterKey::new(NS, "mycluster")
}

/// Change the component spec the way a user edit would: a new generation.
fn edit(store: &MemStore, f: impl FnOnce(&mut ClusterComponentSpec)) {
    let mut c = store.cluster(NS, "mycluster").unwrap();
    f(&mut c.spec.component_specs[0]);
    c.metadata.generation = c.metadata.generation.map(|g| g + 1);
    store.insert_cluster(c);
}

fn obj_key(kind: ObjectKind, name: &str) -> ObjectKey { ObjectKey::new(kind, NS, name) }

fn wl_key() -> ObjectKey { obj_key(ObjectKind::Workload, "mycluster-mysql") }

fn workload(store: &MemStore) -> StatefulSet { StatefulSet::try_from(store.object(&wl_key()).unwrap()).unwrap() }

fn replicas(store: &MemStore) -> Option<i32> { workload(store).spec.and_then(|s| s.replicas) }

fn status(store: &MemStore) -> ComponentStatus {
    store.cluster(NS, "mycluster").unwrap().component_status("mysql").cloned().unwrap()
}

/// Stand in for the workload controller: `replicas` available on `revision`.
fn settle_workload(store: &MemStore, replicas: i32, revision: &str) {
    assert!(store.modify(&wl_key(), |o| {
        if let ManagedObject::Workload(s) = o {
            s.status = Some(StatefulSetStatus {
                observed_generation: s.metadata.generation,
                replicas,
                available_replicas: Some(replicas),
                ready_replicas: Some(replicas),
                current_revision: Some(revision.into()),
                update_revision: Some(revision.into()),
                ..Default::default()
            });
        }
    }));
}

fn pod(ordinal: i32, role: Option<&str>, revision: &str, ready_since: DateTime<Utc>) -> ManagedObject {
    let mut p = Pod::default();
    p.metadata.name = Some(format!("mycluster-mysql-{}", ordinal));
    p.metadata.namespace = Some(NS.into());
    let mut l = labels::component("mycluster", "mysql");
    l.insert(labels::REVISION.into(), revision.into());
    if let Some(r) = role {
        l.insert(labels::ROLE.into(), r.into());
    }
    p.metadata.labels = Some(l);
    p.status = Some(PodStatus {
        conditions: Some(vec![PodCondition {
            type_: "Ready".into(),
            status: "True".into(),
            last_transition_time: Some(Time(ready_since)),
            ..Default::default()
        }]),
        ..Default::default()
    });
    p.into()
}

fn seed_pods(store: &MemStore, roles: &[Option<&str>], revision: &str, ready_since: DateTime<Utc>) {
    for (i, role) in roles.iter().enumerate() {
        store.insert(pod(i as i32, *role, revision, ready_since));
    }
}

fn with_containers(spec: &mut ClusterComponentSpec, names: &[&str]) {
    let containers = names.iter().map(|n| Container { name: n.to_string(), image: Some(format!("{}:8.0", n)), ..Default::default() }).collect();
    spec.template = PodTemplateSpec { metadata: None, spec: Some(PodSpec { containers, ..Default::default() }) };
}

fn container_names(store: &MemStore) -> Vec<String> {
    let template = workload(store).spec.map(|s| s.template).unwrap_or_default();
    template.spec.map(|p| p.containers.into_iter().map(|c| c.name).collect()).unwrap_or_default()
}

fn outcome_of(out: &ComponentOutcome, key: &ObjectKey) -> Option<Outcome> {
    out.report.applied.iter().find(|a| &a.key == key).map(|a| a.outcome)
}

fn object_writes(store: &MemStore) -> Vec<StoreOp> {
    store.ops().into_iter().filter(|op| !matches!(op, StoreOp::UpdateClusterStatus(_))).collect()
}

/// Created, settled and running with three labelled replicas.
async fn running(store: &Arc<MemStore>, spec: ClusterComponentSpec) -> (Reconciler, ClusterKey) {
    let key = seed(store, spec);
    let r = Reconciler::new(store.clone(), EngineConfig::default());
    r.reconcile(&key).await.unwrap();
    settle_workload(store, 3, "rev1");
    seed_pods(store, &[Some("leader"), Some("follower"), Some("follower")], "rev1", Utc::now());
    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::Running));
    store.clear_ops();
    (r, key)
}

#[tokio::test]
async fn first_pass_creates_every_owned_object() {
    let store = Arc::new(MemStore::new());
    let key = seed(&store, component_spec(3, None));
    let r = Reconciler::new(store.clone(), EngineConfig::default());

    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::Creating));
    assert!(out.requeue_after.is_some());
    for k in [
        wl_key(),
        obj_key(ObjectKind::Service, "mycluster-mysql-headless"),
        obj_key(ObjectKind::Service, "mycluster-mysql"),
        obj_key(ObjectKind::DisruptionBudget, "mycluster-mysql"),
        obj_key(ObjectKind::ConfigMap, "mycluster-mysql-env"),
    ] {
        assert!(store.ops().contains(&StoreOp::Create(k.clone())), "{} not created", k);
    }
    let cluster = store.cluster(NS, "mycluster").unwrap();
    assert_eq!(cluster.status.as_ref().and_then(|s| s.observed_generation), Some(1));
    assert_eq!(status(&store).phase, Some(ComponentPhase::Creating));

    // Nothing changed: later passes leave every object alone.
    r.reconcile(&key).await.unwrap();
    store.clear_ops();
    r.reconcile(&key).await.unwrap();
    assert!(store.ops().is_empty(), "{:?}", store.ops());
}

#[tokio::test]
async fn running_component_publishes_its_leader() {
    let store = Arc::new(MemStore::new());
    let (_r, _key) = running(&store, component_spec(3, None)).await;

    let st = status(&store);
    assert_eq!(st.pods_ready, Some(true));
    assert!(st.pods_ready_time.is_some());
    let roles = st.consensus_set_status.unwrap();
    assert_eq!(roles.leader.pod, "mycluster-mysql-0");
    assert_eq!(roles.followers.len(), 2);

    let env = ConfigMap::try_from(store.object(&obj_key(ObjectKind::ConfigMap, "mycluster-mysql-env")).unwrap()).unwrap();
    let data = env.data.unwrap();
    assert_eq!(data.get("TESSERA_MYSQL_LEADER").map(String::as_str), Some("mycluster-mysql-0"));
    assert_eq!(data.get("TESSERA_MYSQL_FOLLOWERS").map(String::as_str), Some("mycluster-mysql-1,mycluster-mysql-2"));
}

#[tokio::test]
async fn unprobed_roles_fail_the_component_after_the_timeout() {
    let store = Arc::new(MemStore::new());
    let key = seed(&store, component_spec(3, None));
    let r = Reconciler::new(store.clone(), EngineConfig::default());
    let now = Utc::now();
    r.reconcile_at(&key, now).await.unwrap();
    settle_workload(&store, 3, "rev1");

    seed_pods(&store, &[None, None, None], "rev1", now);
    r.reconcile_at(&key, now).await.unwrap();
    assert_eq!(status(&store).phase, Some(ComponentPhase::Creating));

    let later = now + Span::minutes(2);
    let out = r.reconcile_at(&key, later).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::Failed));
    let st = status(&store);
    assert_eq!(st.message.get("Pod/mycluster-mysql-0").map(String::as_str), Some(PROBE_TIMEOUT_MESSAGE));
}

#[tokio::test]
async fn snapshot_scale_out_pins_replicas_until_volumes_exist() {
    let store = Arc::new(MemStore::new());
    let (r, key) = running(&store, component_spec(3, Some(HScalePolicyType::Snapshot))).await;
    edit(&store, |c| c.replicas = 5);

    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::SpecReconciling));
    let snap_key = obj_key(ObjectKind::Snapshot, "mycluster-mysql-scaling");
    assert!(store.object(&snap_key).is_some());
    assert_eq!(replicas(&store), Some(3));
    assert!(!status(&store).data_clone.is_empty());

    // Still processing: nothing new.
    store.clear_ops();
    r.reconcile(&key).await.unwrap();
    assert!(object_writes(&store).is_empty(), "{:?}", store.ops());

    store.modify(&snap_key, |o| {
        if let ManagedObject::Snapshot(vs) = o {
            vs.status = Some(VolumeSnapshotStatus { ready_to_use: Some(true), error: None });
        }
    });
    r.reconcile(&key).await.unwrap();
    for ordinal in [3, 4] {
        let claim = store.object(&obj_key(ObjectKind::VolumeClaim, &format!("data-mycluster-mysql-{}", ordinal))).unwrap();
        let claim = PersistentVolumeClaim::try_from(claim).unwrap();
        let source = claim.spec.and_then(|s| s.data_source).unwrap();
        assert_eq!(source.name, "mycluster-mysql-scaling");
    }
    assert_eq!(replicas(&store), Some(3));

    r.reconcile(&key).await.unwrap();
    assert_eq!(replicas(&store), Some(5));
    assert!(status(&store).data_clone.is_empty());
}

#[tokio::test]
async fn scale_in_schedules_volume_cleanup_and_scale_out_cancels_it() {
    let store = Arc::new(MemStore::new());
    let (r, key) = running(&store, component_spec(3, None)).await;
    edit(&store, |c| c.replicas = 2);

    let now = Utc::now();
    r.reconcile_at(&key, now).await.unwrap();
    assert_eq!(replicas(&store), Some(2));
    let cj_key = obj_key(ObjectKind::CronJob, &cleanup_cron_job_name("data-mycluster-mysql-2"));
    let cj = store.object(&cj_key).unwrap();
    let schedule = match &cj {
        ManagedObject::CronJob(c) => c.spec.as_ref().map(|s| s.schedule.clone()),
        _ => None,
    };
    assert_eq!(schedule, Some(schedule_at(now + Span::minutes(30))));

    edit(&store, |c| c.replicas = 3);
    r.reconcile_at(&key, now).await.unwrap();
    assert!(store.object(&cj_key).is_none());
    assert_eq!(replicas(&store), Some(3));
}

#[tokio::test]
async fn settled_scale_in_retires_cleanup_and_reports_failed_jobs() {
    let store = Arc::new(MemStore::new());
    let (r, key) = running(&store, component_spec(3, None)).await;
    edit(&store, |c| c.replicas = 2);
    r.reconcile(&key).await.unwrap();

    settle_workload(&store, 2, "rev1");
    store.remove(&obj_key(ObjectKind::Pod, "mycluster-mysql-2"));
    let mut job = Job::default();
    job.metadata.name = Some("delete-pvc-data-mycluster-mysql-2-28000".into());
    job.metadata.namespace = Some(NS.into());
    job.metadata.labels = Some(labels::component("mycluster", "mysql"));
    job.status = Some(JobStatus {
        conditions: Some(vec![JobCondition { type_: "Failed".into(), status: "True".into(), ..Default::default() }]),
        ..Default::default()
    });
    store.insert(job.into());

    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::Abnormal));
    assert!(status(&store).message.contains_key("Job/delete-pvc-data-mycluster-mysql-2-28000"));
    // The claim is gone already, so its CronJob has nothing left to do.
    assert!(store.object(&obj_key(ObjectKind::CronJob, "delete-pvc-data-mycluster-mysql-2")).is_none());
}

#[tokio::test]
async fn restart_deletes_outdated_followers_before_the_leader() {
    let store = Arc::new(MemStore::new());
    let key = seed(&store, component_spec(3, None));
    let r = Reconciler::new(store.clone(), EngineConfig::default());
    r.reconcile(&key).await.unwrap();
    settle_workload(&store, 3, "rev2");
    seed_pods(&store, &[Some("leader"), Some("follower"), Some("follower")], "rev1", Utc::now());
    store.clear_ops();

    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.components["mysql"].pods_deleted, 1);
    assert!(store.ops().contains(&StoreOp::Delete(obj_key(ObjectKind::Pod, "mycluster-mysql-1"))));
    assert!(store.object(&obj_key(ObjectKind::Pod, "mycluster-mysql-0")).is_some());
}

#[tokio::test]
async fn undeclared_services_are_deleted() {
    let store = Arc::new(MemStore::new());
    let key = seed(&store, component_spec(3, None));
    let r = Reconciler::new(store.clone(), EngineConfig::default());
    r.reconcile(&key).await.unwrap();
    edit(&store, |c| c.services.clear());
    store.clear_ops();

    r.reconcile(&key).await.unwrap();
    let ops = object_writes(&store);
    assert!(ops.contains(&StoreOp::Delete(obj_key(ObjectKind::Service, "mycluster-mysql"))));
    assert!(store.object(&obj_key(ObjectKind::Service, "mycluster-mysql-headless")).is_some());
}

#[tokio::test]
async fn missing_cluster_is_a_noop() {
    let store = Arc::new(MemStore::new());
    let r = Reconciler::new(store.clone(), EngineConfig::default());
    let out = r.reconcile(&ClusterKey::new(NS, "ghost")).await.unwrap();
    assert_eq!(out.phase, None);
    assert!(out.components.is_empty());
    assert!(store.ops().is_empty());
}

#[tokio::test]
async fn template_edits_update_the_workload_both_ways() {
    let store = Arc::new(MemStore::new());
    let mut spec = component_spec(3, None);
    with_containers(&mut spec, &["mysql", "sidecar"]);
    let (r, key) = running(&store, spec).await;

    // Dropping a container is a change like any other.
    edit(&store, |c| with_containers(c, &["mysql"]));
    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::SpecReconciling));
    assert_eq!(outcome_of(&out.components["mysql"], &wl_key()), Some(Outcome::Updated));
    assert!(store.ops().contains(&StoreOp::Update(wl_key())));
    assert_eq!(container_names(&store), vec!["mysql".to_string()]);

    // Nothing new since: the workload stays frozen.
    store.clear_ops();
    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(outcome_of(&out.components["mysql"], &wl_key()), Some(Outcome::SkippedImmutable));
    assert!(!store.ops().contains(&StoreOp::Update(wl_key())));

    settle_workload(&store, 3, "rev1");
    assert_eq!(r.reconcile(&key).await.unwrap().phase, Some(ComponentPhase::Running));

    edit(&store, |c| with_containers(c, &["mysql", "exporter"]));
    store.clear_ops();
    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(out.phase, Some(ComponentPhase::SpecReconciling));
    assert!(store.ops().contains(&StoreOp::Update(wl_key())));
    assert_eq!(container_names(&store), vec!["mysql".to_string(), "exporter".to_string()]);
}

#[tokio::test]
async fn removed_service_port_updates_the_service() {
    let store = Arc::new(MemStore::new());
    let mut spec = component_spec(3, None);
    spec.services[0].ports.push(ServicePort { name: Some("admin".into()), port: 33062, ..Default::default() });
    let (r, key) = running(&store, spec).await;
    let svc_key = obj_key(ObjectKind::Service, "mycluster-mysql");

    edit(&store, |c| c.services[0].ports.truncate(1));
    let out = r.reconcile(&key).await.unwrap();
    assert_eq!(outcome_of(&out.components["mysql"], &svc_key), Some(Outcome::Updated));
    let svc = Service::try_from(store.object(&svc_key).unwrap()).unwrap();
    let ports: Vec<i32> = svc.spec.and_then(|s| s.ports).unwrap_or_default().iter().map(|p| p.port).collect();
    assert_eq!(ports, vec![3306]);
}
