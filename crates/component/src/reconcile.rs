use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, histogram};
use serde::Serialize;
use tessera_apply::{apply_graph, object_diff, ApplyReport};
use tessera_core::labels::{self, Labels};
use tessera_core::spec::SynthesizedComponent;
use tessera_core::status::{ComponentPhase, ComponentStatus, MessageMap};
use tessera_core::{EngineConfig, Error, ManagedObject, ObjectKey, ObjectKind, Owner, Result};
use tessera_dataclone::CloneContext;
use tessera_graph::{Action, Mutation, ResourceGraph, Snapshot};
use tessera_kubehub::{ClusterKey, ObjectStore};
use tessera_rollout::{build_plan, build_role_status, plan_restart, role_env, RolePriority};
use tessera_store::read_snapshot;
use tracing::{debug, info, warn};

use crate::builder::{DefaultBuilder, ObjectBuilder};
use crate::hscale::{plan_horizontal_scale, ScaleOutcome};
use crate::status::{self, StatusTransaction};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComponentOutcome {
    pub phase: Option<ComponentPhase>,
    pub report: ApplyReport,
    pub pods_deleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requeue_after: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    /// Most severe component phase.
    pub phase: Option<ComponentPhase>,
    pub components: BTreeMap<String, ComponentOutcome>,
    /// Shortest requeue hint over all components.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requeue_after: Option<Duration>,
}

/// Live workload carrying the proto's template, replica count and update
/// strategy. Template annotations added by others survive.
pub fn merge_workload(live: &StatefulSet, proto: &StatefulSet) -> StatefulSet {
    let mut out = live.clone();
    let Some(p) = proto.spec.as_ref() else { return out };
    let spec = out.spec.get_or_insert_with(|| p.clone());
    let mut template = p.template.clone();
    let kept = spec.template.metadata.as_ref().and_then(|m| m.annotations.clone()).unwrap_or_default();
    if !kept.is_empty() {
        let ann = template.metadata.get_or_insert_with(Default::default).annotations.get_or_insert_with(Default::default);
        for (k, v) in kept {
            ann.entry(k).or_insert(v);
        }
    }
    spec.template = template;
    spec.replicas = p.replicas;
    spec.update_strategy = p.update_strategy.clone();
    out
}

fn workload_changed(desired: &StatefulSet, live: &StatefulSet) -> Result<bool> {
    Ok(object_diff(&desired.clone().into(), &live.clone().into())?.changes())
}

/// Sorted snapshot objects of `kind` carrying every `selector` label.
fn owned_of_kind<'a>(snapshot: &'a Snapshot, kind: ObjectKind, selector: &Labels) -> Vec<&'a ManagedObject> {
    let mut objs: Vec<&ManagedObject> = snapshot.of_kind(kind).filter(|o| labels::matches(o.labels(), selector)).collect();
    objs.sort_by_key(|o| o.key());
    objs
}

/// Updates keep the cluster IPs the server assigned.
fn carry_cluster_ips(graph: &mut ResourceGraph) {
    for id in graph.find_all(ObjectKind::Service) {
        let Some(v) = graph.vertex_mut(id) else { continue };
        let Some(ManagedObject::Service(live)) = v.live.as_ref() else { continue };
        let Some(live_spec) = live.spec.clone() else { continue };
        if let ManagedObject::Service(svc) = &mut v.obj {
            if let Some(spec) = svc.spec.as_mut() {
                if spec.cluster_ip.is_none() {
                    spec.cluster_ip = live_spec.cluster_ip;
                    spec.cluster_ips = live_spec.cluster_ips;
                }
            }
        }
    }
}

/// Drives the reconcile pass of every component of a Cluster.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    config: EngineConfig,
    builder: Arc<dyn ObjectBuilder>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, config: EngineConfig) -> Self {
        let builder = Arc::new(DefaultBuilder::new(config.manager_name.clone()));
        Self { store, config, builder }
    }

    pub fn with_builder(mut self, builder: Arc<dyn ObjectBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    pub async fn reconcile(&self, key: &ClusterKey) -> Result<ReconcileOutcome> { self.reconcile_at(key, Utc::now()).await }

    /// One pass with `now` as the clock for every timeout check.
    pub async fn reconcile_at(&self, key: &ClusterKey, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.pass(key, now).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(o) => debug!(cluster = %key, phase = ?o.phase, requeue = ?o.requeue_after, "reconciled"),
            Err(e) => {
                counter!("reconcile_err", 1u64);
                warn!(cluster = %key, error = %e, transient = e.is_transient(), "reconcile failed");
            }
        }
        res
    }

    /// Stage names of the update plan for one component's live pods.
    pub async fn update_plan(&self, key: &ClusterKey, component: &str) -> Result<Vec<Vec<String>>> {
        let cluster = self
            .store
            .get_cluster(&key.namespace, &key.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Cluster/{}", key)))?;
        let spec = cluster
            .spec
            .component_specs
            .iter()
            .find(|s| s.name == component)
            .ok_or_else(|| Error::NotFound(format!("component {} in cluster {}", component, key)))?;
        let comp = SynthesizedComponent::compose(&cluster, spec)?;
        let pods = self.pods(&comp).await?;
        let priority = RolePriority::from_spec(&comp.consensus)?;
        Ok(build_plan(pods, &priority, comp.consensus.update_strategy).stage_names())
    }

    async fn pods(&self, comp: &SynthesizedComponent) -> Result<Vec<Pod>> {
        let objs = self.store.list(ObjectKind::Pod, &comp.namespace, &comp.match_labels()).await?;
        Ok(objs.into_iter().filter_map(|o| Pod::try_from(o).ok()).collect())
    }

    async fn pass(&self, key: &ClusterKey, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let Some(mut cluster) = self.store.get_cluster(&key.namespace, &key.name).await? else {
            debug!(cluster = %key, "cluster not found");
            return Ok(ReconcileOutcome::default());
        };
        if cluster.metadata.deletion_timestamp.is_some() {
            debug!(cluster = %key, "cluster is being deleted");
            return Ok(ReconcileOutcome::default());
        }
        let owner = Owner::from_cluster(&cluster)?;
        let status_updating = cluster.is_status_updating();
        let snapshot = read_snapshot(self.store.as_ref(), &owner).await?;

        let mut next = cluster.status.clone().unwrap_or_default();
        let mut outcome = ReconcileOutcome::default();
        for spec in cluster.spec.component_specs.iter() {
            let comp = SynthesizedComponent::compose(&cluster, spec)?;
            let prev = cluster.component_status(&comp.name).cloned().unwrap_or_default();
            let (st, co) = self.reconcile_component(&comp, &owner, prev, &snapshot, status_updating, now).await?;
            next.components.insert(comp.name.clone(), st);
            outcome.components.insert(comp.name, co);
        }
        next.components.retain(|name, _| outcome.components.contains_key(name));
        next.phase = next.components.values().filter_map(|s| s.phase).max_by_key(|p| p.severity());
        next.observed_generation = cluster.metadata.generation;
        outcome.phase = next.phase;
        outcome.requeue_after = outcome.components.values().filter_map(|c| c.requeue_after).min();

        if cluster.status.as_ref() != Some(&next) {
            cluster.status = Some(next);
            self.store.update_cluster_status(&cluster).await?;
            info!(cluster = %key, phase = ?outcome.phase, "cluster status updated");
        }
        Ok(outcome)
    }

    async fn reconcile_component(
        &self,
        comp: &SynthesizedComponent,
        owner: &Owner,
        mut status: ComponentStatus,
        snapshot: &Snapshot,
        status_updating: bool,
        now: DateTime<Utc>,
    ) -> Result<(ComponentStatus, ComponentOutcome)> {
        let store = self.store.as_ref();
        let selector = comp.match_labels();
        let pods = self.pods(comp).await?;
        let wl_key = ObjectKey::new(ObjectKind::Workload, &comp.namespace, comp.workload_name());
        let live = snapshot.get(&wl_key).cloned().and_then(|o| StatefulSet::try_from(o).ok());
        let proto = self.builder.workload(comp, owner);

        let mut tx = StatusTransaction::new();
        let mut graph = ResourceGraph::new();
        let mut mutations = Vec::new();

        let (wl_id, scale) = match &live {
            None => {
                tx.propose(ComponentPhase::Creating, MessageMap::new());
                (graph.add_vertex(Some(proto.into()), None, None)?, ScaleOutcome::default())
            }
            Some(live) => {
                let mut desired = merge_workload(live, &proto);
                if workload_changed(&desired, live)? {
                    tx.propose(ComponentPhase::SpecReconciling, MessageMap::new());
                }
                let ctx = CloneContext { store, component: comp, owner, live, desired_replicas: comp.replicas, config: &self.config };
                let scale = plan_horizontal_scale(ctx, &status.data_clone, now).await?;
                if let (Some(r), Some(spec)) = (scale.pinned_replicas, desired.spec.as_mut()) {
                    spec.replicas = Some(r);
                }
                let frozen = !workload_changed(&desired, live)?;
                let id = graph.add_vertex(Some(desired.into()), None, None)?;
                if frozen {
                    mutations.push(Mutation::MarkImmutable(id));
                }
                (id, scale)
            }
        };

        if scale.pinned_replicas.is_some() {
            debug!(component = %comp.name, replicas = ?scale.pinned_replicas, "replicas pinned until data clone succeeds");
        }
        for obj in scale.create {
            let id = graph.add_vertex(Some(obj), Some(Action::Create), None)?;
            graph.connect(id, wl_id)?;
        }
        for obj in scale.delete {
            let id = graph.add_vertex(Some(obj), Some(Action::Delete), None)?;
            graph.connect(id, wl_id)?;
        }
        if live.is_some() {
            status.data_clone = scale.data_clone;
        }
        if let Some(phase) = scale.phase {
            tx.propose(phase, scale.messages);
        }

        let mut wanted = BTreeSet::new();
        for svc in self.builder.services(comp, owner) {
            let obj = ManagedObject::from(svc);
            wanted.insert(obj.key());
            graph.add_vertex(Some(obj), None, None)?;
        }
        for stale in owned_of_kind(snapshot, ObjectKind::Service, &selector).into_iter().filter(|o| !wanted.contains(&o.key())) {
            debug!(service = %stale.key(), "service no longer declared");
            graph.add_vertex(Some(stale.clone()), Some(Action::Delete), None)?;
        }

        match self.builder.disruption_budget(comp, owner) {
            Some(pdb) => {
                graph.add_vertex(Some(pdb.into()), None, None)?;
            }
            None => {
                let key = ObjectKey::new(ObjectKind::DisruptionBudget, &comp.namespace, comp.workload_name());
                if let Some(pdb) = snapshot.get(&key) {
                    graph.add_vertex(Some(pdb.clone()), Some(Action::Delete), None)?;
                }
            }
        }

        for claim in owned_of_kind(snapshot, ObjectKind::VolumeClaim, &selector) {
            graph.add_vertex(Some(claim.clone()), Some(Action::Noop), None)?;
        }

        let mut pods_deleted = 0usize;
        if let Some(live) = &live {
            let priority = RolePriority::from_spec(&comp.consensus)?;
            for pod in plan_restart(live, &pods, &priority, comp.consensus.update_strategy)? {
                let id = graph.add_vertex(Some(pod.into()), Some(Action::Delete), None)?;
                mutations.push(Mutation::MarkOrphan(id));
                pods_deleted += 1;
            }
        }

        let roles = build_role_status(&comp.consensus, &pods);
        let role_changed = status.consensus_set_status.as_ref() != Some(&roles);
        if role_changed {
            info!(component = %comp.name, leader = %roles.leader.pod, followers = roles.followers.len(), "role membership changed");
        }
        let env = self.builder.env_config_map(comp, owner, role_env(&comp.name, &roles));
        let env_id = graph.add_vertex(Some(env.into()), None, None)?;
        graph.connect(env_id, wl_id)?;
        status.consensus_set_status = Some(roles);

        graph.resolve_actions(snapshot, status_updating)?;
        if role_changed {
            if let Some(v) = graph.vertex_mut(env_id) {
                v.immutable = false;
            }
        }
        graph.apply(mutations)?;
        carry_cluster_ips(&mut graph);

        let report = apply_graph(store, &graph).await?;
        if pods_deleted > 0 {
            counter!("rollout_pods_deleted", pods_deleted as u64);
            info!(component = %comp.name, pods = pods_deleted, "pods deleted for restart");
        }

        let mut requeue = None;
        if let Some(live) = &live {
            requeue = status::aggregate(comp, live, &pods, &mut status, &mut tx, &self.config, now);
        }
        if tx.commit(&mut status) {
            info!(component = %comp.name, phase = ?status.phase, "component phase changed");
        }
        let settling = matches!(status.phase, Some(ComponentPhase::Creating | ComponentPhase::SpecReconciling));
        if settling || pods_deleted > 0 || !status.data_clone.is_empty() {
            let hint = self.config.requeue_after;
            requeue = Some(requeue.map_or(hint, |r: Duration| r.min(hint)));
        }
        let outcome = ComponentOutcome { phase: status.phase, report, pods_deleted, requeue_after: requeue };
        Ok((status, outcome))
    }
}
