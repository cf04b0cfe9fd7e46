use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use smallvec::SmallVec;
use tessera_core::spec::UpdateStrategy;
use tessera_core::Result;
use tracing::debug;

use crate::pods;
use crate::priority::{RolePriority, LEADER, LEARNER};

/// Indexes into the plan's sorted pods; members of a stage run in parallel.
pub type Stage = SmallVec<[usize; 4]>;

/// Sequential stages of replicas to recreate.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pods: Vec<Pod>,
    stages: Vec<Stage>,
}

impl UpdatePlan {
    pub fn len(&self) -> usize { self.stages.len() }
    pub fn is_empty(&self) -> bool { self.stages.is_empty() }
    pub fn pods(&self) -> &[Pod] { &self.pods }

    pub fn stage(&self, i: usize) -> impl Iterator<Item = &Pod> {
        self.stages.get(i).into_iter().flat_map(move |s| s.iter().map(move |&p| &self.pods[p]))
    }

    /// Pod names per stage, in plan order.
    pub fn stage_names(&self) -> Vec<Vec<String>> {
        (0..self.stages.len()).map(|i| self.stage(i).map(|p| pods::name(p).to_string()).collect()).collect()
    }
}

/// Stable sort by `(priority(role), ordinal)`.
pub fn sort_pods(pods: &mut [Pod], priority: &RolePriority) {
    pods.sort_by_key(|p| (priority.of_pod(p), pods::ordinal(pods::name(p))));
}

pub fn build_plan(mut pods: Vec<Pod>, priority: &RolePriority, strategy: UpdateStrategy) -> UpdatePlan {
    sort_pods(&mut pods, priority);
    let n = pods.len();
    let stages: Vec<Stage> = match strategy {
        UpdateStrategy::Serial => (0..n).map(|i| SmallVec::from_elem(i, 1)).collect(),
        UpdateStrategy::Parallel => {
            if n == 0 { Vec::new() } else { vec![(0..n).collect()] }
        }
        UpdateStrategy::BestEffortParallel => {
            // Unlabeled, empty-role and learner replicas go first.
            let low = pods.iter().take_while(|p| priority.of_pod(p) <= LEARNER).count();
            let followers = pods[low..].iter().filter(|p| priority.of_pod(p) < LEADER).count();
            // Floor split: with an odd follower count the larger half goes second.
            let half = followers / 2;
            let bounds = [0, low, low + half, low + followers, n];
            bounds
                .windows(2)
                .map(|w| (w[0]..w[1]).collect::<Stage>())
                .filter(|s| !s.is_empty())
                .collect()
        }
    };
    UpdatePlan { pods, stages }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Work was started or is still pending; stop walking for this pass.
    InProgress,
    Complete,
}

/// Advance the plan by one unit of work.
///
/// Every member of the first unfinished stage is visited. If any of them
/// reports [`StepState::InProgress`] the walk stops and returns `false`;
/// otherwise it moves on to the next stage. Returns `true` once every stage
/// is complete.
pub fn walk_one_step<F>(plan: &UpdatePlan, mut step: F) -> Result<bool>
where
    F: FnMut(&Pod) -> Result<StepState>,
{
    for stage in plan.stages.iter() {
        let mut pending = false;
        for &i in stage.iter() {
            if step(&plan.pods[i])? == StepState::InProgress {
                pending = true;
            }
        }
        if pending {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Step function for restarting replicas onto the workload's update revision.
#[derive(Debug)]
pub struct RestartWalker<'a> {
    update_revision: &'a str,
    to_delete: Vec<Pod>,
}

impl<'a> RestartWalker<'a> {
    pub fn new(update_revision: &'a str) -> Self { Self { update_revision, to_delete: Vec::new() } }

    pub fn step(&mut self, pod: &Pod) -> StepState {
        if pods::is_terminating(pod) {
            return StepState::InProgress;
        }
        if pods::revision(pod) == Some(self.update_revision) {
            return if pods::is_ready_with_role(pod) { StepState::Complete } else { StepState::InProgress };
        }
        self.to_delete.push(pod.clone());
        StepState::InProgress
    }

    pub fn into_pods(self) -> Vec<Pod> { self.to_delete }
}

/// Pods to delete this pass so the workload controller recreates them on
/// the update revision.
///
/// Nothing is planned while the workload's spec change is still being rolled
/// out by its controller, or while the pod population differs from the
/// declared replica count.
pub fn plan_restart(workload: &StatefulSet, pods: &[Pod], priority: &RolePriority, strategy: UpdateStrategy) -> Result<Vec<Pod>> {
    let status = workload.status.as_ref();
    if workload.metadata.generation != status.and_then(|s| s.observed_generation) {
        return Ok(Vec::new());
    }
    let replicas = workload.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    if pods.len() != replicas.max(0) as usize {
        return Ok(Vec::new());
    }
    let update_revision = match status.and_then(|s| s.update_revision.as_deref()) {
        Some(r) if !r.is_empty() => r,
        _ => return Ok(Vec::new()),
    };
    let plan = build_plan(pods.to_vec(), priority, strategy);
    let mut walker = RestartWalker::new(update_revision);
    let done = walk_one_step(&plan, |p| Ok(walker.step(p)))?;
    let out = walker.into_pods();
    debug!(done, to_delete = out.len(), stages = plan.len(), "restart plan walked");
    Ok(out)
}
