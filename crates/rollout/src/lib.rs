//! Tessera rollout (Milestone 2): role priorities, deterministic update
//! plans and the per-role status block.
//!
//! Plans are recomputed every pass from the live pods; nothing is kept
//! between passes. `walk_one_step` advances at most one stage of work and
//! the caller re-invokes it until it reports completion.

#![forbid(unsafe_code)]

pub mod pods;
mod plan;
mod priority;
mod role;

pub use plan::{build_plan, plan_restart, sort_pods, walk_one_step, RestartWalker, Stage, StepState, UpdatePlan};
pub use priority::{RolePriority, EMPTY, FOLLOWER_NONE, FOLLOWER_READONLY, FOLLOWER_READ_WRITE, LEADER, LEARNER, UNKNOWN};
pub use role::{build_role_status, role_env, DEFAULT_POD_NAME};
