//! Tessera component (Milestone 4): the reconcile pass of a Cluster's
//! components.
//!
//! Each pass builds a resource graph from the declared spec, lets horizontal
//! scaling, restarts and role changes add their vertices, resolves actions
//! against a snapshot of owned objects, applies the graph and finally folds
//! the observed workload into the component status.

#![forbid(unsafe_code)]

pub mod builder;
pub mod hscale;
mod reconcile;
pub mod status;

pub use builder::{env_config_map_name, DefaultBuilder, ObjectBuilder};
pub use hscale::{plan_horizontal_scale, ScaleOutcome};
pub use reconcile::{merge_workload, ComponentOutcome, ReconcileOutcome, Reconciler};
pub use status::{StatusTransaction, PROBE_TIMEOUT_MESSAGE};
