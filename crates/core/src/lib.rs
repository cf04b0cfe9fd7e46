//! Tessera core (Milestone 0): managed-object model, custom resources,
//! component spec/status types, errors and engine configuration.

#![forbid(unsafe_code)]

pub mod config;
pub mod crd;
pub mod error;
pub mod labels;
pub mod object;
pub mod spec;
pub mod status;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use object::{ManagedObject, ObjectKey, ObjectKind, Owner};

pub mod prelude {
    pub use super::crd::{Backup, BackupPolicy, BackupPolicyTemplate, BackupTool, Cluster, ClusterStatus, VolumeSnapshot};
    pub use super::spec::{AccessMode, ConsensusSpec, HScalePolicyType, SynthesizedComponent, UpdateStrategy};
    pub use super::status::{ClonePhase, ComponentPhase, ComponentStatus, ConsensusSetStatus, MessageMap};
    pub use super::{EngineConfig, Error, ManagedObject, ObjectKey, ObjectKind, Owner, Result};
}
