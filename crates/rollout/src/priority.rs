use k8s_openapi::api::core::v1::Pod;
use rustc_hash::FxHashMap;
use tessera_core::spec::{AccessMode, ConsensusSpec};
use tessera_core::{Error, Result};

use crate::pods;

pub const LEADER: i32 = 1 << 5;
pub const FOLLOWER_READ_WRITE: i32 = 1 << 4;
pub const FOLLOWER_READONLY: i32 = 1 << 3;
pub const FOLLOWER_NONE: i32 = 1 << 2;
pub const LEARNER: i32 = 1 << 1;
/// Pods whose role label is present but empty.
pub const EMPTY: i32 = 1 << 0;
/// Role label value not declared by the component.
pub const UNKNOWN: i32 = 0;

/// Role name to priority, built from the component's declared roles.
/// Lower priority is recreated first; the leader always comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePriority {
    map: FxHashMap<String, i32>,
}

impl RolePriority {
    pub fn from_spec(spec: &ConsensusSpec) -> Result<Self> {
        let mut map = FxHashMap::default();
        map.insert(String::new(), EMPTY);
        let mut declare = |name: &str, prio: i32| -> Result<()> {
            if name.is_empty() {
                return Err(Error::Config("consensus role without a name".into()));
            }
            if map.insert(name.to_string(), prio).is_some() {
                return Err(Error::Config(format!("role {} declared more than once", name)));
            }
            Ok(())
        };
        declare(&spec.leader.name, LEADER)?;
        for f in spec.followers.iter() {
            let prio = match f.access_mode {
                AccessMode::ReadWrite => FOLLOWER_READ_WRITE,
                AccessMode::Readonly => FOLLOWER_READONLY,
                AccessMode::None => FOLLOWER_NONE,
            };
            declare(&f.name, prio)?;
        }
        if let Some(l) = spec.learner.as_ref() {
            declare(&l.name, LEARNER)?;
        }
        Ok(Self { map })
    }

    pub fn priority(&self, role: &str) -> i32 { self.map.get(role).copied().unwrap_or(UNKNOWN) }

    pub fn of_pod(&self, pod: &Pod) -> i32 { self.priority(pods::role(pod)) }
}
