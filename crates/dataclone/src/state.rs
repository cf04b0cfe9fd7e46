use std::collections::BTreeMap;

use tessera_core::status::ClonePhase;

/// Recorded clone progress of one backup or volume claim.
///
/// Observations only move the phase forward along
/// NotCreated → Processing → ReadyToUse; Failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCloneState {
    phase: ClonePhase,
}

impl Default for ReplicaCloneState {
    fn default() -> Self { Self { phase: ClonePhase::NotCreated } }
}

impl ReplicaCloneState {
    pub fn new(phase: ClonePhase) -> Self { Self { phase } }
    pub fn phase(&self) -> ClonePhase { self.phase }

    /// Merge an observed phase; a regression keeps the recorded phase.
    pub fn observe(&mut self, observed: ClonePhase) -> ClonePhase {
        if self.phase != ClonePhase::Failed && observed.rank() > self.phase.rank() {
            self.phase = observed;
        }
        self.phase
    }
}

/// Clone phases keyed by backup or claim name, persisted in the component
/// status between passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneTracker {
    phases: BTreeMap<String, ClonePhase>,
}

impl CloneTracker {
    pub fn from_status(phases: &BTreeMap<String, ClonePhase>) -> Self { Self { phases: phases.clone() } }

    pub fn phase(&self, name: &str) -> Option<ClonePhase> { self.phases.get(name).copied() }

    pub fn observe(&mut self, name: &str, observed: ClonePhase) -> ClonePhase {
        let mut st = self.phases.get(name).copied().map(ReplicaCloneState::new).unwrap_or_default();
        let phase = st.observe(observed);
        self.phases.insert(name.to_string(), phase);
        phase
    }

    pub fn has_failed(&self) -> bool { self.phases.values().any(|p| *p == ClonePhase::Failed) }

    pub fn into_map(self) -> BTreeMap<String, ClonePhase> { self.phases }
}

/// Whether any backup or restore of an in-flight scale-out has failed.
pub fn is_scale_out_failed(phases: &BTreeMap<String, ClonePhase>) -> bool {
    phases.values().any(|p| *p == ClonePhase::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClonePhase::*;

    #[test]
    fn phases_never_regress() {
        let mut st = ReplicaCloneState::default();
        assert_eq!(st.observe(Processing), Processing);
        assert_eq!(st.observe(NotCreated), Processing);
        assert_eq!(st.observe(ReadyToUse), ReadyToUse);
        assert_eq!(st.observe(Processing), ReadyToUse);
        assert_eq!(st.observe(Failed), Failed);
        assert_eq!(st.observe(ReadyToUse), Failed);
        assert_eq!(st.observe(NotCreated), Failed);
    }

    #[test]
    fn tracker_persists_through_status_map() {
        let mut t = CloneTracker::default();
        t.observe("mycluster-mysql-scaling", ReadyToUse);
        t.observe("data-mycluster-mysql-3", Processing);
        let map = t.into_map();
        assert!(!is_scale_out_failed(&map));

        let mut t = CloneTracker::from_status(&map);
        assert_eq!(t.observe("mycluster-mysql-scaling", NotCreated), ReadyToUse);
        assert_eq!(t.observe("data-mycluster-mysql-3", Failed), Failed);
        assert!(t.has_failed());
        assert!(is_scale_out_failed(&t.into_map()));
    }
}
