use serde::{Deserialize, Serialize};

/// Engine errors, grouped by how a caller should react to them.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// Object store unreachable or returned an unexpected failure.
    #[error("store: {0}")]
    Store(String),
    /// Optimistic-concurrency conflict (stale resourceVersion, AlreadyExists).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config: {0}")]
    Config(String),
    /// Backup or restore reached the terminal Failed phase.
    #[error("clone failed: {0}")]
    CloneFailed(String),
    /// Programming-error class fault; the pass must not continue.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn store(e: impl std::fmt::Display) -> Self { Error::Store(e.to_string()) }

    /// Requeue the whole pass shortly; nothing to fix by hand.
    pub fn is_transient(&self) -> bool { matches!(self, Error::Store(_) | Error::Conflict(_)) }

    /// Needs operator or configuration correction; requeue with backoff.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Config(_) | Error::CloneFailed(_))
    }

    pub fn is_invariant(&self) -> bool { matches!(self, Error::Invariant(_)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_disjoint() {
        let all = [
            Error::Store("x".into()),
            Error::Conflict("x".into()),
            Error::NotFound("x".into()),
            Error::Config("x".into()),
            Error::CloneFailed("x".into()),
            Error::Invariant("x".into()),
        ];
        for e in all.iter() {
            let n = [e.is_transient(), e.is_structural(), e.is_invariant()].iter().filter(|b| **b).count();
            assert_eq!(n, 1, "{:?}", e);
        }
        assert!(Error::Conflict("rv".into()).to_string().starts_with("conflict"));
    }
}
