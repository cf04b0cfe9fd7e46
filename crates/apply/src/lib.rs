//! Tessera apply (Milestone 2): executes a resolved resource graph against an
//! object store, skipping updates that would not change anything.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tessera_core::{Error, ManagedObject, ObjectKey, Result};
use tessera_graph::{Action, ResourceGraph, Vertex};
use tessera_kubehub::ObjectStore;
use tracing::{debug, info};

/// Where a desired object departs from its live copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Paths the desired object sets differently, including arrays whose
    /// length differs (`spec.ports[]`).
    pub changed: Vec<String>,
    /// Map keys only the live copy carries; treated as server defaults.
    pub defaulted: usize,
}

impl DiffSummary {
    pub fn changes(&self) -> bool { !self.changed.is_empty() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    /// Create found the object already there.
    Existed,
    Unchanged,
    SkippedImmutable,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applied {
    pub key: ObjectKey,
    pub action: Action,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub applied: Vec<Applied>,
}

impl ApplyReport {
    /// Whether any write reached the store.
    pub fn wrote(&self) -> bool { self.created + self.updated + self.deleted > 0 }

    fn push(&mut self, v: &Vertex, action: Action, outcome: Outcome, diff: Option<DiffSummary>) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Deleted => self.deleted += 1,
            _ => self.skipped += 1,
        }
        self.applied.push(Applied { key: v.key(), action, outcome, diff });
    }
}

/// Metadata written by the API server, never by a builder.
const SERVER_META: [&str; 6] = ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"];

/// JSON form of `obj` without status and server-owned metadata.
pub fn normalize(obj: &ManagedObject) -> Result<Json> {
    let mut v = obj.to_json()?;
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in SERVER_META {
            meta.remove(k);
        }
    }
    if let Some(o) = v.as_object_mut() {
        o.remove("status");
    }
    Ok(v)
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

/// Compare `desired` against `live`.
///
/// A map key absent from `desired` is left to the server. Arrays are
/// positional: a length mismatch is a change (an element was added or
/// dropped) and elements are compared with the same map rule.
pub fn json_diff(desired: &Json, live: &Json) -> DiffSummary {
    fn walk(path: &str, d: &Json, l: &Json, out: &mut DiffSummary) {
        match (d, l) {
            (Json::Object(dm), Json::Object(lm)) => {
                for (k, dv) in dm.iter() {
                    match lm.get(k) {
                        Some(lv) if lv == dv => {}
                        Some(lv) => walk(&join(path, k), dv, lv, out),
                        None => out.changed.push(join(path, k)),
                    }
                }
                out.defaulted += lm.keys().filter(|k| !dm.contains_key(*k)).count();
            }
            (Json::Array(da), Json::Array(la)) => {
                if da.len() != la.len() {
                    out.changed.push(format!("{}[]", path));
                }
                for (i, (dv, lv)) in da.iter().zip(la.iter()).enumerate() {
                    if dv != lv {
                        walk(&format!("{}[{}]", path, i), dv, lv, out);
                    }
                }
            }
            _ => {
                if d != l {
                    out.changed.push(path.to_string());
                }
            }
        }
    }
    let mut out = DiffSummary::default();
    walk("", desired, live, &mut out);
    out
}

/// Normalised difference of `desired` against `live`.
pub fn object_diff(desired: &ManagedObject, live: &ManagedObject) -> Result<DiffSummary> {
    Ok(json_diff(&normalize(desired)?, &normalize(live)?))
}

async fn update_one<S: ObjectStore + ?Sized>(store: &S, v: &Vertex) -> Result<(Outcome, Option<DiffSummary>)> {
    if v.immutable {
        counter!("apply_skipped_immutable", 1u64);
        return Ok((Outcome::SkippedImmutable, None));
    }
    let live = match &v.live {
        Some(l) => l.clone(),
        None => store.get(&v.key()).await?.ok_or_else(|| Error::NotFound(v.key().to_string()))?,
    };
    let diff = object_diff(&v.obj, &live)?;
    if !diff.changes() {
        return Ok((Outcome::Unchanged, Some(diff)));
    }
    debug!(obj = %v.key(), changed = ?diff.changed, "update needed");
    let mut obj = v.obj.clone();
    obj.meta_mut().resource_version = live.resource_version().map(String::from);
    store.update(&obj).await?;
    counter!("apply_update", 1u64);
    Ok((Outcome::Updated, Some(diff)))
}

/// Execute every vertex of `graph` in dependency order.
///
/// Creates of objects that already exist count as done. Updates are
/// skipped for immutable vertices and when the desired object would not
/// change the live one. The first store error aborts the walk.
pub async fn apply_graph<S: ObjectStore + ?Sized>(store: &S, graph: &ResourceGraph) -> Result<ApplyReport> {
    let t0 = Instant::now();
    let mut report = ApplyReport::default();
    for id in graph.topological_order()? {
        let v = graph.vertex(id).ok_or_else(|| Error::Invariant(format!("unknown vertex {}", id.index())))?;
        let action = v.action.ok_or_else(|| Error::Invariant(format!("{} has no action", v.key())))?;
        let (outcome, diff) = match action {
            Action::Create => match store.create(&v.obj).await {
                Ok(_) => {
                    counter!("apply_create", 1u64);
                    (Outcome::Created, None)
                }
                Err(Error::Conflict(_)) => (Outcome::Existed, None),
                Err(e) => return Err(e),
            },
            Action::Update => update_one(store, v).await?,
            Action::Delete => {
                store.delete(&v.obj, v.orphan).await?;
                counter!("apply_delete", 1u64);
                (Outcome::Deleted, None)
            }
            Action::Noop | Action::Status => (Outcome::Skipped, None),
        };
        debug!(obj = %v.key(), ?action, ?outcome, "vertex applied");
        report.push(v, action, outcome, diff);
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    if report.wrote() {
        info!(created = report.created, updated = report.updated, deleted = report.deleted, skipped = report.skipped, "graph applied");
    }
    Ok(report)
}
