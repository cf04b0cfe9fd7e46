//! Tessera graph (Milestone 1): an arena of managed-object vertices with
//! ordering edges, plus resolution of undetermined actions against a
//! snapshot of live objects.
//!
//! Resolution is split into a pure planning step (`plan_resolution`) that
//! returns explicit [`Mutation`]s, and `apply`, so each phase can be tested
//! on its own.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tessera_core::{Error, ManagedObject, ObjectKey, ObjectKind, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(usize);

impl VertexId {
    pub fn index(self) -> usize { self.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
    Noop,
    /// Status sub-resource write only.
    Status,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub obj: ManagedObject,
    pub action: Option<Action>,
    /// Updates to an immutable vertex are skipped by the executor.
    pub immutable: bool,
    /// Live copy recorded at resolution, used for change detection.
    pub live: Option<ManagedObject>,
    /// Delete without cascading to dependents.
    pub orphan: bool,
}

impl Vertex {
    pub fn key(&self) -> ObjectKey { self.obj.key() }
}

/// Point-in-time index of live objects owned by one entity.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    objects: FxHashMap<ObjectKey, ManagedObject>,
}

impl Snapshot {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
    pub fn get(&self, key: &ObjectKey) -> Option<&ManagedObject> { self.objects.get(key) }
    pub fn contains(&self, key: &ObjectKey) -> bool { self.objects.contains_key(key) }

    pub fn insert(&mut self, obj: ManagedObject) { self.objects.insert(obj.key(), obj); }

    pub fn of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &ManagedObject> {
        self.objects.values().filter(move |o| o.kind() == kind)
    }
}

impl FromIterator<ManagedObject> for Snapshot {
    fn from_iter<I: IntoIterator<Item = ManagedObject>>(iter: I) -> Self {
        let mut s = Snapshot::new();
        for o in iter { s.insert(o); }
        s
    }
}

/// Explicit change to a graph, produced by a planning phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SetAction { vertex: VertexId, action: Action, live: Option<ManagedObject> },
    MarkImmutable(VertexId),
    MarkOrphan(VertexId),
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    vertices: Vec<Vertex>,
    children: Vec<Vec<VertexId>>,
    index: FxHashMap<ObjectKey, VertexId>,
}

impl ResourceGraph {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.vertices.len() }
    pub fn is_empty(&self) -> bool { self.vertices.is_empty() }
    pub fn vertices(&self) -> &[Vertex] { &self.vertices }

    pub fn iter(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.vertices.iter().enumerate().map(|(i, v)| (VertexId(i), v))
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> { self.vertices.get(id.0) }
    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut Vertex> { self.vertices.get_mut(id.0) }

    fn checked(&self, id: VertexId) -> Result<()> {
        if id.0 < self.vertices.len() { Ok(()) } else { Err(Error::Invariant(format!("unknown vertex {}", id.0))) }
    }

    /// Add a vertex for `obj`, optionally as a child of `parent`.
    ///
    /// A missing object is a programming error and is reported as
    /// [`Error::Invariant`]; no vertex is added in that case.
    pub fn add_vertex(&mut self, obj: Option<ManagedObject>, action: Option<Action>, parent: Option<VertexId>) -> Result<VertexId> {
        let obj = obj.ok_or_else(|| Error::Invariant("add_vertex called without an object".into()))?;
        if let Some(p) = parent { self.checked(p)?; }
        let id = VertexId(self.vertices.len());
        self.index.entry(obj.key()).or_insert(id);
        self.vertices.push(Vertex { obj, action, immutable: false, live: None, orphan: false });
        self.children.push(Vec::new());
        if let Some(p) = parent { self.children[p.0].push(id); }
        Ok(id)
    }

    /// Add the edge `parent -> child`; rejects edges that would close a cycle.
    pub fn connect(&mut self, parent: VertexId, child: VertexId) -> Result<()> {
        self.checked(parent)?;
        self.checked(child)?;
        if parent == child || self.reaches(child, parent) {
            return Err(Error::Invariant(format!(
                "edge {} -> {} would create a cycle",
                self.vertices[parent.0].key(),
                self.vertices[child.0].key()
            )));
        }
        if !self.children[parent.0].contains(&child) { self.children[parent.0].push(child); }
        Ok(())
    }

    pub fn children(&self, id: VertexId) -> &[VertexId] {
        self.children.get(id.0).map(|c| c.as_slice()).unwrap_or(&[])
    }

    fn reaches(&self, from: VertexId, to: VertexId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.vertices.len()];
        while let Some(v) = stack.pop() {
            if v == to { return true; }
            if std::mem::replace(&mut seen[v.0], true) { continue; }
            stack.extend(self.children[v.0].iter().copied());
        }
        false
    }

    /// First vertex added for `key`.
    pub fn find(&self, key: &ObjectKey) -> Option<VertexId> { self.index.get(key).copied() }

    pub fn find_all(&self, kind: ObjectKind) -> Vec<VertexId> {
        self.iter().filter(|(_, v)| v.obj.kind() == kind).map(|(id, _)| id).collect()
    }

    /// The single primary workload vertex, if any.
    pub fn workload(&self) -> Result<Option<VertexId>> {
        let all = self.find_all(ObjectKind::Workload);
        match all.as_slice() {
            [] => Ok(None),
            [one] => Ok(Some(*one)),
            _ => Err(Error::Config(format!("expected one workload vertex, found {}", all.len()))),
        }
    }

    /// Error if any vertex still lacks an action.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<String> = self.vertices.iter().filter(|v| v.action.is_none()).map(|v| v.key().to_string()).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Invariant(format!("vertices without action: {}", missing.join(", "))))
        }
    }

    /// Parents before children; ties keep insertion order.
    pub fn topological_order(&self) -> Result<Vec<VertexId>> {
        let n = self.vertices.len();
        let mut indegree = vec![0usize; n];
        for cs in self.children.iter() {
            for c in cs { indegree[c.0] += 1; }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut out = Vec::with_capacity(n);
        while let Some(i) = ready.pop_first() {
            out.push(VertexId(i));
            for c in self.children[i].iter() {
                indegree[c.0] -= 1;
                if indegree[c.0] == 0 { ready.insert(c.0); }
            }
        }
        if out.len() != n {
            return Err(Error::Invariant("resource graph contains a cycle".into()));
        }
        Ok(out)
    }

    /// Plan actions for every vertex whose action is undetermined.
    ///
    /// Present in the snapshot means Update (with the live copy recorded),
    /// absent means Create; pre-set actions are left alone. When
    /// `status_updating` holds, every vertex except the primary workload is
    /// marked immutable.
    pub fn plan_resolution(&self, snapshot: &Snapshot, status_updating: bool) -> Vec<Mutation> {
        let mut out = Vec::new();
        for (id, v) in self.iter() {
            if v.action.is_none() {
                let m = match snapshot.get(&v.key()) {
                    Some(live) => Mutation::SetAction { vertex: id, action: Action::Update, live: Some(live.clone()) },
                    None => Mutation::SetAction { vertex: id, action: Action::Create, live: None },
                };
                out.push(m);
            }
            if status_updating && v.obj.kind() != ObjectKind::Workload && !v.immutable {
                out.push(Mutation::MarkImmutable(id));
            }
        }
        out
    }

    pub fn apply(&mut self, mutations: Vec<Mutation>) -> Result<()> {
        for m in mutations {
            match m {
                Mutation::SetAction { vertex, action, live } => {
                    let v = self.vertex_mut(vertex).ok_or_else(|| Error::Invariant(format!("unknown vertex {}", vertex.0)))?;
                    v.action = Some(action);
                    if live.is_some() { v.live = live; }
                }
                Mutation::MarkImmutable(id) => {
                    self.vertex_mut(id).ok_or_else(|| Error::Invariant(format!("unknown vertex {}", id.0)))?.immutable = true;
                }
                Mutation::MarkOrphan(id) => {
                    self.vertex_mut(id).ok_or_else(|| Error::Invariant(format!("unknown vertex {}", id.0)))?.orphan = true;
                }
            }
        }
        Ok(())
    }

    /// Resolve all undetermined actions and validate the result.
    pub fn resolve_actions(&mut self, snapshot: &Snapshot, status_updating: bool) -> Result<()> {
        let mutations = self.plan_resolution(snapshot, status_updating);
        debug!(vertices = self.len(), mutations = mutations.len(), status_updating, "resolving graph actions");
        self.apply(mutations)?;
        self.validate()
    }
}
