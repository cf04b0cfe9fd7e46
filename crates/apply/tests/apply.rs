#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::ConfigMap;
use tessera_apply::{apply_graph, Outcome};
use tessera_core::{labels, ManagedObject, ObjectKey, ObjectKind};
use tessera_graph::{Action, ResourceGraph};
use tessera_store::{MemStore, StoreOp};

fn cm(name: &str, value: &str) -> ManagedObject {
    let mut c = ConfigMap::default();
    c.metadata.name = Some(name.into());
    c.metadata.namespace = Some("default".into());
    c.metadata.labels = Some(labels::instance("mycluster"));
    c.data = Some([("k".to_string(), value.to_string())].into_iter().collect());
    c.into()
}

fn key(name: &str) -> ObjectKey { ObjectKey::new(ObjectKind::ConfigMap, "default", name) }

#[tokio::test]
async fn executes_each_action_in_order() {
    let store = MemStore::new();
    let same = store.insert(cm("same", "1"));
    let changed = store.insert(cm("changed", "1"));
    let frozen = store.insert(cm("frozen", "1"));
    store.insert(cm("gone", "1"));
    store.insert(cm("exists", "1"));
    store.clear_ops();

    let mut g = ResourceGraph::new();
    let root = g.add_vertex(Some(cm("new", "1")), Some(Action::Create), None).unwrap();
    let v = g.add_vertex(Some(cm("same", "1")), Some(Action::Update), Some(root)).unwrap();
    g.vertex_mut(v).unwrap().live = Some(same);
    let v = g.add_vertex(Some(cm("changed", "2")), Some(Action::Update), Some(root)).unwrap();
    g.vertex_mut(v).unwrap().live = Some(changed);
    let v = g.add_vertex(Some(cm("frozen", "2")), Some(Action::Update), None).unwrap();
    {
        let vx = g.vertex_mut(v).unwrap();
        vx.live = Some(frozen);
        vx.immutable = true;
    }
    let v = g.add_vertex(Some(cm("gone", "1")), Some(Action::Delete), None).unwrap();
    g.vertex_mut(v).unwrap().orphan = true;
    g.add_vertex(Some(cm("exists", "1")), Some(Action::Create), None).unwrap();
    g.add_vertex(Some(cm("tracked", "1")), Some(Action::Noop), None).unwrap();

    let report = apply_graph(&store, &g).await.unwrap();
    let outcomes: Vec<(String, Outcome)> = report.applied.iter().map(|a| (a.key.name.clone(), a.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            ("new".to_string(), Outcome::Created),
            ("same".to_string(), Outcome::Unchanged),
            ("changed".to_string(), Outcome::Updated),
            ("frozen".to_string(), Outcome::SkippedImmutable),
            ("gone".to_string(), Outcome::Deleted),
            ("exists".to_string(), Outcome::Existed),
            ("tracked".to_string(), Outcome::Skipped),
        ]
    );
    assert_eq!((report.created, report.updated, report.deleted, report.skipped), (1, 1, 1, 4));
    assert_eq!(
        store.ops(),
        vec![StoreOp::Create(key("new")), StoreOp::Update(key("changed")), StoreOp::Delete(key("gone"))]
    );
    let ManagedObject::ConfigMap(c) = store.object(&key("changed")).unwrap() else { panic!("expected a config map") };
    assert_eq!(c.data.unwrap().get("k").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn stale_live_copy_is_a_conflict() {
    let store = MemStore::new();
    let live = store.insert(cm("a", "1"));
    store.modify(&key("a"), |_| {});

    let mut g = ResourceGraph::new();
    let v = g.add_vertex(Some(cm("a", "2")), Some(Action::Update), None).unwrap();
    g.vertex_mut(v).unwrap().live = Some(live);
    let err = apply_graph(&store, &g).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn unresolved_vertex_is_an_invariant_error() {
    let store = MemStore::new();
    let mut g = ResourceGraph::new();
    g.add_vertex(Some(cm("a", "1")), None, None).unwrap();
    assert!(apply_graph(&store, &g).await.unwrap_err().is_invariant());
    assert!(store.ops().is_empty());
}
