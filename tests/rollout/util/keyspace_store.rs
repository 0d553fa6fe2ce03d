use controlplane_rollout::rollout::k8s::meta::ObjectMeta;
use controlplane_rollout::rollout::k8s::{Client, ConfigMap, KeyspaceStore, StoreError};
use controlplane_rollout::rollout::util::{Keyspace, KeyspaceEventType};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn open(dir: &TempDir) -> Client {
    let store = KeyspaceStore::open(dir.path().join("keyspace"), dir.path().join("keyspace.lock"))
        .expect("open store");
    Client::new(Arc::new(store))
}

#[test]
fn objects_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let client = open(&dir);
        client
            .create(&ConfigMap::new(ObjectMeta::named("config")).with_data("config.json", "{}"))
            .expect("create");
    }
    let client = open(&dir);
    let stored = client
        .get::<ConfigMap>("config")
        .expect("get")
        .expect("persisted");
    assert_eq!(stored.data.get("config.json").map(String::as_str), Some("{}"));
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("1"));
}

#[test]
fn concurrent_writers_never_lose_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = open(&dir);
    client
        .create(&ConfigMap::new(ObjectMeta::named("counter")).with_data("value", "0"))
        .expect("create");

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let client = open(&dir);
            thread::spawn(move || {
                for _ in 0..10 {
                    loop {
                        let mut map = client
                            .get::<ConfigMap>("counter")
                            .expect("get")
                            .expect("counter");
                        let value: u64 = map.data["value"].parse().expect("number");
                        map.data.insert("value".to_string(), (value + 1).to_string());
                        match client.update(&map) {
                            Ok(_) => break,
                            Err(StoreError::Conflict { .. }) => continue,
                            Err(err) => panic!("unexpected error: {}", err),
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let map = client
        .get::<ConfigMap>("counter")
        .expect("get")
        .expect("counter");
    assert_eq!(map.data["value"], "40");
    assert_eq!(map.metadata.resource_version.as_deref(), Some("41"));
}

#[test]
fn subscribers_see_changes_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let keyspace = Keyspace::open(dir.path(), "objects").expect("keyspace");
    let mut events = keyspace.subscribe();

    keyspace.put("/nodes/master-0", "{}").expect("put");
    keyspace.put("/nodes/master-0", "{\"a\":1}").expect("put");
    assert!(keyspace.delete("/nodes/master-0").expect("delete"));
    assert!(!keyspace.delete("/nodes/master-0").expect("delete"));

    let kinds: Vec<KeyspaceEventType> = (0..3)
        .map(|_| events.try_recv().expect("event").event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            KeyspaceEventType::Added,
            KeyspaceEventType::Modified,
            KeyspaceEventType::Deleted
        ]
    );
    assert!(events.try_recv().is_err());
}

#[test]
fn invalid_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = open(&dir);
    let err = client
        .create(&ConfigMap::new(ObjectMeta::named("../escape")))
        .expect_err("invalid name");
    assert!(matches!(err, StoreError::InvalidKey(_)));
}
