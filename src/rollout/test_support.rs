/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

#![allow(dead_code)]

//! Shared fixtures for unit and scenario tests.

use crate::rollout::bundle::assets::DefaultAssets;
use crate::rollout::bundle::config::ObservedFacts;
use crate::rollout::bundle::synthesize;
use crate::rollout::controller::installer::installer_pod_name;
use crate::rollout::controller::status::{read_status, update_status};
use crate::rollout::k8s::configmap::ConfigMap;
use crate::rollout::k8s::meta::{revisioned_name, ObjectMeta, REVISION_LABEL};
use crate::rollout::k8s::node::Node;
use crate::rollout::k8s::operator::{NodeRolloutRecord, OperatorSpecFields, RolloutStatus};
use crate::rollout::k8s::pod::{InstallerPhase, InstallerPod};
use crate::rollout::k8s::secret::Secret;
use crate::rollout::k8s::store::{
    Client, KeyspaceStore, ObjectStore, StoreError, StoreEvent,
};

use chrono::Utc;
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

pub const ETCD_CLIENT_SECRET: &str = "etcd-client";

/// Sets or clears environment variables for the lifetime of the guard and
/// restores the previous values on drop. Callers serialize with
/// `#[serial]`.
pub struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    pub fn set(vars: &[(&str, &str)]) -> Self {
        let guard = Self::save(vars.iter().map(|(key, _)| *key));
        for (key, value) in vars {
            env::set_var(key, value);
        }
        guard
    }

    pub fn clear(vars: &[&str]) -> Self {
        let guard = Self::save(vars.iter().copied());
        for key in vars {
            env::remove_var(key);
        }
        guard
    }

    fn save<'a>(keys: impl Iterator<Item = &'a str>) -> Self {
        Self {
            saved: keys
                .map(|key| (key.to_string(), env::var(key).ok()))
                .collect(),
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..) {
            match value {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreOp {
    Get,
    List,
    Create,
    Update,
    Delete,
}

struct Fault {
    op: StoreOp,
    key_prefix: String,
    remaining: usize,
    error: fn() -> StoreError,
}

/// Wraps a store and fails selected operations a fixed number of times.
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
        }
    }

    fn faults(&self) -> MutexGuard<'_, Vec<Fault>> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails the next `times` calls of `op` on keys starting with
    /// `key_prefix`.
    pub fn fail(&self, op: StoreOp, key_prefix: &str, times: usize, error: fn() -> StoreError) {
        self.faults().push(Fault {
            op,
            key_prefix: key_prefix.to_string(),
            remaining: times,
            error,
        });
    }

    pub fn clear(&self) {
        self.faults().clear();
    }

    fn check(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        let mut faults = self.faults();
        let hit = faults
            .iter_mut()
            .find(|fault| fault.op == op && fault.remaining > 0 && key.starts_with(&fault.key_prefix));
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err((fault.error)())
            }
            None => Ok(()),
        }
    }
}

impl ObjectStore for FaultyStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.check(StoreOp::Get, key)?;
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<Value>, StoreError> {
        self.check(StoreOp::List, prefix)?;
        self.inner.list(prefix)
    }

    fn create(&self, key: &str, object: Value) -> Result<Value, StoreError> {
        self.check(StoreOp::Create, key)?;
        self.inner.create(key, object)
    }

    fn update(&self, key: &str, object: Value) -> Result<Value, StoreError> {
        self.check(StoreOp::Update, key)?;
        self.inner.update(key, object)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(StoreOp::Delete, key)?;
        self.inner.delete(key)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}

/// Keyspace-backed store in a temporary directory, wrapped for fault
/// injection.
pub struct TestStore {
    dir: tempfile::TempDir,
    faults: Arc<FaultyStore>,
    client: Client,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyspaceStore::open(dir.path().join("keyspace"), dir.path().join("keyspace.lock"))
            .expect("open keyspace store");
        let faults = Arc::new(FaultyStore::new(Arc::new(store)));
        let client = Client::new(faults.clone());
        Self {
            dir,
            faults,
            client,
        }
    }

    /// Opens a second store over the same directory, as a restarted process
    /// would.
    pub fn reopen(&self) -> Client {
        let store = KeyspaceStore::open(
            self.dir.path().join("keyspace"),
            self.dir.path().join("keyspace.lock"),
        )
        .expect("reopen keyspace store");
        Client::new(Arc::new(store))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn faults(&self) -> &FaultyStore {
        &self.faults
    }

    pub fn resource_root(&self) -> PathBuf {
        self.dir.path().join("resources")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.dir.path().join("manifests")
    }
}

impl Default for TestStore {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_assets() -> DefaultAssets {
    DefaultAssets::new(Duration::from_secs(135))
}

pub fn test_observed() -> ObservedFacts {
    ObservedFacts {
        etcd_servers: Some(vec!["https://10.0.0.1:2379".to_string()]),
        ..ObservedFacts::default()
    }
}

fn source_objects(force_redeployment_reason: &str) -> (Vec<ConfigMap>, Secret) {
    let spec = OperatorSpecFields {
        force_redeployment_reason: force_redeployment_reason.to_string(),
        ..OperatorSpecFields::default()
    };
    let bundle = synthesize(&test_assets(), &spec, &test_observed(), None).expect("synthesize");
    let secret = Secret::new(ObjectMeta::named(ETCD_CLIENT_SECRET))
        .with_entry("tls.crt", b"certificate")
        .with_entry("tls.key", b"private key");
    (bundle.config_maps(), secret)
}

/// Publishes the unsuffixed source objects a revision is cut from.
pub fn seed_sources(client: &Client) {
    seed_sources_with_reason(client, "");
}

pub fn seed_sources_with_reason(client: &Client, force_redeployment_reason: &str) {
    let (maps, secret) = source_objects(force_redeployment_reason);
    for map in &maps {
        client.apply(map).expect("apply source configmap");
    }
    client.apply(&secret).expect("apply source secret");
}

/// Writes the sources together with their `-<revision>` copies, without
/// touching the latest revision counter.
pub fn seed_revision(client: &Client, revision: u64) {
    let (maps, secret) = source_objects("");
    for map in maps {
        client.apply(&map).expect("apply source configmap");
        let mut copy = map.clone();
        copy.metadata = ObjectMeta::named(revisioned_name(&map.metadata.name, revision))
            .with_label(REVISION_LABEL, revision.to_string());
        client.apply(&copy).expect("apply revision configmap");
    }
    client.apply(&secret).expect("apply source secret");
    let mut copy = secret.clone();
    copy.metadata = ObjectMeta::named(revisioned_name(ETCD_CLIENT_SECRET, revision))
        .with_label(REVISION_LABEL, revision.to_string());
    client.apply(&copy).expect("apply revision secret");
}

pub fn add_control_plane_node(client: &Client, name: &str) {
    client
        .create(&Node::control_plane(name))
        .expect("create node");
}

pub fn set_running_revision(client: &Client, name: &str, revision: u64) {
    let mut node = client.get::<Node>(name).expect("get node").expect("node exists");
    node.status.running_revision = Some(revision);
    client.update(&node).expect("update node");
}

/// Overwrites the latest revision and the node records.
pub fn set_fleet(client: &Client, latest: u64, records: Vec<NodeRolloutRecord>) {
    update_status(client, |status| {
        status.latest_available_revision = latest;
        status.node_statuses = records.clone();
        true
    })
    .expect("write fleet status");
}

pub fn fleet(client: &Client) -> RolloutStatus {
    read_status(client).expect("read status")
}

pub fn record(client: &Client, node: &str) -> NodeRolloutRecord {
    fleet(client)
        .record(node)
        .cloned()
        .unwrap_or_else(|| panic!("no record for {}", node))
}

pub fn installer(client: &Client, node: &str, revision: u64) -> Option<InstallerPod> {
    client
        .get::<InstallerPod>(&installer_pod_name(node, revision))
        .expect("get installer")
}

/// Marks an installer terminal, as the executor would.
pub fn finish_installer(
    client: &Client,
    node: &str,
    revision: u64,
    phase: InstallerPhase,
    messages: &[&str],
) {
    let mut pod = installer(client, node, revision)
        .unwrap_or_else(|| panic!("no installer for {} at {}", node, revision));
    pod.status.phase = phase;
    pod.status.completion_time = Some(Utc::now());
    pod.status.termination_messages = messages.iter().map(|m| m.to_string()).collect();
    client.update(&pod).expect("update installer");
}
