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

//! Installer tasks: how they are named and built, and the local executor that
//! lays a revision's bundle out on disk and swaps in the new pod manifest.

use crate::rollout::bundle::{POD_CONFIG_MAP, POD_KEY};
use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::reconcile::{ReconcileData, Reconciler};
use crate::rollout::controller::revision::{TrackedKind, TrackedObject, TRACKED_OBJECTS};
use crate::rollout::k8s::configmap::ConfigMap;
use crate::rollout::k8s::meta::{revisioned_name, ObjectMeta, REVISION_LABEL};
use crate::rollout::k8s::node::Node;
use crate::rollout::k8s::pod::{
    InstallerPhase, InstallerPod, InstallerSpec, InstallerStatus, StaticPodManifest,
    INSTALLER_APP, INSTALLER_APP_LABEL, INSTALLER_NODE_LABEL,
};
use crate::rollout::k8s::secret::Secret;
use crate::rollout::k8s::store::{Client, Resource, StoreError};
use crate::rollout::logger::{log_info, log_warn};

use chrono::Utc;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "installer";
const REPORTER_COMPONENT: &str = "revision-reporter";
pub const WATCHED_PREFIXES: &[&str] = &[InstallerPod::PREFIX];
pub const REPORTER_WATCHED_PREFIXES: &[&str] = &[InstallerPod::PREFIX, Node::PREFIX];

/// Deterministic task name, so creating the same task twice collapses.
pub fn installer_pod_name(node_name: &str, revision: u64) -> String {
    format!("installer-{}-{}", revision, node_name)
}

/// `<resource-root>/<pod-bundle-name>-<revision>`
pub fn revision_dir(resource_root: &Path, pod_bundle_name: &str, revision: u64) -> PathBuf {
    resource_root.join(revisioned_name(pod_bundle_name, revision))
}

/// Manifest file the node agent watches.
pub fn manifest_path(manifest_dir: &Path, pod_bundle_name: &str) -> PathBuf {
    manifest_dir.join(format!("{}.json", pod_bundle_name))
}

/// Static inputs shared by every installer task.
#[derive(Debug, Clone)]
pub struct InstallerTemplate {
    pub pod_bundle_name: String,
    pub resource_root: PathBuf,
    pub tracked: &'static [TrackedObject],
}

impl InstallerTemplate {
    pub fn new(pod_bundle_name: impl Into<String>, resource_root: impl Into<PathBuf>) -> Self {
        Self {
            pod_bundle_name: pod_bundle_name.into(),
            resource_root: resource_root.into(),
            tracked: TRACKED_OBJECTS,
        }
    }

    pub fn build(&self, node_name: &str, revision: u64) -> InstallerPod {
        let names = |kind: TrackedKind, optional: bool| -> Vec<String> {
            self.tracked
                .iter()
                .filter(|object| object.kind == kind && object.optional == optional)
                .map(|object| object.name.to_string())
                .collect()
        };

        InstallerPod {
            metadata: ObjectMeta::named(installer_pod_name(node_name, revision))
                .with_label(INSTALLER_APP_LABEL, INSTALLER_APP)
                .with_label(INSTALLER_NODE_LABEL, node_name)
                .with_label(REVISION_LABEL, revision.to_string()),
            spec: InstallerSpec {
                node_name: node_name.to_string(),
                revision,
                pod_bundle_name: self.pod_bundle_name.clone(),
                resource_dir: self.resource_root.to_string_lossy().into_owned(),
                config_maps: names(TrackedKind::ConfigMap, false),
                optional_config_maps: names(TrackedKind::ConfigMap, true),
                secrets: names(TrackedKind::Secret, false),
                optional_secrets: names(TrackedKind::Secret, true),
                pod_config_map: POD_CONFIG_MAP.to_string(),
            },
            status: InstallerStatus::default(),
        }
    }
}

#[derive(Debug)]
pub enum InstallerError {
    Store(StoreError),
    MissingObject { kind: &'static str, name: String },
    InvalidEntry { object: String, key: String },
    Manifest(String),
    Io { path: PathBuf, source: io::Error },
}

impl Display for InstallerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallerError::Store(err) => write!(f, "{}", err),
            InstallerError::MissingObject { kind, name } => {
                write!(f, "{} {} does not exist", kind, name)
            }
            InstallerError::InvalidEntry { object, key } => {
                write!(f, "{} has key '{}' that is not a valid file name", object, key)
            }
            InstallerError::Manifest(msg) => write!(f, "invalid pod manifest: {}", msg),
            InstallerError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
        }
    }
}

impl Error for InstallerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InstallerError::Store(err) => Some(err),
            InstallerError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<StoreError> for InstallerError {
    fn from(err: StoreError) -> Self {
        InstallerError::Store(err)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> InstallerError + '_ {
    move |source| InstallerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_entries(
    dir: &Path,
    object: &str,
    entries: &BTreeMap<String, Vec<u8>>,
    mode: u32,
) -> Result<(), InstallerError> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    for (key, value) in entries {
        if key.is_empty() || key == "." || key == ".." || key.contains('/') {
            return Err(InstallerError::InvalidEntry {
                object: object.to_string(),
                key: key.clone(),
            });
        }
        let path = dir.join(key);
        fs::write(&path, value).map_err(io_error(&path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(io_error(&path))?;
    }
    Ok(())
}

fn copy_config_maps(
    client: &Client,
    staging: &Path,
    names: &[String],
    optional: bool,
    revision: u64,
) -> Result<(), InstallerError> {
    for name in names {
        let revisioned = revisioned_name(name, revision);
        match client.get::<ConfigMap>(&revisioned)? {
            Some(map) => write_entries(
                &staging.join("configmaps").join(name),
                &revisioned,
                &map.entries(),
                0o644,
            )?,
            None if optional => {}
            None => {
                return Err(InstallerError::MissingObject {
                    kind: "configmap",
                    name: revisioned,
                })
            }
        }
    }
    Ok(())
}

fn copy_secrets(
    client: &Client,
    staging: &Path,
    names: &[String],
    optional: bool,
    revision: u64,
) -> Result<(), InstallerError> {
    for name in names {
        let revisioned = revisioned_name(name, revision);
        match client.get::<Secret>(&revisioned)? {
            Some(secret) => write_entries(
                &staging.join("secrets").join(name),
                &revisioned,
                &secret.entries(),
                0o600,
            )?,
            None if optional => {}
            None => {
                return Err(InstallerError::MissingObject {
                    kind: "secret",
                    name: revisioned,
                })
            }
        }
    }
    Ok(())
}

fn load_manifest(client: &Client, spec: &InstallerSpec) -> Result<StaticPodManifest, InstallerError> {
    let name = revisioned_name(&spec.pod_config_map, spec.revision);
    let map = client
        .get::<ConfigMap>(&name)?
        .ok_or_else(|| InstallerError::MissingObject {
            kind: "configmap",
            name: name.clone(),
        })?;
    let raw = map
        .entries()
        .remove(POD_KEY)
        .ok_or_else(|| InstallerError::Manifest(format!("{} has no {} key", name, POD_KEY)))?;
    let mut manifest: StaticPodManifest = serde_json::from_slice(&raw)
        .map_err(|err| InstallerError::Manifest(format!("{}: {}", name, err)))?;
    manifest.stamp_revision(spec.revision);
    Ok(manifest)
}

fn write_manifest(path: &Path, manifest: &StaticPodManifest) -> Result<(), InstallerError> {
    let dir = path
        .parent()
        .ok_or_else(|| InstallerError::Manifest(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    let payload = serde_json::to_vec_pretty(manifest)
        .map_err(|err| InstallerError::Manifest(err.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    tmp.write_all(&payload).map_err(io_error(path))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path)
        .map_err(|err| io_error(path)(err.error))?;
    Ok(())
}

/// Lays out the task's revision under its resource directory and replaces the
/// pod manifest in `manifest_dir`. The bundle is assembled in a staging
/// directory and renamed into place, so a partially copied revision is never
/// visible. Returns the revision directory.
pub fn run_installer(
    client: &Client,
    pod: &InstallerPod,
    manifest_dir: &Path,
) -> Result<PathBuf, InstallerError> {
    let spec = &pod.spec;
    let resource_root = Path::new(&spec.resource_dir);
    fs::create_dir_all(resource_root).map_err(io_error(resource_root))?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(resource_root)
        .map_err(io_error(resource_root))?;

    copy_config_maps(client, staging.path(), &spec.config_maps, false, spec.revision)?;
    copy_config_maps(
        client,
        staging.path(),
        &spec.optional_config_maps,
        true,
        spec.revision,
    )?;
    copy_secrets(client, staging.path(), &spec.secrets, false, spec.revision)?;
    copy_secrets(
        client,
        staging.path(),
        &spec.optional_secrets,
        true,
        spec.revision,
    )?;
    let manifest = load_manifest(client, spec)?;

    let destination = revision_dir(resource_root, &spec.pod_bundle_name, spec.revision);
    if destination.exists() {
        fs::remove_dir_all(&destination).map_err(io_error(&destination))?;
    }
    fs::rename(staging.path(), &destination).map_err(io_error(&destination))?;

    write_manifest(&manifest_path(manifest_dir, &spec.pod_bundle_name), &manifest)?;
    Ok(destination)
}

/// Runs pending installer tasks on this host.
pub struct InstallerExecutor {
    manifest_dir: PathBuf,
    /// Only tasks for this node are executed when set.
    node_name: Option<String>,
}

impl InstallerExecutor {
    pub fn new(manifest_dir: impl Into<PathBuf>, node_name: Option<String>) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            node_name,
        }
    }

    fn handles(&self, pod: &InstallerPod) -> bool {
        !pod.phase().is_terminal()
            && self
                .node_name
                .as_deref()
                .map(|node| node == pod.node_name())
                .unwrap_or(true)
    }

    fn execute(&self, client: &Client, mut pod: InstallerPod) -> Result<(), RolloutError> {
        let name = pod.metadata.name.clone();
        let revision = pod.revision().to_string();
        if pod.phase() == InstallerPhase::Pending {
            pod.status.phase = InstallerPhase::Running;
            pod.status.start_time = Some(Utc::now());
            pod = client.update(&pod)?;
        }

        match run_installer(client, &pod, &self.manifest_dir) {
            Ok(dir) => {
                pod.status.phase = InstallerPhase::Succeeded;
                pod.status.termination_messages.clear();
                let dir = dir.display().to_string();
                log_info(
                    COMPONENT,
                    "Installed revision",
                    &[
                        ("pod", &name),
                        ("node", pod.node_name()),
                        ("revision", &revision),
                        ("dir", &dir),
                    ],
                );
            }
            // The task stays Running and is picked up again on the next pass.
            Err(InstallerError::Store(err)) if err.is_transient() => {
                return Err(InstallerError::Store(err).into());
            }
            Err(err) => {
                let message = err.to_string();
                log_warn(
                    COMPONENT,
                    "Installer failed",
                    &[
                        ("pod", &name),
                        ("node", pod.node_name()),
                        ("revision", &revision),
                        ("error", &message),
                    ],
                );
                pod.status.phase = InstallerPhase::Failed;
                pod.status.termination_messages = vec![message];
            }
        }
        pod.status.completion_time = Some(Utc::now());
        client.update(&pod)?;
        Ok(())
    }
}

impl Reconciler for InstallerExecutor {
    type Desired = Vec<InstallerPod>;
    type Observed = ();
    type Plan = Vec<InstallerPod>;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        COMPONENT
    }

    fn fetch(&self, client: &Client) -> Result<Option<ReconcileData<Vec<InstallerPod>, ()>>, RolloutError> {
        let mut pending: Vec<InstallerPod> = client
            .list::<InstallerPod>()?
            .into_iter()
            .filter(|pod| self.handles(pod))
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }
        pending.sort_by_key(|pod| pod.revision());
        Ok(Some(ReconcileData {
            desired: pending,
            observed: (),
        }))
    }

    fn diff(&self, desired: &Vec<InstallerPod>, _: &()) -> Result<Vec<InstallerPod>, RolloutError> {
        Ok(desired.clone())
    }

    fn apply(&self, client: &Client, plan: Vec<InstallerPod>) -> Result<(), RolloutError> {
        for pod in plan {
            self.execute(client, pod)?;
        }
        Ok(())
    }
}

/// Reads the revision of the installed pod manifest and reports it on the
/// node object, standing in for the node agent's own status updates.
pub struct RunningRevisionReporter {
    manifest_dir: PathBuf,
    pod_bundle_name: String,
    node_name: String,
}

impl RunningRevisionReporter {
    pub fn new(
        manifest_dir: impl Into<PathBuf>,
        pod_bundle_name: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            pod_bundle_name: pod_bundle_name.into(),
            node_name: node_name.into(),
        }
    }

    fn installed_revision(&self) -> Result<Option<u64>, InstallerError> {
        let path = manifest_path(&self.manifest_dir, &self.pod_bundle_name);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path)(err)),
        };
        let manifest: StaticPodManifest = serde_json::from_slice(&raw)
            .map_err(|err| InstallerError::Manifest(format!("{}: {}", path.display(), err)))?;
        Ok(manifest.revision())
    }
}

impl Reconciler for RunningRevisionReporter {
    type Desired = u64;
    type Observed = Node;
    type Plan = Option<Node>;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        REPORTER_COMPONENT
    }

    fn fetch(&self, client: &Client) -> Result<Option<ReconcileData<u64, Node>>, RolloutError> {
        let Some(revision) = self.installed_revision()? else {
            return Ok(None);
        };
        Ok(client
            .get::<Node>(&self.node_name)?
            .map(|node| ReconcileData {
                desired: revision,
                observed: node,
            }))
    }

    fn diff(&self, desired: &u64, observed: &Node) -> Result<Option<Node>, RolloutError> {
        if observed.status.running_revision == Some(*desired) {
            return Ok(None);
        }
        let mut node = observed.clone();
        node.status.running_revision = Some(*desired);
        Ok(Some(node))
    }

    fn apply(&self, client: &Client, plan: Option<Node>) -> Result<(), RolloutError> {
        if let Some(node) = plan {
            client.update(&node)?;
            let revision = node
                .status
                .running_revision
                .map(|r| r.to_string())
                .unwrap_or_default();
            log_info(
                REPORTER_COMPONENT,
                "Node reports new running revision",
                &[("node", &node.metadata.name), ("revision", &revision)],
            );
        }
        Ok(())
    }
}
