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

//! Removes revisions that fell out of the retained history: their revisioned
//! objects, finished installers and unpacked bundles under the resource root.

use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::installer::InstallerError;
use crate::rollout::controller::reconcile::{ReconcileData, Reconciler};
use crate::rollout::controller::status::read_status;
use crate::rollout::k8s::configmap::ConfigMap;
use crate::rollout::k8s::operator::{NodeRolloutRecord, OperatorStatus};
use crate::rollout::k8s::pod::InstallerPod;
use crate::rollout::k8s::secret::Secret;
use crate::rollout::k8s::store::{Client, Resource};
use crate::rollout::logger::{log_debug, log_info, log_warn};

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "revision-pruner";
pub const WATCHED_PREFIXES: &[&str] = &[OperatorStatus::PREFIX];

/// Revisions that must be kept: the latest `limit` revisions, plus every
/// revision a node is at or moving to.
pub fn protected_revisions(latest: u64, limit: u64, records: &[NodeRolloutRecord]) -> BTreeSet<u64> {
    let limit = limit.max(1);
    let mut keep: BTreeSet<u64> = (latest.saturating_sub(limit - 1).max(1)..=latest).collect();
    for record in records {
        keep.insert(record.current_revision);
        keep.insert(record.target_revision);
    }
    keep.remove(&0);
    keep
}

#[derive(Debug, Clone, Default)]
pub struct RevisionInventory {
    pub config_maps: Vec<(String, u64)>,
    pub secrets: Vec<(String, u64)>,
    /// Finished installers only; running ones are never pruned.
    pub installers: Vec<(String, u64)>,
    pub bundle_dirs: Vec<(PathBuf, u64)>,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub latest: u64,
    pub protected: BTreeSet<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    pub config_maps: Vec<String>,
    pub secrets: Vec<String>,
    pub installers: Vec<String>,
    pub bundle_dirs: Vec<PathBuf>,
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.config_maps.is_empty()
            && self.secrets.is_empty()
            && self.installers.is_empty()
            && self.bundle_dirs.is_empty()
    }
}

pub struct RevisionPruner {
    limit: u64,
    resource_root: PathBuf,
    pod_bundle_name: String,
}

impl RevisionPruner {
    pub fn new(limit: u64, resource_root: impl Into<PathBuf>, pod_bundle_name: impl Into<String>) -> Self {
        Self {
            limit,
            resource_root: resource_root.into(),
            pod_bundle_name: pod_bundle_name.into(),
        }
    }

    /// `<bundle>-<revision>` directories under the resource root.
    fn bundle_dirs(&self) -> Result<Vec<(PathBuf, u64)>, RolloutError> {
        let entries = match fs::read_dir(&self.resource_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(dir_error(&self.resource_root, err)),
        };
        let prefix = format!("{}-", self.pod_bundle_name);
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| dir_error(&self.resource_root, err))?;
            let name = entry.file_name();
            let Some(revision) = name
                .to_str()
                .and_then(|name| name.strip_prefix(&prefix))
                .and_then(|suffix| suffix.parse::<u64>().ok())
            else {
                continue;
            };
            if entry.path().is_dir() {
                dirs.push((entry.path(), revision));
            }
        }
        Ok(dirs)
    }
}

fn dir_error(path: &Path, source: io::Error) -> RolloutError {
    InstallerError::Io {
        path: path.to_path_buf(),
        source,
    }
    .into()
}

fn revisioned<R: Resource>(objects: Vec<R>) -> Vec<(String, u64)> {
    objects
        .into_iter()
        .filter_map(|object| {
            let revision = object.metadata().revision()?;
            Some((object.name().to_string(), revision))
        })
        .collect()
}

fn prunable<T: Clone>(items: &[(T, u64)], policy: &RetentionPolicy) -> Vec<T> {
    items
        .iter()
        .filter(|(_, revision)| *revision < policy.latest && !policy.protected.contains(revision))
        .map(|(item, _)| item.clone())
        .collect()
}

impl Reconciler for RevisionPruner {
    type Desired = RetentionPolicy;
    type Observed = RevisionInventory;
    type Plan = PrunePlan;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        COMPONENT
    }

    fn fetch(
        &self,
        client: &Client,
    ) -> Result<Option<ReconcileData<RetentionPolicy, RevisionInventory>>, RolloutError> {
        let status = read_status(client)?;
        if status.latest_available_revision == 0 {
            return Ok(None);
        }
        let installers = client
            .list::<InstallerPod>()?
            .into_iter()
            .filter(|pod| pod.phase().is_terminal())
            .map(|pod| (pod.metadata.name.clone(), pod.revision()))
            .collect();
        Ok(Some(ReconcileData {
            desired: RetentionPolicy {
                latest: status.latest_available_revision,
                protected: protected_revisions(
                    status.latest_available_revision,
                    self.limit,
                    &status.node_statuses,
                ),
            },
            observed: RevisionInventory {
                config_maps: revisioned(client.list::<ConfigMap>()?),
                secrets: revisioned(client.list::<Secret>()?),
                installers,
                bundle_dirs: self.bundle_dirs()?,
            },
        }))
    }

    fn diff(
        &self,
        desired: &RetentionPolicy,
        observed: &RevisionInventory,
    ) -> Result<PrunePlan, RolloutError> {
        Ok(PrunePlan {
            config_maps: prunable(&observed.config_maps, desired),
            secrets: prunable(&observed.secrets, desired),
            installers: prunable(&observed.installers, desired),
            bundle_dirs: prunable(&observed.bundle_dirs, desired),
        })
    }

    fn apply(&self, client: &Client, plan: PrunePlan) -> Result<(), RolloutError> {
        if plan.is_empty() {
            log_debug(COMPONENT, "Nothing to prune", &[]);
            return Ok(());
        }
        for name in &plan.config_maps {
            client.delete::<ConfigMap>(name)?;
        }
        for name in &plan.secrets {
            client.delete::<Secret>(name)?;
        }
        for name in &plan.installers {
            client.delete::<InstallerPod>(name)?;
        }
        for dir in &plan.bundle_dirs {
            if let Err(err) = fs::remove_dir_all(dir) {
                let dir = dir.display().to_string();
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to remove bundle directory",
                    &[("dir", &dir), ("error", &error)],
                );
            }
        }
        let objects = (plan.config_maps.len() + plan.secrets.len()).to_string();
        let installers = plan.installers.len().to_string();
        let dirs = plan.bundle_dirs.len().to_string();
        log_info(
            COMPONENT,
            "Pruned old revisions",
            &[
                ("objects", &objects),
                ("installers", &installers),
                ("bundle_dirs", &dirs),
            ],
        );
        Ok(())
    }
}
