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

use super::meta::{ObjectMeta, REVISION_LABEL};
use super::store::Resource;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const INSTALLER_APP_LABEL: &str = "app";
pub const INSTALLER_APP: &str = "installer";
pub const INSTALLER_NODE_LABEL: &str = "rollout.io/node";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstallerPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl InstallerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallerPhase::Pending => "Pending",
            InstallerPhase::Running => "Running",
            InstallerPhase::Succeeded => "Succeeded",
            InstallerPhase::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstallerPhase::Succeeded | InstallerPhase::Failed)
    }
}

impl fmt::Display for InstallerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an installer copies and where it puts it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallerSpec {
    pub node_name: String,
    pub revision: u64,
    pub pod_bundle_name: String,
    pub resource_dir: String,
    #[serde(default)]
    pub config_maps: Vec<String>,
    #[serde(default)]
    pub optional_config_maps: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub optional_secrets: Vec<String>,
    /// Configmap whose `pod.json` becomes the static pod manifest.
    pub pod_config_map: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallerStatus {
    #[serde(default)]
    pub phase: InstallerPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub termination_messages: Vec<String>,
}

/// Ephemeral per-(node, revision) installation task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallerPod {
    pub metadata: ObjectMeta,
    pub spec: InstallerSpec,
    #[serde(default)]
    pub status: InstallerStatus,
}

impl InstallerPod {
    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    pub fn revision(&self) -> u64 {
        self.spec.revision
    }

    pub fn phase(&self) -> InstallerPhase {
        self.status.phase
    }
}

impl Resource for InstallerPod {
    const KIND: &'static str = "InstallerPod";
    const PREFIX: &'static str = "/installerpods";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Static pod manifest the node agent starts the API server from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticPodManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StaticPodSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticPodSpec {
    #[serde(default)]
    pub host_network: bool,
    pub termination_grace_period_seconds: u64,
    pub containers: Vec<StaticContainer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticContainer {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl StaticPodManifest {
    pub fn revision(&self) -> Option<u64> {
        self.metadata.revision()
    }

    pub fn stamp_revision(&mut self, revision: u64) {
        self.metadata
            .labels
            .insert(REVISION_LABEL.to_string(), revision.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_serialize_capitalized() {
        let status = InstallerStatus {
            phase: InstallerPhase::Succeeded,
            ..InstallerStatus::default()
        };
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["phase"], "Succeeded");
        assert!(InstallerPhase::Failed.is_terminal());
        assert!(!InstallerPhase::Running.is_terminal());
    }

    #[test]
    fn manifest_revision_comes_from_label() {
        let mut manifest = StaticPodManifest::default();
        assert_eq!(manifest.revision(), None);
        manifest.stamp_revision(9);
        assert_eq!(manifest.revision(), Some(9));
    }
}
