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

use super::meta::ObjectMeta;
use super::store::Resource;

use serde::{Deserialize, Serialize};

pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeStatus {
    #[serde(default)]
    pub ready: bool,
    /// Revision of the API server instance the node reports as running. This
    /// is the ground truth reported from the node, independent of the rollout
    /// bookkeeping.
    #[serde(rename = "runningRevision", skip_serializing_if = "Option::is_none")]
    pub running_revision: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn control_plane(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name).with_label(CONTROL_PLANE_LABEL, ""),
            status: NodeStatus {
                ready: true,
                running_revision: None,
            },
        }
    }

    pub fn is_control_plane(&self) -> bool {
        self.metadata.labels.contains_key(CONTROL_PLANE_LABEL)
    }
}

impl Resource for Node {
    const KIND: &'static str = "Node";
    const PREFIX: &'static str = "/nodes";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
