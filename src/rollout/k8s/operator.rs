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

//! Singleton objects that configure the rollout and expose its state.

use super::meta::ObjectMeta;
use super::store::Resource;
use crate::rollout::bundle::config::{ConfigOverrides, ObservedFacts};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name shared by every singleton object below.
pub const CLUSTER: &str = "cluster";

/// Operator-owned desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorSpec {
    pub metadata: ObjectMeta,
    pub spec: OperatorSpecFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpecFields {
    /// Any change to this string forces a new revision with otherwise
    /// identical content.
    #[serde(default)]
    pub force_redeployment_reason: String,
    #[serde(default)]
    pub overrides: ConfigOverrides,
}

impl Resource for OperatorSpec {
    const KIND: &'static str = "OperatorSpec";
    const PREFIX: &'static str = "/operatorspecs";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Facts reported by the cluster observers, e.g. the current etcd members.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub facts: ObservedFacts,
}

impl Resource for ObservedConfig {
    const KIND: &'static str = "ObservedConfig";
    const PREFIX: &'static str = "/observedconfigs";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Per-node bookkeeping of the rollout.
///
/// `target_revision == 0` means idle and `target_revision > current_revision`
/// means a transition is in flight. A failed attempt records the revision in
/// `last_failed_revision`, which blocks retries until a newer revision exists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRolloutRecord {
    pub node_name: String,
    #[serde(default)]
    pub current_revision: u64,
    #[serde(default)]
    pub target_revision: u64,
    #[serde(default)]
    pub last_failed_revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_failed_revision_errors: Vec<String>,
}

impl NodeRolloutRecord {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    pub fn is_transitioning(&self) -> bool {
        self.target_revision > self.current_revision
    }

    /// True when the node should be moved to `latest`: it is not there yet
    /// and has not already failed that exact revision.
    pub fn is_eligible(&self, latest: u64) -> bool {
        self.current_revision != latest && self.last_failed_revision != latest
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    #[default]
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(default)]
    pub latest_available_revision: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_available_revision_reason: String,
    #[serde(default)]
    pub node_statuses: Vec<NodeRolloutRecord>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RolloutStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn record(&self, node_name: &str) -> Option<&NodeRolloutRecord> {
        self.node_statuses.iter().find(|r| r.node_name == node_name)
    }

    /// Upserts a condition. The transition time only moves when the status
    /// flips. Returns `true` when anything changed.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let status = ConditionStatus::from(status);
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                self.conditions.push(Condition {
                    type_: type_.to_string(),
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: now,
                });
                true
            }
        }
    }
}

/// Rollout state published for operators and consumed by every controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperatorStatus {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: RolloutStatus,
}

impl Resource for OperatorStatus {
    const KIND: &'static str = "OperatorStatus";
    const PREFIX: &'static str = "/operatorstatuses";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
