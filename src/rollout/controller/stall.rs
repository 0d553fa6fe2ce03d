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

//! Cross-checks finished installers against the revision each node reports
//! as running. Only raises or clears `RolloutDegraded`; never retries or
//! rolls back.

use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::reconcile::{ReconcileData, Reconciler};
use crate::rollout::controller::status::{
    set_condition, update_status, ConditionReason, ConditionType,
};
use crate::rollout::k8s::node::Node;
use crate::rollout::k8s::pod::{InstallerPhase, InstallerPod};
use crate::rollout::k8s::store::{Client, Resource};
use crate::rollout::logger::{log_info, log_warn};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

const COMPONENT: &str = "stall-detector";
pub const WATCHED_PREFIXES: &[&str] = &[InstallerPod::PREFIX, Node::PREFIX];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledNode {
    pub node: String,
    pub installer: String,
    pub expected: u64,
    pub observed: Option<u64>,
    pub completed_at: DateTime<Utc>,
}

impl StalledNode {
    fn describe(&self) -> String {
        let observed = self
            .observed
            .map(|r| r.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "node {} is running revision {} but expected revision {} (installer {} completed at {})",
            self.node,
            observed,
            self.expected,
            self.installer,
            self.completed_at.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallVerdict {
    Stalled(Vec<StalledNode>),
    /// Every node runs the revision of its most recent successful installer.
    Converged,
    /// Some node is still installing or within its grace period.
    Pending,
}

/// Compares each node's most recent installer with its reported running
/// revision. A succeeded installer older than `threshold` whose revision the
/// node has not reached is a stall.
pub fn detect_stalled(
    tasks: &[InstallerPod],
    nodes: &[Node],
    now: DateTime<Utc>,
    threshold: Duration,
) -> StallVerdict {
    let mut latest_task: BTreeMap<&str, &InstallerPod> = BTreeMap::new();
    for task in tasks {
        let entry = latest_task.entry(task.node_name()).or_insert(task);
        if task.revision() > entry.revision() {
            *entry = task;
        }
    }
    let threshold = chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

    let mut stalled = Vec::new();
    let mut pending = false;
    for node in nodes {
        let Some(task) = latest_task.get(node.metadata.name.as_str()) else {
            continue;
        };
        match task.phase() {
            InstallerPhase::Pending | InstallerPhase::Running => pending = true,
            InstallerPhase::Failed => {}
            InstallerPhase::Succeeded => {
                let observed = node.status.running_revision;
                if observed.map(|r| r >= task.revision()).unwrap_or(false) {
                    continue;
                }
                // A succeeded task without a completion time is judged from now.
                let completed_at = task.status.completion_time.unwrap_or(now);
                if now.signed_duration_since(completed_at) > threshold {
                    stalled.push(StalledNode {
                        node: node.metadata.name.clone(),
                        installer: task.metadata.name.clone(),
                        expected: task.revision(),
                        observed,
                        completed_at,
                    });
                } else {
                    pending = true;
                }
            }
        }
    }

    if !stalled.is_empty() {
        StallVerdict::Stalled(stalled)
    } else if pending {
        StallVerdict::Pending
    } else {
        StallVerdict::Converged
    }
}

pub struct StallDetector {
    threshold: Duration,
}

impl StallDetector {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }
}

pub struct StallInput {
    pub tasks: Vec<InstallerPod>,
    pub nodes: Vec<Node>,
}

impl Reconciler for StallDetector {
    type Desired = StallInput;
    type Observed = ();
    type Plan = StallVerdict;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        COMPONENT
    }

    fn fetch(&self, client: &Client) -> Result<Option<ReconcileData<StallInput, ()>>, RolloutError> {
        let tasks = client.list::<InstallerPod>()?;
        let nodes: Vec<Node> = client
            .list::<Node>()?
            .into_iter()
            .filter(Node::is_control_plane)
            .collect();
        Ok(Some(ReconcileData {
            desired: StallInput { tasks, nodes },
            observed: (),
        }))
    }

    fn diff(&self, desired: &StallInput, _: &()) -> Result<StallVerdict, RolloutError> {
        Ok(detect_stalled(
            &desired.tasks,
            &desired.nodes,
            Utc::now(),
            self.threshold,
        ))
    }

    fn apply(&self, client: &Client, plan: StallVerdict) -> Result<(), RolloutError> {
        let now = Utc::now();
        match plan {
            StallVerdict::Pending => {}
            StallVerdict::Stalled(nodes) => {
                let message = nodes
                    .iter()
                    .map(StalledNode::describe)
                    .collect::<Vec<_>>()
                    .join("; ");
                let mut raised = false;
                update_status(client, |status| {
                    raised = set_condition(
                        status,
                        ConditionType::RolloutDegraded,
                        true,
                        ConditionReason::NodeRevisionStalled,
                        &message,
                        now,
                    );
                    raised
                })?;
                if raised {
                    log_warn(COMPONENT, "Rollout stalled", &[("detail", &message)]);
                }
            }
            StallVerdict::Converged => {
                let mut cleared = false;
                let status = update_status(client, |status| {
                    let was_degraded = status
                        .condition(ConditionType::RolloutDegraded.as_str())
                        .map(|c| c.is_true())
                        .unwrap_or(false);
                    let changed = set_condition(
                        status,
                        ConditionType::RolloutDegraded,
                        false,
                        ConditionReason::AsExpected,
                        "",
                        now,
                    );
                    cleared = changed && was_degraded;
                    changed
                })?;
                if cleared {
                    let latest = status.latest_available_revision.to_string();
                    log_info(
                        COMPONENT,
                        "Nodes caught up with their installers",
                        &[("latest_revision", &latest)],
                    );
                }
            }
        }
        Ok(())
    }
}
