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

//! Moves control-plane nodes to the latest revision one node at a time.
//!
//! Every pass first aligns the record list with the live node set, then takes
//! exactly one step: fold the outcome of the single in-flight installer, or
//! start the next eligible node, or nothing. Records are written back only
//! after the step has been decided.

use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::installer::{installer_pod_name, InstallerTemplate};
use crate::rollout::controller::nodes::{reconcile_node_records, NodeSetChange};
use crate::rollout::controller::reconcile::{ReconcileData, Reconciler};
use crate::rollout::controller::status::{
    read_status, set_condition, update_status, ConditionReason, ConditionType,
};
use crate::rollout::k8s::node::Node;
use crate::rollout::k8s::operator::{NodeRolloutRecord, OperatorStatus, RolloutStatus};
use crate::rollout::k8s::pod::{InstallerPhase, InstallerPod};
use crate::rollout::k8s::store::{Client, Resource, StoreError};
use crate::rollout::logger::{log_info, log_warn};
use crate::rollout::observability::metrics::{self, InstallerOutcome};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

const COMPONENT: &str = "node-rollout";
pub const WATCHED_PREFIXES: &[&str] = &[OperatorStatus::PREFIX, Node::PREFIX, InstallerPod::PREFIX];

/// Fleet state read from the store.
#[derive(Debug, Clone, Default)]
pub struct FleetState {
    pub latest: u64,
    pub records: Vec<NodeRolloutRecord>,
    pub live_nodes: Vec<String>,
}

/// Installer tasks by name.
pub type TaskIndex = BTreeMap<String, InstallerPod>;

/// How a finished or vanished installer was folded into its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Succeeded,
    Failed,
    Missing,
}

impl FoldOutcome {
    fn metric(self) -> InstallerOutcome {
        match self {
            FoldOutcome::Succeeded => InstallerOutcome::Succeeded,
            FoldOutcome::Failed => InstallerOutcome::Failed,
            FoldOutcome::Missing => InstallerOutcome::Missing,
        }
    }
}

/// The single step taken in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStep {
    /// Nothing to do: every node is at the latest revision or blocked on it.
    Idle,
    /// The in-flight installer has not finished.
    Waiting { node: String, revision: u64, phase: InstallerPhase },
    Folded { node: String, revision: u64, outcome: FoldOutcome },
    /// The node was targeted at `revision` and needs an installer.
    Started { node: String, revision: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutPlan {
    pub latest: u64,
    pub records: Vec<NodeRolloutRecord>,
    pub node_change: NodeSetChange,
    pub step: RolloutStep,
}

fn fold_succeeded(record: &mut NodeRolloutRecord) {
    record.current_revision = record.target_revision;
    record.target_revision = 0;
    record.last_failed_revision = 0;
    record.last_failed_time = None;
    record.last_failed_revision_errors.clear();
}

fn fold_failed(record: &mut NodeRolloutRecord, errors: Vec<String>, now: DateTime<Utc>) {
    record.last_failed_revision = record.target_revision;
    record.last_failed_time = Some(now);
    record.target_revision = record.current_revision;
    record.last_failed_revision_errors = errors;
}

/// Decides and applies one step to `records`.
pub fn plan_step(
    records: &mut [NodeRolloutRecord],
    latest: u64,
    tasks: &TaskIndex,
    now: DateTime<Utc>,
) -> RolloutStep {
    if let Some(record) = records.iter_mut().find(|r| r.is_transitioning()) {
        let node = record.node_name.clone();
        let revision = record.target_revision;
        let name = installer_pod_name(&node, revision);
        let outcome = match tasks.get(&name) {
            None => {
                fold_failed(
                    record,
                    vec![format!("installer pod {} disappeared before completing", name)],
                    now,
                );
                FoldOutcome::Missing
            }
            Some(task) => match task.phase() {
                InstallerPhase::Succeeded => {
                    fold_succeeded(record);
                    FoldOutcome::Succeeded
                }
                InstallerPhase::Failed => {
                    let mut errors = task.status.termination_messages.clone();
                    if errors.is_empty() {
                        errors.push(format!("installer pod {} failed", name));
                    }
                    fold_failed(record, errors, now);
                    FoldOutcome::Failed
                }
                phase => {
                    return RolloutStep::Waiting {
                        node,
                        revision,
                        phase,
                    }
                }
            },
        };
        return RolloutStep::Folded {
            node,
            revision,
            outcome,
        };
    }

    if latest == 0 {
        return RolloutStep::Idle;
    }
    match records.iter_mut().find(|r| r.is_eligible(latest)) {
        Some(record) => {
            record.target_revision = latest;
            RolloutStep::Started {
                node: record.node_name.clone(),
                revision: latest,
            }
        }
        None => RolloutStep::Idle,
    }
}

fn node_list(names: &[&str]) -> String {
    format!("[{}]", names.join(", "))
}

/// Derives the installer conditions from the records. Returns `true` when the
/// status changed.
fn set_installer_conditions(status: &mut RolloutStatus, now: DateTime<Utc>) -> bool {
    let latest = status.latest_available_revision;
    if latest == 0 {
        return false;
    }
    let failed: Vec<&NodeRolloutRecord> = status
        .node_statuses
        .iter()
        .filter(|r| r.last_failed_revision == latest)
        .collect();
    let behind: Vec<&str> = status
        .node_statuses
        .iter()
        .filter(|r| r.current_revision != latest)
        .map(|r| r.node_name.as_str())
        .collect();

    let (degraded, degraded_reason, degraded_message) = if failed.is_empty() {
        (false, ConditionReason::AsExpected, String::new())
    } else {
        let names: Vec<&str> = failed.iter().map(|r| r.node_name.as_str()).collect();
        let first_error = failed
            .iter()
            .find_map(|r| r.last_failed_revision_errors.first())
            .map(String::as_str)
            .unwrap_or("unknown error");
        (
            true,
            ConditionReason::InstallerFailed,
            format!(
                "nodes {} failed to install revision {}: {}",
                node_list(&names),
                latest,
                first_error
            ),
        )
    };
    let (progressing, progressing_reason, progressing_message) = if behind.is_empty() {
        (
            false,
            ConditionReason::AllNodesAtLatestRevision,
            format!(
                "{} nodes are at revision {}",
                status.node_statuses.len(),
                latest
            ),
        )
    } else {
        (
            true,
            ConditionReason::NodesProgressing,
            format!(
                "nodes {} are not at revision {}",
                node_list(&behind),
                latest
            ),
        )
    };

    let mut changed = set_condition(
        status,
        ConditionType::NodeInstallerDegraded,
        degraded,
        degraded_reason,
        &degraded_message,
        now,
    );
    changed |= set_condition(
        status,
        ConditionType::NodeInstallerProgressing,
        progressing,
        progressing_reason,
        &progressing_message,
        now,
    );
    changed
}

pub struct NodeRolloutController {
    template: InstallerTemplate,
}

impl NodeRolloutController {
    pub fn new(template: InstallerTemplate) -> Self {
        Self { template }
    }

    fn create_installer(&self, client: &Client, node: &str, revision: u64) -> Result<(), RolloutError> {
        let pod = self.template.build(node, revision);
        match client.create(&pod) {
            Ok(_) => {}
            // Same (node, revision) identity: the existing task stands.
            Err(StoreError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }
        let revision = revision.to_string();
        log_info(
            COMPONENT,
            "Started node transition",
            &[
                ("node", node),
                ("revision", &revision),
                ("installer", &pod.metadata.name),
            ],
        );
        Ok(())
    }

    fn report_step(step: &RolloutStep, records: &[NodeRolloutRecord]) {
        if let RolloutStep::Folded {
            node,
            revision,
            outcome,
        } = step
        {
            metrics::record_installer_outcome(outcome.metric());
            let revision = revision.to_string();
            match outcome {
                FoldOutcome::Succeeded => log_info(
                    COMPONENT,
                    "Node reached revision",
                    &[("node", node), ("revision", &revision)],
                ),
                FoldOutcome::Failed | FoldOutcome::Missing => {
                    let errors = records
                        .iter()
                        .find(|r| &r.node_name == node)
                        .map(|r| r.last_failed_revision_errors.join("; "))
                        .unwrap_or_default();
                    log_warn(
                        COMPONENT,
                        "Node failed to install revision",
                        &[("node", node), ("revision", &revision), ("errors", &errors)],
                    );
                }
            }
        }
        for record in records {
            metrics::set_node_current_revision(&record.node_name, record.current_revision);
        }
    }
}

impl Reconciler for NodeRolloutController {
    type Desired = FleetState;
    type Observed = TaskIndex;
    type Plan = RolloutPlan;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        COMPONENT
    }

    fn fetch(
        &self,
        client: &Client,
    ) -> Result<Option<ReconcileData<FleetState, TaskIndex>>, RolloutError> {
        let status = read_status(client)?;
        let live_nodes = client
            .list::<Node>()?
            .into_iter()
            .filter(Node::is_control_plane)
            .map(|node| node.metadata.name)
            .collect();
        let tasks = client
            .list::<InstallerPod>()?
            .into_iter()
            .map(|pod| (pod.metadata.name.clone(), pod))
            .collect();
        Ok(Some(ReconcileData {
            desired: FleetState {
                latest: status.latest_available_revision,
                records: status.node_statuses,
                live_nodes,
            },
            observed: tasks,
        }))
    }

    fn diff(&self, desired: &FleetState, observed: &TaskIndex) -> Result<RolloutPlan, RolloutError> {
        let mut records = desired.records.clone();
        let node_change = reconcile_node_records(&mut records, &desired.live_nodes);
        let step = plan_step(&mut records, desired.latest, observed, Utc::now());
        Ok(RolloutPlan {
            latest: desired.latest,
            records,
            node_change,
            step,
        })
    }

    fn apply(&self, client: &Client, plan: RolloutPlan) -> Result<(), RolloutError> {
        // The task exists before any record points at it.
        if let RolloutStep::Started { node, revision } = &plan.step {
            self.create_installer(client, node, *revision)?;
        }

        let now = Utc::now();
        update_status(client, |status| {
            let mut changed = false;
            if status.node_statuses != plan.records {
                status.node_statuses = plan.records.clone();
                changed = true;
            }
            changed |= set_installer_conditions(status, now);
            changed
        })?;

        for name in &plan.node_change.added {
            log_info(COMPONENT, "Tracking control-plane node", &[("node", name)]);
        }
        for name in &plan.node_change.removed {
            metrics::clear_node(name);
            log_info(COMPONENT, "Dropped record of removed node", &[("node", name)]);
        }
        Self::report_step(&plan.step, &plan.records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::k8s::meta::ObjectMeta;

    fn record(name: &str, current: u64) -> NodeRolloutRecord {
        NodeRolloutRecord {
            current_revision: current,
            ..NodeRolloutRecord::new(name)
        }
    }

    fn task(node: &str, revision: u64, phase: InstallerPhase) -> (String, InstallerPod) {
        let name = installer_pod_name(node, revision);
        let mut pod = InstallerPod {
            metadata: ObjectMeta::named(name.clone()),
            ..InstallerPod::default()
        };
        pod.spec.node_name = node.to_string();
        pod.spec.revision = revision;
        pod.status.phase = phase;
        (name, pod)
    }

    fn transitioning(records: &[NodeRolloutRecord]) -> usize {
        records.iter().filter(|r| r.is_transitioning()).count()
    }

    #[test]
    fn first_node_starts_and_others_wait() {
        let mut records = vec![record("a", 3), record("b", 3), record("c", 3)];
        let step = plan_step(&mut records, 4, &TaskIndex::new(), Utc::now());
        assert_eq!(
            step,
            RolloutStep::Started {
                node: "a".into(),
                revision: 4
            }
        );
        assert_eq!(records[0].target_revision, 4);
        assert_eq!(records[1].target_revision, 0);
        assert_eq!(records[2].target_revision, 0);
        assert_eq!(transitioning(&records), 1);

        // No task yet is not a wait: the record is folded as failed.
        let step = plan_step(&mut records, 4, &TaskIndex::new(), Utc::now());
        assert!(matches!(
            step,
            RolloutStep::Folded {
                outcome: FoldOutcome::Missing,
                ..
            }
        ));
    }

    #[test]
    fn running_task_blocks_the_fleet() {
        let mut records = vec![record("a", 3), record("b", 3)];
        records[0].target_revision = 4;
        let tasks: TaskIndex = [task("a", 4, InstallerPhase::Running)].into_iter().collect();
        let before = records.clone();
        let step = plan_step(&mut records, 4, &tasks, Utc::now());
        assert!(matches!(step, RolloutStep::Waiting { phase: InstallerPhase::Running, .. }));
        assert_eq!(records, before);
    }

    #[test]
    fn success_advances_the_node() {
        let mut records = vec![record("a", 3)];
        records[0].target_revision = 4;
        records[0].last_failed_revision = 2;
        records[0].last_failed_revision_errors = vec!["old".into()];
        let tasks: TaskIndex = [task("a", 4, InstallerPhase::Succeeded)].into_iter().collect();
        plan_step(&mut records, 4, &tasks, Utc::now());
        assert_eq!(records[0].current_revision, 4);
        assert_eq!(records[0].target_revision, 0);
        assert_eq!(records[0].last_failed_revision, 0);
        assert!(records[0].last_failed_revision_errors.is_empty());
    }

    #[test]
    fn failure_quarantines_the_revision_and_moves_on() {
        let now = Utc::now();
        let mut records = vec![record("a", 3), record("b", 3)];
        records[0].target_revision = 4;
        let (name, mut failed) = task("a", 4, InstallerPhase::Failed);
        failed.status.termination_messages = vec!["disk full".into()];
        let tasks: TaskIndex = [(name, failed)].into_iter().collect();

        plan_step(&mut records, 4, &tasks, now);
        assert_eq!(records[0].last_failed_revision, 4);
        assert_eq!(records[0].target_revision, 3);
        assert_eq!(records[0].last_failed_time, Some(now));
        assert_eq!(records[0].last_failed_revision_errors, vec!["disk full"]);

        let step = plan_step(&mut records, 4, &tasks, now);
        assert_eq!(
            step,
            RolloutStep::Started {
                node: "b".into(),
                revision: 4
            }
        );
        assert!(!records[0].is_transitioning());
    }

    #[test]
    fn failure_without_messages_gets_one() {
        let mut records = vec![record("a", 1)];
        records[0].target_revision = 2;
        let tasks: TaskIndex = [task("a", 2, InstallerPhase::Failed)].into_iter().collect();
        plan_step(&mut records, 2, &tasks, Utc::now());
        assert_eq!(records[0].last_failed_revision_errors.len(), 1);
    }

    #[test]
    fn quarantined_node_retries_on_newer_revision() {
        let mut records = vec![record("a", 3)];
        records[0].last_failed_revision = 4;
        assert_eq!(
            plan_step(&mut records, 4, &TaskIndex::new(), Utc::now()),
            RolloutStep::Idle
        );
        assert_eq!(
            plan_step(&mut records, 5, &TaskIndex::new(), Utc::now()),
            RolloutStep::Started {
                node: "a".into(),
                revision: 5
            }
        );
    }

    #[test]
    fn nothing_happens_before_the_first_revision() {
        let mut records = vec![record("a", 0)];
        assert_eq!(
            plan_step(&mut records, 0, &TaskIndex::new(), Utc::now()),
            RolloutStep::Idle
        );
    }

    #[test]
    fn conditions_name_failed_and_lagging_nodes() {
        let mut status = RolloutStatus {
            latest_available_revision: 4,
            node_statuses: vec![record("a", 3), record("b", 4)],
            ..RolloutStatus::default()
        };
        status.node_statuses[0].last_failed_revision = 4;
        status.node_statuses[0].last_failed_revision_errors = vec!["boom".into()];
        assert!(set_installer_conditions(&mut status, Utc::now()));

        let degraded = status
            .condition(ConditionType::NodeInstallerDegraded.as_str())
            .expect("degraded condition");
        assert!(degraded.is_true());
        assert_eq!(degraded.reason, "InstallerFailed");
        assert!(degraded.message.contains("[a]"));
        assert!(degraded.message.contains("boom"));
        let progressing = status
            .condition(ConditionType::NodeInstallerProgressing.as_str())
            .expect("progressing condition");
        assert!(progressing.is_true());

        assert!(!set_installer_conditions(&mut status, Utc::now()));
    }
}
