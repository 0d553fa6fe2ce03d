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

//! Condition vocabulary and optimistic read-modify-write of the shared
//! rollout status object.

use crate::rollout::k8s::meta::ObjectMeta;
use crate::rollout::k8s::operator::{OperatorStatus, RolloutStatus, CLUSTER};
use crate::rollout::k8s::store::{Client, StoreError};
use crate::rollout::observability::metrics;

use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};

const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConditionType {
    /// A node did not pick up a revision its installer completed.
    RolloutDegraded,
    /// Some node failed to install the latest revision.
    NodeInstallerDegraded,
    /// Some node is not yet at the latest revision.
    NodeInstallerProgressing,
    /// The latest revision could not be materialized.
    RevisionControllerDegraded,
    /// The desired bundle could not be computed.
    BundleSynthesisDegraded,
}

impl ConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionType::RolloutDegraded => "RolloutDegraded",
            ConditionType::NodeInstallerDegraded => "NodeInstallerDegraded",
            ConditionType::NodeInstallerProgressing => "NodeInstallerProgressing",
            ConditionType::RevisionControllerDegraded => "RevisionControllerDegraded",
            ConditionType::BundleSynthesisDegraded => "BundleSynthesisDegraded",
        }
    }

    const fn is_degraded(self) -> bool {
        !matches!(self, ConditionType::NodeInstallerProgressing)
    }
}

impl Display for ConditionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons attached to conditions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConditionReason {
    AsExpected,
    NodeRevisionStalled,
    InstallerFailed,
    NodesProgressing,
    AllNodesAtLatestRevision,
    RevisionCopyFailed,
    RevisionSourceMissing,
    SynthesisFailed,
}

impl ConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionReason::AsExpected => "AsExpected",
            ConditionReason::NodeRevisionStalled => "NodeRevisionStalled",
            ConditionReason::InstallerFailed => "InstallerFailed",
            ConditionReason::NodesProgressing => "NodesProgressing",
            ConditionReason::AllNodesAtLatestRevision => "AllNodesAtLatestRevision",
            ConditionReason::RevisionCopyFailed => "RevisionCopyFailed",
            ConditionReason::RevisionSourceMissing => "RevisionSourceMissing",
            ConditionReason::SynthesisFailed => "SynthesisFailed",
        }
    }
}

impl Display for ConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sets `condition` on `status` and mirrors degraded conditions into the
/// metrics gauge. Returns `true` when the status changed.
pub fn set_condition(
    status: &mut RolloutStatus,
    condition: ConditionType,
    value: bool,
    reason: ConditionReason,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    if condition.is_degraded() {
        metrics::set_condition_degraded(condition.as_str(), value);
    }
    status.set_condition(condition.as_str(), value, reason.as_str(), message, now)
}

/// Current rollout status, or the empty status when none was written yet.
pub fn read_status(client: &Client) -> Result<RolloutStatus, StoreError> {
    Ok(client
        .get::<OperatorStatus>(CLUSTER)?
        .map(|object| object.status)
        .unwrap_or_default())
}

/// Applies `mutate` to the freshest status and writes it back, retrying when
/// another controller won the race. `mutate` returns whether it changed
/// anything; unchanged statuses are not written.
pub fn update_status<F>(client: &Client, mut mutate: F) -> Result<RolloutStatus, StoreError>
where
    F: FnMut(&mut RolloutStatus) -> bool,
{
    let mut last_conflict = None;
    for _ in 0..MAX_CONFLICT_RETRIES {
        let result = match client.get::<OperatorStatus>(CLUSTER)? {
            None => {
                let mut object = OperatorStatus {
                    metadata: ObjectMeta::named(CLUSTER),
                    status: RolloutStatus::default(),
                };
                if !mutate(&mut object.status) {
                    return Ok(object.status);
                }
                client.create(&object)
            }
            Some(mut object) => {
                if !mutate(&mut object.status) {
                    return Ok(object.status);
                }
                client.update(&object)
            }
        };
        match result {
            Ok(stored) => return Ok(stored.status),
            Err(err @ StoreError::Conflict { .. }) | Err(err @ StoreError::AlreadyExists(_)) => {
                last_conflict = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_conflict.unwrap_or(StoreError::DeadlineExceeded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::test_support::TestStore;

    #[test]
    fn creates_status_on_first_write() {
        let store = TestStore::new();
        let client = store.client();
        assert_eq!(read_status(client).expect("read"), RolloutStatus::default());

        let status = update_status(client, |status| {
            status.latest_available_revision = 1;
            true
        })
        .expect("update");
        assert_eq!(status.latest_available_revision, 1);
        assert_eq!(read_status(client).expect("read").latest_available_revision, 1);
    }

    #[test]
    fn unchanged_status_is_not_written() {
        let store = TestStore::new();
        let client = store.client();
        update_status(client, |status| {
            status.latest_available_revision = 2;
            true
        })
        .expect("seed");
        let before = client
            .get::<OperatorStatus>(CLUSTER)
            .expect("get")
            .expect("present");

        update_status(client, |_| false).expect("noop");
        let after = client
            .get::<OperatorStatus>(CLUSTER)
            .expect("get")
            .expect("present");
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
    }

    #[test]
    fn retries_after_concurrent_write() {
        let store = TestStore::new();
        let client = store.client();
        update_status(client, |status| {
            status.latest_available_revision = 1;
            true
        })
        .expect("seed");

        let mut attempts = 0;
        let status = update_status(client, |status| {
            attempts += 1;
            if attempts == 1 {
                // Simulate another controller writing between read and update.
                update_status(client, |other| {
                    other.latest_available_revision = 7;
                    true
                })
                .expect("concurrent write");
            }
            status.latest_available_revision_reason = "seen".to_string();
            true
        })
        .expect("update");

        assert_eq!(attempts, 2);
        assert_eq!(status.latest_available_revision, 7);
        assert_eq!(status.latest_available_revision_reason, "seen");
    }

    #[test]
    fn condition_names_are_stable() {
        assert_eq!(ConditionType::RolloutDegraded.to_string(), "RolloutDegraded");
        assert_eq!(
            ConditionReason::NodeRevisionStalled.as_str(),
            "NodeRevisionStalled"
        );
    }
}
