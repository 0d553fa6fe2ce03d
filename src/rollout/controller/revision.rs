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

//! Revision trigger: compares the desired objects against the copies of the
//! latest revision and materializes a new revision when they drift.

use crate::rollout::bundle::{
    bundle_fingerprint, BUNDLE_CONFIG_MAPS, CONFIG_MAP, FINGERPRINT_KEY, POD_CONFIG_MAP,
};
use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::reconcile::{ReconcileData, Reconciler};
use crate::rollout::controller::status::{
    set_condition, update_status, ConditionReason, ConditionType,
};
use crate::rollout::k8s::configmap::ConfigMap;
use crate::rollout::k8s::meta::{revisioned_name, ObjectMeta, REVISION_LABEL};
use crate::rollout::k8s::operator::{OperatorStatus, RolloutStatus, CLUSTER};
use crate::rollout::k8s::secret::Secret;
use crate::rollout::k8s::store::{Client, Resource, StoreError};
use crate::rollout::logger::{log_info, log_warn};
use crate::rollout::observability::metrics;

use chrono::{SecondsFormat, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};

const COMPONENT: &str = "revision-controller";
pub const REVISION_STATUS_PREFIX: &str = "revision-status";
pub const WATCHED_PREFIXES: &[&str] = &[
    ConfigMap::PREFIX,
    Secret::PREFIX,
    OperatorStatus::PREFIX,
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackedKind {
    ConfigMap,
    Secret,
}

impl TrackedKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            TrackedKind::ConfigMap => "configmap",
            TrackedKind::Secret => "secret",
        }
    }
}

/// An object copied into every revision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TrackedObject {
    pub kind: TrackedKind,
    pub name: &'static str,
    /// Optional objects are skipped when absent.
    pub optional: bool,
}

pub const TRACKED_OBJECTS: &[TrackedObject] = &[
    TrackedObject {
        kind: TrackedKind::ConfigMap,
        name: CONFIG_MAP,
        optional: false,
    },
    TrackedObject {
        kind: TrackedKind::ConfigMap,
        name: POD_CONFIG_MAP,
        optional: false,
    },
    TrackedObject {
        kind: TrackedKind::ConfigMap,
        name: "cloud-config",
        optional: true,
    },
    TrackedObject {
        kind: TrackedKind::Secret,
        name: "etcd-client",
        optional: false,
    },
];

/// Content of a tracked object, compared without metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackedContent {
    ConfigMap(ConfigMap),
    Secret(Secret),
}

impl TrackedContent {
    fn content_equals(&self, other: &TrackedContent) -> bool {
        match (self, other) {
            (TrackedContent::ConfigMap(a), TrackedContent::ConfigMap(b)) => {
                without_fingerprint(a).content_equals(&without_fingerprint(b))
            }
            (TrackedContent::Secret(a), TrackedContent::Secret(b)) => a.content_equals(b),
            _ => false,
        }
    }

    /// Copy named for `revision`, labelled with it.
    fn for_revision(&self, base: &str, revision: u64) -> TrackedContent {
        let metadata = ObjectMeta::named(revisioned_name(base, revision))
            .with_label(REVISION_LABEL, revision.to_string());
        match self {
            TrackedContent::ConfigMap(map) => TrackedContent::ConfigMap(ConfigMap {
                metadata,
                data: map.data.clone(),
                binary_data: map.binary_data.clone(),
            }),
            TrackedContent::Secret(secret) => TrackedContent::Secret(Secret {
                metadata,
                type_: secret.type_.clone(),
                data: secret.data.clone(),
            }),
        }
    }
}

/// The bundle fingerprint changes with any published configmap, so it is left
/// out when judging whether one object drifted.
fn without_fingerprint(map: &ConfigMap) -> ConfigMap {
    let mut map = map.clone();
    map.data.remove(FINGERPRINT_KEY);
    map
}

fn fetch_tracked(
    client: &Client,
    tracked: &TrackedObject,
    name: &str,
) -> Result<Option<TrackedContent>, StoreError> {
    Ok(match tracked.kind {
        TrackedKind::ConfigMap => client.get::<ConfigMap>(name)?.map(TrackedContent::ConfigMap),
        TrackedKind::Secret => client.get::<Secret>(name)?.map(TrackedContent::Secret),
    })
}

fn apply_tracked(client: &Client, content: &TrackedContent) -> Result<(), StoreError> {
    match content {
        TrackedContent::ConfigMap(map) => client.apply(map).map(|_| ()),
        TrackedContent::Secret(secret) => client.apply(secret).map(|_| ()),
    }
}

#[derive(Debug)]
pub enum RevisionError {
    Store(StoreError),
    /// A required source object does not exist, so no complete revision can
    /// be cut.
    MissingSource { kind: &'static str, name: String },
    /// The published bundle configmaps come from different synthesis
    /// passes, so their content does not belong together yet.
    InconsistentBundle { fingerprints: Vec<(String, String)> },
    /// Another writer moved the latest revision while this one was being
    /// materialized.
    Superseded { expected: u64, found: u64 },
}

impl Display for RevisionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RevisionError::Store(err) => write!(f, "{}", err),
            RevisionError::MissingSource { kind, name } => {
                write!(f, "required {} {} does not exist", kind, name)
            }
            RevisionError::InconsistentBundle { fingerprints } => {
                let described = fingerprints
                    .iter()
                    .map(|(name, fingerprint)| format!("{}={}", name, fingerprint))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "published bundle is only partially written ({})", described)
            }
            RevisionError::Superseded { expected, found } => write!(
                f,
                "latest revision moved from {} to {} while materializing",
                expected, found
            ),
        }
    }
}

impl Error for RevisionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RevisionError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RevisionError {
    fn from(err: StoreError) -> Self {
        RevisionError::Store(err)
    }
}

/// Tracked objects as they currently exist, by position in the tracked list.
pub type ObjectSet = Vec<Option<TrackedContent>>;

/// What the latest revision looks like in the store.
#[derive(Clone, Debug)]
pub struct CurrentRevision {
    pub latest: u64,
    pub objects: ObjectSet,
    /// Whether `RevisionControllerDegraded` is currently raised.
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevisionPlan {
    UpToDate { clear_degraded: bool },
    Create { revision: u64, reason: String },
    /// A required source is gone. Nothing is copied and the degraded
    /// condition is raised.
    MissingSource { kind: &'static str, name: String },
}

/// Verifies that `sources` can form a complete revision: every required
/// object is present and the bundle configmaps were published together.
pub fn check_sources(tracked: &[TrackedObject], sources: &ObjectSet) -> Result<(), RevisionError> {
    for (object, content) in tracked.iter().zip(sources) {
        if content.is_none() && !object.optional {
            return Err(RevisionError::MissingSource {
                kind: object.kind.as_str(),
                name: object.name.to_string(),
            });
        }
    }

    let fingerprints = tracked
        .iter()
        .zip(sources)
        .filter(|(object, _)| {
            object.kind == TrackedKind::ConfigMap && BUNDLE_CONFIG_MAPS.contains(&object.name)
        })
        .filter_map(|(object, content)| match content {
            Some(TrackedContent::ConfigMap(map)) => Some((
                object.name.to_string(),
                bundle_fingerprint(map).unwrap_or("").to_string(),
            )),
            _ => None,
        })
        .collect::<Vec<_>>();
    if fingerprints.windows(2).any(|pair| pair[0].1 != pair[1].1) {
        return Err(RevisionError::InconsistentBundle { fingerprints });
    }
    Ok(())
}

/// Returns why a new revision is needed, or `None` when the latest revision
/// already matches `desired`. `desired` must pass [`check_sources`].
pub fn needs_new_revision(
    tracked: &[TrackedObject],
    desired: &ObjectSet,
    current: &CurrentRevision,
) -> Result<Option<String>, RevisionError> {
    check_sources(tracked, desired)?;

    if current.latest == 0 {
        return Ok(Some("no revision exists yet".to_string()));
    }

    for ((object, wanted), have) in tracked.iter().zip(desired).zip(&current.objects) {
        let revisioned = revisioned_name(object.name, current.latest);
        let reason = match (wanted, have) {
            (Some(wanted), Some(have)) if wanted.content_equals(have) => continue,
            (Some(_), Some(_)) => format!("{}/{} has changed", object.kind.as_str(), object.name),
            (Some(_), None) => format!("{}/{} is missing", object.kind.as_str(), revisioned),
            (None, Some(_)) => format!("{}/{} was removed", object.kind.as_str(), object.name),
            (None, None) => continue,
        };
        return Ok(Some(reason));
    }
    Ok(None)
}

/// Copies every present tracked object to `<name>-<revision>` and records why
/// the revision was cut. The latest revision counter is not touched.
pub fn materialize_revision(
    client: &Client,
    tracked: &[TrackedObject],
    desired: &ObjectSet,
    revision: u64,
    reason: &str,
) -> Result<(), RevisionError> {
    for (object, content) in tracked.iter().zip(desired) {
        if let Some(content) = content {
            apply_tracked(client, &content.for_revision(object.name, revision))?;
        }
    }

    let record = ConfigMap::new(
        ObjectMeta::named(revisioned_name(REVISION_STATUS_PREFIX, revision))
            .with_label(REVISION_LABEL, revision.to_string()),
    )
    .with_data("reason", reason)
    .with_data(
        "createdAt",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    client.apply(&record)?;
    Ok(())
}

/// Claims `revision` as the latest, provided nobody else advanced it from
/// `expected` in the meantime.
fn claim_revision(
    client: &Client,
    expected: u64,
    revision: u64,
    reason: &str,
) -> Result<(), RevisionError> {
    let mut found = expected;
    let status = update_status(client, |status| {
        found = status.latest_available_revision;
        if found != expected {
            return false;
        }
        status.latest_available_revision = revision;
        status.latest_available_revision_reason = reason.to_string();
        set_condition(
            status,
            ConditionType::RevisionControllerDegraded,
            false,
            ConditionReason::AsExpected,
            "",
            Utc::now(),
        );
        true
    })?;
    if status.latest_available_revision != revision {
        return Err(RevisionError::Superseded { expected, found });
    }
    Ok(())
}

fn report_degraded(client: &Client, reason: ConditionReason, message: &str) {
    let result = update_status(client, |status: &mut RolloutStatus| {
        set_condition(
            status,
            ConditionType::RevisionControllerDegraded,
            true,
            reason,
            message,
            Utc::now(),
        )
    });
    if let Err(err) = result {
        let error = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to record revision controller condition",
            &[("error", &error)],
        );
    }
}

/// Detects drift and cuts new revisions.
pub struct RevisionController {
    tracked: &'static [TrackedObject],
}

impl RevisionController {
    pub fn new() -> Self {
        Self::with_tracked(TRACKED_OBJECTS)
    }

    pub fn with_tracked(tracked: &'static [TrackedObject]) -> Self {
        Self { tracked }
    }
}

impl Default for RevisionController {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler for RevisionController {
    type Desired = ObjectSet;
    type Observed = CurrentRevision;
    type Plan = RevisionPlan;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        COMPONENT
    }

    fn fetch(
        &self,
        client: &Client,
    ) -> Result<Option<ReconcileData<ObjectSet, CurrentRevision>>, RolloutError> {
        let status = client
            .get::<OperatorStatus>(CLUSTER)?
            .map(|object| object.status)
            .unwrap_or_default();
        let latest = status.latest_available_revision;
        let degraded = status
            .condition(ConditionType::RevisionControllerDegraded.as_str())
            .map(|condition| condition.is_true())
            .unwrap_or(false);

        let mut desired = Vec::with_capacity(self.tracked.len());
        let mut current = Vec::with_capacity(self.tracked.len());
        for object in self.tracked {
            desired.push(fetch_tracked(client, object, object.name)?);
            current.push(if latest == 0 {
                None
            } else {
                fetch_tracked(client, object, &revisioned_name(object.name, latest))?
            });
        }

        Ok(Some(ReconcileData {
            desired,
            observed: CurrentRevision {
                latest,
                objects: current,
                degraded,
            },
        }))
    }

    fn diff(
        &self,
        desired: &ObjectSet,
        observed: &CurrentRevision,
    ) -> Result<RevisionPlan, RolloutError> {
        Ok(match needs_new_revision(self.tracked, desired, observed) {
            Ok(Some(reason)) => RevisionPlan::Create {
                revision: observed.latest + 1,
                reason,
            },
            Ok(None) => RevisionPlan::UpToDate {
                clear_degraded: observed.degraded,
            },
            Err(RevisionError::MissingSource { kind, name }) => {
                RevisionPlan::MissingSource { kind, name }
            }
            Err(err) => return Err(err.into()),
        })
    }

    fn apply(&self, client: &Client, plan: RevisionPlan) -> Result<(), RolloutError> {
        let (revision, reason) = match plan {
            RevisionPlan::UpToDate { clear_degraded } => {
                if clear_degraded {
                    update_status(client, |status| {
                        set_condition(
                            status,
                            ConditionType::RevisionControllerDegraded,
                            false,
                            ConditionReason::AsExpected,
                            "",
                            Utc::now(),
                        )
                    })?;
                }
                return Ok(());
            }
            RevisionPlan::MissingSource { kind, name } => {
                let err = RevisionError::MissingSource { kind, name };
                report_degraded(client, ConditionReason::RevisionSourceMissing, &err.to_string());
                return Err(err.into());
            }
            RevisionPlan::Create { revision, reason } => (revision, reason),
        };

        // Sources are re-read so the copy reflects what is stored right now,
        // and checked again since they may have changed since the diff.
        let desired = self
            .tracked
            .iter()
            .map(|object| fetch_tracked(client, object, object.name))
            .collect::<Result<ObjectSet, StoreError>>()?;

        let materialized = check_sources(self.tracked, &desired)
            .and_then(|()| materialize_revision(client, self.tracked, &desired, revision, &reason))
            .and_then(|()| claim_revision(client, revision - 1, revision, &reason));
        if let Err(err) = materialized {
            let message = format!("revision {}: {}", revision, err);
            match &err {
                RevisionError::Store(StoreError::DeadlineExceeded)
                | RevisionError::InconsistentBundle { .. } => {}
                RevisionError::MissingSource { .. } => {
                    report_degraded(client, ConditionReason::RevisionSourceMissing, &message)
                }
                _ => report_degraded(client, ConditionReason::RevisionCopyFailed, &message),
            }
            return Err(err.into());
        }

        metrics::set_latest_available_revision(revision);
        let revision_text = revision.to_string();
        log_info(
            COMPONENT,
            "Created new revision",
            &[("revision", &revision_text), ("reason", &reason)],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(value: &str) -> Option<TrackedContent> {
        Some(TrackedContent::ConfigMap(
            ConfigMap::new(ObjectMeta::named("config")).with_data("config.json", value),
        ))
    }

    const ONE: &[TrackedObject] = &[TrackedObject {
        kind: TrackedKind::ConfigMap,
        name: "config",
        optional: false,
    }];

    const WITH_OPTIONAL: &[TrackedObject] = &[
        TrackedObject {
            kind: TrackedKind::ConfigMap,
            name: "config",
            optional: false,
        },
        TrackedObject {
            kind: TrackedKind::ConfigMap,
            name: "cloud-config",
            optional: true,
        },
    ];

    #[test]
    fn first_revision_is_always_needed() {
        let current = CurrentRevision {
            latest: 0,
            objects: vec![None],
            degraded: false,
        };
        let reason = needs_new_revision(ONE, &vec![config("a")], &current).expect("decide");
        assert_eq!(reason.as_deref(), Some("no revision exists yet"));
    }

    #[test]
    fn identical_content_needs_nothing() {
        let current = CurrentRevision {
            latest: 3,
            objects: vec![config("a")],
            degraded: false,
        };
        assert_eq!(
            needs_new_revision(ONE, &vec![config("a")], &current).expect("decide"),
            None
        );
    }

    #[test]
    fn changed_or_missing_content_is_drift() {
        let changed = CurrentRevision {
            latest: 3,
            objects: vec![config("a")],
            degraded: false,
        };
        assert_eq!(
            needs_new_revision(ONE, &vec![config("b")], &changed)
                .expect("decide")
                .as_deref(),
            Some("configmap/config has changed")
        );

        let missing = CurrentRevision {
            latest: 3,
            objects: vec![None],
            degraded: false,
        };
        assert_eq!(
            needs_new_revision(ONE, &vec![config("a")], &missing)
                .expect("decide")
                .as_deref(),
            Some("configmap/config-3 is missing")
        );
    }

    #[test]
    fn missing_required_source_is_an_error() {
        let current = CurrentRevision {
            latest: 3,
            objects: vec![config("a")],
            degraded: false,
        };
        assert!(matches!(
            needs_new_revision(ONE, &vec![None], &current),
            Err(RevisionError::MissingSource { .. })
        ));
    }

    #[test]
    fn absent_optional_object_is_not_drift() {
        let current = CurrentRevision {
            latest: 2,
            objects: vec![config("a"), None],
            degraded: false,
        };
        assert_eq!(
            needs_new_revision(WITH_OPTIONAL, &vec![config("a"), None], &current)
                .expect("decide"),
            None
        );
        assert!(
            needs_new_revision(WITH_OPTIONAL, &vec![config("a"), config("cloud")], &current)
                .expect("decide")
                .is_some()
        );
    }

    fn published(name: &str, fingerprint: &str) -> Option<TrackedContent> {
        Some(TrackedContent::ConfigMap(
            ConfigMap::new(ObjectMeta::named(name))
                .with_data("payload", name)
                .with_data(FINGERPRINT_KEY, fingerprint),
        ))
    }

    const BUNDLE: &[TrackedObject] = &[
        TrackedObject {
            kind: TrackedKind::ConfigMap,
            name: CONFIG_MAP,
            optional: false,
        },
        TrackedObject {
            kind: TrackedKind::ConfigMap,
            name: POD_CONFIG_MAP,
            optional: false,
        },
    ];

    #[test]
    fn bundle_from_two_passes_is_rejected() {
        let sources = vec![published(CONFIG_MAP, "old"), published(POD_CONFIG_MAP, "new")];
        assert!(matches!(
            check_sources(BUNDLE, &sources),
            Err(RevisionError::InconsistentBundle { .. })
        ));

        let sources = vec![published(CONFIG_MAP, "new"), published(POD_CONFIG_MAP, "new")];
        assert!(check_sources(BUNDLE, &sources).is_ok());
    }

    #[test]
    fn fingerprint_alone_is_not_drift_for_an_object() {
        let current = CurrentRevision {
            latest: 1,
            objects: vec![published(CONFIG_MAP, "old"), published(POD_CONFIG_MAP, "old")],
            degraded: false,
        };
        let mut pod = ConfigMap::new(ObjectMeta::named(POD_CONFIG_MAP))
            .with_data("payload", "changed")
            .with_data(FINGERPRINT_KEY, "new");
        pod.data.insert("extra".to_string(), "arg".to_string());
        let desired = vec![
            published(CONFIG_MAP, "new"),
            Some(TrackedContent::ConfigMap(pod)),
        ];
        assert_eq!(
            needs_new_revision(BUNDLE, &desired, &current)
                .expect("decide")
                .as_deref(),
            Some("configmap/apiserver-pod has changed")
        );
    }
}
