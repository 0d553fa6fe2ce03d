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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carried by every object materialized for a specific revision.
pub const REVISION_LABEL: &str = "rollout.io/revision";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(rename = "creationTimestamp", skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Revision this object was materialized for, if any.
    pub fn revision(&self) -> Option<u64> {
        self.labels
            .get(REVISION_LABEL)
            .and_then(|value| value.parse().ok())
    }
}

/// Name of the copy of `name` materialized for `revision`.
pub fn revisioned_name(name: &str, revision: u64) -> String {
    format!("{}-{}", name, revision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_label_round_trips() {
        let meta = ObjectMeta::named("config-4").with_label(REVISION_LABEL, "4");
        assert_eq!(meta.revision(), Some(4));
        assert_eq!(ObjectMeta::named("config").revision(), None);
        assert_eq!(revisioned_name("config", 4), "config-4");
    }

    #[test]
    fn empty_maps_are_omitted_from_json() {
        let json = serde_json::to_value(ObjectMeta::named("a")).expect("serialize");
        assert_eq!(json, serde_json::json!({ "name": "a" }));
    }
}
