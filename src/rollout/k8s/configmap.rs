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

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(
        rename = "binaryData",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub binary_data: BTreeMap<String, String>,
}

impl ConfigMap {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Stores `value` as text when it is valid UTF-8, base64 otherwise.
    pub fn insert_bytes(&mut self, key: &str, value: &[u8]) {
        match std::str::from_utf8(value) {
            Ok(text) => {
                self.binary_data.remove(key);
                self.data.insert(key.to_string(), text.to_string());
            }
            Err(_) => {
                self.data.remove(key);
                self.binary_data
                    .insert(key.to_string(), BASE64_STANDARD.encode(value));
            }
        }
    }

    /// Text and binary keys merged into one decoded view.
    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, value) in &self.data {
            merged.insert(key.clone(), value.clone().into_bytes());
        }
        for (key, value) in &self.binary_data {
            if let Ok(decoded) = BASE64_STANDARD.decode(value) {
                merged.insert(key.clone(), decoded);
            }
        }
        merged
    }

    /// Compares payloads only; metadata is ignored.
    pub fn content_equals(&self, other: &ConfigMap) -> bool {
        self.entries() == other.entries()
    }
}

impl Resource for ConfigMap {
    const KIND: &'static str = "ConfigMap";
    const PREFIX: &'static str = "/configmaps";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
