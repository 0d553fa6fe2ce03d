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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(rename = "type", default = "default_secret_type")]
    pub type_: String,
    /// Base64 encoded values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

fn default_secret_type() -> String {
    "Opaque".to_string()
}

impl Secret {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            type_: default_secret_type(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: &[u8]) -> Self {
        self.data.insert(key.into(), BASE64_STANDARD.encode(value));
        self
    }

    /// Decoded entries. Values that are not valid base64 are kept verbatim so
    /// a malformed entry still counts as content.
    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        self.data
            .iter()
            .map(|(key, value)| {
                let decoded = BASE64_STANDARD
                    .decode(value)
                    .unwrap_or_else(|_| value.clone().into_bytes());
                (key.clone(), decoded)
            })
            .collect()
    }

    pub fn content_equals(&self, other: &Secret) -> bool {
        self.type_ == other.type_ && self.entries() == other.entries()
    }
}

impl Resource for Secret {
    const KIND: &'static str = "Secret";
    const PREFIX: &'static str = "/secrets";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_decoded_content_and_type() {
        let a = Secret::new(ObjectMeta::named("etcd-client")).with_entry("tls.crt", b"cert");
        let b = Secret::new(ObjectMeta::named("etcd-client-2")).with_entry("tls.crt", b"cert");
        assert!(a.content_equals(&b));

        let mut typed = b.clone();
        typed.type_ = "kubernetes.io/tls".to_string();
        assert!(!a.content_equals(&typed));
    }

    #[test]
    fn missing_type_defaults_to_opaque() {
        let secret: Secret =
            serde_json::from_str(r#"{"metadata":{"name":"s"}}"#).expect("deserialize");
        assert_eq!(secret.type_, "Opaque");
    }
}
