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

//! Desired bundle synthesis: the configuration document and pod manifest the
//! API server should run, as named configmap payloads.

pub mod assets;
pub mod config;

use crate::rollout::k8s::configmap::ConfigMap;
use crate::rollout::k8s::meta::ObjectMeta;
use crate::rollout::k8s::operator::OperatorSpecFields;
use assets::AssetProvider;
use config::{merge_config, ApiServerConfig, BundleError, ObservedFacts};

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

pub const CONFIG_MAP: &str = "config";
pub const CONFIG_KEY: &str = "config.json";
pub const POD_CONFIG_MAP: &str = "apiserver-pod";
pub const POD_KEY: &str = "pod.json";
pub const FORCE_REDEPLOYMENT_KEY: &str = "forceRedeploymentReason";
pub const VERSION_KEY: &str = "version";
/// Stamped into every published configmap of one bundle. Configmaps carrying
/// different values were written by different synthesis passes.
pub const FINGERPRINT_KEY: &str = "bundleFingerprint";
/// Configmaps published together as one bundle.
pub const BUNDLE_CONFIG_MAPS: &[&str] = &[CONFIG_MAP, POD_CONFIG_MAP];

/// Read-only result of one synthesis pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredBundle {
    pub config: ApiServerConfig,
    /// configmap name -> key -> content
    pub objects: BTreeMap<String, BTreeMap<String, String>>,
    pub fingerprint: String,
    /// Observations that were ignored in favour of the previous value.
    pub fallbacks: Vec<String>,
}

impl DesiredBundle {
    pub fn config_maps(&self) -> Vec<ConfigMap> {
        self.objects
            .iter()
            .map(|(name, data)| {
                let mut data = data.clone();
                data.insert(FINGERPRINT_KEY.to_string(), self.fingerprint.clone());
                ConfigMap {
                    data,
                    ..ConfigMap::new(ObjectMeta::named(name.clone()))
                }
            })
            .collect()
    }
}

/// Fingerprint of the bundle `config_map` was published with, if any.
pub fn bundle_fingerprint(config_map: &ConfigMap) -> Option<&str> {
    config_map.data.get(FINGERPRINT_KEY).map(String::as_str)
}

/// Computes the desired configuration and pod manifest. `previous` is the
/// last published configuration and supplies values for unusable
/// observations.
pub fn synthesize(
    assets: &dyn AssetProvider,
    spec: &OperatorSpecFields,
    observed: &ObservedFacts,
    previous: Option<&ApiServerConfig>,
) -> Result<DesiredBundle, BundleError> {
    let merged = merge_config(&assets.default_config(), observed, &spec.overrides, previous)?;
    let pod = assets.pod_manifest(&merged.config)?;

    let config_json = serde_json::to_string_pretty(&merged.config)
        .map_err(|err| BundleError::Render(err.to_string()))?;
    let pod_json =
        serde_json::to_string_pretty(&pod).map_err(|err| BundleError::Render(err.to_string()))?;

    let mut objects = BTreeMap::new();
    objects.insert(
        CONFIG_MAP.to_string(),
        BTreeMap::from([(CONFIG_KEY.to_string(), config_json)]),
    );
    objects.insert(
        POD_CONFIG_MAP.to_string(),
        BTreeMap::from([
            (POD_KEY.to_string(), pod_json),
            (
                FORCE_REDEPLOYMENT_KEY.to_string(),
                spec.force_redeployment_reason.clone(),
            ),
            (
                VERSION_KEY.to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
        ]),
    );

    Ok(DesiredBundle {
        config: merged.config,
        fingerprint: fingerprint(&objects),
        objects,
        fallbacks: merged.fallbacks,
    })
}

fn fingerprint(objects: &BTreeMap<String, BTreeMap<String, String>>) -> String {
    let mut hasher = Sha1::new();
    for (name, data) in objects {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Parses the configuration published in the `config` configmap.
pub fn published_config(config_map: &ConfigMap) -> Option<ApiServerConfig> {
    config_map
        .data
        .get(CONFIG_KEY)
        .and_then(|raw| serde_json::from_str(raw).ok())
}
