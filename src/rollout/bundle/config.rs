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

//! Typed API server configuration and the rules that layer observed facts
//! and operator overrides on top of the built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerConfig {
    pub image: String,
    pub etcd_servers: Vec<String>,
    pub service_cluster_ip_range: Vec<String>,
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default)]
    pub feature_gates: BTreeMap<String, bool>,
    pub audit_profile: String,
    pub shutdown_delay_seconds: u64,
}

/// Facts reported by cluster observers. `None` means "not observed".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObservedFacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd_servers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_cluster_ip_range: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_allowed_origins: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_gates: Option<BTreeMap<String, bool>>,
}

/// Operator supplied settings; each present field wins over defaults and
/// observations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_allowed_origins: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_gates: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_delay_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPath {
    Image,
    EtcdServers,
    ServiceClusterIpRange,
    CorsAllowedOrigins,
    FeatureGates,
    AuditProfile,
    ShutdownDelaySeconds,
}

impl ConfigPath {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigPath::Image => "image",
            ConfigPath::EtcdServers => "etcdServers",
            ConfigPath::ServiceClusterIpRange => "serviceClusterIPRange",
            ConfigPath::CorsAllowedOrigins => "corsAllowedOrigins",
            ConfigPath::FeatureGates => "featureGates",
            ConfigPath::AuditProfile => "auditProfile",
            ConfigPath::ShutdownDelaySeconds => "shutdownDelaySeconds",
        }
    }

    fn read(self, config: &ApiServerConfig) -> FieldValue {
        match self {
            ConfigPath::Image => FieldValue::Text(config.image.clone()),
            ConfigPath::EtcdServers => FieldValue::List(config.etcd_servers.clone()),
            ConfigPath::ServiceClusterIpRange => {
                FieldValue::List(config.service_cluster_ip_range.clone())
            }
            ConfigPath::CorsAllowedOrigins => FieldValue::List(config.cors_allowed_origins.clone()),
            ConfigPath::FeatureGates => FieldValue::Flags(config.feature_gates.clone()),
            ConfigPath::AuditProfile => FieldValue::Text(config.audit_profile.clone()),
            ConfigPath::ShutdownDelaySeconds => FieldValue::Number(config.shutdown_delay_seconds),
        }
    }

    fn write(self, config: &mut ApiServerConfig, value: FieldValue) {
        match (self, value) {
            (ConfigPath::Image, FieldValue::Text(v)) => config.image = v,
            (ConfigPath::EtcdServers, FieldValue::List(v)) => config.etcd_servers = v,
            (ConfigPath::ServiceClusterIpRange, FieldValue::List(v)) => {
                config.service_cluster_ip_range = v
            }
            (ConfigPath::CorsAllowedOrigins, FieldValue::List(v)) => {
                config.cors_allowed_origins = v
            }
            (ConfigPath::FeatureGates, FieldValue::Flags(v)) => config.feature_gates = v,
            (ConfigPath::AuditProfile, FieldValue::Text(v)) => config.audit_profile = v,
            (ConfigPath::ShutdownDelaySeconds, FieldValue::Number(v)) => {
                config.shutdown_delay_seconds = v
            }
            // Sources only produce the shape matching their path.
            _ => {}
        }
    }

    fn validate(self, value: &FieldValue) -> Result<(), String> {
        match (self, value) {
            (ConfigPath::Image, FieldValue::Text(image)) | (ConfigPath::AuditProfile, FieldValue::Text(image)) => {
                if image.trim().is_empty() {
                    Err("must not be empty".to_string())
                } else {
                    Ok(())
                }
            }
            (ConfigPath::EtcdServers, FieldValue::List(servers)) => {
                if servers.is_empty() {
                    return Err("no etcd members observed".to_string());
                }
                match servers.iter().find(|s| !s.starts_with("https://")) {
                    Some(bad) => Err(format!("etcd endpoint '{}' is not https", bad)),
                    None => Ok(()),
                }
            }
            (ConfigPath::ServiceClusterIpRange, FieldValue::List(ranges)) => {
                if ranges.is_empty() {
                    return Err("no service network observed".to_string());
                }
                match ranges.iter().find(|r| !is_cidr(r)) {
                    Some(bad) => Err(format!("'{}' is not a CIDR", bad)),
                    None => Ok(()),
                }
            }
            (ConfigPath::CorsAllowedOrigins, FieldValue::List(origins)) => {
                if origins.iter().any(|o| o.trim().is_empty()) {
                    Err("empty origin".to_string())
                } else {
                    Ok(())
                }
            }
            (ConfigPath::FeatureGates, FieldValue::Flags(_)) => Ok(()),
            (ConfigPath::ShutdownDelaySeconds, FieldValue::Number(seconds)) => {
                if *seconds > 600 {
                    Err(format!("{}s exceeds 600s", seconds))
                } else {
                    Ok(())
                }
            }
            _ => Err("value has the wrong shape".to_string()),
        }
    }
}

fn is_cidr(value: &str) -> bool {
    match value.split_once('/') {
        Some((address, prefix)) => {
            address.parse::<std::net::IpAddr>().is_ok() && prefix.parse::<u8>().is_ok()
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldValue {
    Text(String),
    List(Vec<String>),
    Flags(BTreeMap<String, bool>),
    Number(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Observed,
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// The layer's value replaces the current one.
    Replace,
    /// List entries are appended after the current ones, skipping duplicates.
    Union,
    /// Map keys from the layer win; other keys are kept.
    Overlay,
}

/// Applied top to bottom. Observations come before overrides so an operator
/// can always pin a value.
pub const MERGE_RULES: &[(Source, ConfigPath, MergeRule)] = &[
    (Source::Observed, ConfigPath::EtcdServers, MergeRule::Replace),
    (
        Source::Observed,
        ConfigPath::ServiceClusterIpRange,
        MergeRule::Replace,
    ),
    (Source::Observed, ConfigPath::CorsAllowedOrigins, MergeRule::Union),
    (Source::Observed, ConfigPath::FeatureGates, MergeRule::Overlay),
    (Source::Override, ConfigPath::Image, MergeRule::Replace),
    (Source::Override, ConfigPath::CorsAllowedOrigins, MergeRule::Union),
    (Source::Override, ConfigPath::FeatureGates, MergeRule::Overlay),
    (Source::Override, ConfigPath::AuditProfile, MergeRule::Replace),
    (
        Source::Override,
        ConfigPath::ShutdownDelaySeconds,
        MergeRule::Replace,
    ),
];

/// Paths that must end up valid for the configuration to be usable.
const REQUIRED_PATHS: &[ConfigPath] = &[
    ConfigPath::Image,
    ConfigPath::EtcdServers,
    ConfigPath::ServiceClusterIpRange,
];

fn observed_value(facts: &ObservedFacts, path: ConfigPath) -> Option<FieldValue> {
    match path {
        ConfigPath::EtcdServers => facts.etcd_servers.clone().map(FieldValue::List),
        ConfigPath::ServiceClusterIpRange => {
            facts.service_cluster_ip_range.clone().map(FieldValue::List)
        }
        ConfigPath::CorsAllowedOrigins => facts.cors_allowed_origins.clone().map(FieldValue::List),
        ConfigPath::FeatureGates => facts.feature_gates.clone().map(FieldValue::Flags),
        _ => None,
    }
}

fn override_value(overrides: &ConfigOverrides, path: ConfigPath) -> Option<FieldValue> {
    match path {
        ConfigPath::Image => overrides.image.clone().map(FieldValue::Text),
        ConfigPath::CorsAllowedOrigins => {
            overrides.cors_allowed_origins.clone().map(FieldValue::List)
        }
        ConfigPath::FeatureGates => overrides.feature_gates.clone().map(FieldValue::Flags),
        ConfigPath::AuditProfile => overrides.audit_profile.clone().map(FieldValue::Text),
        ConfigPath::ShutdownDelaySeconds => {
            overrides.shutdown_delay_seconds.map(FieldValue::Number)
        }
        _ => None,
    }
}

fn merge(current: FieldValue, incoming: FieldValue, rule: MergeRule) -> FieldValue {
    match (rule, current, incoming) {
        (MergeRule::Union, FieldValue::List(mut current), FieldValue::List(incoming)) => {
            for entry in incoming {
                if !current.contains(&entry) {
                    current.push(entry);
                }
            }
            FieldValue::List(current)
        }
        (MergeRule::Overlay, FieldValue::Flags(mut current), FieldValue::Flags(incoming)) => {
            current.extend(incoming);
            FieldValue::Flags(current)
        }
        (_, _, incoming) => incoming,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// A required path has no valid value from any layer nor from the
    /// previous configuration.
    MissingRequired { path: &'static str, reason: String },
    Render(String),
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleError::MissingRequired { path, reason } => {
                write!(f, "required configuration {} is unavailable: {}", path, reason)
            }
            BundleError::Render(msg) => write!(f, "failed to render bundle: {}", msg),
        }
    }
}

impl std::error::Error for BundleError {}

/// Result of layering. `fallbacks` lists observations that were ignored in
/// favour of the previous value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedConfig {
    pub config: ApiServerConfig,
    pub fallbacks: Vec<String>,
}

/// Layers `observed` then `overrides` onto `defaults` following
/// [`MERGE_RULES`].
///
/// A missing or invalid observation keeps the value from `previous` (the
/// last configuration that was published) when there is one, and the default
/// otherwise. Invalid overrides are reported as fallbacks the same way.
pub fn merge_config(
    defaults: &ApiServerConfig,
    observed: &ObservedFacts,
    overrides: &ConfigOverrides,
    previous: Option<&ApiServerConfig>,
) -> Result<MergedConfig, BundleError> {
    let mut config = defaults.clone();
    let mut fallbacks = Vec::new();

    for (source, path, rule) in MERGE_RULES {
        let incoming = match source {
            Source::Observed => observed_value(observed, *path),
            Source::Override => override_value(overrides, *path),
        };
        let candidate = incoming.map(|value| merge(path.read(&config), value, *rule));
        match candidate {
            Some(value) => match path.validate(&value) {
                Ok(()) => path.write(&mut config, value),
                Err(reason) => {
                    fallbacks.push(format!("{}: {}", path.as_str(), reason));
                    if let Some(previous) = previous {
                        path.write(&mut config, path.read(previous));
                    }
                }
            },
            None if *source == Source::Observed => {
                if let Some(previous) = previous {
                    path.write(&mut config, path.read(previous));
                }
            }
            None => {}
        }
    }

    for path in REQUIRED_PATHS {
        if let Err(reason) = path.validate(&path.read(&config)) {
            return Err(BundleError::MissingRequired {
                path: path.as_str(),
                reason,
            });
        }
    }

    Ok(MergedConfig { config, fallbacks })
}
