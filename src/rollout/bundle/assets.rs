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

use super::config::{ApiServerConfig, BundleError};
use crate::rollout::k8s::meta::ObjectMeta;
use crate::rollout::k8s::pod::{StaticContainer, StaticPodManifest, StaticPodSpec};

use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_IMAGE: &str = "registry.k8s.io/kube-apiserver:v1.30.0";
const CONFIG_MOUNT: &str = "/etc/kubernetes/static-pod-resources/configmaps/config/config.json";

/// Source of the built-in configuration defaults and the pod template.
pub trait AssetProvider: Send + Sync {
    fn default_config(&self) -> ApiServerConfig;

    /// Renders the pod that runs `config`. The revision label is stamped later
    /// by the installer.
    fn pod_manifest(&self, config: &ApiServerConfig) -> Result<StaticPodManifest, BundleError>;
}

/// Compiled-in assets.
#[derive(Debug, Clone)]
pub struct DefaultAssets {
    termination_grace_period: Duration,
}

impl DefaultAssets {
    pub fn new(termination_grace_period: Duration) -> Self {
        Self {
            termination_grace_period,
        }
    }
}

impl AssetProvider for DefaultAssets {
    fn default_config(&self) -> ApiServerConfig {
        ApiServerConfig {
            image: DEFAULT_IMAGE.to_string(),
            etcd_servers: Vec::new(),
            service_cluster_ip_range: vec!["10.96.0.0/12".to_string()],
            cors_allowed_origins: vec![
                "//127\\.0\\.0\\.1(:|$)".to_string(),
                "//localhost(:|$)".to_string(),
            ],
            feature_gates: BTreeMap::new(),
            audit_profile: "Default".to_string(),
            shutdown_delay_seconds: 70,
        }
    }

    fn pod_manifest(&self, config: &ApiServerConfig) -> Result<StaticPodManifest, BundleError> {
        let grace = self.termination_grace_period.as_secs();
        if config.shutdown_delay_seconds >= grace {
            return Err(BundleError::Render(format!(
                "shutdown delay {}s must be shorter than the termination grace period {}s",
                config.shutdown_delay_seconds, grace
            )));
        }

        let mut args = vec![
            format!("--config={}", CONFIG_MOUNT),
            format!("--etcd-servers={}", config.etcd_servers.join(",")),
            format!(
                "--service-cluster-ip-range={}",
                config.service_cluster_ip_range.join(",")
            ),
            format!("--shutdown-delay-duration={}s", config.shutdown_delay_seconds),
            format!("--audit-profile={}", config.audit_profile),
        ];
        if !config.cors_allowed_origins.is_empty() {
            args.push(format!(
                "--cors-allowed-origins={}",
                config.cors_allowed_origins.join(",")
            ));
        }
        if !config.feature_gates.is_empty() {
            let gates: Vec<String> = config
                .feature_gates
                .iter()
                .map(|(gate, enabled)| format!("{}={}", gate, enabled))
                .collect();
            args.push(format!("--feature-gates={}", gates.join(",")));
        }

        Ok(StaticPodManifest {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta::named("kube-apiserver").with_label("app", "kube-apiserver"),
            spec: StaticPodSpec {
                host_network: true,
                termination_grace_period_seconds: grace,
                containers: vec![StaticContainer {
                    name: "kube-apiserver".to_string(),
                    image: config.image.clone(),
                    command: vec!["kube-apiserver".to_string()],
                    args,
                }],
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_args_from_config() {
        let assets = DefaultAssets::new(Duration::from_secs(135));
        let mut config = assets.default_config();
        config.etcd_servers = vec!["https://a:2379".to_string(), "https://b:2379".to_string()];
        config
            .feature_gates
            .insert("APIPriority".to_string(), false);

        let pod = assets.pod_manifest(&config).expect("render");
        let container = &pod.spec.containers[0];
        assert_eq!(container.image, DEFAULT_IMAGE);
        assert!(container
            .args
            .contains(&"--etcd-servers=https://a:2379,https://b:2379".to_string()));
        assert!(container
            .args
            .contains(&"--feature-gates=APIPriority=false".to_string()));
        assert_eq!(pod.spec.termination_grace_period_seconds, 135);
    }

    #[test]
    fn shutdown_delay_must_fit_grace_period() {
        let assets = DefaultAssets::new(Duration::from_secs(60));
        let config = assets.default_config();
        assert!(matches!(
            assets.pod_manifest(&config),
            Err(BundleError::Render(_))
        ));
    }
}
