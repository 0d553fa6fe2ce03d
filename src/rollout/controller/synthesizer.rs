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

//! Publishes the desired bundle as the unsuffixed `config` and
//! `apiserver-pod` configmaps the revision controller compares against.

use crate::rollout::bundle::assets::AssetProvider;
use crate::rollout::bundle::config::{ApiServerConfig, ObservedFacts};
use crate::rollout::bundle::{
    published_config, synthesize, DesiredBundle, CONFIG_MAP, POD_CONFIG_MAP,
};
use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::reconcile::{ReconcileData, Reconciler};
use crate::rollout::controller::status::{
    set_condition, update_status, ConditionReason, ConditionType,
};
use crate::rollout::k8s::configmap::ConfigMap;
use crate::rollout::k8s::operator::{
    ObservedConfig, OperatorSpec, OperatorSpecFields, OperatorStatus, CLUSTER,
};
use crate::rollout::k8s::store::{Client, Resource};
use crate::rollout::logger::{log_info, log_warn};

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

const COMPONENT: &str = "bundle-synthesizer";
pub const WATCHED_PREFIXES: &[&str] = &[
    OperatorSpec::PREFIX,
    ObservedConfig::PREFIX,
    ConfigMap::PREFIX,
];

pub struct SynthesisInput {
    pub spec: OperatorSpecFields,
    pub observed: ObservedFacts,
    /// Configuration currently published, used as the fallback for unusable
    /// observations.
    pub previous: Option<ApiServerConfig>,
}

/// Desired configmaps as currently stored, by name.
pub struct PublishedBundle {
    pub config_maps: BTreeMap<String, ConfigMap>,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisPlan {
    /// Configmaps whose content differs from the stored copy.
    Publish {
        changed: Vec<ConfigMap>,
        fallbacks: Vec<String>,
        clear_degraded: bool,
    },
    /// The bundle could not be computed. Stored content is left alone.
    Degraded { message: String },
}

pub struct BundleSynthesizer {
    assets: Arc<dyn AssetProvider>,
}

impl BundleSynthesizer {
    pub fn new(assets: Arc<dyn AssetProvider>) -> Self {
        Self { assets }
    }
}

fn changed_config_maps(
    bundle: &DesiredBundle,
    published: &BTreeMap<String, ConfigMap>,
) -> Vec<ConfigMap> {
    bundle
        .config_maps()
        .into_iter()
        .filter(|desired| {
            published
                .get(&desired.metadata.name)
                .map(|stored| !stored.content_equals(desired))
                .unwrap_or(true)
        })
        .collect()
}

impl Reconciler for BundleSynthesizer {
    type Desired = SynthesisInput;
    type Observed = PublishedBundle;
    type Plan = SynthesisPlan;
    type Error = RolloutError;

    fn kind(&self) -> &'static str {
        COMPONENT
    }

    fn fetch(
        &self,
        client: &Client,
    ) -> Result<Option<ReconcileData<SynthesisInput, PublishedBundle>>, RolloutError> {
        let spec = client
            .get::<OperatorSpec>(CLUSTER)?
            .map(|object| object.spec)
            .unwrap_or_default();
        let observed = client
            .get::<ObservedConfig>(CLUSTER)?
            .map(|object| object.facts)
            .unwrap_or_default();

        let mut config_maps = BTreeMap::new();
        for name in [CONFIG_MAP, POD_CONFIG_MAP] {
            if let Some(map) = client.get::<ConfigMap>(name)? {
                config_maps.insert(name.to_string(), map);
            }
        }
        let previous = config_maps.get(CONFIG_MAP).and_then(published_config);
        let degraded = client
            .get::<OperatorStatus>(CLUSTER)?
            .and_then(|object| {
                object
                    .status
                    .condition(ConditionType::BundleSynthesisDegraded.as_str())
                    .map(|condition| condition.is_true())
            })
            .unwrap_or(false);

        Ok(Some(ReconcileData {
            desired: SynthesisInput {
                spec,
                observed,
                previous,
            },
            observed: PublishedBundle {
                config_maps,
                degraded,
            },
        }))
    }

    fn diff(
        &self,
        desired: &SynthesisInput,
        observed: &PublishedBundle,
    ) -> Result<SynthesisPlan, RolloutError> {
        match synthesize(
            self.assets.as_ref(),
            &desired.spec,
            &desired.observed,
            desired.previous.as_ref(),
        ) {
            Ok(bundle) => Ok(SynthesisPlan::Publish {
                changed: changed_config_maps(&bundle, &observed.config_maps),
                fallbacks: bundle.fallbacks,
                clear_degraded: observed.degraded,
            }),
            Err(err) => Ok(SynthesisPlan::Degraded {
                message: err.to_string(),
            }),
        }
    }

    fn apply(&self, client: &Client, plan: SynthesisPlan) -> Result<(), RolloutError> {
        match plan {
            SynthesisPlan::Publish {
                changed,
                fallbacks,
                clear_degraded,
            } => {
                for fallback in &fallbacks {
                    log_warn(
                        COMPONENT,
                        "Ignoring unusable observation; keeping previous value",
                        &[("detail", fallback)],
                    );
                }
                for map in &changed {
                    client.apply(map)?;
                    log_info(
                        COMPONENT,
                        "Published desired configmap",
                        &[("configmap", &map.metadata.name)],
                    );
                }
                if clear_degraded {
                    update_status(client, |status| {
                        set_condition(
                            status,
                            ConditionType::BundleSynthesisDegraded,
                            false,
                            ConditionReason::AsExpected,
                            "",
                            Utc::now(),
                        )
                    })?;
                }
                Ok(())
            }
            SynthesisPlan::Degraded { message } => {
                log_warn(
                    COMPONENT,
                    "Desired bundle unavailable; keeping published content",
                    &[("error", &message)],
                );
                update_status(client, |status| {
                    set_condition(
                        status,
                        ConditionType::BundleSynthesisDegraded,
                        true,
                        ConditionReason::SynthesisFailed,
                        &message,
                        Utc::now(),
                    )
                })?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollout::bundle::assets::DefaultAssets;
    use crate::rollout::controller::status::read_status;
    use crate::rollout::k8s::meta::ObjectMeta;
    use crate::rollout::test_support::TestStore;
    use std::time::Duration;

    fn synthesizer() -> BundleSynthesizer {
        BundleSynthesizer::new(Arc::new(DefaultAssets::new(Duration::from_secs(135))))
    }

    fn observe(client: &Client, servers: &[&str]) {
        client
            .apply(&ObservedConfig {
                metadata: ObjectMeta::named(CLUSTER),
                facts: ObservedFacts {
                    etcd_servers: Some(servers.iter().map(|s| s.to_string()).collect()),
                    ..ObservedFacts::default()
                },
            })
            .expect("observed config");
    }

    #[test]
    fn publishes_then_stays_quiet() {
        let store = TestStore::new();
        let client = store.client();
        observe(client, &["https://10.0.0.1:2379"]);

        let synthesizer = synthesizer();
        synthesizer.reconcile_and_apply(client).expect("first pass");
        let config = client
            .get::<ConfigMap>(CONFIG_MAP)
            .expect("get")
            .expect("published");
        assert!(client.get::<ConfigMap>(POD_CONFIG_MAP).expect("get").is_some());

        match synthesizer.reconcile(client).expect("second pass") {
            Some(SynthesisPlan::Publish { changed, .. }) => assert!(changed.is_empty()),
            other => panic!("unexpected plan {:?}", other),
        }
        synthesizer.reconcile_and_apply(client).expect("third pass");
        let again = client
            .get::<ConfigMap>(CONFIG_MAP)
            .expect("get")
            .expect("published");
        assert_eq!(config.metadata.resource_version, again.metadata.resource_version);
    }

    #[test]
    fn synthesis_failure_keeps_content_and_raises_condition() {
        let store = TestStore::new();
        let client = store.client();
        let synthesizer = synthesizer();

        synthesizer.reconcile_and_apply(client).expect("pass");
        assert!(client.get::<ConfigMap>(CONFIG_MAP).expect("get").is_none());
        let status = read_status(client).expect("status");
        let condition = status
            .condition("BundleSynthesisDegraded")
            .expect("condition");
        assert!(condition.is_true());
        assert_eq!(condition.reason, "SynthesisFailed");

        observe(client, &["https://10.0.0.1:2379"]);
        synthesizer.reconcile_and_apply(client).expect("recovered pass");
        let status = read_status(client).expect("status");
        assert!(!status
            .condition("BundleSynthesisDegraded")
            .expect("condition")
            .is_true());
    }

    #[test]
    fn lost_etcd_observation_reuses_published_value() {
        let store = TestStore::new();
        let client = store.client();
        observe(client, &["https://10.0.0.1:2379"]);
        let synthesizer = synthesizer();
        synthesizer.reconcile_and_apply(client).expect("first pass");

        observe(client, &[]);
        synthesizer.reconcile_and_apply(client).expect("second pass");
        let config = client
            .get::<ConfigMap>(CONFIG_MAP)
            .expect("get")
            .expect("published");
        let published = published_config(&config).expect("parse");
        assert_eq!(published.etcd_servers, vec!["https://10.0.0.1:2379"]);
    }
}
