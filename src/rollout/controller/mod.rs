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

pub mod error;
pub mod installer;
pub mod nodes;
pub mod orchestrator;
pub mod pruner;
pub mod reconcile;
pub mod revision;
pub mod runtime;
pub mod stall;
pub mod status;
pub mod synthesizer;

use crate::rollout::bundle::assets::DefaultAssets;
use crate::rollout::config::RolloutSettings;
use crate::rollout::k8s::store::Client;
use crate::rollout::logger::log_info;

use installer::{InstallerExecutor, InstallerTemplate, RunningRevisionReporter};
use orchestrator::NodeRolloutController;
use pruner::RevisionPruner;
use revision::RevisionController;
use runtime::{spawn_controller, LoopSettings};
use stall::StallDetector;
use synthesizer::BundleSynthesizer;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Host directories the node-side controllers write to.
#[derive(Debug, Clone)]
pub struct ControllerPaths {
    pub resource_root: PathBuf,
    pub manifest_dir: PathBuf,
}

/// Starts every rollout controller loop. The installer executor only runs
/// tasks for `settings.node_name` when set, and the running revision reporter
/// only runs in that case.
pub fn spawn_all(
    client: &Client,
    settings: &RolloutSettings,
    paths: &ControllerPaths,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let loop_settings = LoopSettings::from(settings);
    let assets = Arc::new(DefaultAssets::new(settings.termination_grace_period));
    let template = InstallerTemplate::new(&settings.pod_bundle_name, &paths.resource_root);

    let mut handles = vec![
        spawn_controller(
            Arc::new(BundleSynthesizer::new(assets)),
            client.clone(),
            synthesizer::WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ),
        spawn_controller(
            Arc::new(RevisionController::new()),
            client.clone(),
            revision::WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ),
        spawn_controller(
            Arc::new(NodeRolloutController::new(template)),
            client.clone(),
            orchestrator::WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ),
        spawn_controller(
            Arc::new(StallDetector::new(settings.stall_threshold())),
            client.clone(),
            stall::WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ),
        spawn_controller(
            Arc::new(RevisionPruner::new(
                settings.revision_history_limit,
                &paths.resource_root,
                &settings.pod_bundle_name,
            )),
            client.clone(),
            pruner::WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ),
        spawn_controller(
            Arc::new(InstallerExecutor::new(
                &paths.manifest_dir,
                settings.node_name.clone(),
            )),
            client.clone(),
            installer::WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ),
    ];

    if let Some(node_name) = &settings.node_name {
        handles.push(spawn_controller(
            Arc::new(RunningRevisionReporter::new(
                &paths.manifest_dir,
                &settings.pod_bundle_name,
                node_name,
            )),
            client.clone(),
            installer::REPORTER_WATCHED_PREFIXES,
            loop_settings,
            shutdown.child_token(),
        ));
    }

    let count = handles.len().to_string();
    log_info("controller", "Started rollout controllers", &[("count", &count)]);
    handles
}
