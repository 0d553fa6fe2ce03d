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

use controlplane_rollout::rollout::controller::{spawn_all, ControllerPaths};
use controlplane_rollout::rollout::k8s::{Client, KeyspaceStore};
use controlplane_rollout::rollout::logger::{log_error, log_info, set_log_format, set_min_level};
use controlplane_rollout::rollout::observability::tracing as rollout_tracing;
use controlplane_rollout::rollout::{Config, RolloutSettings};

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "main";

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let settings = RolloutSettings::from_env()?;
    set_log_format(settings.log_format);
    set_min_level(settings.log_level);
    rollout_tracing::init();

    let keyspace = Config::Keyspace.verify()?;
    Config::LockFile.verify()?;
    let paths = ControllerPaths {
        resource_root: Config::ResourceRoot.verify()?,
        manifest_dir: Config::ManifestDir.verify()?,
    };
    let store = KeyspaceStore::open(&keyspace, Config::LockFile.get_path())?;
    let client = Client::new(Arc::new(store));

    let keyspace_text = keyspace.display().to_string();
    let node = settings.node_name.clone().unwrap_or_else(|| "*".to_string());
    log_info(
        COMPONENT,
        "Starting control-plane rollout",
        &[("keyspace", &keyspace_text), ("node", &node)],
    );

    let shutdown = CancellationToken::new();
    let handles = spawn_all(&client, &settings, &paths, &shutdown);

    tokio::signal::ctrl_c().await?;
    log_info(COMPONENT, "Shutdown requested", &[]);
    shutdown.cancel();
    for handle in handles {
        if let Err(err) = handle.await {
            let error = err.to_string();
            log_error(COMPONENT, "Controller task panicked", &[("error", &error)]);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let error = err.to_string();
            log_error(COMPONENT, "Rollout process failed", &[("error", &error)]);
            ExitCode::FAILURE
        }
    }
}
