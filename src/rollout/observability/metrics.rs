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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static LATEST_AVAILABLE_REVISION: OnceLock<IntGauge> = OnceLock::new();
static NODE_CURRENT_REVISION: OnceLock<IntGaugeVec> = OnceLock::new();
static INSTALLER_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONDITION_DEGRADED: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("controlplane_rollout".to_string()), None)
            .expect("failed to initialise rollout metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register rollout metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation passes grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "reconcile_duration_seconds",
            "Latency distribution for controller reconciliation passes",
        )
        .subsystem("controller")
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

fn latest_available_revision() -> &'static IntGauge {
    LATEST_AVAILABLE_REVISION.get_or_init(|| {
        let gauge = IntGauge::new(
            "latest_available_revision",
            "Highest revision materialized for rollout",
        )
        .expect("failed to build latest revision gauge");
        register_collector(gauge)
    })
}

fn node_current_revision() -> &'static IntGaugeVec {
    NODE_CURRENT_REVISION.get_or_init(|| {
        let opts = Opts::new(
            "node_current_revision",
            "Revision each control-plane node last installed successfully",
        );
        let gauge = IntGaugeVec::new(opts, &["node"])
            .expect("failed to build node revision gauge");
        register_collector(gauge)
    })
}

fn installer_outcomes_total() -> &'static IntCounterVec {
    INSTALLER_OUTCOMES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "installer_outcomes_total",
            "Installer task outcomes folded into node records",
        );
        let counter = IntCounterVec::new(opts, &["outcome"])
            .expect("failed to build installer outcome counter");
        register_collector(counter)
    })
}

fn condition_degraded() -> &'static IntGaugeVec {
    CONDITION_DEGRADED.get_or_init(|| {
        let opts = Opts::new(
            "condition_degraded",
            "Whether a degraded condition is currently true",
        );
        let gauge = IntGaugeVec::new(opts, &["condition"])
            .expect("failed to build degraded condition gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControllerReconcileResult {
    Success,
    Error,
    Timeout,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Error => "error",
            ControllerReconcileResult::Timeout => "timeout",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstallerOutcome {
    Succeeded,
    Failed,
    Missing,
}

impl InstallerOutcome {
    fn as_label(self) -> &'static str {
        match self {
            InstallerOutcome::Succeeded => "succeeded",
            InstallerOutcome::Failed => "failed",
            InstallerOutcome::Missing => "missing",
        }
    }
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    elapsed: Duration,
) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn set_latest_available_revision(revision: u64) {
    latest_available_revision().set(i64::try_from(revision).unwrap_or(i64::MAX));
}

pub fn set_node_current_revision(node: &str, revision: u64) {
    node_current_revision()
        .with_label_values(&[node])
        .set(i64::try_from(revision).unwrap_or(i64::MAX));
}

pub fn clear_node(node: &str) {
    let _ = node_current_revision().remove_label_values(&[node]);
}

pub fn record_installer_outcome(outcome: InstallerOutcome) {
    installer_outcomes_total()
        .with_label_values(&[outcome.as_label()])
        .inc();
}

pub fn set_condition_degraded(condition: &str, degraded: bool) {
    condition_degraded()
        .with_label_values(&[condition])
        .set(if degraded { 1 } else { 0 });
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
