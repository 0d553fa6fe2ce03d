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

//! Loop machinery shared by every controller: a single-slot work queue fed by
//! store change notifications and a periodic resync, drained by exactly one
//! worker.

use crate::rollout::config::RolloutSettings;
use crate::rollout::controller::error::RolloutError;
use crate::rollout::controller::reconcile::Reconciler;
use crate::rollout::k8s::store::Client;
use crate::rollout::logger::{log_debug, log_error, log_warn};
use crate::rollout::observability::metrics::{self, ControllerReconcileResult};
use crate::rollout::observability::tracing::{carry_context, with_span};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller-runtime";

/// The only work item: "run a reconcile pass".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileRequest;

/// Queue holding at most one pending request. Enqueueing while a request is
/// already pending is a no-op, so bursts of notifications collapse into one
/// pass.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

struct WorkQueueInner {
    sender: mpsc::Sender<ReconcileRequest>,
    receiver: Mutex<mpsc::Receiver<ReconcileRequest>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    /// Returns `true` when a new request was queued, `false` when one was
    /// already pending.
    pub fn enqueue(&self) -> bool {
        self.inner.sender.try_send(ReconcileRequest).is_ok()
    }

    pub async fn next(&self) -> Option<ReconcileRequest> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub resync_interval: Duration,
    pub pass_deadline: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&RolloutSettings> for LoopSettings {
    fn from(settings: &RolloutSettings) -> Self {
        Self {
            resync_interval: settings.resync_interval,
            pass_deadline: settings.pass_deadline,
            backoff_initial: settings.backoff_initial,
            backoff_max: settings.backoff_max,
        }
    }
}

/// Doubling delay between retries of failed passes.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Runs one pass under the deadline on the blocking pool, recording metrics
/// and a span.
pub async fn run_pass<R>(
    reconciler: Arc<R>,
    client: &Client,
    deadline: Duration,
) -> Result<(), RolloutError>
where
    R: Reconciler<Error = RolloutError> + Send + Sync + 'static,
{
    let kind = reconciler.kind();
    let started = Instant::now();
    let bounded = client.with_deadline(started + deadline);
    let joined = with_span("controller", kind, async move {
        let pass = carry_context(move || reconciler.reconcile_and_apply(&bounded));
        tokio::task::spawn_blocking(pass).await
    })
    .await;
    let result = joined.unwrap_or_else(|err| Err(RolloutError::Aborted(err.to_string())));

    let outcome = match &result {
        Ok(()) => ControllerReconcileResult::Success,
        Err(err) if err.is_deadline_exceeded() => ControllerReconcileResult::Timeout,
        Err(_) => ControllerReconcileResult::Error,
    };
    metrics::record_controller_reconcile(kind, outcome, started.elapsed());
    result
}

/// Spawns the watcher, the resync ticker and the single worker for
/// `reconciler`. Passes run strictly one at a time. Every task stops when
/// `shutdown` is cancelled; the returned handle completes once the worker has
/// exited.
pub fn spawn_controller<R>(
    reconciler: Arc<R>,
    client: Client,
    watched_prefixes: &'static [&'static str],
    settings: LoopSettings,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    R: Reconciler<Error = RolloutError> + Send + Sync + 'static,
{
    let queue = WorkQueue::new();
    queue.enqueue();

    spawn_watcher(
        client.clone(),
        queue.clone(),
        watched_prefixes,
        shutdown.clone(),
    );
    spawn_ticker(queue.clone(), settings.resync_interval, shutdown.clone());

    tokio::spawn(async move {
        let kind = reconciler.kind();
        let mut backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = queue.next() => {
                    if item.is_none() {
                        break;
                    }
                }
            }

            match run_pass(Arc::clone(&reconciler), &client, settings.pass_deadline).await {
                Ok(()) => backoff.reset(),
                Err(err) if err.is_transient() => {
                    let delay = backoff.next_delay();
                    let message = err.to_string();
                    let delay_text = humantime::format_duration(delay).to_string();
                    let summary = if err.is_deadline_exceeded() {
                        "Reconcile pass exceeded its deadline; retrying"
                    } else {
                        "Reconcile pass failed; retrying"
                    };
                    log_warn(
                        COMPONENT,
                        summary,
                        &[("controller", kind), ("error", &message), ("retry_in", &delay_text)],
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    queue.enqueue();
                }
                Err(err) => {
                    backoff.reset();
                    let message = err.to_string();
                    log_error(
                        COMPONENT,
                        "Reconcile pass failed",
                        &[("controller", kind), ("error", &message)],
                    );
                }
            }
        }
        log_debug(COMPONENT, "Controller stopped", &[("controller", kind)]);
    })
}

fn spawn_watcher(
    client: Client,
    queue: WorkQueue,
    watched_prefixes: &'static [&'static str],
    shutdown: CancellationToken,
) {
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => {
                        if watched_prefixes.iter().any(|prefix| event.matches_prefix(prefix)) {
                            queue.enqueue();
                        }
                    }
                    // Missed notifications: a full pass re-reads everything.
                    Err(RecvError::Lagged(_)) => {
                        queue.enqueue();
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }
    });
}

fn spawn_ticker(queue: WorkQueue, period: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial pass is already queued.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    queue.enqueue();
                }
            }
        }
    });
}
