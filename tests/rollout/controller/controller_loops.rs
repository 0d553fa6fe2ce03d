use controlplane_rollout::rollout::controller::installer::InstallerTemplate;
use controlplane_rollout::rollout::controller::orchestrator::{self, NodeRolloutController};
use controlplane_rollout::rollout::controller::runtime::{spawn_controller, LoopSettings};
use controlplane_rollout::rollout::k8s::operator::NodeRolloutRecord;
use controlplane_rollout::rollout::k8s::StoreError;
use controlplane_rollout::rollout::observability::metrics;
use controlplane_rollout::rollout::test_support::{
    add_control_plane_node, fleet, installer, set_fleet, StoreOp, TestStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

fn fast_settings() -> LoopSettings {
    LoopSettings {
        resync_interval: Duration::from_millis(100),
        pass_deadline: Duration::from_secs(5),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
    }
}

fn controller(store: &TestStore) -> Arc<NodeRolloutController> {
    Arc::new(NodeRolloutController::new(InstallerTemplate::new(
        "kube-apiserver-pod",
        store.resource_root(),
    )))
}

async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn loop_reacts_to_store_changes() {
    let store = TestStore::new();
    let client = store.client().clone();
    let shutdown = CancellationToken::new();
    let handle = spawn_controller(
        controller(&store),
        client.clone(),
        orchestrator::WATCHED_PREFIXES,
        LoopSettings {
            resync_interval: Duration::from_secs(3600),
            ..fast_settings()
        },
        shutdown.clone(),
    );

    add_control_plane_node(&client, "master-0");
    set_fleet(&client, 1, vec![NodeRolloutRecord::new("master-0")]);
    assert!(wait_for(|| installer(&client, "master-0", 1).is_some()).await);
    assert_eq!(fleet(&client).node_statuses[0].target_revision, 1);

    shutdown.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker stops on shutdown")
        .expect("worker did not panic");
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let store = TestStore::new();
    let client = store.client().clone();
    add_control_plane_node(&client, "master-0");
    set_fleet(&client, 2, vec![NodeRolloutRecord::new("master-0")]);
    store.faults().fail(StoreOp::List, "/installerpods", 3, || StoreError::Conflict {
        key: "/installerpods".to_string(),
        expected: None,
        actual: None,
    });

    let shutdown = CancellationToken::new();
    let handle = spawn_controller(
        controller(&store),
        client.clone(),
        orchestrator::WATCHED_PREFIXES,
        LoopSettings {
            resync_interval: Duration::from_secs(3600),
            ..fast_settings()
        },
        shutdown.clone(),
    );

    assert!(wait_for(|| installer(&client, "master-0", 2).is_some()).await);
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn periodic_resync_runs_without_events() {
    let store = TestStore::new();
    let client = store.client().clone();
    add_control_plane_node(&client, "master-0");
    set_fleet(&client, 1, vec![NodeRolloutRecord::new("master-0")]);
    // The first passes fail permanently; only the ticker brings the loop back.
    store.faults().fail(StoreOp::List, "/nodes", 1, || {
        StoreError::Serialization("corrupt".to_string())
    });

    let shutdown = CancellationToken::new();
    let handle = spawn_controller(
        controller(&store),
        client.clone(),
        &[],
        fast_settings(),
        shutdown.clone(),
    );

    assert!(wait_for(|| installer(&client, "master-0", 1).is_some()).await);
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}

#[tokio::test]
async fn passes_over_deadline_are_reported() {
    let store = TestStore::new();
    let client = store.client().clone();
    let shutdown = CancellationToken::new();
    let handle = spawn_controller(
        controller(&store),
        client,
        orchestrator::WATCHED_PREFIXES,
        LoopSettings {
            pass_deadline: Duration::ZERO,
            ..fast_settings()
        },
        shutdown.clone(),
    );

    let timed_out = wait_for(|| {
        metrics::gather()
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .lines()
                    .any(|line| line.contains("node-rollout") && line.contains("timeout"))
            })
            .unwrap_or(false)
    })
    .await;
    assert!(timed_out);
    shutdown.cancel();
    let _ = timeout(Duration::from_secs(2), handle).await;
}
