use controlplane_rollout::rollout::bundle::assets::DefaultAssets;
use controlplane_rollout::rollout::bundle::config::ObservedFacts;
use controlplane_rollout::rollout::bundle::{CONFIG_KEY, POD_KEY};
use controlplane_rollout::rollout::controller::installer::{
    InstallerExecutor, InstallerTemplate, RunningRevisionReporter,
};
use controlplane_rollout::rollout::controller::orchestrator::NodeRolloutController;
use controlplane_rollout::rollout::controller::reconcile::Reconciler;
use controlplane_rollout::rollout::controller::revision::RevisionController;
use controlplane_rollout::rollout::controller::stall::StallDetector;
use controlplane_rollout::rollout::controller::status::{ConditionReason, ConditionType};
use controlplane_rollout::rollout::controller::synthesizer::BundleSynthesizer;
use controlplane_rollout::rollout::k8s::meta::ObjectMeta;
use controlplane_rollout::rollout::k8s::operator::{
    NodeRolloutRecord, ObservedConfig, OperatorSpec, RolloutStatus, CLUSTER,
};
use controlplane_rollout::rollout::k8s::{
    Client, ConfigMap, InstallerPhase, InstallerPod, Node, Secret, StoreError,
};
use controlplane_rollout::rollout::test_support::{
    add_control_plane_node, finish_installer, fleet, installer, record, seed_sources,
    seed_sources_with_reason, set_fleet, set_running_revision, test_observed, StoreOp, TestStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const BUNDLE: &str = "kube-apiserver-pod";
const GRACE: Duration = Duration::from_secs(135);
const STALL_THRESHOLD: Duration = Duration::from_secs(195);

fn orchestrator(store: &TestStore) -> NodeRolloutController {
    NodeRolloutController::new(InstallerTemplate::new(BUNDLE, store.resource_root()))
}

fn at_revision(name: &str, current: u64) -> NodeRolloutRecord {
    NodeRolloutRecord {
        current_revision: current,
        ..NodeRolloutRecord::new(name)
    }
}

fn transitioning(status: &RolloutStatus) -> Vec<String> {
    status
        .node_statuses
        .iter()
        .filter(|r| r.is_transitioning())
        .map(|r| r.node_name.clone())
        .collect()
}

fn fleet_at_three(store: &TestStore) {
    let client = store.client();
    for name in ["a", "b", "c"] {
        add_control_plane_node(client, name);
    }
    set_fleet(
        client,
        4,
        vec![at_revision("a", 3), at_revision("b", 3), at_revision("c", 3)],
    );
}

#[test]
fn scenario_first_node_transitions_alone() {
    let store = TestStore::new();
    let client = store.client();
    fleet_at_three(&store);

    orchestrator(&store).reconcile_and_apply(client).expect("pass");

    let status = fleet(client);
    assert_eq!(transitioning(&status), vec!["a"]);
    assert_eq!(record(client, "a").target_revision, 4);
    assert_eq!(record(client, "b").target_revision, 0);
    assert_eq!(record(client, "c").target_revision, 0);
    let task = installer(client, "a", 4).expect("installer for a");
    assert_eq!(task.phase(), InstallerPhase::Pending);
    assert!(installer(client, "b", 4).is_none());

    // A pending installer holds the whole fleet.
    orchestrator(&store).reconcile_and_apply(client).expect("pass");
    assert_eq!(transitioning(&fleet(client)), vec!["a"]);
    assert!(installer(client, "b", 4).is_none());
}

#[test]
fn scenario_failed_installer_quarantines_revision() {
    let store = TestStore::new();
    let client = store.client();
    fleet_at_three(&store);
    let controller = orchestrator(&store);

    controller.reconcile_and_apply(client).expect("start a");
    finish_installer(client, "a", 4, InstallerPhase::Failed, &["etcd unreachable"]);
    controller.reconcile_and_apply(client).expect("fold a");

    let a = record(client, "a");
    assert_eq!(a.last_failed_revision, 4);
    assert_eq!(a.target_revision, 3);
    assert_eq!(a.current_revision, 3);
    assert_eq!(a.last_failed_revision_errors, vec!["etcd unreachable"]);
    assert!(a.last_failed_time.is_some());

    let degraded = fleet(client)
        .condition(ConditionType::NodeInstallerDegraded.as_str())
        .cloned()
        .expect("degraded condition");
    assert!(degraded.is_true());
    assert!(degraded.message.contains("[a]"));

    controller.reconcile_and_apply(client).expect("start b");
    assert_eq!(transitioning(&fleet(client)), vec!["b"]);
    assert!(installer(client, "b", 4).is_some());
}

#[test]
fn scenario_removed_node_mid_transition() {
    let store = TestStore::new();
    let client = store.client();
    fleet_at_three(&store);
    let controller = orchestrator(&store);

    controller.reconcile_and_apply(client).expect("start a");
    assert!(client.delete::<Node>("a").expect("delete node"));
    controller.reconcile_and_apply(client).expect("drop a");

    let status = fleet(client);
    assert!(status.record("a").is_none());
    assert_eq!(status.node_statuses.len(), 2);
    assert_eq!(transitioning(&status), vec!["b"]);
}

#[test]
fn scenario_new_node_joins_idle_at_the_end() {
    let store = TestStore::new();
    let client = store.client();
    fleet_at_three(&store);
    let controller = orchestrator(&store);
    controller.reconcile_and_apply(client).expect("start a");

    add_control_plane_node(client, "aa");
    client
        .create(&Node {
            metadata: ObjectMeta::named("worker-0"),
            ..Node::default()
        })
        .expect("worker node");
    controller.reconcile_and_apply(client).expect("track new node");

    let names: Vec<String> = fleet(client)
        .node_statuses
        .into_iter()
        .map(|r| r.node_name)
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "aa"]);
    let joined = record(client, "aa");
    assert_eq!(joined.current_revision, 0);
    assert_eq!(joined.target_revision, 0);
}

#[test]
fn scenario_failed_revision_is_never_retargeted() {
    let store = TestStore::new();
    let client = store.client();
    fleet_at_three(&store);
    let controller = orchestrator(&store);

    for _ in 0..12 {
        controller.reconcile_and_apply(client).expect("pass");
        let status = fleet(client);
        assert!(transitioning(&status).len() <= 1);
        for record in &status.node_statuses {
            assert!(
                !(record.last_failed_revision == 4 && record.target_revision == 4),
                "{} re-targeted a failed revision",
                record.node_name
            );
        }
        if let Some(node) = transitioning(&status).first() {
            finish_installer(client, node, 4, InstallerPhase::Failed, &[]);
        }
    }

    let status = fleet(client);
    assert!(status.node_statuses.iter().all(|r| r.last_failed_revision == 4));
    assert!(status.node_statuses.iter().all(|r| r.current_revision == 3));

    // A newer revision lifts the quarantine.
    set_fleet(client, 5, status.node_statuses.clone());
    controller.reconcile_and_apply(client).expect("pass");
    assert_eq!(record(client, "a").target_revision, 5);
}

#[test]
fn scenario_vanished_installer_counts_as_failure() {
    let store = TestStore::new();
    let client = store.client();
    fleet_at_three(&store);
    let controller = orchestrator(&store);

    controller.reconcile_and_apply(client).expect("start a");
    let name = installer(client, "a", 4).expect("installer").metadata.name;
    client.delete::<InstallerPod>(&name).expect("delete installer");
    controller.reconcile_and_apply(client).expect("fold a");

    let a = record(client, "a");
    assert_eq!(a.last_failed_revision, 4);
    assert_eq!(a.last_failed_revision_errors.len(), 1);
    assert!(a.last_failed_revision_errors[0].contains(&name));
}

#[test]
fn scenario_stalled_node_raises_degraded() {
    let store = TestStore::new();
    let client = store.client();
    add_control_plane_node(client, "a");
    set_running_revision(client, "a", 4);
    set_fleet(client, 5, vec![at_revision("a", 4)]);

    let controller = orchestrator(&store);
    controller.reconcile_and_apply(client).expect("start a");
    let mut task = installer(client, "a", 5).expect("installer");
    task.status.phase = InstallerPhase::Succeeded;
    task.status.completion_time = Some(chrono::Utc::now() - chrono::Duration::seconds(600));
    client.update(&task).expect("complete installer");

    StallDetector::new(STALL_THRESHOLD)
        .reconcile_and_apply(client)
        .expect("detect");
    let condition = fleet(client)
        .condition(ConditionType::RolloutDegraded.as_str())
        .cloned()
        .expect("condition");
    assert!(condition.is_true());
    assert_eq!(condition.reason, "NodeRevisionStalled");
    assert!(condition.message.contains("node a"));
    assert!(condition.message.contains("revision 4"));
    assert!(condition.message.contains("revision 5"));

    // Bookkeeping moving on does not clear it; only the node catching up does.
    controller.reconcile_and_apply(client).expect("fold a");
    StallDetector::new(STALL_THRESHOLD)
        .reconcile_and_apply(client)
        .expect("detect");
    assert!(fleet(client)
        .condition(ConditionType::RolloutDegraded.as_str())
        .map(|c| c.is_true())
        .unwrap_or(false));

    set_running_revision(client, "a", 5);
    StallDetector::new(STALL_THRESHOLD)
        .reconcile_and_apply(client)
        .expect("detect");
    assert!(!fleet(client)
        .condition(ConditionType::RolloutDegraded.as_str())
        .map(|c| c.is_true())
        .unwrap_or(true));
}

#[test]
fn scenario_revisions_increase_only_on_drift() {
    let store = TestStore::new();
    let client = store.client();
    seed_sources(client);
    let revisions = RevisionController::new();

    revisions.reconcile_and_apply(client).expect("first revision");
    assert_eq!(fleet(client).latest_available_revision, 1);
    revisions.reconcile_and_apply(client).expect("no drift");
    revisions.reconcile_and_apply(client).expect("no drift");
    assert_eq!(fleet(client).latest_available_revision, 1);

    seed_sources_with_reason(client, "rotate certificates");
    revisions.reconcile_and_apply(client).expect("drift");
    let status = fleet(client);
    assert_eq!(status.latest_available_revision, 2);
    assert!(status.latest_available_revision_reason.contains("apiserver-pod"));

    // A restarted process continues from the stored counter.
    let restarted = store.reopen();
    RevisionController::new()
        .reconcile_and_apply(&restarted)
        .expect("no drift after restart");
    assert_eq!(fleet(&restarted).latest_available_revision, 2);
    seed_sources_with_reason(&restarted, "rotate again");
    RevisionController::new()
        .reconcile_and_apply(&restarted)
        .expect("drift after restart");
    assert_eq!(fleet(&restarted).latest_available_revision, 3);
    assert!(restarted
        .get::<ConfigMap>("revision-status-3")
        .expect("get")
        .is_some());
}

#[test]
fn scenario_partial_copy_does_not_claim_revision() {
    let store = TestStore::new();
    let client = store.client();
    seed_sources(client);
    store.faults().fail(StoreOp::Create, "/secrets/etcd-client-", 1, || {
        StoreError::Serialization("injected".to_string())
    });

    let revisions = RevisionController::new();
    assert!(revisions.reconcile_and_apply(client).is_err());
    let status = fleet(client);
    assert_eq!(status.latest_available_revision, 0);
    assert!(status
        .condition(ConditionType::RevisionControllerDegraded.as_str())
        .map(|c| c.is_true())
        .unwrap_or(false));

    revisions.reconcile_and_apply(client).expect("retry");
    let status = fleet(client);
    assert_eq!(status.latest_available_revision, 1);
    assert!(!status
        .condition(ConditionType::RevisionControllerDegraded.as_str())
        .map(|c| c.is_true())
        .unwrap_or(true));
}

fn revision_condition(client: &Client) -> Option<(bool, String)> {
    fleet(client)
        .condition(ConditionType::RevisionControllerDegraded.as_str())
        .map(|c| (c.is_true(), c.reason.clone()))
}

#[test]
fn scenario_source_deleted_before_copy_does_not_claim_revision() {
    let store = TestStore::new();
    let client = store.client();
    seed_sources(client);

    let revisions = RevisionController::new();
    let plan = revisions
        .reconcile(client)
        .expect("decide")
        .expect("plan");
    assert!(client.delete::<Secret>("etcd-client").expect("delete secret"));

    assert!(revisions.apply(client, plan).is_err());
    assert_eq!(fleet(client).latest_available_revision, 0);
    for name in ["config-1", "apiserver-pod-1", "revision-status-1"] {
        assert!(client.get::<ConfigMap>(name).expect("get").is_none(), "{name}");
    }
    assert!(client.get::<Secret>("etcd-client-1").expect("get").is_none());
    assert_eq!(
        revision_condition(client),
        Some((true, ConditionReason::RevisionSourceMissing.as_str().to_string()))
    );
}

#[test]
fn scenario_missing_source_raises_condition_until_restored() {
    let store = TestStore::new();
    let client = store.client();
    seed_sources(client);
    let revisions = RevisionController::new();
    revisions.reconcile_and_apply(client).expect("first revision");

    assert!(client.delete::<Secret>("etcd-client").expect("delete secret"));
    assert!(revisions.reconcile_and_apply(client).is_err());
    assert_eq!(
        revision_condition(client),
        Some((true, ConditionReason::RevisionSourceMissing.as_str().to_string()))
    );

    seed_sources(client);
    revisions.reconcile_and_apply(client).expect("restored");
    assert_eq!(fleet(client).latest_available_revision, 1);
    assert_eq!(
        revision_condition(client).map(|(degraded, _)| degraded),
        Some(false)
    );
}

#[test]
fn scenario_partially_published_bundle_is_not_cut() {
    let store = TestStore::new();
    let client = store.client();
    client
        .create(&ObservedConfig {
            metadata: ObjectMeta::named(CLUSTER),
            facts: test_observed(),
        })
        .expect("observed config");
    client
        .create(&Secret::new(ObjectMeta::named("etcd-client")).with_entry("tls.crt", b"certificate"))
        .expect("etcd secret");

    let synthesizer = BundleSynthesizer::new(Arc::new(DefaultAssets::new(GRACE)));
    let revisions = RevisionController::new();
    synthesizer.reconcile_and_apply(client).expect("publish");
    revisions.reconcile_and_apply(client).expect("first revision");
    assert_eq!(fleet(client).latest_available_revision, 1);

    client
        .apply(&ObservedConfig {
            metadata: ObjectMeta::named(CLUSTER),
            facts: ObservedFacts {
                etcd_servers: Some(vec!["https://10.0.0.9:2379".to_string()]),
                ..ObservedFacts::default()
            },
        })
        .expect("observed config");
    store.faults().fail(StoreOp::Update, "/configmaps/config", 1, || {
        StoreError::Io("injected".into())
    });

    assert!(synthesizer.reconcile_and_apply(client).is_err());
    let pod = client
        .get::<ConfigMap>("apiserver-pod")
        .expect("get")
        .expect("published pod");
    assert!(pod.data[POD_KEY].contains("10.0.0.9"));

    assert!(revisions.reconcile_and_apply(client).is_err());
    assert_eq!(fleet(client).latest_available_revision, 1);
    assert!(client.get::<ConfigMap>("apiserver-pod-2").expect("get").is_none());

    synthesizer.reconcile_and_apply(client).expect("publish retry");
    revisions.reconcile_and_apply(client).expect("second revision");
    assert_eq!(fleet(client).latest_available_revision, 2);
    let config = client
        .get::<ConfigMap>("config-2")
        .expect("get")
        .expect("config copy");
    let pod = client
        .get::<ConfigMap>("apiserver-pod-2")
        .expect("get")
        .expect("pod copy");
    assert!(config.data[CONFIG_KEY].contains("10.0.0.9"));
    assert!(pod.data[POD_KEY].contains("10.0.0.9"));
}

struct Host {
    name: &'static str,
    executor: InstallerExecutor,
    reporter: RunningRevisionReporter,
}

impl Host {
    fn new(store: &TestStore, name: &'static str) -> Self {
        let manifests: PathBuf = store.manifest_dir().join(name);
        Self {
            name,
            executor: InstallerExecutor::new(&manifests, Some(name.to_string())),
            reporter: RunningRevisionReporter::new(&manifests, BUNDLE, name),
        }
    }
}

fn converge(store: &TestStore, hosts: &[Host], passes: usize) {
    let client: &Client = store.client();
    let synthesizer = BundleSynthesizer::new(Arc::new(DefaultAssets::new(GRACE)));
    let revisions = RevisionController::new();
    let controller = orchestrator(store);
    let stall = StallDetector::new(STALL_THRESHOLD);
    for _ in 0..passes {
        synthesizer.reconcile_and_apply(client).expect("synthesize");
        revisions.reconcile_and_apply(client).expect("revision");
        controller.reconcile_and_apply(client).expect("orchestrate");
        assert!(transitioning(&fleet(client)).len() <= 1);
        for host in hosts {
            host.executor.reconcile_and_apply(client).expect("install");
            host.reporter.reconcile_and_apply(client).expect("report");
        }
        stall.reconcile_and_apply(client).expect("stall");
    }
}

#[test]
fn scenario_end_to_end_rollout() {
    let store = TestStore::new();
    let client = store.client();
    client
        .create(&ObservedConfig {
            metadata: ObjectMeta::named(CLUSTER),
            facts: test_observed(),
        })
        .expect("observed config");
    client
        .create(&Secret::new(ObjectMeta::named("etcd-client"))
            .with_entry("tls.crt", b"certificate"))
        .expect("etcd secret");
    let hosts = [Host::new(&store, "master-0"), Host::new(&store, "master-1")];
    for host in &hosts {
        add_control_plane_node(client, host.name);
    }

    converge(&store, &hosts, 6);
    let status = fleet(client);
    assert_eq!(status.latest_available_revision, 1);
    for host in &hosts {
        assert_eq!(record(client, host.name).current_revision, 1);
        let node = client.get::<Node>(host.name).expect("get").expect("node");
        assert_eq!(node.status.running_revision, Some(1));
    }
    assert!(store
        .resource_root()
        .join("kube-apiserver-pod-1/configmaps/config/config.json")
        .is_file());
    let progressing = status
        .condition(ConditionType::NodeInstallerProgressing.as_str())
        .cloned()
        .expect("progressing");
    assert!(!progressing.is_true());

    let mut spec = client
        .get::<OperatorSpec>(CLUSTER)
        .expect("get")
        .unwrap_or(OperatorSpec {
            metadata: ObjectMeta::named(CLUSTER),
            ..OperatorSpec::default()
        });
    spec.spec.force_redeployment_reason = "rotate".to_string();
    client.apply(&spec).expect("force redeployment");

    converge(&store, &hosts, 6);
    assert_eq!(fleet(client).latest_available_revision, 2);
    for host in &hosts {
        assert_eq!(record(client, host.name).current_revision, 2);
    }
    assert!(!fleet(client)
        .condition(ConditionType::RolloutDegraded.as_str())
        .map(|c| c.is_true())
        .unwrap_or(false));
}
