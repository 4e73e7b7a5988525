use super::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use crate::action::{ActionSpec, DockerInitAction, TargetId};
use crate::environment::CastleEnvironment;
use crate::log::tests::SharedBuf;
use crate::role::{DockerNodeRole, RoleSet};
use crate::uplink::{MemoryUplink, Uplink};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    _dir: TempDir,
    cluster: Arc<Cluster>,
    cluster_out: SharedBuf,
    node_out: BTreeMap<String, SharedBuf>,
    uplinks: BTreeMap<String, MemoryUplink>,
}

fn fixture(nodes: &[(&str, bool)]) -> Fixture {
    let dir = TempDir::new().unwrap();
    let cluster_out = SharedBuf::default();
    let cluster = Cluster::new(
        CastleEnvironment::new(dir.path()),
        CastleLog::new("cluster", cluster_out.clone(), true),
    );
    let mut node_out = BTreeMap::new();
    let mut uplinks = BTreeMap::new();
    for (name, running) in nodes {
        let uplink = if *running {
            MemoryUplink::running(*name)
        } else {
            MemoryUplink::new(*name)
        };
        let out = SharedBuf::default();
        cluster
            .add_node(Node::new(
                *name,
                RoleSet::new().with(Arc::new(DockerNodeRole::new("confluentinc/cp-kafka"))),
                Arc::new(uplink.clone()),
                CastleLog::new(*name, out.clone(), false),
            ))
            .unwrap();
        node_out.insert(name.to_string(), out);
        uplinks.insert(name.to_string(), uplink);
    }
    Fixture {
        _dir: dir,
        cluster,
        cluster_out,
        node_out,
        uplinks,
    }
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

enum Behavior {
    Succeed,
    Fail,
    FailOn(&'static str),
    Panic,
    /// Completes, then panics when the finished future is dropped.
    PanicOnDrop,
    Abort(AbortSignal),
}

struct DropBomb;

impl std::future::Future for DropBomb {
    type Output = Result<()>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

impl Drop for DropBomb {
    fn drop(&mut self) {
        panic!("dropped after completing");
    }
}

struct TestAction {
    spec: ActionSpec,
    recorder: Recorder,
    behavior: Behavior,
    delay: Duration,
}

impl TestAction {
    fn new(ty: &str, targets: &[TargetId], nodes: &[&str], recorder: &Recorder) -> Self {
        Self {
            spec: ActionSpec::new(
                ActionId::new(ty, ""),
                targets.to_vec(),
                nodes.iter().map(|n| n.to_string()).collect(),
                0,
            ),
            recorder: recorder.clone(),
            behavior: Behavior::Succeed,
            delay: Duration::ZERO,
        }
    }

    fn priority(mut self, priority: i32) -> Self {
        self.spec.priority = priority;
        self
    }

    fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    fn arc(self) -> Arc<dyn Action> {
        Arc::new(self)
    }
}

impl Action for TestAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    fn call<'a>(
        &'a self,
        _cluster: &'a Arc<Cluster>,
        node: Option<&'a Arc<Node>>,
    ) -> BoxFuture<'a, Result<()>> {
        if matches!(self.behavior, Behavior::PanicOnDrop) {
            return Box::pin(DropBomb);
        }
        Box::pin(async move {
            let label = match node {
                Some(n) => format!("{}@{}", self.spec.id, n.name()),
                None => self.spec.id.to_string(),
            };
            self.recorder.calls.lock().unwrap().push(label);
            let now = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.recorder.active.fetch_sub(1, Ordering::SeqCst);

            let fail = || CastleError::ActionFailed {
                action: self.spec.id.to_string(),
                reason: "boom".to_string(),
            };
            match &self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(fail()),
                Behavior::FailOn(target) => match node {
                    Some(n) if n.name() == *target => Err(fail()),
                    _ => Ok(()),
                },
                Behavior::Panic => panic!("kaboom"),
                Behavior::PanicOnDrop => unreachable!(),
                Behavior::Abort(signal) => {
                    signal.abort();
                    Ok(())
                }
            }
        })
    }
}

fn id(ty: &str) -> ActionId {
    ActionId::new(ty, "")
}

fn on(ty: &str, node: &str) -> InstanceKey {
    InstanceKey::new(id(ty), Some(node.to_string()))
}

// ---------------------------------------------------------------------------
// Ordering and success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependency_runs_before_its_dependents() {
    let fx = fixture(&[("n1", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("a", &[], &["n1"], &recorder).delay_ms(10).arc(),
        TestAction::new("b", &[TargetId::any("a")], &["n1"], &recorder).arc(),
        TestAction::new("c", &[TargetId::any("a")], &["n1"], &recorder).arc(),
    ];
    let report = ActionScheduler::new(4).run(&fx.cluster, actions).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.return_code(), ReturnCode::Success);
    assert_eq!(report.status(&id("a")), Some(ActionStatus::Succeeded));
    assert_eq!(report.status(&id("b")), Some(ActionStatus::Succeeded));
    assert_eq!(report.status(&id("c")), Some(ActionStatus::Succeeded));

    let a_done = report.instance(&id("a"), Some("n1")).unwrap().finished_at.unwrap();
    for dep in ["b", "c"] {
        let started = report.instance(&id(dep), Some("n1")).unwrap().started_at.unwrap();
        assert!(a_done <= started, "{dep} started before a finished");
    }
    assert_eq!(recorder.calls()[0], "a@n1");
}

#[tokio::test]
async fn wildcard_dependency_waits_for_every_instance() {
    let fx = fixture(&[("n1", false), ("n2", false), ("n3", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("init", &[], &["n1", "n2", "n3"], &recorder).delay_ms(5).arc(),
        TestAction::new("start", &[TargetId::any("init")], &["n1", "n2"], &recorder).arc(),
    ];
    let report = ActionScheduler::new(8).run(&fx.cluster, actions).await.unwrap();
    assert!(report.is_success());

    let last_init = ["n1", "n2", "n3"]
        .iter()
        .map(|n| report.instance(&id("init"), Some(n)).unwrap().finished_at.unwrap())
        .max()
        .unwrap();
    for n in ["n1", "n2"] {
        let started = report.instance(&id("start"), Some(n)).unwrap().started_at.unwrap();
        assert!(last_init <= started);
    }
}

#[tokio::test]
async fn untargeted_action_runs_once_without_a_node() {
    let fx = fixture(&[("n1", false), ("n2", false)]);
    let recorder = Recorder::default();
    let report = ActionScheduler::default()
        .run(&fx.cluster, vec![TestAction::new("writeConf", &[], &[], &recorder).arc()])
        .await
        .unwrap();
    assert_eq!(recorder.calls(), vec!["writeConf"]);
    assert_eq!(report.instances().len(), 1);
    assert_eq!(report.instances()[0].key.node, None);
}

#[tokio::test]
async fn ready_ties_break_on_priority_then_catalog_order() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("low", &[], &[], &recorder).arc(),
        TestAction::new("high", &[], &[], &recorder).priority(5).arc(),
        TestAction::new("mid", &[], &[], &recorder).priority(1).arc(),
        TestAction::new("low2", &[], &[], &recorder).arc(),
    ];
    ActionScheduler::new(1).run(&fx.cluster, actions).await.unwrap();
    assert_eq!(recorder.calls(), vec!["high", "mid", "low", "low2"]);
}

#[tokio::test]
async fn worker_pool_is_bounded() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let actions: Vec<Arc<dyn Action>> = (0..6)
        .map(|i| {
            TestAction::new(&format!("job{i}"), &[], &[], &recorder)
                .delay_ms(20)
                .arc()
        })
        .collect();
    let report = ActionScheduler::new(2).run(&fx.cluster, actions).await.unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.calls().len(), 6);
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn zero_workers_still_makes_progress() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let scheduler = ActionScheduler::new(0);
    assert_eq!(scheduler.max_workers(), 1);
    let report = scheduler
        .run(&fx.cluster, vec![TestAction::new("a", &[], &[], &recorder).arc()])
        .await
        .unwrap();
    assert!(report.is_success());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_skips_every_transitive_dependent() {
    let fx = fixture(&[("n1", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("a", &[], &["n1"], &recorder).behavior(Behavior::Fail).arc(),
        TestAction::new("b", &[TargetId::any("a")], &["n1"], &recorder).arc(),
        TestAction::new("c", &[TargetId::any("a")], &["n1"], &recorder).arc(),
        TestAction::new("d", &[TargetId::any("b")], &["n1"], &recorder).arc(),
        TestAction::new("e", &[], &["n1"], &recorder).arc(),
    ];
    let report = ActionScheduler::new(1).run(&fx.cluster, actions).await.unwrap();

    assert_eq!(report.status(&id("a")), Some(ActionStatus::Failed));
    for skipped in ["b", "c", "d"] {
        let r = report.instance(&id(skipped), Some("n1")).unwrap();
        assert_eq!(r.status, ActionStatus::Skipped);
        assert_eq!(r.skip_cause, Some(SkipCause::Upstream { failed: on("a", "n1") }));
        assert!(r.started_at.is_none());
    }
    assert_eq!(report.status(&id("e")), Some(ActionStatus::Succeeded));
    assert!(!report.is_success());
    assert_eq!(report.return_code(), ReturnCode::Failure);
    assert_eq!(report.count(ActionStatus::Skipped), 3);

    let mut calls = recorder.calls();
    calls.sort();
    assert_eq!(calls, vec!["a@n1", "e@n1"]);

    let a = report.instance(&id("a"), Some("n1")).unwrap();
    assert!(a.error.as_deref().unwrap().contains("boom"));
}

#[tokio::test]
async fn outcomes_are_logged_with_instance_and_upstream() {
    let fx = fixture(&[("n1", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("a", &[], &["n1"], &recorder).behavior(Behavior::Fail).arc(),
        TestAction::new("b", &[TargetId::any("a")], &["n1"], &recorder).arc(),
    ];
    ActionScheduler::new(2).run(&fx.cluster, actions).await.unwrap();

    let cluster_log = fx.cluster_out.contents();
    assert!(cluster_log.contains("*** Starting a on n1."));
    assert!(cluster_log.contains("*** Failed a on n1: action a failed: boom"));
    assert!(cluster_log.contains("*** Skipped b on n1: a on n1 failed."));
    assert!(cluster_log.contains("*** Finished: 0 succeeded, 1 failed, 1 skipped."));

    let node_log = fx.node_out["n1"].contents();
    assert!(node_log.contains("*** Starting a on n1."));
    assert!(node_log.contains("*** Skipped b on n1"));
}

#[tokio::test]
async fn sibling_instances_still_run_but_action_is_failed() {
    let fx = fixture(&[("n1", false), ("n2", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("x", &[], &["n1", "n2"], &recorder)
            .behavior(Behavior::FailOn("n1"))
            .arc(),
        TestAction::new("y", &[TargetId::any("x")], &["n2"], &recorder).arc(),
    ];
    let report = ActionScheduler::new(4).run(&fx.cluster, actions).await.unwrap();

    assert_eq!(
        report.instance(&id("x"), Some("n2")).unwrap().status,
        ActionStatus::Succeeded
    );
    assert_eq!(report.status(&id("x")), Some(ActionStatus::Failed));
    assert_eq!(report.status(&id("y")), Some(ActionStatus::Skipped));
    assert_eq!(report.by_action().get(&id("x")), Some(&ActionStatus::Failed));
}

#[tokio::test]
async fn panicking_action_is_reported_as_failed() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("a", &[], &[], &recorder).behavior(Behavior::Panic).arc(),
        TestAction::new("b", &[TargetId::any("a")], &[], &recorder).arc(),
    ];
    let report = ActionScheduler::new(2).run(&fx.cluster, actions).await.unwrap();

    let a = report.instance(&id("a"), None).unwrap();
    assert_eq!(a.status, ActionStatus::Failed);
    assert!(a.error.as_deref().unwrap().contains("panicked: kaboom"));
    assert_eq!(report.status(&id("b")), Some(ActionStatus::Skipped));
}

#[tokio::test]
async fn task_dying_after_its_action_fails_the_instance() {
    let fx = fixture(&[("n1", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("a", &[], &["n1"], &recorder)
            .behavior(Behavior::PanicOnDrop)
            .arc(),
        TestAction::new("b", &[TargetId::any("a")], &["n1"], &recorder).arc(),
        TestAction::new("c", &[TargetId::any("b")], &["n1"], &recorder).arc(),
    ];
    let report = ActionScheduler::new(2).run(&fx.cluster, actions).await.unwrap();

    let a = report.instance(&id("a"), Some("n1")).unwrap();
    assert_eq!(a.status, ActionStatus::Failed);
    assert!(a.error.as_deref().unwrap().contains("dropped after completing"));
    for ty in ["b", "c"] {
        let r = report.instance(&id(ty), Some("n1")).unwrap();
        assert_eq!(r.status, ActionStatus::Skipped);
        assert_eq!(r.skip_cause, Some(SkipCause::Upstream { failed: on("a", "n1") }));
    }
    assert!(recorder.calls().is_empty());
    let log = fx.cluster_out.contents();
    assert!(log.contains("*** Failed a on n1"));
    assert!(!log.contains("the run was aborted"));
}

#[tokio::test]
async fn cycle_fails_before_anything_runs() {
    let fx = fixture(&[("n1", false)]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("free", &[], &["n1"], &recorder).arc(),
        TestAction::new("a", &[TargetId::any("b")], &["n1"], &recorder).arc(),
        TestAction::new("b", &[TargetId::any("a")], &["n1"], &recorder).arc(),
    ];
    let err = ActionScheduler::new(2).run(&fx.cluster, actions).await.unwrap_err();
    assert!(matches!(err, CastleError::DependencyCycle { .. }));
    assert!(recorder.calls().is_empty());
    assert!(fx.cluster_out.contents().contains("*** Unable to schedule actions"));
}

#[tokio::test]
async fn unresolved_dependency_fails_before_anything_runs() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let actions = vec![
        TestAction::new("free", &[], &[], &recorder).arc(),
        TestAction::new("a", &[TargetId::new("nope", "x")], &[], &recorder).arc(),
    ];
    let err = ActionScheduler::new(2).run(&fx.cluster, actions).await.unwrap_err();
    assert!(matches!(err, CastleError::UnresolvedDependency { .. }));
    assert!(recorder.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_stops_dispatch_and_reports_the_rest_as_aborted() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let signal = AbortSignal::new();
    let actions = vec![
        TestAction::new("first", &[], &[], &recorder)
            .priority(10)
            .behavior(Behavior::Abort(signal.clone()))
            .arc(),
        TestAction::new("second", &[], &[], &recorder).arc(),
        TestAction::new("third", &[TargetId::any("second")], &[], &recorder).arc(),
    ];
    let scheduler = ActionScheduler::with_abort(1, signal.clone());
    let report = scheduler.run(&fx.cluster, actions).await.unwrap();

    assert!(scheduler.abort_signal().is_aborted());
    assert_eq!(recorder.calls(), vec!["first"]);
    assert_eq!(report.status(&id("first")), Some(ActionStatus::Succeeded));
    for name in ["second", "third"] {
        let r = report.instance(&id(name), None).unwrap();
        assert_eq!(r.status, ActionStatus::Skipped);
        assert_eq!(r.skip_cause, Some(SkipCause::Aborted));
    }
    assert_eq!(report.return_code(), ReturnCode::Failure);
    assert!(fx.cluster_out.contents().contains("*** Aborting"));
}

#[tokio::test]
async fn abort_lets_in_flight_work_finish() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let signal = AbortSignal::new();
    let actions = vec![
        TestAction::new("slow", &[], &[], &recorder).delay_ms(30).arc(),
        TestAction::new("trigger", &[], &[], &recorder)
            .behavior(Behavior::Abort(signal.clone()))
            .arc(),
        TestAction::new("late", &[TargetId::any("slow")], &[], &recorder).arc(),
    ];
    let report = ActionScheduler::with_abort(2, signal)
        .run(&fx.cluster, actions)
        .await
        .unwrap();
    assert_eq!(report.status(&id("slow")), Some(ActionStatus::Succeeded));
    assert_eq!(report.status(&id("trigger")), Some(ActionStatus::Succeeded));
    assert_eq!(
        report.instance(&id("late"), None).unwrap().skip_cause,
        Some(SkipCause::Aborted)
    );
}

#[tokio::test]
async fn pre_aborted_scheduler_runs_nothing() {
    let fx = fixture(&[]);
    let recorder = Recorder::default();
    let signal = AbortSignal::new();
    signal.abort();
    let report = ActionScheduler::with_abort(4, signal)
        .run(&fx.cluster, vec![TestAction::new("a", &[], &[], &recorder).arc()])
        .await
        .unwrap();
    assert!(recorder.calls().is_empty());
    assert_eq!(report.count(ActionStatus::Skipped), 1);
}

// ---------------------------------------------------------------------------
// End to end with docker actions and shutdown hooks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_run_persists_cluster_and_keeps_nodes() {
    let fx = fixture(&[("broker1", false), ("broker2", false)]);
    let actions: Vec<Arc<dyn Action>> = vec![
        Arc::new(DockerInitAction::new("broker1")),
        Arc::new(DockerInitAction::new("broker2")),
    ];
    let outcome = ActionScheduler::new(4)
        .run_to_completion(&fx.cluster, actions)
        .await;

    assert_eq!(outcome.return_code, ReturnCode::Success);
    assert!(outcome.report.unwrap().is_success());
    outcome.shutdown.unwrap();
    assert!(fx.uplinks.values().all(|u| u.started()));
    assert!(fx.cluster.env().cluster_output_path().exists());
    assert!(fx.cluster.shutdown_manager().is_empty());
}

#[tokio::test]
async fn failed_run_tears_down_started_nodes() {
    let fx = fixture(&[("broker1", false)]);
    let recorder = Recorder::default();
    let actions: Vec<Arc<dyn Action>> = vec![
        Arc::new(DockerInitAction::new("broker1")),
        TestAction::new("configure", &[TargetId::new("dockerInit", "broker1")], &["broker1"], &recorder)
            .behavior(Behavior::Fail)
            .arc(),
    ];
    let outcome = ActionScheduler::new(2)
        .run_to_completion(&fx.cluster, actions)
        .await;

    assert_eq!(outcome.return_code, ReturnCode::Failure);
    outcome.shutdown.unwrap();
    let uplink = &fx.uplinks["broker1"];
    assert_eq!(uplink.startup_calls(), 1);
    assert_eq!(uplink.shutdown_calls(), 1);
    assert!(!uplink.started());
    assert!(fx.cluster_out.contents().contains("*** Terminated docker nodes."));
}

#[tokio::test]
async fn init_on_running_node_is_a_successful_no_op() {
    let fx = fixture(&[("broker1", true)]);
    let report = ActionScheduler::default()
        .run(&fx.cluster, vec![Arc::new(DockerInitAction::new("broker1"))])
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(fx.uplinks["broker1"].startup_calls(), 0);
    assert!(fx.cluster.shutdown_manager().is_empty());
    assert!(fx.node_out["broker1"]
        .contents()
        .contains("*** Skipping dockerInit, because the node is already running."));
}

#[tokio::test]
async fn graph_error_still_unwinds_hooks_with_failure() {
    let fx = fixture(&[("broker1", true)]);
    fx.cluster
        .shutdown_manager()
        .add_hook_if_missing(Arc::new(crate::action::DestroyDockerInstancesShutdownHook::new(
            &fx.cluster,
        )));
    let recorder = Recorder::default();
    let actions = vec![TestAction::new("a", &[TargetId::any("a")], &[], &recorder).arc()];
    let outcome = ActionScheduler::new(1)
        .run_to_completion(&fx.cluster, actions)
        .await;

    assert!(outcome.report.is_err());
    assert_eq!(outcome.return_code, ReturnCode::Failure);
    assert!(!fx.uplinks["broker1"].started());
}
