//! Parallel execution of an action catalog against a cluster.
//!
//! The catalog is expanded into an [`ActionGraph`] and run with Kahn's
//! algorithm: instances whose dependencies have all succeeded go into a
//! ready queue, and a pool of at most `max_workers` tasks drains it. A
//! failed instance is never retried; everything downstream of it is
//! skipped, while unrelated parts of the graph keep running.

pub mod graph;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};

use crate::action::{Action, ActionId};
use crate::cluster::Cluster;
use crate::error::{CastleError, Result};
use crate::log::{error_chain, print_to_all, CastleLog};
use crate::node::Node;
use crate::shutdown::ReturnCode;

pub use graph::{ActionGraph, InstanceKey};

pub const DEFAULT_MAX_WORKERS: usize = 8;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipCause {
    /// The named instance failed somewhere upstream.
    Upstream { failed: InstanceKey },
    /// The run was aborted before this instance was dispatched.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub key: InstanceKey,
    pub status: ActionStatus,
    pub error: Option<String>,
    pub skip_cause: Option<SkipCause>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl InstanceReport {
    fn skipped(key: InstanceKey, cause: SkipCause) -> Self {
        Self {
            key,
            status: ActionStatus::Skipped,
            error: None,
            skip_cause: Some(cause),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Outcome of every scheduled instance, in graph order.
#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    instances: Vec<InstanceReport>,
}

impl ScheduleReport {
    pub fn instances(&self) -> &[InstanceReport] {
        &self.instances
    }

    pub fn instance(&self, action: &ActionId, node: Option<&str>) -> Option<&InstanceReport> {
        self.instances
            .iter()
            .find(|r| &r.key.action == action && r.key.node.as_deref() == node)
    }

    /// Aggregate status of an action over all of its instances: failed if
    /// any instance failed, else skipped if any was skipped, else succeeded.
    pub fn status(&self, action: &ActionId) -> Option<ActionStatus> {
        self.instances
            .iter()
            .filter(|r| &r.key.action == action)
            .map(|r| r.status)
            .max()
    }

    pub fn by_action(&self) -> BTreeMap<ActionId, ActionStatus> {
        let mut out: BTreeMap<ActionId, ActionStatus> = BTreeMap::new();
        for r in &self.instances {
            out.entry(r.key.action.clone())
                .and_modify(|s| *s = (*s).max(r.status))
                .or_insert(r.status);
        }
        out
    }

    pub fn count(&self, status: ActionStatus) -> usize {
        self.instances.iter().filter(|r| r.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        self.instances.iter().all(|r| r.status == ActionStatus::Succeeded)
    }

    pub fn return_code(&self) -> ReturnCode {
        if self.is_success() {
            ReturnCode::Success
        } else {
            ReturnCode::Failure
        }
    }
}

// ---------------------------------------------------------------------------
// AbortSignal
// ---------------------------------------------------------------------------

/// Stops a running scheduler from dispatching new work. Work already in
/// flight finishes normally.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// ActionScheduler
// ---------------------------------------------------------------------------

/// What a full run produced: the schedule report (or the error that kept
/// the schedule from starting), the return code handed to the shutdown
/// hooks, and the result of unwinding them.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Result<ScheduleReport>,
    pub return_code: ReturnCode,
    pub shutdown: Result<()>,
}

#[derive(Debug, Clone)]
pub struct ActionScheduler {
    max_workers: usize,
    abort: AbortSignal,
}

impl Default for ActionScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

enum Slot {
    Pending,
    Running,
    Done(InstanceReport),
}

type Finished = (usize, Instant, Instant, Result<()>);

impl ActionScheduler {
    pub fn new(max_workers: usize) -> Self {
        Self::with_abort(max_workers, AbortSignal::new())
    }

    pub fn with_abort(max_workers: usize, abort: AbortSignal) -> Self {
        Self {
            max_workers: max_workers.max(1),
            abort,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Run `actions` against `cluster` until nothing is left to dispatch.
    ///
    /// Returns `Err` only when the graph cannot be built; in that case no
    /// action runs. Per-instance failures are reported in the
    /// [`ScheduleReport`].
    pub async fn run(
        &self,
        cluster: &Arc<Cluster>,
        actions: Vec<Arc<dyn Action>>,
    ) -> Result<ScheduleReport> {
        let graph = match ActionGraph::build(&actions, &cluster.node_names()) {
            Ok(graph) => graph,
            Err(e) => {
                cluster
                    .cluster_log()
                    .error_with("*** Unable to schedule actions", &e);
                return Err(e);
            }
        };
        let nodes: Vec<Option<Arc<Node>>> = graph
            .instances
            .iter()
            .map(|key| key.node.as_deref().map(|name| cluster.node(name)).transpose())
            .collect::<Result<_>>()?;

        tracing::info!(
            instances = graph.len(),
            max_workers = self.max_workers,
            "running action graph"
        );

        let mut slots: Vec<Slot> = (0..graph.len()).map(|_| Slot::Pending).collect();
        let mut in_degree = graph.in_degree.clone();
        let mut ready: BinaryHeap<(i32, Reverse<usize>)> = BinaryHeap::new();
        for (i, degree) in in_degree.iter().enumerate() {
            if *degree == 0 {
                ready.push((priority(&actions, &graph, i), Reverse(i)));
            }
        }

        let mut abort_rx = self.abort.subscribe();
        let mut aborted = false;
        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut spawned: HashMap<task::Id, (usize, Instant)> = HashMap::new();

        loop {
            if !aborted && self.abort.is_aborted() {
                aborted = true;
                cluster
                    .cluster_log()
                    .info("*** Aborting: no further actions will be started.");
            }
            if !aborted {
                while running.len() < self.max_workers {
                    let Some((_, Reverse(i))) = ready.pop() else {
                        break;
                    };
                    if !matches!(slots[i], Slot::Pending) {
                        continue;
                    }
                    slots[i] = Slot::Running;
                    let action = Arc::clone(&actions[graph.action_of[i]]);
                    let node = nodes[i].clone();
                    log_start(cluster, &graph.instances[i], node.as_deref());
                    let handle = running.spawn(run_instance(i, action, Arc::clone(cluster), node));
                    spawned.insert(handle.id(), (i, Instant::now()));
                }
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next_with_id() => match joined {
                    Some(Ok((id, finished))) => {
                        spawned.remove(&id);
                        self.complete(
                            cluster,
                            &graph,
                            &nodes,
                            &actions,
                            &mut slots,
                            &mut in_degree,
                            &mut ready,
                            finished,
                        );
                    }
                    // The task died outside the action's own panic guard.
                    Some(Err(e)) => match spawned.remove(&e.id()) {
                        Some((i, started)) => {
                            let error = CastleError::ActionFailed {
                                action: graph.instances[i].action.to_string(),
                                reason: format!("action task did not complete: {e}"),
                            };
                            self.complete(
                                cluster,
                                &graph,
                                &nodes,
                                &actions,
                                &mut slots,
                                &mut in_degree,
                                &mut ready,
                                (i, started, Instant::now(), Err(error)),
                            );
                        }
                        None => tracing::error!("unknown action task did not complete: {e}"),
                    },
                    None => {}
                },
                Ok(()) = abort_rx.changed(), if !aborted => {}
            }
        }

        let instances = slots
            .into_iter()
            .zip(graph.instances.iter())
            .zip(nodes.iter())
            .map(|((slot, key), node)| match slot {
                Slot::Done(report) => report,
                Slot::Pending => {
                    log_outcome(
                        cluster,
                        node.as_deref(),
                        &format!("*** Skipped {key}: the run was aborted."),
                    );
                    InstanceReport::skipped(key.clone(), SkipCause::Aborted)
                }
                Slot::Running => InstanceReport {
                    key: key.clone(),
                    status: ActionStatus::Failed,
                    error: Some("action task was lost before it reported".to_string()),
                    skip_cause: None,
                    started_at: None,
                    finished_at: None,
                },
            })
            .collect();
        let report = ScheduleReport { instances };

        let summary = format!(
            "*** Finished: {} succeeded, {} failed, {} skipped.",
            report.count(ActionStatus::Succeeded),
            report.count(ActionStatus::Failed),
            report.count(ActionStatus::Skipped),
        );
        cluster.cluster_log().info(&summary);
        tracing::info!(success = report.is_success(), "{}", summary.trim_start_matches("*** "));
        Ok(report)
    }

    /// Run the catalog, then unwind the cluster's shutdown hooks with the
    /// resulting return code. The hooks run even when the graph could not
    /// be built.
    pub async fn run_to_completion(
        &self,
        cluster: &Arc<Cluster>,
        actions: Vec<Arc<dyn Action>>,
    ) -> RunOutcome {
        let report = self.run(cluster, actions).await;
        let return_code = match &report {
            Ok(report) => report.return_code(),
            Err(_) => ReturnCode::Failure,
        };
        let shutdown = cluster.shutdown_manager().unwind(return_code).await;
        if let Err(e) = &shutdown {
            cluster.cluster_log().error_with("*** Shutdown hooks failed", e);
        }
        RunOutcome {
            report,
            return_code,
            shutdown,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        cluster: &Arc<Cluster>,
        graph: &ActionGraph,
        nodes: &[Option<Arc<Node>>],
        actions: &[Arc<dyn Action>],
        slots: &mut [Slot],
        in_degree: &mut [usize],
        ready: &mut BinaryHeap<(i32, Reverse<usize>)>,
        (i, started, finished, result): Finished,
    ) {
        let key = &graph.instances[i];
        let node = nodes[i].as_deref();
        match result {
            Ok(()) => {
                log_outcome(cluster, node, &format!("*** Finished {key}."));
                tracing::debug!(instance = %key, "action succeeded");
                slots[i] = Slot::Done(InstanceReport {
                    key: key.clone(),
                    status: ActionStatus::Succeeded,
                    error: None,
                    skip_cause: None,
                    started_at: Some(started),
                    finished_at: Some(finished),
                });
                for &d in &graph.dependents[i] {
                    in_degree[d] -= 1;
                    if in_degree[d] == 0 && matches!(slots[d], Slot::Pending) {
                        ready.push((priority(actions, graph, d), Reverse(d)));
                    }
                }
            }
            Err(e) => {
                let message = error_chain(&e);
                log_outcome(cluster, node, &format!("*** Failed {key}: {message}"));
                tracing::warn!(instance = %key, "action failed: {message}");
                slots[i] = Slot::Done(InstanceReport {
                    key: key.clone(),
                    status: ActionStatus::Failed,
                    error: Some(message),
                    skip_cause: None,
                    started_at: Some(started),
                    finished_at: Some(finished),
                });
                skip_downstream(cluster, graph, nodes, slots, i);
            }
        }
    }
}

/// Mark every pending instance reachable from `failed` as skipped.
fn skip_downstream(
    cluster: &Arc<Cluster>,
    graph: &ActionGraph,
    nodes: &[Option<Arc<Node>>],
    slots: &mut [Slot],
    failed: usize,
) {
    let failed_key = &graph.instances[failed];
    let mut stack: Vec<usize> = graph.dependents[failed].clone();
    while let Some(d) = stack.pop() {
        if !matches!(slots[d], Slot::Pending) {
            continue;
        }
        let key = &graph.instances[d];
        log_outcome(
            cluster,
            nodes[d].as_deref(),
            &format!("*** Skipped {key}: {failed_key} failed."),
        );
        slots[d] = Slot::Done(InstanceReport::skipped(
            key.clone(),
            SkipCause::Upstream {
                failed: failed_key.clone(),
            },
        ));
        stack.extend(graph.dependents[d].iter().copied());
    }
}

fn priority(actions: &[Arc<dyn Action>], graph: &ActionGraph, i: usize) -> i32 {
    actions[graph.action_of[i]].spec().priority
}

fn log_start(cluster: &Cluster, key: &InstanceKey, node: Option<&Node>) {
    let line = format!("*** Starting {key}.");
    cluster.cluster_log().debug(&line);
    if let Some(node) = node {
        node.log().info(&line);
    }
    tracing::debug!(instance = %key, "starting action");
}

fn log_outcome(cluster: &Cluster, node: Option<&Node>, line: &str) {
    let text = format!("{line}\n");
    let mut logs: Vec<&CastleLog> = vec![cluster.cluster_log()];
    if let Some(node) = node {
        logs.push(node.log());
    }
    print_to_all(&text, &logs);
}

async fn run_instance(
    i: usize,
    action: Arc<dyn Action>,
    cluster: Arc<Cluster>,
    node: Option<Arc<Node>>,
) -> Finished {
    let started = Instant::now();
    let result = AssertUnwindSafe(action.call(&cluster, node.as_ref()))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(CastleError::ActionFailed {
                action: action.id().to_string(),
                reason: format!("panicked: {}", panic_message(panic.as_ref())),
            })
        });
    (i, started, Instant::now(), result)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests;
