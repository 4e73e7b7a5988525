pub mod down;
pub mod status;
pub mod up;

use crate::output::{print_json, print_table};
use anyhow::Context;
use castle_core::action::Action;
use castle_core::cluster::Cluster;
use castle_core::config::{CastleConfig, WarnLevel};
use castle_core::environment::{CastleEnvironment, CLUSTER_LOG_NAME};
use castle_core::expand::FixedMapStringExpander;
use castle_core::node::Node;
use castle_core::role::DockerNodeRole;
use castle_core::scheduler::{
    AbortSignal, ActionScheduler, ActionStatus, ScheduleReport, SkipCause,
};
use castle_core::uplink::UplinkBackend;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Global options shared by every subcommand.
pub struct Options {
    pub working_dir: PathBuf,
    pub verbose: bool,
    pub max_workers: Option<usize>,
    pub vars: HashMap<String, String>,
    pub dry_run: bool,
    pub json: bool,
}

impl Options {
    fn backend(&self, config: &CastleConfig) -> UplinkBackend {
        if self.dry_run {
            UplinkBackend::Memory
        } else {
            UplinkBackend::Docker {
                binary: config.docker_binary.clone(),
                stop_timeout_secs: config.stop_timeout_secs,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cluster loading
// ---------------------------------------------------------------------------

pub fn load_config(env: &CastleEnvironment) -> anyhow::Result<CastleConfig> {
    let config = CastleConfig::load(env)
        .with_context(|| format!("failed to load {}", env.config_path().display()))?;
    let warnings = config.validate();
    for w in &warnings {
        let prefix = match w.level {
            WarnLevel::Warning => "warning",
            WarnLevel::Error => "error",
        };
        eprintln!("[{prefix}] {}", w.message);
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(config)
}

pub fn load_cluster(opts: &Options) -> anyhow::Result<(Arc<Cluster>, CastleConfig)> {
    let env = CastleEnvironment::new(&opts.working_dir);
    let config = load_config(&env)?;
    let debug = opts.verbose || config.debug;

    let cluster_log = env
        .create_castle_log(CLUSTER_LOG_NAME, debug)
        .context("failed to open the cluster log")?;
    let expander = FixedMapStringExpander::new(opts.vars.clone());
    let cluster = Cluster::load(env, &expander, &opts.backend(&config), cluster_log, debug)
        .context("failed to load the cluster")?;
    Ok((cluster, config))
}

/// Nodes that carry a docker role, in name order.
pub fn docker_nodes(cluster: &Cluster) -> Vec<Arc<Node>> {
    cluster
        .nodes()
        .into_iter()
        .filter(|n| n.role::<DockerNodeRole>().is_some())
        .collect()
}

// ---------------------------------------------------------------------------
// Running a catalog
// ---------------------------------------------------------------------------

/// Run `actions`, unwind the shutdown hooks and report. Ctrl-C stops new
/// actions from starting; the hooks still run. A second Ctrl-C exits at once.
pub fn execute(
    opts: &Options,
    cluster: &Arc<Cluster>,
    config: &CastleConfig,
    actions: Vec<Arc<dyn Action>>,
) -> anyhow::Result<()> {
    let scheduler =
        ActionScheduler::new(opts.max_workers.unwrap_or_else(|| config.effective_max_workers()));
    let abort = scheduler.abort_signal();

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let interrupt = tokio::spawn(handle_interrupts(tokio::signal::ctrl_c, abort, || {
            std::process::exit(130);
        }));
        let outcome = scheduler.run_to_completion(cluster, actions).await;
        interrupt.abort();
        outcome
    });
    cluster.close_logs();

    let report = outcome.report.context("failed to schedule actions")?;
    print_report(&report, opts.json)?;
    outcome.shutdown.context("cleanup after the run failed")?;

    if !report.is_success() {
        anyhow::bail!(
            "{} failed, {} skipped; see {} for details",
            report.count(ActionStatus::Failed),
            report.count(ActionStatus::Skipped),
            cluster
                .env()
                .node_log_path(CLUSTER_LOG_NAME)
                .display()
        );
    }
    Ok(())
}

/// The first signal aborts the run; a second one calls `force_exit`.
async fn handle_interrupts<S, F>(mut next_signal: S, abort: AbortSignal, force_exit: impl FnOnce())
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if next_signal().await.is_err() {
        return;
    }
    eprintln!("interrupted: waiting for running actions to finish (Ctrl-C again to exit now)");
    abort.abort();
    if next_signal().await.is_err() {
        return;
    }
    eprintln!("interrupted again: exiting without cleanup");
    force_exit();
}

fn status_label(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Succeeded => "succeeded",
        ActionStatus::Failed => "failed",
        ActionStatus::Skipped => "skipped",
    }
}

fn print_report(report: &ScheduleReport, json: bool) -> anyhow::Result<()> {
    if json {
        let instances: Vec<_> = report
            .instances()
            .iter()
            .map(|r| {
                let elapsed_ms = match (r.started_at, r.finished_at) {
                    (Some(s), Some(f)) => Some(f.duration_since(s).as_millis() as u64),
                    _ => None,
                };
                serde_json::json!({
                    "action": r.key.action.to_string(),
                    "node": r.key.node,
                    "status": r.status,
                    "error": r.error,
                    "skip_cause": r.skip_cause,
                    "elapsed_ms": elapsed_ms,
                })
            })
            .collect();
        return print_json(&serde_json::json!({
            "success": report.is_success(),
            "return_code": report.return_code(),
            "instances": instances,
        }));
    }

    if report.instances().is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }
    let rows = report
        .instances()
        .iter()
        .map(|r| {
            let detail = match (&r.error, &r.skip_cause) {
                (Some(e), _) => e.clone(),
                (None, Some(SkipCause::Upstream { failed })) => format!("{failed} failed"),
                (None, Some(SkipCause::Aborted)) => "aborted".to_string(),
                (None, None) => String::new(),
            };
            vec![
                r.key.action.to_string(),
                r.key.node.clone().unwrap_or_else(|| "-".to_string()),
                status_label(r.status).to_string(),
                detail,
            ]
        })
        .collect();
    print_table(&["ACTION", "NODE", "STATUS", "DETAIL"], rows);
    Ok(())
}
