//! Actions that create and remove Docker-hosted nodes.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;

use super::{Action, ActionId, ActionSpec};
use crate::cluster::Cluster;
use crate::error::{CastleError, Result};
use crate::node::Node;
use crate::role::DockerNodeRole;
use crate::shutdown::{ReturnCode, ShutdownHook};

pub const DOCKER_INIT: &str = "dockerInit";
pub const DOCKER_DESTROY: &str = "dockerDestroy";

fn docker_node<'a>(spec: &ActionSpec, node: Option<&'a Arc<Node>>) -> Result<&'a Arc<Node>> {
    let node = node.ok_or_else(|| CastleError::ActionFailed {
        action: spec.id.to_string(),
        reason: "must run against a node".to_string(),
    })?;
    if node.role::<DockerNodeRole>().is_none() {
        return Err(CastleError::ActionFailed {
            action: spec.id.to_string(),
            reason: format!("node '{}' has no docker role", node.name()),
        });
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// DockerInitAction
// ---------------------------------------------------------------------------

/// Starts the Docker container for one node.
pub struct DockerInitAction {
    spec: ActionSpec,
}

impl DockerInitAction {
    pub fn new(node_name: &str) -> Self {
        Self {
            spec: ActionSpec::new(
                ActionId::new(DOCKER_INIT, node_name),
                Vec::new(),
                vec![node_name.to_string()],
                0,
            ),
        }
    }
}

impl Action for DockerInitAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    fn call<'a>(
        &'a self,
        cluster: &'a Arc<Cluster>,
        node: Option<&'a Arc<Node>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let node = docker_node(&self.spec, node)?;
            if node.uplink().started() {
                node.log().info(&format!(
                    "*** Skipping {DOCKER_INIT}, because the node is already running."
                ));
                return Ok(());
            }

            // A container must not outlive a failed run.
            cluster
                .shutdown_manager()
                .add_hook_if_missing(Arc::new(DestroyDockerInstancesShutdownHook::new(cluster)));

            node.uplink().startup().await?;

            cluster.persist().await?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// DockerDestroyAction
// ---------------------------------------------------------------------------

/// Stops and removes the Docker container for one node.
pub struct DockerDestroyAction {
    spec: ActionSpec,
}

impl DockerDestroyAction {
    pub fn new(node_name: &str) -> Self {
        Self {
            spec: ActionSpec::new(
                ActionId::new(DOCKER_DESTROY, node_name),
                Vec::new(),
                vec![node_name.to_string()],
                0,
            ),
        }
    }
}

impl Action for DockerDestroyAction {
    fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    fn call<'a>(
        &'a self,
        cluster: &'a Arc<Cluster>,
        node: Option<&'a Arc<Node>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let node = docker_node(&self.spec, node)?;
            if !node.uplink().started() {
                node.log().info(&format!(
                    "*** Skipping {DOCKER_DESTROY}, because the node is not running."
                ));
                return Ok(());
            }
            node.uplink().shutdown().wait().await?;
            cluster.persist().await?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// DestroyDockerInstancesShutdownHook
// ---------------------------------------------------------------------------

/// On success, persists the cluster file. On failure, or when the cluster
/// file cannot be written, removes every running Docker node.
pub struct DestroyDockerInstancesShutdownHook {
    cluster: Weak<Cluster>,
    terminating: tokio::sync::Mutex<()>,
}

impl DestroyDockerInstancesShutdownHook {
    pub const NAME: &'static str = "DestroyDockerInstancesShutdownHook";

    pub fn new(cluster: &Arc<Cluster>) -> Self {
        Self {
            cluster: Arc::downgrade(cluster),
            terminating: tokio::sync::Mutex::new(()),
        }
    }

    async fn terminate_instances(&self, cluster: &Cluster) -> Result<()> {
        let _guard = self.terminating.lock().await;
        let handles: Vec<_> = cluster
            .nodes()
            .iter()
            .filter(|n| n.role::<DockerNodeRole>().is_some() && n.uplink().started())
            .map(|n| n.uplink().shutdown())
            .collect();
        let terminated = !handles.is_empty();

        let mut first_error = None;
        for handle in handles {
            let node = handle.node().to_string();
            if let Err(e) = handle.wait().await {
                cluster
                    .cluster_log()
                    .error_with(&format!("*** Failed to terminate {node}"), &e);
                first_error.get_or_insert(e);
            }
        }
        if terminated {
            cluster.cluster_log().info("*** Terminated docker nodes.");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl ShutdownHook for DestroyDockerInstancesShutdownHook {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, code: ReturnCode) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(cluster) = self.cluster.upgrade() else {
                return Ok(());
            };
            if !code.is_success() {
                return self.terminate_instances(&cluster).await;
            }
            if let Err(e) = cluster.persist().await {
                cluster.cluster_log().error_with(
                    &format!(
                        "*** Failed to write cluster file to {}",
                        cluster.env().cluster_output_path().display()
                    ),
                    &e,
                );
                if let Err(te) = self.terminate_instances(&cluster).await {
                    tracing::warn!("cleanup after failed cluster write also failed: {te}");
                }
                return Err(e);
            }
            Ok(())
        })
    }
}
