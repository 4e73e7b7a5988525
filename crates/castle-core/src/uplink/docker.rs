use std::process::{Output, Stdio};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::process::Command;

use super::{ShutdownHandle, Uplink};
use crate::error::{CastleError, Result};
use crate::role::DockerNodeRole;

/// Prefix for containers created by castle, followed by the node name.
pub const CONTAINER_PREFIX: &str = "castle-";

#[derive(Debug)]
struct DockerInner {
    node: String,
    role: Arc<DockerNodeRole>,
    binary: String,
    stop_timeout_secs: u64,
}

/// Uplink for nodes hosted in a local Docker container.
///
/// Liveness is the role's container name: non-empty while a castle container
/// may exist for the node, cleared only once `shutdown()` has removed it.
#[derive(Debug, Clone)]
pub struct DockerUplink {
    inner: Arc<DockerInner>,
}

impl DockerUplink {
    pub fn new(
        node: impl Into<String>,
        role: Arc<DockerNodeRole>,
        binary: impl Into<String>,
        stop_timeout_secs: u64,
    ) -> Self {
        Self {
            inner: Arc::new(DockerInner {
                node: node.into(),
                role,
                binary: binary.into(),
                stop_timeout_secs,
            }),
        }
    }

    pub fn container_name_for(node: &str) -> String {
        format!("{CONTAINER_PREFIX}{node}")
    }
}

impl DockerInner {
    async fn output(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!(node = %self.node, "{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                CastleError::uplink(&self.node, format!("failed to spawn {}: {e}", self.binary))
            })
    }

    fn failure(&self, args: &[&str], output: &Output) -> CastleError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        CastleError::uplink(
            &self.node,
            format!(
                "`{} {}` exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                stderr.trim()
            ),
        )
    }

    /// Run one docker CLI command and return its trimmed stdout.
    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(self.failure(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `Some(true)` running, `Some(false)` stopped, `None` no such container.
    /// Any other inspect failure is an error: the container may still exist.
    async fn container_state(&self, name: &str) -> Result<Option<bool>> {
        let args = ["inspect", "--format", "{{.State.Running}}", name];
        let output = self.output(&args).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Ok(Some(stdout.trim() == "true"));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such object") || stderr.contains("No such container") {
            return Ok(None);
        }
        Err(self.failure(&args, &output))
    }

    async fn startup(&self) -> Result<()> {
        which::which(&self.binary).map_err(|_| {
            CastleError::uplink(&self.node, format!("{} not found on PATH", self.binary))
        })?;

        let name = DockerUplink::container_name_for(&self.node);
        match self.container_state(&name).await? {
            Some(true) => {
                tracing::info!(node = %self.node, container = %name, "container already running");
            }
            Some(false) => {
                self.role.set_container_name(name.as_str());
                self.docker(&["start", name.as_str()]).await?;
            }
            None => {
                let mut args: Vec<&str> = vec![
                    "run",
                    "-d",
                    "--name",
                    name.as_str(),
                    "--hostname",
                    self.node.as_str(),
                ];
                args.extend(self.role.run_args().iter().map(String::as_str));
                args.push(self.role.image());
                // `run` can create the container and still fail, so track it first.
                self.role.set_container_name(name.as_str());
                if let Err(e) = self.docker(&args).await {
                    if let Ok(None) = self.container_state(&name).await {
                        self.role.set_container_name("");
                    }
                    return Err(e);
                }
            }
        }
        self.role.set_container_name(name);
        Ok(())
    }

    async fn teardown(&self, name: String) -> Result<()> {
        let timeout = self.stop_timeout_secs.to_string();
        let Some(running) = self.container_state(&name).await? else {
            self.role.set_container_name("");
            tracing::info!(node = %self.node, container = %name, "container already gone");
            return Ok(());
        };
        if running {
            self.docker(&["stop", "-t", timeout.as_str(), name.as_str()])
                .await?;
        }
        self.docker(&["rm", "-f", name.as_str()]).await?;
        self.role.set_container_name("");
        tracing::info!(node = %self.node, container = %name, "container removed");
        Ok(())
    }
}

impl Uplink for DockerUplink {
    fn backend(&self) -> &'static str {
        "docker"
    }

    fn started(&self) -> bool {
        !self.inner.role.container_name().is_empty()
    }

    fn startup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.startup())
    }

    fn shutdown(&self) -> ShutdownHandle {
        let name = self.inner.role.container_name();
        if name.is_empty() {
            return ShutdownHandle::ready(self.inner.node.clone(), Ok(()));
        }
        let inner = Arc::clone(&self.inner);
        ShutdownHandle::spawn(self.inner.node.clone(), async move {
            inner.teardown(name).await
        })
    }
}
