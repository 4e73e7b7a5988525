//! Node lifecycle handles.
//!
//! An [`Uplink`] is how actions reach a node, whatever hosts it. Backends:
//!
//! ```text
//! DockerUplink  ← drives the docker CLI (tokio::process)
//! MemoryUplink  ← in-process liveness flag, for dry runs and tests
//! ```

pub mod docker;
pub mod memory;

use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::error::{CastleError, Result};

pub use docker::DockerUplink;
pub use memory::MemoryUplink;

pub trait Uplink: Send + Sync + fmt::Debug {
    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;

    /// Non-blocking liveness check. Safe to call before `startup()`.
    fn started(&self) -> bool;

    /// Bring the node to the running state. Safe to retry after a failure.
    fn startup(&self) -> BoxFuture<'_, Result<()>>;

    /// Begin tearing the node down. The returned handle completes once the
    /// underlying resource has been released.
    fn shutdown(&self) -> ShutdownHandle;
}

/// Which backend `Cluster::from_descriptor` attaches to nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkBackend {
    Docker {
        binary: String,
        stop_timeout_secs: u64,
    },
    /// No external side effects; liveness lives only in memory.
    Memory,
}

// ---------------------------------------------------------------------------
// ShutdownHandle
// ---------------------------------------------------------------------------

enum HandleState {
    Ready(Result<()>),
    Pending(JoinHandle<Result<()>>),
}

/// Pending completion of an asynchronous [`Uplink::shutdown`].
#[must_use = "await the handle to observe teardown errors"]
pub struct ShutdownHandle {
    node: String,
    state: HandleState,
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("node", &self.node)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ShutdownHandle {
    /// A handle that has already completed with `result`.
    pub fn ready(node: impl Into<String>, result: Result<()>) -> Self {
        Self {
            node: node.into(),
            state: HandleState::Ready(result),
        }
    }

    /// Run `teardown` on the tokio runtime and hand back its completion.
    pub fn spawn<F>(node: impl Into<String>, teardown: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            node: node.into(),
            state: HandleState::Pending(tokio::spawn(teardown)),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Pending(handle) => handle.is_finished(),
        }
    }

    /// Cancel a teardown that is still in flight. `wait()` then reports
    /// the cancellation as an error.
    pub fn cancel(&self) {
        if let HandleState::Pending(handle) = &self.state {
            handle.abort();
        }
    }

    pub async fn wait(self) -> Result<()> {
        match self.state {
            HandleState::Ready(result) => result,
            HandleState::Pending(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => {
                    Err(CastleError::uplink(self.node, "shutdown was cancelled"))
                }
                Err(e) => Err(CastleError::uplink(
                    self.node,
                    format!("shutdown task panicked: {e}"),
                )),
            },
        }
    }
}
