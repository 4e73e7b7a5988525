use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use super::{DockerUplink, ShutdownHandle, Uplink};
use crate::error::{CastleError, Result};
use crate::role::DockerNodeRole;

#[derive(Debug, Default)]
struct MemoryState {
    started: AtomicBool,
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
    startup_error: Mutex<Option<String>>,
    shutdown_error: Mutex<Option<String>>,
}

/// Uplink whose node exists only as a liveness flag.
///
/// With a Docker role attached, liveness is the role's container name, set
/// and cleared the way the Docker uplink does, so a dry run persists the
/// same state a real run would.
#[derive(Debug, Clone)]
pub struct MemoryUplink {
    node: String,
    role: Option<Arc<DockerNodeRole>>,
    state: Arc<MemoryState>,
}

impl MemoryUplink {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            role: None,
            state: Arc::default(),
        }
    }

    /// An uplink standing in for a Docker container described by `role`.
    pub fn with_role(node: impl Into<String>, role: Arc<DockerNodeRole>) -> Self {
        Self {
            role: Some(role),
            ..Self::new(node)
        }
    }

    /// An uplink whose node is already running.
    pub fn running(node: impl Into<String>) -> Self {
        let uplink = Self::new(node);
        uplink.state.started.store(true, Ordering::SeqCst);
        uplink
    }

    /// Make every following `startup()` fail with `message`.
    pub fn fail_startup(&self, message: impl Into<String>) {
        *self.state.startup_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Make every following `shutdown()` fail with `message`.
    pub fn fail_shutdown(&self, message: impl Into<String>) {
        *self.state.shutdown_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    pub fn startup_calls(&self) -> usize {
        self.state.startups.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }
}

impl Uplink for MemoryUplink {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn started(&self) -> bool {
        match &self.role {
            Some(role) => !role.container_name().is_empty(),
            None => self.state.started.load(Ordering::SeqCst),
        }
    }

    fn startup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state.startups.fetch_add(1, Ordering::SeqCst);
            let failure = self
                .state
                .startup_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(message) = failure {
                return Err(CastleError::uplink(&self.node, message));
            }
            self.state.started.store(true, Ordering::SeqCst);
            if let Some(role) = self.role.as_ref().filter(|r| r.container_name().is_empty()) {
                role.set_container_name(DockerUplink::container_name_for(&self.node));
            }
            tracing::debug!(node = %self.node, "memory uplink started");
            Ok(())
        })
    }

    fn shutdown(&self) -> ShutdownHandle {
        let node = self.node.clone();
        let state = Arc::clone(&self.state);
        let role = self.role.clone();
        ShutdownHandle::spawn(self.node.clone(), async move {
            state.shutdowns.fetch_add(1, Ordering::SeqCst);
            let failure = state
                .shutdown_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(message) = failure {
                return Err(CastleError::uplink(node, message));
            }
            state.started.store(false, Ordering::SeqCst);
            if let Some(role) = role {
                role.set_container_name("");
            }
            Ok(())
        })
    }
}
