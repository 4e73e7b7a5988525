//! Compensating actions run when an orchestration run ends.
//!
//! Actions that create external resources register a [`ShutdownHook`] on the
//! cluster's [`ShutdownManager`]. The caller unwinds the stack exactly once,
//! after the scheduler has finished, handing every hook the final
//! [`ReturnCode`]: success persists state, failure tears resources down.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::Result;
use crate::log::error_chain;

/// Aggregate outcome of a run, as seen by shutdown hooks and the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCode {
    Success,
    /// Any failure, skip or abort.
    Failure,
}

impl ReturnCode {
    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::Failure => 1,
        }
    }
}

pub trait ShutdownHook: Send + Sync {
    /// Identity used to deduplicate registrations.
    fn name(&self) -> &str;

    fn run(&self, code: ReturnCode) -> BoxFuture<'_, Result<()>>;
}

// ---------------------------------------------------------------------------
// ShutdownManager
// ---------------------------------------------------------------------------

/// LIFO stack of shutdown hooks owned by one cluster.
#[derive(Default)]
pub struct ShutdownManager {
    hooks: Mutex<Vec<Arc<dyn ShutdownHook>>>,
}

impl std::fmt::Debug for ShutdownManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownManager")
            .field("hooks", &self.hook_names())
            .finish()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` unless a hook with the same name is already present.
    /// Returns whether it was added.
    pub fn add_hook_if_missing(&self, hook: Arc<dyn ShutdownHook>) -> bool {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if hooks.iter().any(|h| h.name() == hook.name()) {
            return false;
        }
        tracing::debug!(hook = hook.name(), "registered shutdown hook");
        hooks.push(hook);
        true
    }

    /// Names in registration order.
    pub fn hook_names(&self) -> Vec<String> {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered hook, most recently added first, and empty the
    /// stack. A failing hook does not stop the others; the first error is
    /// returned once all of them have run.
    pub async fn unwind(&self, code: ReturnCode) -> Result<()> {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(|e| e.into_inner()));
        let mut first_error = None;
        for hook in hooks.iter().rev() {
            tracing::debug!(hook = hook.name(), ?code, "running shutdown hook");
            if let Err(e) = hook.run(code).await {
                tracing::error!(hook = hook.name(), "shutdown hook failed: {}", error_chain(&e));
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ShutdownManager {
    fn drop(&mut self) {
        let pending = self.hooks.get_mut().map(|h| h.len()).unwrap_or(0);
        if pending > 0 {
            tracing::warn!(pending, "shutdown manager dropped without unwinding its hooks");
        }
    }
}
