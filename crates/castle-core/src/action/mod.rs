//! Actions: named, scoped units of provisioning work with declared
//! dependencies.
//!
//! An action with an empty node list runs once against the cluster itself.
//! An action with nodes runs once per listed node; it counts as done only
//! when every per-node instance has succeeded.
//!
//! Actions should check the node's uplink before doing expensive or
//! destructive work and return early when the desired state already holds,
//! so reruns against a half-provisioned cluster are safe.

pub mod docker;
pub mod id;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cluster::Cluster;
use crate::error::Result;
use crate::node::Node;

pub use docker::{DestroyDockerInstancesShutdownHook, DockerDestroyAction, DockerInitAction};
pub use id::{ActionId, TargetId};

/// Static description of an action, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub id: ActionId,
    /// Actions that must succeed before this one starts.
    pub targets: Vec<TargetId>,
    /// Nodes to run on; empty means once, untargeted.
    pub nodes: Vec<String>,
    /// Among actions that are ready at the same time, higher runs first.
    pub priority: i32,
}

impl ActionSpec {
    pub fn new(id: ActionId, targets: Vec<TargetId>, nodes: Vec<String>, priority: i32) -> Self {
        Self {
            id,
            targets,
            nodes,
            priority,
        }
    }
}

pub trait Action: Send + Sync {
    fn spec(&self) -> &ActionSpec;

    /// Do the work. `node` is `None` for untargeted actions.
    fn call<'a>(
        &'a self,
        cluster: &'a Arc<Cluster>,
        node: Option<&'a Arc<Node>>,
    ) -> BoxFuture<'a, Result<()>>;

    fn id(&self) -> &ActionId {
        &self.spec().id
    }
}
