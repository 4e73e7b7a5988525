use thiserror::Error;

use crate::action::{ActionId, TargetId};

#[derive(Debug, Error)]
pub enum CastleError {
    #[error("cluster descriptor not found at {0}")]
    DescriptorNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("invalid role '{role}' on node '{node}': {reason}")]
    InvalidRole {
        node: String,
        role: String,
        reason: String,
    },

    #[error("no uplink backend for node '{0}': it carries no role with a backend")]
    NoUplink(String),

    #[error("duplicate action: {0}")]
    DuplicateAction(ActionId),

    #[error("action {action} depends on {target}, which matches no scheduled action")]
    UnresolvedDependency { action: ActionId, target: TargetId },

    #[error("action {action} targets unknown node '{node}'")]
    UnknownNode { action: ActionId, node: String },

    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("uplink error on node '{node}': {message}")]
    Uplink { node: String, message: String },

    #[error("shutdown hook '{hook}' failed: {reason}")]
    ShutdownHook { hook: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CastleError {
    pub fn uplink(node: impl Into<String>, message: impl Into<String>) -> Self {
        CastleError::Uplink {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CastleError>;
