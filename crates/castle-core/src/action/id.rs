use std::fmt;

use serde::Serialize;

/// Identity of an action: what it does (`action_type`) and where (`scope`,
/// usually a node or role name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActionId {
    pub action_type: String,
    pub scope: String,
}

impl ActionId {
    pub fn new(action_type: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            scope: scope.into(),
        }
    }

    /// Whether this action satisfies a dependency on `target`.
    pub fn matches(&self, target: &TargetId) -> bool {
        self.action_type == target.action_type
            && (target.scope.is_empty() || self.scope == target.scope)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}", self.action_type)
        } else {
            write!(f, "{}:{}", self.action_type, self.scope)
        }
    }
}

/// A dependency on other actions. An empty scope matches every action of
/// `action_type`, so one target can fan out to many actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetId {
    pub action_type: String,
    pub scope: String,
}

impl TargetId {
    pub fn new(action_type: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            scope: scope.into(),
        }
    }

    /// Every action of `action_type`, whatever its scope.
    pub fn any(action_type: impl Into<String>) -> Self {
        Self::new(action_type, "")
    }

    pub fn is_wildcard(&self) -> bool {
        self.scope.is_empty()
    }
}

impl From<&ActionId> for TargetId {
    fn from(id: &ActionId) -> Self {
        Self::new(id.action_type.clone(), id.scope.clone())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}:*", self.action_type)
        } else {
            write!(f, "{}:{}", self.action_type, self.scope)
        }
    }
}
