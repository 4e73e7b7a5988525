use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::log::CastleLog;
use crate::role::{Role, RoleSet};
use crate::uplink::Uplink;

/// One cluster member.
#[derive(Debug)]
pub struct Node {
    name: String,
    roles: RoleSet,
    uplink: Arc<dyn Uplink>,
    log: CastleLog,
    /// Role settings as written in the descriptor, before expansion.
    settings: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(name: impl Into<String>, roles: RoleSet, uplink: Arc<dyn Uplink>, log: CastleLog) -> Self {
        Self {
            name: name.into(),
            roles,
            uplink,
            log,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: BTreeMap<String, Value>) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    pub fn role<R: Role>(&self) -> Option<&R> {
        self.roles.get::<R>()
    }

    pub fn uplink(&self) -> &dyn Uplink {
        self.uplink.as_ref()
    }

    pub fn log(&self) -> &CastleLog {
        &self.log
    }

    pub fn settings(&self) -> &BTreeMap<String, Value> {
        &self.settings
    }
}
