//! Role capabilities attached to cluster nodes.
//!
//! A node carries a [`RoleSet`]: at most one role per stable role id. Roles
//! are looked up by concrete type and the lookup returns `None` when the node
//! does not carry that role.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CastleError, Result};

pub trait Role: Any + Send + Sync + fmt::Debug {
    /// Stable identifier; also the key under which the role is persisted.
    fn id(&self) -> &'static str;

    fn to_json(&self) -> Result<Value>;

    /// Keys of [`Role::to_json`] that record runtime state rather than
    /// configuration.
    fn runtime_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------------
// RoleSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RoleSet {
    roles: BTreeMap<&'static str, Arc<dyn Role>>,
}

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `role`, replacing any role with the same id.
    pub fn insert(&mut self, role: Arc<dyn Role>) {
        self.roles.insert(role.id(), role);
    }

    pub fn with(mut self, role: Arc<dyn Role>) -> Self {
        self.insert(role);
        self
    }

    pub fn get<R: Role>(&self) -> Option<&R> {
        self.roles
            .values()
            .find_map(|role| role.as_any().downcast_ref::<R>())
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.roles.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.roles.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn to_json_map(&self) -> Result<BTreeMap<String, Value>> {
        self.roles
            .iter()
            .map(|(id, role)| Ok((id.to_string(), role.to_json()?)))
            .collect()
    }

    /// Like [`RoleSet::to_json_map`], but each role keeps the settings it was
    /// loaded from and only its runtime fields are taken from the live role.
    pub fn to_json_map_over(
        &self,
        settings: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut map = BTreeMap::new();
        for (id, role) in &self.roles {
            let live = role.to_json()?;
            let value = match settings.get(*id) {
                Some(Value::Object(raw)) => {
                    let mut merged = raw.clone();
                    for &field in role.runtime_fields() {
                        match live.get(field) {
                            Some(v) => merged.insert(field.to_string(), v.clone()),
                            None => merged.remove(field),
                        };
                    }
                    Value::Object(merged)
                }
                _ => live,
            };
            map.insert(id.to_string(), value);
        }
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// DockerNodeRole
// ---------------------------------------------------------------------------

pub const DOCKER_ROLE_ID: &str = "docker";

/// Persisted form of [`DockerNodeRole`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerNodeRoleSpec {
    pub image: String,
    #[serde(default)]
    pub run_args: Vec<String>,
    /// Name of the running container; empty when none has been created.
    #[serde(default)]
    pub container_name: String,
}

/// A node hosted in a Docker container.
#[derive(Debug)]
pub struct DockerNodeRole {
    image: String,
    run_args: Vec<String>,
    container_name: RwLock<String>,
}

impl DockerNodeRole {
    pub fn new(image: impl Into<String>) -> Self {
        Self::from_spec(DockerNodeRoleSpec {
            image: image.into(),
            ..DockerNodeRoleSpec::default()
        })
    }

    pub fn from_spec(spec: DockerNodeRoleSpec) -> Self {
        Self {
            image: spec.image,
            run_args: spec.run_args,
            container_name: RwLock::new(spec.container_name),
        }
    }

    pub fn from_json(node: &str, value: Value) -> Result<Self> {
        let spec: DockerNodeRoleSpec =
            serde_json::from_value(value).map_err(|e| CastleError::InvalidRole {
                node: node.to_string(),
                role: DOCKER_ROLE_ID.to_string(),
                reason: e.to_string(),
            })?;
        if spec.image.trim().is_empty() {
            return Err(CastleError::InvalidRole {
                node: node.to_string(),
                role: DOCKER_ROLE_ID.to_string(),
                reason: "image must not be empty".to_string(),
            });
        }
        Ok(Self::from_spec(spec))
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn run_args(&self) -> &[String] {
        &self.run_args
    }

    pub fn container_name(&self) -> String {
        self.container_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_container_name(&self, name: impl Into<String>) {
        *self.container_name.write().unwrap_or_else(|e| e.into_inner()) = name.into();
    }

    pub fn spec(&self) -> DockerNodeRoleSpec {
        DockerNodeRoleSpec {
            image: self.image.clone(),
            run_args: self.run_args.clone(),
            container_name: self.container_name(),
        }
    }
}

impl Role for DockerNodeRole {
    fn id(&self) -> &'static str {
        DOCKER_ROLE_ID
    }

    fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.spec())?)
    }

    fn runtime_fields(&self) -> &'static [&'static str] {
        &["containerName"]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
