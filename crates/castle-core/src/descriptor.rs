//! On-disk snapshot of cluster and node state (`cluster.conf`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CastleError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Role id to role-specific settings.
    #[serde(default)]
    pub roles: BTreeMap<String, Value>,
}

impl ClusterDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CastleError::DescriptorNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        let descriptor: ClusterDescriptor = serde_json::from_str(&data)?;
        Ok(descriptor)
    }

    /// Replace the file at `path` with this descriptor.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        crate::io::atomic_write(path, &data)
    }
}
