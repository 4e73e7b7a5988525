//! The cluster aggregate: node registry, environment, shutdown hooks and the
//! cluster-wide log.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::descriptor::{ClusterDescriptor, NodeDescriptor};
use crate::environment::CastleEnvironment;
use crate::error::{CastleError, Result};
use crate::expand::StringExpander;
use crate::log::CastleLog;
use crate::node::Node;
use crate::role::{DockerNodeRole, RoleSet, DOCKER_ROLE_ID};
use crate::shutdown::ShutdownManager;
use crate::uplink::{DockerUplink, MemoryUplink, Uplink, UplinkBackend};

#[derive(Debug)]
pub struct Cluster {
    env: CastleEnvironment,
    /// Ordered by name so shutdown iteration is deterministic.
    nodes: RwLock<BTreeMap<String, Arc<Node>>>,
    shutdown: ShutdownManager,
    cluster_log: CastleLog,
    /// Serializes descriptor writes so the last snapshot taken is the last written.
    persist: Mutex<()>,
}

impl Cluster {
    pub fn new(env: CastleEnvironment, cluster_log: CastleLog) -> Arc<Self> {
        Arc::new(Self {
            env,
            nodes: RwLock::new(BTreeMap::new()),
            shutdown: ShutdownManager::new(),
            cluster_log,
            persist: Mutex::new(()),
        })
    }

    /// Build a cluster from a descriptor. Every role's settings pass through
    /// `expander` before they are decoded.
    pub fn from_descriptor(
        env: CastleEnvironment,
        descriptor: &ClusterDescriptor,
        expander: &dyn StringExpander,
        backend: &UplinkBackend,
        cluster_log: CastleLog,
        debug: bool,
    ) -> Result<Arc<Self>> {
        let cluster = Self::new(env, cluster_log);
        for (name, node_desc) in &descriptor.nodes {
            let node = build_node(&cluster.env, name, node_desc, expander, backend, debug)?;
            cluster.add_node(node)?;
        }
        tracing::debug!(nodes = descriptor.nodes.len(), "cluster loaded");
        Ok(cluster)
    }

    /// Read `cluster.conf` from the environment's working directory.
    pub fn load(
        env: CastleEnvironment,
        expander: &dyn StringExpander,
        backend: &UplinkBackend,
        cluster_log: CastleLog,
        debug: bool,
    ) -> Result<Arc<Self>> {
        let descriptor = ClusterDescriptor::load(&env.cluster_output_path())?;
        Self::from_descriptor(env, &descriptor, expander, backend, cluster_log, debug)
    }

    pub fn env(&self) -> &CastleEnvironment {
        &self.env
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    pub fn cluster_log(&self) -> &CastleLog {
        &self.cluster_log
    }

    // -----------------------------------------------------------------------
    // Node registry
    // -----------------------------------------------------------------------

    pub fn add_node(&self, node: Node) -> Result<Arc<Node>> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(node.name()) {
            return Err(CastleError::NodeExists(node.name().to_string()));
        }
        let node = Arc::new(node);
        nodes.insert(node.name().to_string(), Arc::clone(&node));
        Ok(node)
    }

    pub fn remove_node(&self, name: &str) -> Result<Arc<Node>> {
        let node = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .ok_or_else(|| CastleError::NodeNotFound(name.to_string()))?;
        node.log().close()?;
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| CastleError::NodeNotFound(name.to_string()))
    }

    /// Snapshot of all nodes, ordered by name.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn to_descriptor(&self) -> Result<ClusterDescriptor> {
        let mut descriptor = ClusterDescriptor::default();
        for node in self.nodes() {
            descriptor.nodes.insert(
                node.name().to_string(),
                NodeDescriptor {
                    roles: node.roles().to_json_map_over(node.settings())?,
                },
            );
        }
        Ok(descriptor)
    }

    /// Rewrite `cluster.conf` with the current node and role state.
    ///
    /// Role settings are written back as they were loaded, placeholders
    /// included. Only runtime fields such as the container name change.
    pub fn write_to_disk(&self) -> Result<()> {
        let _guard = self.persist.lock().unwrap_or_else(|e| e.into_inner());
        let descriptor = self.to_descriptor()?;
        let path = self.env.cluster_output_path();
        descriptor.save(&path)?;
        tracing::debug!(path = %path.display(), "wrote cluster file");
        Ok(())
    }

    /// [`Cluster::write_to_disk`] on the blocking pool, for use from async tasks.
    pub async fn persist(self: &Arc<Self>) -> Result<()> {
        let cluster = Arc::clone(self);
        tokio::task::spawn_blocking(move || cluster.write_to_disk())
            .await
            .map_err(|e| CastleError::Io(std::io::Error::other(e)))?
    }

    /// Close every node log and the cluster log.
    pub fn close_logs(&self) {
        for node in self.nodes() {
            if let Err(e) = node.log().close() {
                tracing::warn!(node = node.name(), "failed to close node log: {e}");
            }
        }
        if let Err(e) = self.cluster_log.close() {
            tracing::warn!("failed to close cluster log: {e}");
        }
    }
}

fn build_node(
    env: &CastleEnvironment,
    name: &str,
    desc: &NodeDescriptor,
    expander: &dyn StringExpander,
    backend: &UplinkBackend,
    debug: bool,
) -> Result<Node> {
    let mut roles = RoleSet::new();
    let mut docker_role = None;
    for (role_id, value) in &desc.roles {
        let value = expander.expand_json(value);
        match role_id.as_str() {
            DOCKER_ROLE_ID => {
                let role = Arc::new(DockerNodeRole::from_json(name, value)?);
                roles.insert(role.clone());
                docker_role = Some(role);
            }
            other => {
                return Err(CastleError::InvalidRole {
                    node: name.to_string(),
                    role: other.to_string(),
                    reason: "unknown role".to_string(),
                })
            }
        }
    }

    let uplink: Arc<dyn Uplink> = match (backend, docker_role) {
        (
            UplinkBackend::Docker {
                binary,
                stop_timeout_secs,
            },
            Some(role),
        ) => Arc::new(DockerUplink::new(name, role, binary.clone(), *stop_timeout_secs)),
        (UplinkBackend::Docker { .. }, None) => {
            return Err(CastleError::NoUplink(name.to_string()))
        }
        (UplinkBackend::Memory, Some(role)) => Arc::new(MemoryUplink::with_role(name, role)),
        (UplinkBackend::Memory, None) => Arc::new(MemoryUplink::new(name)),
    };

    let log = env.create_castle_log(name, debug)?;
    Ok(Node::new(name, roles, uplink, log).with_settings(desc.roles.clone()))
}
