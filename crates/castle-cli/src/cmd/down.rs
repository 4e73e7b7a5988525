use super::{docker_nodes, execute, load_cluster, Options};
use castle_core::action::{Action, DockerDestroyAction};
use std::sync::Arc;

pub fn run(opts: &Options) -> anyhow::Result<()> {
    let (cluster, config) = load_cluster(opts)?;
    let actions: Vec<Arc<dyn Action>> = docker_nodes(&cluster)
        .iter()
        .map(|n| Arc::new(DockerDestroyAction::new(n.name())) as Arc<dyn Action>)
        .collect();
    tracing::debug!(nodes = actions.len(), "tearing cluster down");
    execute(opts, &cluster, &config, actions)
}
