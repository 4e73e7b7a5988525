use super::{load_cluster, Options};
use crate::output::{print_json, print_table};
use castle_core::role::DockerNodeRole;

pub fn run(opts: &Options) -> anyhow::Result<()> {
    let (cluster, _config) = load_cluster(opts)?;
    let nodes = cluster.nodes();

    if opts.json {
        let value: Vec<_> = nodes
            .iter()
            .map(|n| {
                let docker = n.role::<DockerNodeRole>();
                serde_json::json!({
                    "name": n.name(),
                    "roles": n.roles().ids(),
                    "backend": n.uplink().backend(),
                    "running": n.uplink().started(),
                    "image": docker.map(|r| r.image().to_string()),
                    "container": docker.map(|r| r.container_name()).filter(|c| !c.is_empty()),
                })
            })
            .collect();
        print_json(&value)?;
    } else if nodes.is_empty() {
        println!("No nodes defined in {}.", cluster.env().cluster_output_path().display());
    } else {
        let rows = nodes
            .iter()
            .map(|n| {
                let docker = n.role::<DockerNodeRole>();
                let running = if n.uplink().started() { "yes" } else { "no" };
                vec![
                    n.name().to_string(),
                    n.roles().ids().join(","),
                    n.uplink().backend().to_string(),
                    running.to_string(),
                    docker.map(|r| r.image().to_string()).unwrap_or_default(),
                    docker
                        .map(|r| r.container_name())
                        .filter(|c| !c.is_empty())
                        .unwrap_or_else(|| "-".to_string()),
                ]
            })
            .collect();
        print_table(&["NODE", "ROLES", "BACKEND", "RUNNING", "IMAGE", "CONTAINER"], rows);
    }

    cluster.close_logs();
    Ok(())
}
