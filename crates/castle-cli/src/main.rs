mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::Options;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "castle",
    about = "Provision and tear down test clusters described by cluster.conf",
    version,
    propagate_version = true
)]
struct Cli {
    /// Directory holding cluster.conf, castle.yaml and the node logs
    #[arg(
        long,
        short = 'w',
        global = true,
        env = "CASTLE_WORKING_DIR",
        default_value = "."
    )]
    working_dir: PathBuf,

    /// Log debug output to the console and the castle logs
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Maximum number of actions running at once (overrides castle.yaml)
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Value for a %{KEY} placeholder in the cluster descriptor (repeatable)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE", value_parser = parse_key_val)]
    vars: Vec<(String, String)>,

    /// Track node state in memory instead of talking to Docker
    #[arg(long, global = true)]
    dry_run: bool,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every Docker node that is not already running
    Up,

    /// Stop and remove every running Docker node
    Down,

    /// Show nodes, their roles and whether they are running
    Status,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let opts = Options {
        working_dir: cli.working_dir,
        verbose: cli.verbose,
        max_workers: cli.max_workers,
        vars: cli.vars.into_iter().collect(),
        dry_run: cli.dry_run,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Up => cmd::up::run(&opts),
        Commands::Down => cmd::down::run(&opts),
        Commands::Status => cmd::status::run(&opts),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
