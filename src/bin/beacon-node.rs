//! beacon-node - run discovery for one server process against etcd.
//!
//! Advertises `--server-id` and follows the cluster until Ctrl-C, logging the
//! current server list periodically.

use anyhow::{Context, Result, bail};
use beacon::beacon_config::{ConfigManager, FileFormat};
use beacon::{EtcdConnector, Node, ServerIdentity};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Beacon discovery node
#[derive(Parser, Debug)]
#[command(name = "beacon-node")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Advertise this server and follow cluster membership")]
struct Cli {
    /// Identity written into the membership record, e.g. host:port
    #[arg(long, env = "BEACON_SERVER_ID")]
    server_id: Option<String>,

    /// Settings file (.toml, .json, .env or .properties)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Load a .env file before reading the environment
    #[arg(long)]
    dotenv: bool,

    /// Only follow membership, do not advertise
    #[arg(long, conflicts_with = "advertise_only")]
    watch_only: bool,

    /// Only advertise, do not follow membership
    #[arg(long)]
    advertise_only: bool,

    /// Seconds between server list reports
    #[arg(long, default_value_t = 10)]
    print_interval: u64,
}

fn load_config(cli: &Cli) -> Result<ConfigManager> {
    let config = ConfigManager::with_prefixes(["BEACON", "CLUSTER"]);

    if let Some(path) = &cli.config {
        let format = FileFormat::from_path(path)
            .with_context(|| format!("unsupported settings file {}", path.display()))?;
        config
            .load_file(path, format)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }

    // Environment overrides the file
    if cli.dotenv {
        config.load_dotenv(None)?;
    } else {
        config.load_env();
    }

    Ok(config)
}

fn build_node(cli: &Cli, config: ConfigManager) -> Result<Node> {
    let mut builder = Node::builder(EtcdConnector::new(), config);

    if !cli.watch_only {
        let Some(server_id) = cli.server_id.as_deref() else {
            bail!("--server-id is required unless --watch-only is set");
        };
        builder = builder.advertise(ServerIdentity::new(server_id));
    }
    if !cli.advertise_only {
        builder = builder.watch();
    }

    Ok(builder.build())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    beacon::beacon_log::init();

    let node = build_node(&cli, config)?;
    node.started().await.context("discovery failed to start")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.print_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick(), if !cli.advertise_only => {
                let urls = node.urls();
                info!(count = urls.len(), servers = ?urls, "Cluster membership");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    node.stopped().await;
    Ok(())
}
