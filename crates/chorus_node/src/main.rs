// Chorus node binary: embedded cluster demo and catalog administration.
//
// `start` boots an n-node embedded cluster, runs a small write workload
// and reports per-node state; `node-add` / `node-drop` are the only
// catalog mutators; `status` prints the catalog.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use chorus_node::{EmbeddedCluster, NodeCatalog};

#[derive(Parser)]
#[command(name = "chorus-node", about = "Multi-master coordination core node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an embedded cluster with a demo workload.
    Start {
        /// Number of embedded nodes.
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        /// How long to run before shutting down.
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
    },
    /// Register a node in the catalog.
    NodeAdd {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        id: u8,
        #[arg(long, default_value = "")]
        conninfo: String,
        /// Mark this entry as the local node.
        #[arg(long = "self")]
        is_self: bool,
    },
    /// Remove a node from the catalog.
    NodeDrop {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        id: u8,
    },
    /// Show the catalog.
    Status {
        #[arg(long)]
        catalog: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Start {
            nodes,
            duration_secs,
        } => run_demo(nodes, Duration::from_secs(duration_secs)),
        Command::NodeAdd {
            catalog,
            id,
            conninfo,
            is_self,
        } => {
            let catalog = NodeCatalog::load_or_init(catalog)?;
            catalog.after_node_create(id, &conninfo, is_self)?;
            println!("node {id} added");
            Ok(())
        }
        Command::NodeDrop { catalog, id } => {
            let catalog = NodeCatalog::load_or_init(catalog)?;
            catalog.after_node_drop(id)?;
            println!("node {id} dropped");
            Ok(())
        }
        Command::Status { catalog } => {
            let catalog = NodeCatalog::load_or_init(catalog)?;
            if !catalog.is_configured() {
                println!("cluster is not configured (no self entry)");
            }
            for node in catalog.nodes() {
                println!(
                    "node {:2}  self={}  conninfo={:?}  slots={:?}",
                    node.id, node.is_self, node.conninfo, node.slots
                );
            }
            Ok(())
        }
    }
}

fn run_demo(nodes: usize, duration: Duration) -> anyhow::Result<()> {
    anyhow::ensure!(nodes >= 1, "need at least one node");
    tracing::info!(nodes, "starting embedded cluster");
    let cluster = EmbeddedCluster::start(nodes).context("cluster failed to start")?;
    tracing::info!("all nodes online");

    let started = std::time::Instant::now();
    let mut round = 0i64;
    while started.elapsed() < duration {
        round += 1;
        let writer = (round as u64 % nodes as u64) as u8 + 1;
        let key = format!("demo_{}", round % 10);
        match cluster.node(writer).put(&[(key.as_str(), round)]) {
            Ok(outcome) => tracing::info!(writer, key, round, ?outcome, "write committed"),
            Err(err) => tracing::warn!(writer, key, error = %err, "write failed"),
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    for id in 1..=nodes as u8 {
        let node = cluster.node(id);
        tracing::info!(
            node = id,
            status = %node.ctx.membership.status(),
            origin_lsn = node.ctx.syncpoints.origin_lsn(),
            "final state"
        );
    }
    cluster.shutdown();
    Ok(())
}
