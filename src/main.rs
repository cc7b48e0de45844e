//! webgis-ops - dry-run driver for the Web GIS orchestrator
//!
//! Usage:
//!   webgis-ops simulate --tree tree.json --intents intents.json --fail-name B=CONFLICT
//!   webgis-ops dump-config
//!
//! `simulate` seeds the in-memory remote and the cached tree from a snapshot,
//! submits each intent in order and prints every batch report as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webgis_core::{Error, NodeData, OrchestratorConfig};
use webgis_orchestrator::{
    BatchReport, InMemoryRemote, Intent, JobScheduler, ResourceTree,
};

#[derive(Parser)]
#[command(
    name = "webgis-ops",
    version = env!("CARGO_PKG_VERSION"),
    about = "Resource operation orchestrator for Web GIS resource trees"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run intents against an in-memory copy of a resource tree
    Simulate {
        /// Tree snapshot: JSON array of resources, exactly one without a parent
        #[arg(long)]
        tree: PathBuf,

        /// JSON array of intents, submitted in order
        #[arg(long)]
        intents: PathBuf,

        /// Path to config file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Make every call touching <name> fail, e.g. `roads=CONFLICT`
        #[arg(long = "fail-name", value_name = "NAME=CODE")]
        fail_name: Vec<String>,
    },
    /// Dump default config as TOML and exit
    DumpConfig,
}

/// Outcome of one submitted intent.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SimulationEntry {
    Completed { report: BatchReport },
    Rejected { intent: String, error: Error },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webgis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::DumpConfig => {
            println!("{}", OrchestratorConfig::default().to_toml());
            Ok(())
        }
        Command::Simulate {
            tree,
            intents,
            config,
            fail_name,
        } => simulate(&tree, &intents, config.as_deref(), &fail_name).await,
    }
}

async fn simulate(
    tree_path: &Path,
    intents_path: &Path,
    config_path: Option<&Path>,
    failures: &[String],
) -> anyhow::Result<()> {
    let config = config_path
        .map(OrchestratorConfig::load)
        .unwrap_or_default();

    let snapshot: Vec<NodeData> = read_json(tree_path)?;
    let intents: Vec<Intent> = read_json(intents_path)?;

    let remote = Arc::new(InMemoryRemote::from_snapshot(snapshot.clone()));
    for spec in failures {
        let (name, error) = parse_failure(spec)?;
        remote.fail_on_name(name, error);
    }
    let tree = ResourceTree::from_snapshot(snapshot).context("invalid tree snapshot")?;

    let scheduler = JobScheduler::new(tree, remote.clone(), config);
    info!(intents = intents.len(), "Simulation started");

    let mut entries = Vec::with_capacity(intents.len());
    for intent in intents {
        let label = intent.label();
        let entry = match scheduler.submit(intent) {
            Ok(handle) => SimulationEntry::Completed {
                report: handle.wait().await?,
            },
            Err(error) => SimulationEntry::Rejected {
                intent: label,
                error,
            },
        };
        entries.push(entry);
    }

    info!(calls = remote.calls(), resources = scheduler.tree().len(), "Simulation finished");
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_failure(spec: &str) -> anyhow::Result<(String, Error)> {
    let (name, code) = spec
        .rsplit_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected NAME=CODE, got {:?}", spec))?;
    let error = Error::from_code(code, format!("scripted failure for {}", name))
        .ok_or_else(|| anyhow::anyhow!("unknown error code {:?}", code))?;
    Ok((name.to_string(), error))
}
