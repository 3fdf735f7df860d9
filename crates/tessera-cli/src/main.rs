//! `tessera`: inspect and maintain a persisted Tessera store.
//!
//! Works on the SQLite file directly; nothing here talks to a generation
//! backend, so it is safe to run while no app is open.
//!
//! Usage:
//!   tessera --db tessera.db nodes
//!   tessera sessions
//!   tessera gc --stale-secs 600
//!   tessera merge other.db
//!   tessera export > graph.json

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use tessera_crdt::{GraphStore, KindRegistry, ReplicaId};
use tessera_kernel::{
    CheckpointStore, DEFAULT_GRAPH, FlowBus, GraphSnapshots, KernelConfig, SharedGraph, SharedKv,
    SqliteKv,
};

const DEFAULT_DB: &str = "tessera.db";

/// Offline tools for a Tessera store.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(about = "Inspect and maintain a persisted Tessera graph")]
struct Args {
    /// SQLite database (overrides `db_path` from the config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Kernel config TOML
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List nodes with their status
    Nodes,
    /// List session checkpoints
    Sessions,
    /// Drop stale and corrupt checkpoints
    Gc {
        /// Age threshold; defaults to the configured staleness window
        #[arg(long)]
        stale_secs: Option<u64>,
    },
    /// Merge another store's graph into this one
    Merge { other: PathBuf },
    /// Print the raw graph state as JSON
    Export,
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => KernelConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    let db = args
        .db
        .clone()
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
    let kv = open_kv(&db)?;

    let mut out = std::io::stdout().lock();
    match args.command {
        Command::Nodes => list_nodes(&kv, &mut out),
        Command::Sessions => list_sessions(&kv, &mut out),
        Command::Gc { stale_secs } => {
            let secs = stale_secs.unwrap_or(config.staleness_window_secs);
            gc(&kv, secs, &mut out)
        }
        Command::Merge { other } => merge(&kv, &open_kv(&other)?, &mut out),
        Command::Export => export(&kv, &mut out),
    }
}

fn open_kv(path: &Path) -> Result<SharedKv> {
    let kv = SqliteKv::open(path).with_context(|| format!("opening {}", path.display()))?;
    tracing::debug!(db = %path.display(), "opened store");
    Ok(Arc::new(kv))
}

fn load_store(kv: &SharedKv) -> Result<GraphStore> {
    let state = GraphSnapshots::new(kv.clone())
        .load(DEFAULT_GRAPH)
        .context("loading graph snapshot")?
        .unwrap_or_default();
    Ok(GraphStore::from_state(
        ReplicaId::new(),
        state,
        Arc::new(KindRegistry::new()),
    ))
}

fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or("");
    let mut short: String = line.chars().take(48).collect();
    if short.len() < content.len() {
        short.push('…');
    }
    short
}

fn list_nodes(kv: &SharedKv, out: &mut impl Write) -> Result<()> {
    let store = load_store(kv)?;
    for snapshot in store.snapshots() {
        let node = &snapshot.node;
        writeln!(
            out,
            "{}  {:<16} {:<10} parents={}  {}",
            node.id.short(),
            node.kind.as_str(),
            node.status,
            snapshot.parent_refs.len(),
            preview(&node.content),
        )?;
    }
    Ok(())
}

fn list_sessions(kv: &SharedKv, out: &mut impl Write) -> Result<()> {
    let (checkpoints, corrupt) = CheckpointStore::new(kv.clone())
        .list()
        .context("listing checkpoints")?;
    let now = tessera_crdt::now_millis();
    for cp in checkpoints {
        let handle = match cp.handle() {
            Some(h) if h.durable => format!("upstream:{}", h.id),
            Some(h) => format!("local:{}", h.id),
            None => "-".to_string(),
        };
        writeln!(
            out,
            "{}  {:<10} {:<9} deltas={:<5} age={}s  {}",
            cp.node_id.short(),
            cp.feature_id,
            cp.phase,
            cp.deltas,
            cp.age_ms(now) / 1000,
            handle,
        )?;
    }
    if !corrupt.is_empty() {
        writeln!(out, "{} corrupt entries (run gc to purge)", corrupt.len())?;
    }
    Ok(())
}

fn gc(kv: &SharedKv, stale_secs: u64, out: &mut impl Write) -> Result<()> {
    let checkpoints = CheckpointStore::new(kv.clone());
    let (entries, corrupt) = checkpoints.list().context("listing checkpoints")?;
    let now = tessera_crdt::now_millis();
    let limit_ms = stale_secs.saturating_mul(1000);

    let mut dropped = 0;
    for cp in entries {
        if cp.age_ms(now) > limit_ms {
            checkpoints.delete(&cp.node_id)?;
            tracing::info!(node = %cp.node_id, phase = %cp.phase, "dropped stale checkpoint");
            dropped += 1;
        }
    }
    let mut purged = 0;
    for error in corrupt {
        if let tessera_kernel::PersistError::Corrupt { key, .. } = error {
            checkpoints.purge_key(&key)?;
            purged += 1;
        }
    }
    writeln!(out, "dropped {dropped} stale, purged {purged} corrupt")?;
    Ok(())
}

fn merge(kv: &SharedKv, other: &SharedKv, out: &mut impl Write) -> Result<()> {
    let remote = GraphSnapshots::new(other.clone())
        .load(DEFAULT_GRAPH)
        .context("loading other graph")?
        .unwrap_or_default();
    let graph = SharedGraph::load(
        GraphSnapshots::new(kv.clone()),
        DEFAULT_GRAPH,
        ReplicaId::new(),
        Arc::new(KindRegistry::new()),
        FlowBus::new(16),
    )?;
    let report = graph.merge(&remote);
    graph.persist().context("saving merged graph")?;
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

fn export(kv: &SharedKv, out: &mut impl Write) -> Result<()> {
    let store = load_store(kv)?;
    writeln!(out, "{}", serde_json::to_string_pretty(store.state())?)?;
    Ok(())
}
