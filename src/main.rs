//! Chess Session - command console
//!
//! Hosts a session registry over the configured store and reads commands
//! from stdin (`help` lists them). On EOF or `quit` every live game is
//! persisted before exit.
//!
//! Usage:
//!     chess-session [--config FILE]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::BufReader;

use chess_session::config::{EngineConfig, StorageBackend};
use chess_session::console::Console;
use chess_session::logging;
use chess_session::registry::SessionRegistry;
use chess_session::storage::{MemorySessionStore, SessionStore, SqliteSessionStore};

#[derive(Debug, Parser)]
#[command(name = "chess-session", version, about = "Chess game session engine console")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (config, ignored) = EngineConfig::load(args.config.as_deref()).context("loading configuration")?;
    logging::init(&config.logging).context("installing log subscriber")?;
    for skipped in &ignored {
        tracing::warn!(key = skipped.key, value = %skipped.value, reason = %skipped.reason, "ignoring env override");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads())
        .enable_all()
        .build()
        .context("starting runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: EngineConfig) -> anyhow::Result<()> {
    let store: Arc<dyn SessionStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemorySessionStore::new()),
        StorageBackend::Sqlite => {
            let path = config
                .storage
                .sqlite_path
                .as_ref()
                .context("storage.sqlite_path is not set")?;
            Arc::new(SqliteSessionStore::open(path).with_context(|| format!("opening {}", path.display()))?)
        }
    };
    tracing::info!(
        backend = ?config.storage.backend,
        workers = config.runtime.worker_threads(),
        "chess session console starting"
    );

    let registry = Arc::new(SessionRegistry::from_config(store, &config));
    let mut console = Console::new(Arc::clone(&registry));
    console
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("console I/O")?;

    let report = registry.drain().await;
    if !report.failed.is_empty() {
        bail!("{} session(s) could not be persisted", report.failed.len());
    }
    Ok(())
}
