//! takt-pipeline — one scheduling pipeline stage as its own OS process.
//!
//! # Usage
//!
//! ```bash
//! takt-pipeline --config config/takt.toml --pipeline training --role beater
//! takt-pipeline --config config/takt.toml --pipeline training --role assigner
//! takt-pipeline --config config/takt.toml --pipeline training --role matcher
//! takt-pipeline --config config/takt.toml --pipeline training --role subscriber \
//!     --upstreams training-matcher,jupyter-matcher
//! ```
//!
//! Stages find each other through channel files under the configured channel
//! directory; start order does not matter.

use clap::{Parser, ValueEnum};

use takt_core::{TaktConfig, TaktError, TickSnapshot};
use takt_sched::{
    channel_name, spawn_stop_watcher, Db, PgPriorityAudit, PgSignalSink, PgSnapshotProvider,
    PgTaskStore, PipelineBuilder, SnapshotConsumer,
};

/// Run one pipeline stage.
#[derive(Parser, Debug)]
#[command(name = "takt-pipeline", version, about)]
struct Cli {
    /// Path to the scheduler configuration file.
    #[arg(long, default_value = "config/takt.toml")]
    config: String,

    /// Pipeline name from the configuration.
    #[arg(long)]
    pipeline: String,

    /// Which stage this process runs.
    #[arg(long, value_enum)]
    role: Role,

    /// Full channel names a subscriber merges (default: this pipeline's
    /// matcher).
    #[arg(long, value_delimiter = ',')]
    upstreams: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Beater,
    Assigner,
    Matcher,
    Subscriber,
}

/// Read-only consumer logging headline numbers of the merged view.
struct StatsLogger;

impl SnapshotConsumer for StatsLogger {
    fn consume(&mut self, snap: &TickSnapshot) -> Result<(), TaktError> {
        let scheduled = snap
            .task
            .iter()
            .filter(|t| t.queue_status == takt_core::QueueStatus::Scheduled)
            .count();
        tracing::info!(
            tasks = snap.task.len(),
            scheduled,
            nodes = snap.resource.len(),
            valid = snap.valid,
            "merged pipeline view"
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = TaktConfig::from_file(&cli.config)?;
    let stop = spawn_stop_watcher();
    let builder = PipelineBuilder::new(&config, &cli.pipeline, stop)?;

    tracing::info!(pipeline = %cli.pipeline, role = ?cli.role, "stage starting");

    match cli.role {
        Role::Beater => {
            let db = Db::connect(&config.database_url)?;
            let provider = PgSnapshotProvider::new(db.clone());
            let audit = PgPriorityAudit::new(db);
            builder.beater(provider, audit, &[])?.run()
        }
        Role::Assigner => builder.assigner()?.run(),
        Role::Matcher => {
            let db = Db::connect(&config.database_url)?;
            let store = PgTaskStore::new(db.clone());
            let sink = PgSignalSink::new(db);
            builder.matcher(store, sink)?.run()
        }
        Role::Subscriber => {
            let upstreams = if cli.upstreams.is_empty() {
                vec![channel_name(&cli.pipeline, "matcher")]
            } else {
                cli.upstreams.clone()
            };
            builder.subscriber("subscriber", StatsLogger, &upstreams)?.run()
        }
    }
}
