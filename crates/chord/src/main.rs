//! chord: sharded Discord music bot.
//!
//! One binary, two roles. Run bare (optionally with a trailing `test`
//! argument) it becomes the orchestrator: it opens the shared database,
//! loads the stats snapshots, and spawns one worker process per shard. Run
//! with `--shard N` it becomes that worker, speaking the IPC protocol on
//! stdio.

use std::{path::Path, sync::Arc};

use chord_core::{
    broker::SqlBroker, config::Config, domain::ShardId, manager::ShardManager, shard,
    stats::StatsBook,
};

#[tokio::main]
async fn main() -> Result<(), chord_core::Error> {
    let (test_mode, shard_ordinal) = parse_args();
    chord_core::logging::init("chord")?;
    let cfg = Arc::new(Config::load(test_mode)?);

    if let Some(ordinal) = shard_ordinal {
        return shard::run_worker(cfg, ShardId(ordinal)).await;
    }

    if !cfg.test_mode {
        sweep_temp_dir(&cfg.temp_dir);
    }

    // Failure to open the shared connection aborts startup before any worker
    // is spawned; the bot does not run without persistence.
    let broker = SqlBroker::open(&cfg.database_path)?;
    let stats = StatsBook::load(&cfg.stats_dir)?;

    let manager = ShardManager::new(cfg, broker, stats);
    manager.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    manager.shutdown().await;

    Ok(())
}

/// `chord [test]` runs the orchestrator; `chord --shard N [test]` runs one worker.
fn parse_args() -> (bool, Option<u32>) {
    let mut test_mode = false;
    let mut shard_ordinal = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "test" => test_mode = true,
            "--shard" => shard_ordinal = args.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    (test_mode, shard_ordinal)
}

/// Clear leftover scratch files from the previous run.
fn sweep_temp_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(error) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "failed to remove temp file");
            }
        }
    }
}
