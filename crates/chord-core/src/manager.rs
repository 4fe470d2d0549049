//! The shard manager: process orchestration and the IPC message router.
//!
//! The manager spawns one worker process per shard, speaks newline-delimited
//! JSON with each over the child's stdio, and owns the process-wide services
//! as explicit state: the database broker, the stats book, and the stopwatch
//! registry. One reader task per shard parses inbound lines and dispatches on
//! the tagged message union; only a database request suspends beyond its own
//! reply, so the router stays responsive to every other worker while a query
//! runs.
//!
//! A worker that exits is logged, reported to the error webhook, and
//! respawned on the same attach path after a short delay.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    alerts::{Alerter, Embed, COLOR_ONLINE},
    broker::SqlBroker,
    config::Config,
    domain::ShardId,
    errors::Error,
    ipc::{ManagerMessage, ShardMessage, StatsQuery},
    stats::{StatsBook, StatsValue},
    stopwatch::StopwatchRegistry,
    Result,
};

/// Manager-side handle to one worker's outbound channel.
///
/// Sends are best-effort: a worker that already exited simply misses its
/// reply, which is never retried or escalated.
#[derive(Clone)]
pub struct ShardLink {
    id: ShardId,
    tx: mpsc::UnboundedSender<ManagerMessage>,
}

impl ShardLink {
    pub fn id(&self) -> ShardId {
        self.id
    }

    fn send(&self, msg: ManagerMessage) {
        if self.tx.send(msg).is_err() {
            tracing::debug!(shard = %self.id, "dropped reply for disconnected shard");
        }
    }
}

struct CoreState {
    stats: StatsBook,
    stopwatch: StopwatchRegistry,
}

struct ManagerInner {
    cfg: Arc<Config>,
    broker: SqlBroker,
    alerts: Alerter,
    state: Mutex<CoreState>,
    /// Attached shards and whether each has signalled `Ready`.
    shards: Mutex<HashMap<ShardId, bool>>,
    started_at_ms: u64,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ShardManager {
    inner: Arc<ManagerInner>,
}

impl ShardManager {
    pub fn new(cfg: Arc<Config>, broker: SqlBroker, stats: StatsBook) -> Self {
        let alerts = Alerter::from_config(&cfg);
        Self {
            inner: Arc::new(ManagerInner {
                cfg,
                broker,
                alerts,
                state: Mutex::new(CoreState {
                    stats,
                    stopwatch: StopwatchRegistry::new(),
                }),
                shards: Mutex::new(HashMap::new()),
                started_at_ms: epoch_ms(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn every shard's supervisor plus the periodic stats flush.
    pub async fn start(&self) -> Result<()> {
        let count = self.inner.cfg.shard_count;
        tracing::info!(shards = count, "starting shard manager");

        for ordinal in 0..count {
            self.spawn_supervisor(ShardId(ordinal));
        }
        self.spawn_flush_loop();

        self.inner
            .alerts
            .status(Embed::new("Online", COLOR_ONLINE).description(format!("{count} shards")));
        Ok(())
    }

    /// Stop supervisors and the flush loop, then take a final stats snapshot.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let state = self.inner.state.lock().await;
        if let Err(error) = state.stats.save() {
            tracing::error!(%error, "final stats flush failed");
        }
    }

    pub async fn ready_count(&self) -> usize {
        self.inner
            .shards
            .lock()
            .await
            .values()
            .filter(|ready| **ready)
            .count()
    }

    fn spawn_supervisor(&self, id: ShardId) {
        let mgr = self.clone();
        tokio::spawn(async move {
            loop {
                match mgr.run_shard_once(id).await {
                    Ok(status) => {
                        tracing::warn!(shard = %id, %status, "shard exited");
                        mgr.inner.alerts.error(
                            format!("Shard {id} exited"),
                            Some(status.to_string()),
                            status.code().map(|c| c.to_string()),
                        );
                    }
                    Err(error) => {
                        tracing::error!(shard = %id, %error, "shard failed to run");
                        mgr.inner
                            .alerts
                            .error(format!("Shard {id} failed"), Some(error.to_string()), None);
                    }
                }

                tokio::select! {
                    _ = mgr.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(mgr.inner.cfg.respawn_delay) => {}
                }
                tracing::info!(shard = %id, "respawning shard");
            }
        });
    }

    /// Spawn one worker process and pump its messages until it exits.
    ///
    /// The attach path is identical for a first launch and a respawn, which
    /// is what re-wires dispatch onto a replacement channel.
    async fn run_shard_once(&self, id: ShardId) -> Result<std::process::ExitStatus> {
        let cfg = &self.inner.cfg;
        let program = match &cfg.shard_program {
            Some(p) => p.clone(),
            None => std::env::current_exe()?,
        };

        let mut cmd = Command::new(program);
        cmd.arg("--shard").arg(id.0.to_string());
        if cfg.test_mode {
            cmd.arg("test");
            cmd.env("DISCORD_TEST_TOKEN", &cfg.token);
        } else {
            cmd.env("DISCORD_TOKEN", &cfg.token);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("shard stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("shard stdout was not captured".to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ManagerMessage>();
        let link = ShardLink { id, tx };
        self.inner.shards.lock().await.insert(id, false);
        tracing::info!(shard = %id, "launched shard");

        // Writer: drain outbound replies into the child's stdin. A write
        // failure means the child is gone; the reader loop will notice.
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&msg) else {
                    continue;
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    let _ = child.start_kill();
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.dispatch_line(&link, &line).await,
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(shard = %id, %error, "shard stdout read failed");
                            break;
                        }
                    }
                }
            }
        }

        self.inner.shards.lock().await.remove(&id);
        writer.abort();
        Ok(child.wait().await?)
    }

    async fn dispatch_line(&self, link: &ShardLink, line: &str) {
        let msg = match serde_json::from_str::<ShardMessage>(line) {
            Ok(msg) => msg,
            Err(error) => {
                // Unrecognized traffic gets no reply and no fallback handler.
                tracing::debug!(shard = %link.id, %error, "ignoring malformed shard message");
                return;
            }
        };
        self.dispatch(link, msg).await;
    }

    /// Route one inbound message. Every arm runs to completion before the
    /// caller reads the next line, except the database call, which suspends
    /// only its own request/reply pair on a spawned task.
    async fn dispatch(&self, link: &ShardLink, msg: ShardMessage) {
        match msg {
            ShardMessage::Ready => {
                self.mark_ready(link.id).await;
                tracing::info!(shard = %link.id, "shard ready");
                link.send(ManagerMessage::Hello {
                    shard: link.id,
                    started_at_ms: self.inner.started_at_ms,
                });
            }
            ShardMessage::Sql {
                id,
                op,
                query,
                args,
            } => {
                let broker = self.inner.broker.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    match broker.execute(op, query, args).await {
                        Ok(result) => link.send(ManagerMessage::SqlResult { id, result }),
                        Err(error) => link.send(ManagerMessage::SqlError { id, error }),
                    }
                });
            }
            ShardMessage::Stopwatch { id } => {
                let start_ms = {
                    let mut state = self.inner.state.lock().await;
                    state.stopwatch.signal(&id, epoch_ms())
                };
                link.send(ManagerMessage::Stopwatch { id, start_ms });
            }
            ShardMessage::UpdateStats { delta } => {
                let mut state = self.inner.state.lock().await;
                if let Err(error) = state.stats.apply(&delta) {
                    tracing::error!(shard = %link.id, %error, "rejected stats delta");
                }
            }
            ShardMessage::GetStats { id, query } => {
                let state = self.inner.state.lock().await;
                let value = match query {
                    StatsQuery::Commands => {
                        Some(StatsValue::Tree(state.stats.commands().clone()))
                    }
                    StatsQuery::Daily { key } => state.stats.daily(&key).cloned(),
                    StatsQuery::Weekly { key } => state.stats.weekly(&key).cloned(),
                };
                link.send(ManagerMessage::Stats { id, value });
            }
        }
    }

    async fn mark_ready(&self, id: ShardId) {
        if let Some(ready) = self.inner.shards.lock().await.get_mut(&id) {
            *ready = true;
        }
    }

    fn spawn_flush_loop(&self) {
        let mgr = self.clone();
        tokio::spawn(async move {
            let period = mgr.inner.cfg.stats_flush_interval;
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = mgr.inner.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let state = mgr.inner.state.lock().await;
                        if let Err(error) = state.stats.save() {
                            tracing::error!(%error, "stats flush failed");
                        }
                    }
                }
            }
        });
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::RequestId,
        ipc::{SqlOp, SqlOutcome},
    };
    use serde_json::json;

    fn test_manager(dir: &std::path::Path) -> ShardManager {
        let cfg = Arc::new(Config::for_tests(dir));
        std::fs::create_dir_all(&cfg.stats_dir).unwrap();
        let broker = SqlBroker::open_in_memory().unwrap();
        let stats = StatsBook::load(&cfg.stats_dir).unwrap();
        ShardManager::new(cfg, broker, stats)
    }

    fn test_link(ordinal: u32) -> (ShardLink, mpsc::UnboundedReceiver<ManagerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ShardLink {
                id: ShardId(ordinal),
                tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn ready_is_answered_with_identity_and_uptime_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, mut rx) = test_link(3);

        mgr.dispatch(&link, ShardMessage::Ready).await;

        let ManagerMessage::Hello {
            shard,
            started_at_ms,
        } = rx.recv().await.unwrap()
        else {
            panic!("expected hello");
        };
        assert_eq!(shard, ShardId(3));
        assert_eq!(started_at_ms, mgr.inner.started_at_ms);
    }

    #[tokio::test]
    async fn sql_replies_carry_the_request_correlation_id() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, mut rx) = test_link(0);

        mgr.dispatch(
            &link,
            ShardMessage::Sql {
                id: RequestId(41),
                op: SqlOp::Run,
                query: "CREATE TABLE songs (title TEXT)".to_string(),
                args: vec![],
            },
        )
        .await;

        let ManagerMessage::SqlResult { id, .. } = rx.recv().await.unwrap() else {
            panic!("expected sql result");
        };
        assert_eq!(id, RequestId(41));
    }

    #[tokio::test]
    async fn sql_failure_is_reported_only_as_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, mut rx) = test_link(0);

        mgr.dispatch(
            &link,
            ShardMessage::Sql {
                id: RequestId(1),
                op: SqlOp::Get,
                query: "SELECT x FROM missing".to_string(),
                args: vec![],
            },
        )
        .await;

        let ManagerMessage::SqlError { id, error } = rx.recv().await.unwrap() else {
            panic!("expected sql error");
        };
        assert_eq!(id, RequestId(1));
        assert!(!error.is_empty());
    }

    #[tokio::test]
    async fn replies_route_to_the_originating_shard_even_with_equal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link_a, mut rx_a) = test_link(1);
        let (link_b, mut rx_b) = test_link(2);

        // Both workers use RequestId(7): ids are scoped per requester.
        mgr.dispatch(
            &link_a,
            ShardMessage::Sql {
                id: RequestId(7),
                op: SqlOp::Run,
                query: "CREATE TABLE a (x)".to_string(),
                args: vec![],
            },
        )
        .await;
        mgr.dispatch(
            &link_b,
            ShardMessage::Sql {
                id: RequestId(7),
                op: SqlOp::Get,
                query: "SELECT 1 AS one".to_string(),
                args: vec![],
            },
        )
        .await;

        let to_a = rx_a.recv().await.unwrap();
        let to_b = rx_b.recv().await.unwrap();

        assert!(matches!(
            to_a,
            ManagerMessage::SqlResult {
                id: RequestId(7),
                result: SqlOutcome::Done(_)
            }
        ));
        let ManagerMessage::SqlResult {
            id: RequestId(7),
            result: SqlOutcome::Row(Some(row)),
        } = to_b
        else {
            panic!("expected b's own get result");
        };
        assert_eq!(row.get("one"), Some(&json!(1)));
        assert!(rx_a.try_recv().is_err(), "worker a must see exactly one reply");
    }

    #[tokio::test]
    async fn stopwatch_round_trip_pairs_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, mut rx) = test_link(0);

        mgr.dispatch(
            &link,
            ShardMessage::Stopwatch {
                id: "user-9".to_string(),
            },
        )
        .await;
        let ManagerMessage::Stopwatch { start_ms: None, .. } = rx.recv().await.unwrap() else {
            panic!("first signal must open the measurement");
        };

        mgr.dispatch(
            &link,
            ShardMessage::Stopwatch {
                id: "user-9".to_string(),
            },
        )
        .await;
        let ManagerMessage::Stopwatch {
            start_ms: Some(start),
            ..
        } = rx.recv().await.unwrap()
        else {
            panic!("second signal must close the measurement");
        };
        assert!(start <= epoch_ms());

        // Entry is gone: a third signal opens again.
        mgr.dispatch(
            &link,
            ShardMessage::Stopwatch {
                id: "user-9".to_string(),
            },
        )
        .await;
        let ManagerMessage::Stopwatch { start_ms: None, .. } = rx.recv().await.unwrap() else {
            panic!("third signal must open a fresh measurement");
        };
    }

    #[tokio::test]
    async fn stats_deltas_merge_silently_and_reads_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, mut rx) = test_link(0);

        let delta: crate::stats::StatsDelta = serde_json::from_value(json!({
            "commands": {"play": 2},
            "daily": {"2026-08-06": {"play": 2}},
            "weekly": {"2026-W32": {"play": 2}},
        }))
        .unwrap();
        mgr.dispatch(&link, ShardMessage::UpdateStats { delta: delta.clone() })
            .await;
        mgr.dispatch(&link, ShardMessage::UpdateStats { delta }).await;
        assert!(rx.try_recv().is_err(), "stats reports are never answered");

        mgr.dispatch(
            &link,
            ShardMessage::GetStats {
                id: RequestId(5),
                query: StatsQuery::Daily {
                    key: "2026-08-06".to_string(),
                },
            },
        )
        .await;
        let ManagerMessage::Stats { id, value } = rx.recv().await.unwrap() else {
            panic!("expected stats reply");
        };
        assert_eq!(id, RequestId(5));
        assert_eq!(
            value,
            Some(serde_json::from_value(json!({"play": 4})).unwrap())
        );

        // Missing key: reply still arrives, value absent.
        mgr.dispatch(
            &link,
            ShardMessage::GetStats {
                id: RequestId(6),
                query: StatsQuery::Weekly {
                    key: "2026-W01".to_string(),
                },
            },
        )
        .await;
        let ManagerMessage::Stats { value, .. } = rx.recv().await.unwrap() else {
            panic!("expected stats reply");
        };
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_without_a_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, mut rx) = test_link(0);

        mgr.dispatch_line(&link, "{\"kind\": \"selfdestruct\"}").await;
        mgr.dispatch_line(&link, "garbage").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reply_to_a_disconnected_shard_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let (link, rx) = test_link(0);
        drop(rx);

        // Must not panic or error: delivery failures are best-effort.
        mgr.dispatch(
            &link,
            ShardMessage::Stopwatch {
                id: "x".to_string(),
            },
        )
        .await;
    }
}
