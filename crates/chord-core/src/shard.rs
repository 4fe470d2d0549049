//! Worker-side half of the IPC protocol.
//!
//! A shard worker talks to the manager over its own stdin/stdout. The
//! [`ManagerLink`] turns that byte stream into correlated request futures:
//! each request draws a fresh [`RequestId`] from a per-process counter, parks
//! a oneshot sender, and resolves when the matching reply line arrives.
//! Requests carry no timeout; a reply that never comes is only unblocked by
//! the link shutting down.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};

use crate::{
    config::Config,
    domain::{RequestId, ShardId},
    errors::Error,
    ipc::{ManagerMessage, ShardMessage, SqlDone, SqlOp, SqlOutcome, SqlRow, StatsQuery},
    stats::{StatsDelta, StatsTree, StatsValue},
    Result,
};

/// The manager's answer to `Ready`.
#[derive(Clone, Copy, Debug)]
pub struct Hello {
    pub shard: ShardId,
    /// Orchestrator process-start baseline (epoch ms), for uptime reporting.
    pub started_at_ms: u64,
}

#[derive(Default)]
struct Pending {
    /// Set once the reader sees EOF; no new waiter may park after that.
    closed: bool,
    hello: Option<oneshot::Sender<Hello>>,
    sql: HashMap<RequestId, oneshot::Sender<std::result::Result<SqlOutcome, String>>>,
    stats: HashMap<RequestId, oneshot::Sender<Option<StatsValue>>>,
    // One in-flight signal per id; a re-signal before the reply replaces
    // (and thereby fails) the earlier waiter.
    stopwatch: HashMap<String, oneshot::Sender<Option<u64>>>,
}

pub struct ManagerLink {
    out: mpsc::UnboundedSender<ShardMessage>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

impl ManagerLink {
    /// Attach to the manager over this process's stdio.
    pub fn over_stdio() -> (Arc<Self>, JoinHandle<()>) {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Attach over arbitrary byte streams. Returns the link and the reader
    /// task, which runs until the manager closes its end.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Arc<Self>, JoinHandle<()>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, mut rx) = mpsc::unbounded_channel::<ShardMessage>();
        let link = Arc::new(Self {
            out,
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&msg) else {
                    continue;
                };
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let reader_link = link.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reader_link.handle_line(&line).await;
            }
            // Manager is gone: unblock every waiter instead of hanging.
            reader_link.fail_pending().await;
        });

        (link, handle)
    }

    /// Announce this shard and wait for its identity/uptime baseline.
    pub async fn ready(&self) -> Result<Hello> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(closed());
            }
            pending.hello = Some(tx);
        }
        if !self.send(ShardMessage::Ready) {
            self.pending.lock().await.hello = None;
            return Err(closed());
        }
        rx.await.map_err(|_| closed())
    }

    pub async fn sql_get(&self, query: &str, args: Vec<serde_json::Value>) -> Result<Option<SqlRow>> {
        match self.sql(SqlOp::Get, query, args).await? {
            SqlOutcome::Row(row) => Ok(row),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn sql_run(&self, query: &str, args: Vec<serde_json::Value>) -> Result<SqlDone> {
        match self.sql(SqlOp::Run, query, args).await? {
            SqlOutcome::Done(done) => Ok(done),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn sql_all(&self, query: &str, args: Vec<serde_json::Value>) -> Result<Vec<SqlRow>> {
        match self.sql(SqlOp::All, query, args).await? {
            SqlOutcome::Rows(rows) => Ok(rows),
            other => Err(unexpected(&other)),
        }
    }

    /// Signal the cross-process stopwatch. `None` means this signal opened a
    /// measurement; `Some(start_ms)` means it closed the one opened earlier
    /// (possibly by a different worker).
    pub async fn stopwatch(&self, id: &str) -> Result<Option<u64>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(closed());
            }
            pending.stopwatch.insert(id.to_string(), tx);
        }
        if !self.send(ShardMessage::Stopwatch { id: id.to_string() }) {
            self.pending.lock().await.stopwatch.remove(id);
            return Err(closed());
        }
        rx.await.map_err(|_| closed())
    }

    /// Report a usage delta. Fire-and-forget: there is no reply to wait for.
    pub fn update_stats(&self, delta: StatsDelta) {
        let _ = self.send(ShardMessage::UpdateStats { delta });
    }

    pub async fn get_commands(&self) -> Result<StatsTree> {
        match self.get_stats(StatsQuery::Commands).await? {
            Some(StatsValue::Tree(tree)) => Ok(tree),
            Some(StatsValue::Count(_)) => {
                Err(Error::Ipc("commands tree came back as a counter".to_string()))
            }
            None => Ok(StatsTree::new()),
        }
    }

    pub async fn get_daily(&self, key: &str) -> Result<Option<StatsValue>> {
        self.get_stats(StatsQuery::Daily {
            key: key.to_string(),
        })
        .await
    }

    pub async fn get_weekly(&self, key: &str) -> Result<Option<StatsValue>> {
        self.get_stats(StatsQuery::Weekly {
            key: key.to_string(),
        })
        .await
    }

    async fn sql(
        &self,
        op: SqlOp,
        query: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<SqlOutcome> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(closed());
            }
            pending.sql.insert(id, tx);
        }
        let sent = self.send(ShardMessage::Sql {
            id,
            op,
            query: query.to_string(),
            args,
        });
        if !sent {
            self.pending.lock().await.sql.remove(&id);
            return Err(closed());
        }

        match rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(error)) => Err(Error::Query(error)),
            Err(_) => Err(closed()),
        }
    }

    async fn get_stats(&self, query: StatsQuery) -> Result<Option<StatsValue>> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(closed());
            }
            pending.stats.insert(id, tx);
        }
        if !self.send(ShardMessage::GetStats { id, query }) {
            self.pending.lock().await.stats.remove(&id);
            return Err(closed());
        }
        rx.await.map_err(|_| closed())
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, msg: ShardMessage) -> bool {
        self.out.send(msg).is_ok()
    }

    async fn handle_line(&self, line: &str) {
        let msg = match serde_json::from_str::<ManagerMessage>(line) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::debug!(%error, "ignoring malformed manager message");
                return;
            }
        };

        let mut pending = self.pending.lock().await;
        match msg {
            ManagerMessage::Hello {
                shard,
                started_at_ms,
            } => {
                if let Some(tx) = pending.hello.take() {
                    let _ = tx.send(Hello {
                        shard,
                        started_at_ms,
                    });
                }
            }
            ManagerMessage::SqlResult { id, result } => {
                if let Some(tx) = pending.sql.remove(&id) {
                    let _ = tx.send(Ok(result));
                } else {
                    tracing::debug!(%id, "sql reply with no pending request");
                }
            }
            ManagerMessage::SqlError { id, error } => {
                if let Some(tx) = pending.sql.remove(&id) {
                    let _ = tx.send(Err(error));
                }
            }
            ManagerMessage::Stopwatch { id, start_ms } => {
                if let Some(tx) = pending.stopwatch.remove(&id) {
                    let _ = tx.send(start_ms);
                }
            }
            ManagerMessage::Stats { id, value } => {
                if let Some(tx) = pending.stats.remove(&id) {
                    let _ = tx.send(value);
                }
            }
        }
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        // Dropping the senders wakes every waiter with a closed-link error.
        pending.hello = None;
        pending.sql.clear();
        pending.stats.clear();
        pending.stopwatch.clear();
    }
}

fn closed() -> Error {
    Error::Ipc("manager link closed".to_string())
}

fn unexpected(outcome: &SqlOutcome) -> Error {
    Error::Ipc(format!("unexpected sql outcome: {outcome:?}"))
}

/// Entry point for a `--shard N` worker process.
///
/// Attaches the stdio link, announces readiness, and then serves until the
/// manager closes the pipe. The gateway session owning this shard's
/// partition of connections binds its event handlers to the returned link;
/// that glue lives outside this crate.
pub async fn run_worker(cfg: Arc<Config>, id: ShardId) -> Result<()> {
    tracing::info!(shard = %id, test_mode = cfg.test_mode, "shard worker starting");

    let (link, reader) = ManagerLink::over_stdio();
    let hello = link.ready().await?;
    tracing::info!(
        shard = %hello.shard,
        started_at_ms = hello.started_at_ms,
        "shard ready"
    );

    reader
        .await
        .map_err(|e| Error::External(format!("link reader failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Fake manager that answers over an in-memory pipe the way the real
    /// router would.
    fn fake_manager(io: tokio::io::DuplexStream) {
        let (reader, mut writer) = tokio::io::split(io);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(msg) = serde_json::from_str::<ShardMessage>(&line) else {
                    continue;
                };
                let reply = match msg {
                    ShardMessage::Ready => ManagerMessage::Hello {
                        shard: ShardId(2),
                        started_at_ms: 1_234,
                    },
                    ShardMessage::Sql { id, query, .. } if query.contains("missing") => {
                        ManagerMessage::SqlError {
                            id,
                            error: "no such table: missing".to_string(),
                        }
                    }
                    ShardMessage::Sql { id, .. } => {
                        let mut row = SqlRow::new();
                        row.insert("volume".to_string(), json!(80));
                        ManagerMessage::SqlResult {
                            id,
                            result: SqlOutcome::Row(Some(row)),
                        }
                    }
                    ShardMessage::Stopwatch { id } => ManagerMessage::Stopwatch {
                        id,
                        start_ms: Some(42),
                    },
                    ShardMessage::UpdateStats { .. } => continue,
                    ShardMessage::GetStats { id, .. } => ManagerMessage::Stats {
                        id,
                        value: Some(StatsValue::Count(7)),
                    },
                };
                let mut out = serde_json::to_string(&reply).unwrap();
                out.push('\n');
                if writer.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }

    fn linked() -> Arc<ManagerLink> {
        let (worker_io, manager_io) = tokio::io::duplex(4096);
        fake_manager(manager_io);
        let (reader, writer) = tokio::io::split(worker_io);
        let (link, _handle) = ManagerLink::spawn(reader, writer);
        link
    }

    #[tokio::test]
    async fn ready_handshake_returns_identity_and_baseline() {
        let link = linked();
        let hello = link.ready().await.unwrap();
        assert_eq!(hello.shard, ShardId(2));
        assert_eq!(hello.started_at_ms, 1_234);
    }

    #[tokio::test]
    async fn sql_requests_correlate_over_the_pipe() {
        let link = linked();

        let row = link
            .sql_get("SELECT volume FROM guilds WHERE id = ?1", vec![json!("1")])
            .await
            .unwrap()
            .expect("row");
        assert_eq!(row.get("volume"), Some(&json!(80)));

        // A second request draws a new id and still resolves.
        let row = link.sql_get("SELECT volume FROM guilds", vec![]).await.unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn sql_errors_surface_as_query_failures() {
        let link = linked();
        let err = link.sql_get("SELECT x FROM missing", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Query(ref msg) if msg.contains("missing")));
    }

    #[tokio::test]
    async fn stopwatch_replies_route_by_id() {
        let link = linked();
        assert_eq!(link.stopwatch("user-1").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn stats_report_then_read_resolves() {
        let link = linked();

        // The report itself is one-way; the read after it still correlates.
        link.update_stats(StatsDelta::default());
        assert_eq!(
            link.get_daily("2026-08-06").await.unwrap(),
            Some(StatsValue::Count(7))
        );
    }

    #[tokio::test]
    async fn pending_requests_fail_when_the_manager_goes_away() {
        let (worker_io, manager_io) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(worker_io);
        let (link, _handle) = ManagerLink::spawn(reader, writer);

        // Manager closes without ever answering.
        drop(manager_io);

        let err = link.sql_get("SELECT 1", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Ipc(_)));
    }
}
