//! IPC message vocabulary between the manager and its shard workers.
//!
//! Messages travel as one JSON object per line over the worker's stdio.
//! Each direction is a tagged union dispatched with an explicit match; a line
//! that does not parse is dropped by the receiver. Correlated request/reply
//! pairs round-trip the caller's [`RequestId`] verbatim.

use serde::{Deserialize, Serialize};

use crate::{
    domain::{RequestId, ShardId},
    stats::{StatsDelta, StatsValue},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlOp {
    /// At most one row or nothing.
    Get,
    /// Execution metadata for a mutating statement.
    Run,
    /// Every matching row, in order.
    All,
}

/// One result row, keyed by column name.
pub type SqlRow = serde_json::Map<String, serde_json::Value>;

/// Metadata returned by `run`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlDone {
    pub changes: u64,
    pub last_insert_rowid: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlOutcome {
    Row(Option<SqlRow>),
    Rows(Vec<SqlRow>),
    Done(SqlDone),
}

/// Which stats read a worker is asking for: the whole `commands` tree, or one
/// top-level key of a period tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum StatsQuery {
    Commands,
    Daily { key: String },
    Weekly { key: String },
}

/// Worker → manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShardMessage {
    /// Gateway connections for this shard are up; expects [`ManagerMessage::Hello`].
    Ready,
    Sql {
        id: RequestId,
        op: SqlOp,
        query: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    Stopwatch {
        id: String,
    },
    /// Fire-and-forget usage report; never answered.
    UpdateStats {
        #[serde(flatten)]
        delta: StatsDelta,
    },
    GetStats {
        id: RequestId,
        #[serde(flatten)]
        query: StatsQuery,
    },
}

/// Manager → worker. Replies go only to the worker that asked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManagerMessage {
    /// Answer to `Ready`: the worker's identity and the orchestrator's
    /// process-start baseline, for consistent uptime self-reporting.
    Hello {
        shard: ShardId,
        started_at_ms: u64,
    },
    SqlResult {
        id: RequestId,
        result: SqlOutcome,
    },
    SqlError {
        id: RequestId,
        error: String,
    },
    /// `start_ms` is absent when this signal opened a measurement.
    Stopwatch {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_ms: Option<u64>,
    },
    Stats {
        id: RequestId,
        /// Absent when the queried key does not exist.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<StatsValue>,
    },
}
