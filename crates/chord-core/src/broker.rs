//! The single shared database connection and its serialization queue.
//!
//! Every worker's query funnels through one embedded SQLite connection owned
//! by a dedicated thread. Jobs drain in arrival order (no priority, no
//! fairness beyond first-come-first-served), which is enough to keep two
//! executions from interleaving on the connection. A failing query is
//! reported only to its requester and never disturbs the thread or any other
//! pending job.

use std::path::Path;

use rusqlite::{params_from_iter, types, Connection};
use tokio::sync::{mpsc, oneshot};

use crate::{
    ipc::{SqlDone, SqlOp, SqlOutcome, SqlRow},
    Result,
};

struct Job {
    op: SqlOp,
    query: String,
    args: Vec<serde_json::Value>,
    reply: oneshot::Sender<std::result::Result<SqlOutcome, String>>,
}

/// Handle to the connection thread. Cloning shares the same queue; dropping
/// the last handle closes the queue and lets the thread exit.
#[derive(Clone)]
pub struct SqlBroker {
    tx: mpsc::UnboundedSender<Job>,
}

impl SqlBroker {
    /// Open the shared connection. Failure here is startup-fatal for the
    /// orchestrator: there is no partial operation without persistence.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::serve(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::serve(Connection::open_in_memory()?))
    }

    fn serve(conn: Connection) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name("sql-broker".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    let res = run_job(&conn, &job).map_err(|e| e.to_string());
                    if let Err(error) = &res {
                        tracing::error!(query = %job.query, %error, "sql query failed");
                    }
                    // Requester may have gone away; that is its problem.
                    let _ = job.reply.send(res);
                }
            })
            .expect("spawn sql broker thread");

        Self { tx }
    }

    /// Queue a query and wait for the connection thread to reach it.
    ///
    /// The error side is a plain string: it is shipped verbatim to the
    /// requesting worker and must cross the process boundary.
    pub async fn execute(
        &self,
        op: SqlOp,
        query: String,
        args: Vec<serde_json::Value>,
    ) -> std::result::Result<SqlOutcome, String> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            op,
            query,
            args,
            reply,
        };
        if self.tx.send(job).is_err() {
            return Err("database connection closed".to_string());
        }
        rx.await
            .unwrap_or_else(|_| Err("database connection closed".to_string()))
    }
}

fn run_job(conn: &Connection, job: &Job) -> rusqlite::Result<SqlOutcome> {
    let mut stmt = conn.prepare_cached(&job.query)?;
    let params: Vec<types::Value> = job.args.iter().map(json_to_sql).collect();

    match job.op {
        SqlOp::Get => {
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(params))?;
            let row = match rows.next()? {
                Some(row) => Some(row_to_json(row, &columns)?),
                None => None,
            };
            Ok(SqlOutcome::Row(row))
        }
        SqlOp::All => {
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(params))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_json(row, &columns)?);
            }
            Ok(SqlOutcome::Rows(out))
        }
        SqlOp::Run => {
            let changes = stmt.execute(params_from_iter(params))?;
            Ok(SqlOutcome::Done(SqlDone {
                changes: changes as u64,
                last_insert_rowid: conn.last_insert_rowid(),
            }))
        }
    }
}

fn json_to_sql(v: &serde_json::Value) -> types::Value {
    use serde_json::Value;

    match v {
        Value::Null => types::Value::Null,
        Value::Bool(b) => types::Value::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => types::Value::Integer(i),
            None => types::Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => types::Value::Text(s.clone()),
        // Arrays and objects are stored as their JSON text.
        other => types::Value::Text(other.to_string()),
    }
}

fn row_to_json(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<SqlRow> {
    use types::ValueRef;

    let mut out = SqlRow::new();
    for (idx, name) in columns.iter().enumerate() {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Integer(n) => serde_json::Value::from(n),
            ValueRef::Real(f) => serde_json::Value::from(f),
            ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => serde_json::Value::from(b.to_vec()),
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}
