/// Core error type for the bot workspace.
///
/// Per-request query failures travel back to the requesting shard as
/// [`Error::Query`]; everything else is local to the process that hit it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("query failed: {0}")]
    Query(String),

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("stats shape clash at `{path}`: counter and subtree uses conflict")]
    StatsShape { path: String },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
