use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the orchestrator and its shard workers.
///
/// Everything comes from the environment (with an optional `.env` file); the
/// `test` flag comes from argv and switches the gateway credential while
/// leaving IPC and persistence behavior untouched.
#[derive(Clone, Debug)]
pub struct Config {
    // Gateway credential, selected by test mode.
    pub token: String,
    pub test_mode: bool,

    // Process topology
    pub shard_count: u32,
    /// Worker executable; defaults to the running binary re-invoked with `--shard N`.
    pub shard_program: Option<PathBuf>,
    pub respawn_delay: Duration,

    // Media tree (database, stats snapshots, scratch files)
    pub media_dir: PathBuf,
    pub database_path: PathBuf,
    pub stats_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub stats_flush_interval: Duration,

    // Alerting sinks (fire-and-forget, disabled in test mode)
    pub status_webhook_url: Option<String>,
    pub error_webhook_url: Option<String>,

    // Collaborator credentials
    pub soundcloud_client_id: Option<String>,
}

impl Config {
    pub fn load(test_mode: bool) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let token_var = if test_mode {
            "DISCORD_TEST_TOKEN"
        } else {
            "DISCORD_TOKEN"
        };
        let token = env_str(token_var).unwrap_or_default();
        if token.trim().is_empty() {
            return Err(Error::Config(format!(
                "{token_var} environment variable is required"
            )));
        }

        let shard_count = env_u32("SHARD_COUNT").unwrap_or(1);
        if shard_count == 0 {
            return Err(Error::Config("SHARD_COUNT must be at least 1".to_string()));
        }

        let shard_program = env_path("SHARD_PROGRAM");
        let respawn_delay = Duration::from_millis(env_u64("SHARD_RESPAWN_DELAY_MS").unwrap_or(5_000));

        let media_dir = env_path("MEDIA_DIR").unwrap_or_else(|| PathBuf::from("media"));
        let database_path = env_path("DATABASE_PATH").unwrap_or_else(|| media_dir.join("db.sqlite"));
        let stats_dir = env_path("STATS_DIR").unwrap_or_else(|| media_dir.join("stats"));
        let temp_dir = env_path("TEMP_DIR").unwrap_or_else(|| media_dir.join("temp"));

        let stats_flush_interval =
            Duration::from_millis(env_u64("STATS_FLUSH_INTERVAL_MS").unwrap_or(30_000));

        // Snapshot and scratch directories must exist before first flush.
        fs::create_dir_all(&stats_dir)?;
        fs::create_dir_all(&temp_dir)?;

        let status_webhook_url = env_str("STATUS_WEBHOOK_URL").and_then(non_empty);
        let error_webhook_url = env_str("ERROR_WEBHOOK_URL").and_then(non_empty);
        let soundcloud_client_id = env_str("SOUNDCLOUD_CLIENT_ID").and_then(non_empty);

        Ok(Self {
            token,
            test_mode,
            shard_count,
            shard_program,
            respawn_delay,
            media_dir,
            database_path,
            stats_dir,
            temp_dir,
            stats_flush_interval,
            status_webhook_url,
            error_webhook_url,
            soundcloud_client_id,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
impl Config {
    /// In-memory config pointed at a scratch media tree; no env involved.
    pub(crate) fn for_tests(media_dir: &Path) -> Self {
        Self {
            token: "test-token".to_string(),
            test_mode: true,
            shard_count: 2,
            shard_program: None,
            respawn_delay: Duration::from_millis(10),
            media_dir: media_dir.to_path_buf(),
            database_path: media_dir.join("db.sqlite"),
            stats_dir: media_dir.join("stats"),
            temp_dir: media_dir.join("temp"),
            stats_flush_interval: Duration::from_secs(30),
            status_webhook_url: None,
            error_webhook_url: None,
            soundcloud_client_id: None,
        }
    }
}
