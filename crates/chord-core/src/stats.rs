//! Nested usage counters reported by shard workers.
//!
//! Three named trees exist process-wide (`commands`, `daily`, `weekly`).
//! Workers send additive deltas over IPC; the manager merges them here and a
//! periodic timer rewrites all three snapshot files in full. Data merged after
//! the last flush and before a crash is lost; that is acceptable for telemetry.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// One node of a counter tree: a leaf counter or a nested subtree.
///
/// A key's shape is fixed the first time it is established; a delta that uses
/// an existing counter key as a subtree (or the reverse) is rejected whole.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatsValue {
    Count(i64),
    Tree(StatsTree),
}

pub type StatsTree = BTreeMap<String, StatsValue>;

/// A worker's usage report: one delta per named tree. Omitted trees merge
/// nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    #[serde(default)]
    pub commands: StatsTree,
    #[serde(default)]
    pub daily: StatsTree,
    #[serde(default)]
    pub weekly: StatsTree,
}

/// Add `delta` into `target`: leaf counters sum, subtrees recurse, absent keys
/// are created. The whole delta is validated first, so a shape clash leaves
/// `target` untouched.
pub fn merge(delta: &StatsTree, target: &mut StatsTree) -> Result<()> {
    let mut path = Vec::new();
    ensure_compatible(delta, target, &mut path)?;
    apply(delta, target);
    Ok(())
}

fn ensure_compatible<'a>(
    delta: &'a StatsTree,
    target: &StatsTree,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    for (key, dv) in delta {
        match (dv, target.get(key)) {
            (_, None) => {}
            (StatsValue::Count(_), Some(StatsValue::Count(_))) => {}
            (StatsValue::Tree(dt), Some(StatsValue::Tree(tt))) => {
                path.push(key);
                ensure_compatible(dt, tt, path)?;
                path.pop();
            }
            _ => {
                path.push(key);
                return Err(Error::StatsShape {
                    path: path.join("."),
                });
            }
        }
    }
    Ok(())
}

fn apply(delta: &StatsTree, target: &mut StatsTree) {
    for (key, dv) in delta {
        match dv {
            StatsValue::Count(n) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert(StatsValue::Count(0));
                // Shape clashes were rejected by `ensure_compatible`.
                if let StatsValue::Count(total) = entry {
                    *total += n;
                }
            }
            StatsValue::Tree(dt) => {
                let entry = target
                    .entry(key.clone())
                    .or_insert_with(|| StatsValue::Tree(StatsTree::new()));
                if let StatsValue::Tree(tt) = entry {
                    apply(dt, tt);
                }
            }
        }
    }
}

/// Key for the `daily` tree: UTC calendar date.
pub fn daily_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Key for the `weekly` tree: ISO week.
pub fn weekly_key(now: DateTime<Utc>) -> String {
    let week = now.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

const COMMANDS_FILE: &str = "commands.json";
const DAILY_FILE: &str = "daily.json";
const WEEKLY_FILE: &str = "weekly.json";

/// The three persistent counter trees plus their snapshot directory.
///
/// Loaded once at process start; `save` rewrites every file in full.
#[derive(Debug)]
pub struct StatsBook {
    dir: PathBuf,
    commands: StatsTree,
    daily: StatsTree,
    weekly: StatsTree,
}

impl StatsBook {
    /// A missing snapshot file starts its tree empty (fresh install); a
    /// present-but-unreadable one is a startup error.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        Ok(Self {
            commands: load_tree(&dir.join(COMMANDS_FILE))?,
            daily: load_tree(&dir.join(DAILY_FILE))?,
            weekly: load_tree(&dir.join(WEEKLY_FILE))?,
            dir,
        })
    }

    /// Merge one worker report. All three trees are validated before any of
    /// them is touched, so a rejected report is a no-op.
    pub fn apply(&mut self, delta: &StatsDelta) -> Result<()> {
        let mut path = Vec::new();
        ensure_compatible(&delta.commands, &self.commands, &mut path)?;
        ensure_compatible(&delta.daily, &self.daily, &mut path)?;
        ensure_compatible(&delta.weekly, &self.weekly, &mut path)?;

        apply(&delta.commands, &mut self.commands);
        apply(&delta.daily, &mut self.daily);
        apply(&delta.weekly, &mut self.weekly);
        Ok(())
    }

    pub fn commands(&self) -> &StatsTree {
        &self.commands
    }

    pub fn daily(&self, key: &str) -> Option<&StatsValue> {
        self.daily.get(key)
    }

    pub fn weekly(&self, key: &str) -> Option<&StatsValue> {
        self.weekly.get(key)
    }

    /// Snapshot flush: full rewrite of all three files.
    pub fn save(&self) -> Result<()> {
        save_tree(&self.dir.join(COMMANDS_FILE), &self.commands)?;
        save_tree(&self.dir.join(DAILY_FILE), &self.daily)?;
        save_tree(&self.dir.join(WEEKLY_FILE), &self.weekly)?;
        Ok(())
    }
}

fn load_tree(path: &Path) -> Result<StatsTree> {
    let raw = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StatsTree::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&raw)?)
}

fn save_tree(path: &Path, tree: &StatsTree) -> Result<()> {
    fs::write(path, serde_json::to_string(tree)?)?;
    Ok(())
}
