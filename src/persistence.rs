// src/persistence.rs - Change-log persistence contract and two stores: an
// in-memory one for tests and simple deployments, and an append-only
// JSON-lines file. Logging is best effort; the in-memory model stays the
// source of truth for live control.

use crate::config::AlarmDefinition;
use crate::error::Result;
use crate::manager::AlarmChange;
use crate::state::{AlarmState, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// One record in the alarm change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry<S = AlarmState> {
    /// Monotonic record id assigned by the store
    pub record_id: i64,
    /// Alarm the change belongs to
    pub alarm_id: String,
    /// State after the change
    pub state: S,
    /// Message after the change
    pub message: Option<String>,
    /// Code after the change
    pub code: i32,
    /// Engine/operator annotation
    pub comment: Option<String>,
    /// When the change was applied
    pub at: DateTime<Utc>,
}

/// Persistence contract for alarm definitions and the state-change log.
#[async_trait]
pub trait AlarmStore<S: Severity>: Send + Sync {
    /// Append one change to the log, returning its record id.
    async fn log_change(&self, change: &AlarmChange<S>) -> Result<i64>;

    /// When the alarm last logged a raised state, or `None` for never.
    async fn last_raised(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// When the alarm last logged a quiescent state, or `None` for never.
    async fn last_lowered(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// When the alarm was last logged disabled, or `None` for never.
    async fn last_disabled(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Alarm definitions to register at startup.
    async fn load_definitions(&self) -> Result<Vec<AlarmDefinition>>;
}

fn entry_of<S: Severity>(record_id: i64, change: &AlarmChange<S>) -> LogEntry<S> {
    LogEntry {
        record_id,
        alarm_id: change.id.clone(),
        state: change.state,
        message: change.message.clone(),
        code: change.code,
        comment: change.comment.clone(),
        at: change.at,
    }
}

/// Volatile store backed by a `Vec`.
pub struct MemoryStore<S = AlarmState> {
    definitions: Vec<AlarmDefinition>,
    entries: Mutex<Vec<LogEntry<S>>>,
}

impl<S: Severity> MemoryStore<S> {
    /// Empty store with the given startup definitions.
    pub fn new(definitions: Vec<AlarmDefinition>) -> Self {
        Self {
            definitions,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// All logged entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry<S>> {
        self.entries.lock().clone()
    }

    fn last_matching(&self, alarm_id: &str, pred: impl Fn(S) -> bool) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|e| e.alarm_id == alarm_id && pred(e.state))
            .map(|e| e.at)
    }
}

#[async_trait]
impl<S: Severity> AlarmStore<S> for MemoryStore<S> {
    async fn log_change(&self, change: &AlarmChange<S>) -> Result<i64> {
        let mut entries = self.entries.lock();
        let record_id = entries.len() as i64 + 1;
        entries.push(entry_of(record_id, change));
        Ok(record_id)
    }

    async fn last_raised(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_matching(alarm_id, |s| s.is_raised()))
    }

    async fn last_lowered(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_matching(alarm_id, |s| s.is_quiescent()))
    }

    async fn last_disabled(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_matching(alarm_id, |s| s.is_disabled()))
    }

    async fn load_definitions(&self) -> Result<Vec<AlarmDefinition>> {
        Ok(self.definitions.clone())
    }
}

#[derive(Default)]
struct JsonlIndex {
    next_id: i64,
    last_raised: HashMap<String, DateTime<Utc>>,
    last_lowered: HashMap<String, DateTime<Utc>>,
    last_disabled: HashMap<String, DateTime<Utc>>,
}

impl JsonlIndex {
    fn absorb<S: Severity>(&mut self, entry: &LogEntry<S>) {
        self.next_id = self.next_id.max(entry.record_id);
        let bucket = if entry.state.is_raised() {
            &mut self.last_raised
        } else if entry.state.is_quiescent() {
            &mut self.last_lowered
        } else {
            &mut self.last_disabled
        };
        bucket.insert(entry.alarm_id.clone(), entry.at);
    }
}

/// Append-only JSON-lines change log with an in-memory timestamp index.
pub struct JsonlStore<S = AlarmState> {
    path: PathBuf,
    definitions: Vec<AlarmDefinition>,
    index: Mutex<JsonlIndex>,
    _marker: std::marker::PhantomData<S>,
}

impl<S: Severity> JsonlStore<S> {
    /// Open (or create) the log at `path`, replaying existing records to
    /// seed the timestamp index.
    pub async fn open(path: impl AsRef<Path>, definitions: Vec<AlarmDefinition>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut index = JsonlIndex::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<LogEntry<S>>(line) {
                        Ok(entry) => index.absorb(&entry),
                        Err(e) => {
                            tracing::warn!("skipping corrupt change-log line: {}", e);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            path,
            definitions,
            index: Mutex::new(index),
            _marker: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<S: Severity> AlarmStore<S> for JsonlStore<S> {
    async fn log_change(&self, change: &AlarmChange<S>) -> Result<i64> {
        let entry = {
            let mut index = self.index.lock();
            index.next_id += 1;
            let entry = entry_of(index.next_id, change);
            index.absorb(&entry);
            entry
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| crate::error::SirenError::Config(format!("log encode: {}", e)))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(entry.record_id)
    }

    async fn last_raised(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.index.lock().last_raised.get(alarm_id).copied())
    }

    async fn last_lowered(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.index.lock().last_lowered.get(alarm_id).copied())
    }

    async fn last_disabled(&self, alarm_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.index.lock().last_disabled.get(alarm_id).copied())
    }

    async fn load_definitions(&self) -> Result<Vec<AlarmDefinition>> {
        Ok(self.definitions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NO_CODE;

    fn change(id: &str, state: AlarmState) -> AlarmChange<AlarmState> {
        AlarmChange {
            id: id.to_string(),
            name: id.to_string(),
            state,
            message: None,
            code: NO_CODE,
            testing: false,
            comment: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_buckets() {
        let store: MemoryStore = MemoryStore::new(Vec::new());
        assert_eq!(store.last_raised("smoke1").await.unwrap(), None);

        store.log_change(&change("smoke1", AlarmState::Critical)).await.unwrap();
        store.log_change(&change("smoke1", AlarmState::Lowered)).await.unwrap();
        store.log_change(&change("gas1", AlarmState::Disabled)).await.unwrap();

        assert!(store.last_raised("smoke1").await.unwrap().is_some());
        assert!(store.last_lowered("smoke1").await.unwrap().is_some());
        assert_eq!(store.last_disabled("smoke1").await.unwrap(), None);
        assert!(store.last_disabled("gas1").await.unwrap().is_some());
        assert_eq!(store.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_jsonl_store_replays_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarm_log.jsonl");

        let store: JsonlStore = JsonlStore::open(&path, Vec::new()).await.unwrap();
        let id1 = store.log_change(&change("smoke1", AlarmState::Severe)).await.unwrap();
        let id2 = store.log_change(&change("smoke1", AlarmState::Lowered)).await.unwrap();
        assert!(id2 > id1);

        // reopen: index is rebuilt from the file and ids keep advancing
        let reopened: JsonlStore = JsonlStore::open(&path, Vec::new()).await.unwrap();
        assert!(reopened.last_raised("smoke1").await.unwrap().is_some());
        assert!(reopened.last_lowered("smoke1").await.unwrap().is_some());
        let id3 = reopened.log_change(&change("smoke1", AlarmState::Minor)).await.unwrap();
        assert!(id3 > id2);
    }
}
