//! Thread persistence contract
//!
//! A [`ThreadStore`] keeps, per thread, the graph snapshot (head plus every
//! `{parent_id, message}` entry), the catalog metadata, pending interrupt
//! records and the run audit. [`MemoryStore`] keeps everything in process;
//! the SQLite implementation lives in [`crate::db`].

use crate::error::Result;
use crate::lock_unpoisoned;
use crate::types::{
    InterruptRecord, InterruptStatus, RunRecord, ThreadInfo, ThreadSnapshot, ThreadStatus,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// Run records kept per thread unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Storage for threads, interrupts and run history.
pub trait ThreadStore: Send + Sync {
    /// Persisted snapshot, or `None` when the thread has never been saved.
    fn load_thread(&self, thread_id: &str) -> Result<Option<ThreadSnapshot>>;

    /// Replace the thread's snapshot and bump its `updated_at`.
    ///
    /// Creates the catalog entry when missing.
    fn save_thread(&self, thread_id: &str, snapshot: &ThreadSnapshot) -> Result<()>;

    /// Ensure a catalog entry exists, returning it.
    fn initialize_thread(&self, thread_id: &str) -> Result<ThreadInfo>;

    fn save_interrupt(&self, thread_id: &str, record: &InterruptRecord) -> Result<()>;

    fn clear_interrupt(&self, thread_id: &str, checkpoint_id: &str) -> Result<()>;

    /// Whether `checkpoint_id` still has a pending interrupt recorded.
    fn query_interrupt_status(&self, thread_id: &str, checkpoint_id: &str) -> Result<InterruptStatus>;

    /// Catalog entries, most recently updated first.
    fn list_threads(&self) -> Result<Vec<ThreadInfo>>;

    fn get_thread_info(&self, thread_id: &str) -> Result<Option<ThreadInfo>>;

    /// Returns false when the thread does not exist.
    fn rename_thread(&self, thread_id: &str, title: &str) -> Result<bool>;

    /// Returns false when the thread does not exist.
    fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<bool>;

    /// Remove the thread with its messages, interrupts and runs.
    fn delete_thread(&self, thread_id: &str) -> Result<bool>;

    /// Append to the run audit, trimming to the history limit.
    fn append_run(&self, record: &RunRecord) -> Result<()>;

    /// Run audit, oldest first.
    fn list_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>>;
}

#[derive(Debug, Default)]
struct ThreadEntry {
    info: Option<ThreadInfo>,
    snapshot: Option<ThreadSnapshot>,
    interrupts: HashMap<String, InterruptRecord>,
    runs: Vec<RunRecord>,
}

/// In-process store for tests, demos and embedding.
#[derive(Debug)]
pub struct MemoryStore {
    threads: Mutex<HashMap<String, ThreadEntry>>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }
}

fn ensure_info<'a>(entry: &'a mut ThreadEntry, thread_id: &str) -> &'a mut ThreadInfo {
    entry.info.get_or_insert_with(|| ThreadInfo::new(thread_id))
}

impl ThreadStore for MemoryStore {
    fn load_thread(&self, thread_id: &str) -> Result<Option<ThreadSnapshot>> {
        let threads = lock_unpoisoned(&self.threads);
        Ok(threads.get(thread_id).and_then(|entry| entry.snapshot.clone()))
    }

    fn save_thread(&self, thread_id: &str, snapshot: &ThreadSnapshot) -> Result<()> {
        let mut threads = lock_unpoisoned(&self.threads);
        let entry = threads.entry(thread_id.to_string()).or_default();
        let info = ensure_info(entry, thread_id);
        info.updated_at = Utc::now();
        info.message_count = snapshot.messages.len();
        entry.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn initialize_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let mut threads = lock_unpoisoned(&self.threads);
        let entry = threads.entry(thread_id.to_string()).or_default();
        Ok(ensure_info(entry, thread_id).clone())
    }

    fn save_interrupt(&self, thread_id: &str, record: &InterruptRecord) -> Result<()> {
        let mut threads = lock_unpoisoned(&self.threads);
        let entry = threads.entry(thread_id.to_string()).or_default();
        ensure_info(entry, thread_id);
        entry
            .interrupts
            .insert(record.checkpoint_id.clone(), record.clone());
        Ok(())
    }

    fn clear_interrupt(&self, thread_id: &str, checkpoint_id: &str) -> Result<()> {
        let mut threads = lock_unpoisoned(&self.threads);
        if let Some(entry) = threads.get_mut(thread_id) {
            entry.interrupts.remove(checkpoint_id);
        }
        Ok(())
    }

    fn query_interrupt_status(&self, thread_id: &str, checkpoint_id: &str) -> Result<InterruptStatus> {
        let threads = lock_unpoisoned(&self.threads);
        let payload = threads
            .get(thread_id)
            .and_then(|entry| entry.interrupts.get(checkpoint_id))
            .map(|record| record.payload.clone());
        Ok(InterruptStatus {
            interrupted: payload.is_some(),
            payload,
        })
    }

    fn list_threads(&self) -> Result<Vec<ThreadInfo>> {
        let threads = lock_unpoisoned(&self.threads);
        let mut infos: Vec<ThreadInfo> = threads
            .values()
            .filter_map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(infos)
    }

    fn get_thread_info(&self, thread_id: &str) -> Result<Option<ThreadInfo>> {
        let threads = lock_unpoisoned(&self.threads);
        Ok(threads.get(thread_id).and_then(|entry| entry.info.clone()))
    }

    fn rename_thread(&self, thread_id: &str, title: &str) -> Result<bool> {
        let mut threads = lock_unpoisoned(&self.threads);
        match threads.get_mut(thread_id).and_then(|entry| entry.info.as_mut()) {
            Some(info) => {
                info.title = Some(title.to_string());
                info.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<bool> {
        let mut threads = lock_unpoisoned(&self.threads);
        match threads.get_mut(thread_id).and_then(|entry| entry.info.as_mut()) {
            Some(info) => {
                info.status = status;
                info.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut threads = lock_unpoisoned(&self.threads);
        Ok(threads.remove(thread_id).is_some())
    }

    fn append_run(&self, record: &RunRecord) -> Result<()> {
        let mut threads = lock_unpoisoned(&self.threads);
        let entry = threads.entry(record.thread_id.clone()).or_default();
        ensure_info(entry, &record.thread_id).updated_at = Utc::now();
        entry.runs.push(record.clone());
        if entry.runs.len() > self.history_limit {
            let excess = entry.runs.len() - self.history_limit;
            entry.runs.drain(..excess);
        }
        Ok(())
    }

    fn list_runs(&self, thread_id: &str) -> Result<Vec<RunRecord>> {
        let threads = lock_unpoisoned(&self.threads);
        Ok(threads
            .get(thread_id)
            .map(|entry| entry.runs.clone())
            .unwrap_or_default())
    }
}
