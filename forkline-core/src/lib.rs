//! # forkline-core
//!
//! Core library for forkline - branching chat threads over a checkpointed
//! execution engine.
//!
//! This library provides:
//! - A message graph with branch siblings and a selectable head
//! - Checkpoint resolution that refuses to guess a fork point
//! - A run coordinator that folds streamed engine events into one message
//! - A human-in-the-loop gate for approving tool calls
//! - Thread persistence (in-memory and SQLite)
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! A [`ChatSession`] owns one thread. Caller operations flow through it:
//! - **Resolve:** [`resolver::CheckpointResolver`] picks the checkpoint to fork from
//! - **Run:** [`run::RunCoordinator`] streams from an [`engine::ExecutionEngine`]
//!   and writes the in-flight message into the [`graph::MessageGraph`]
//! - **Persist:** snapshots land in a [`store::ThreadStore`], debounced while streaming
//!
//! ## Example
//!
//! ```rust,no_run
//! use forkline_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

use std::sync::{Mutex, MutexGuard};

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use engine::{ExecutionEngine, RunEnvelope, RunId, ScriptedEngine};
pub use error::{Error, Result};
pub use graph::MessageGraph;
pub use hitl::{InterruptGate, PendingInterrupt};
pub use session::{AbortHandle, ChatSession, LoadReport, RunHandle, SessionUpdate};
pub use store::{MemoryStore, ThreadStore};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hitl;
pub mod logging;
pub mod resolver;
pub mod run;
pub mod session;
pub mod store;
pub mod types;

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
