//! Database layer for forkline
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository implementing [`crate::store::ThreadStore`]

pub mod repo;
pub mod schema;

pub use repo::Database;
