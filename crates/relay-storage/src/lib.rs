//! # Relay Storage
//!
//! Message and session persistence for the Agent Relay daemon.
//!
//! The [`MessageStore`] trait defines the storage interface. Two adapters
//! satisfy it: [`MemoryStore`] (bounded, for tests and ephemeral daemons)
//! and [`SqliteStore`] (durable). [`BatchedStore`] wraps either with a
//! write-behind queue flushed on size, bytes, or time triggers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod batched;
mod error;
mod memory;
mod sqlite;
mod store;
mod types;

pub use batched::{BatchConfig, BatchMetricsSnapshot, BatchedStore};
pub use error::{Result, StorageError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::MessageStore;
pub use types::{
    MessageQuery, MessageRecord, MessageStatus, Session, SessionCloseReason, SortOrder,
    StoredMessage,
};

/// Maximum number of messages the in-memory adapter retains.
pub const MEMORY_STORE_CAPACITY: usize = 1_000;
