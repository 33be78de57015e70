//! regtail-core: Core library for regtail
//!
//! This crate replicates the npm registry change feed into a durable,
//! resumable checkpoint and surfaces Koishi plugin packages as they appear.
//!
//! # Architecture
//!
//! ```text
//! Registry (_changes) → ChangeStream → Plugin Filter → Event Bus
//!        ↑                    ↓
//!  Rate Scheduler      Progress Store (SQLite)
//!        ↑                    ↑
//!  CatchUp workers ── Synchronizer ── LiveTail
//! ```
//!
//! # Modules
//!
//! - `changes`: Change-feed decoding over chunked bodies
//! - `filter`: Koishi plugin name classification
//! - `scheduler`: Per-endpoint query-rate ceiling and concurrency cap
//! - `blocks`: Catch-up blocks and the low-water-mark rule
//! - `catchup`: Concurrent block catch-up coordinator
//! - `tail`: Live tail after catch-up
//! - `store`: Progress store actor over key-value backends
//! - `synchronizer`: Lifecycle state machine and control handle
//! - `registry`: Registry client seam and HTTP implementation
//! - `events`: Event bus for fetched batches and synchronization
//! - `shutdown`: Cooperative cancellation
//! - `retry`: Exponential backoff and retry budgets
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod blocks;
pub mod catchup;
pub mod changes;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod synchronizer;
pub mod tail;

pub use error::{Error, FetchError, Result, StorageError};
pub use synchronizer::{SyncHandle, SyncState, SyncStatus, Synchronizer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
