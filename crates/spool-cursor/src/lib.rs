//! Peek cursor engine for the Spool partitioned transaction log.
//!
//! Storage servers pull committed mutations out of remote TLog servers
//! through a hierarchy of cursors, with exactly-once, deterministically
//! ordered delivery per storage team:
//!
//! ```text
//!                     Storage server
//!                          │ iterate / reset / advance_to
//!                          ▼
//!                 ┌─────────────────┐
//!                 │  Merge cursor   │  synchronizes teams on a common
//!                 │ (ordered/unord.)│  version, merges their messages
//!                 └──┬─────┬─────┬──┘
//!                    │     │     │   one leaf per storage team
//!                    ▼     ▼     ▼
//!                 ┌────┐┌────┐┌────┐
//!                 │leaf││leaf││leaf│  peek RPCs, watermark tracking
//!                 └──┬─┘└──┬─┘└──┬─┘
//!                    ▼     ▼     ▼
//!                 TLog  TLog  TLog    remote endpoints (replicas)
//! ```
//!
//! Consumers iterate locally buffered messages; when the buffers drain, the
//! cursor issues concurrent peeks to refill. A replay snapshot taken at each
//! refill lets callers [`reset`](PeekCursor::reset) and re-consume a batch
//! after a transient failure, losing nothing and duplicating nothing.
//!
//! # Example
//!
//! ```ignore
//! use spool_cursor::{BroadcastCursor, CursorConfig, PeekCursor, StorageTeamCursor};
//!
//! let mut cursor = BroadcastCursor::ordered(CursorConfig::default());
//! for (team, endpoint) in teams {
//!     cursor.add_cursor(StorageTeamCursor::single(
//!         begin_version, team, endpoint, /* report_empty_versions */ true,
//!         CursorConfig::default(),
//!     ));
//! }
//!
//! loop {
//!     match cursor.remote_more_available().await {
//!         Ok(true) => {
//!             while cursor.has_remaining() {
//!                 apply(cursor.get());
//!                 cursor.next();
//!             }
//!         }
//!         Ok(false) => { /* not ready; wait and retry */ }
//!         Err(e) if e.is_end_of_stream() => break,
//!         Err(e) => return Err(e), // rebuild the cursor at its watermark
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod advance;
mod config;
mod container;
mod cursor;
mod leaf;
mod merge;
mod mutable;
mod peek;
mod stats;
pub mod testing;
mod wire;

// Re-export the advance protocol
pub use advance::advance_to;
// Re-export configuration
pub use config::{
    ConfigValidationError, CursorConfig, DEFAULT_MAX_RETRY_DELAY_MS,
    DEFAULT_PARALLEL_GET_MORE_REQUESTS, DEFAULT_PEEK_MAX_LATENCY_MS,
    DEFAULT_PEEK_RESET_INTERVAL_MS, DEFAULT_PEEK_STATS_INTERVAL_MS, DEFAULT_PEEK_STATS_MIN_BYTES,
    DEFAULT_PEEK_STATS_SLOW_AMOUNT, DEFAULT_PEEK_STATS_SLOW_RATIO, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_RETRY_TIMES,
};
// Re-export the cursor surface
pub use cursor::PeekCursor;
pub use leaf::StorageTeamCursor;
pub use merge::BroadcastCursor;
pub use mutable::{EndpointResolver, MutableTeamCursor};
// Re-export the peek RPC surface
pub use peek::{PeekReply, PeekRequest, TLogPeek};
// Re-export reply statistics
pub use stats::{PeekStats, ReplyClass};
// Re-export the wire codec
pub use wire::{MessageDeserializer, MessageSerializer, PAYLOAD_MAGIC};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports() {
        let config = CursorConfig::default();
        assert_eq!(config.retry_times, DEFAULT_RETRY_TIMES);
        assert!(config.validate().is_ok());

        let _ordered = BroadcastCursor::ordered(config.clone());
        let _unordered = BroadcastCursor::unordered(config);
    }
}
