//! Test support: an in-memory TLog service and deterministic commit
//! workloads.
//!
//! Exposed as a regular module so integration tests and downstream crates
//! can drive cursors against a fake log without a cluster.

mod fake_tlog;
mod record;

use std::time::Duration;

pub use fake_tlog::FakeTLog;
pub use record::CommitRecord;
use spool_core::{Result, VersionSubsequenceMessage};

use crate::cursor::PeekCursor;

/// Drains a cursor to end of stream, returning every yielded message except
/// empty-version markers.
///
/// Each refilled batch is consumed twice — drain, [`reset`], drain again —
/// and the two passes are asserted identical, exercising the replay
/// contract on every batch.
///
/// [`reset`]: PeekCursor::reset
pub async fn collect_all_messages<C>(cursor: &mut C) -> Result<Vec<VersionSubsequenceMessage>>
where
    C: PeekCursor + ?Sized,
{
    let mut collected = Vec::new();
    loop {
        match cursor.remote_more_available().await {
            Ok(true) => {
                let mut batch = Vec::new();
                while cursor.has_remaining() {
                    batch.push(cursor.get().clone());
                    cursor.next();
                }

                cursor.reset();
                let mut replay = Vec::new();
                while cursor.has_remaining() {
                    replay.push(cursor.get().clone());
                    cursor.next();
                }
                assert_eq!(batch, replay, "replaying a batch produced a different sequence");

                collected.extend(batch.into_iter().filter(|m| !m.message.is_empty_version()));
            }
            Ok(false) => tokio::time::sleep(Duration::from_millis(1)).await,
            Err(error) if error.is_end_of_stream() => return Ok(collected),
            Err(error) => return Err(error),
        }
    }
}
