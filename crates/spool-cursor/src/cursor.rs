//! The cursor surface exposed to storage servers.

use async_trait::async_trait;
use spool_core::{Result, Subsequence, Version, VersionSubsequenceMessage};

/// A pull cursor over an ordered stream of message triples.
///
/// Cursors are single-task: they are not `Sync` by contract, and concurrent
/// access is undefined. Exactly two operations may suspend —
/// [`remote_more_available`](Self::remote_more_available) and, through it,
/// [`advance_to`](crate::advance_to); everything else is synchronous.
///
/// The consumer loop is:
///
/// ```text
/// loop {
///     match cursor.remote_more_available().await {
///         Ok(true)  => while cursor.has_remaining() { use(cursor.get()); cursor.next(); }
///         Ok(false) => /* not ready, wait and retry */
///         Err(e) if e.is_end_of_stream() => break,
///         Err(e)    => /* rebuild the cursor at its watermark */
///     }
/// }
/// ```
///
/// Between two calls to `remote_more_available` the observable sequence is
/// invariant: [`reset`](Self::reset) followed by consumption reproduces the
/// same triples bit-for-bit.
#[async_trait]
pub trait PeekCursor: Send {
    /// True when a message is buffered locally. May advance internal
    /// positions past suppressed markers, but never suspends.
    fn has_remaining(&mut self) -> bool;

    /// Returns the current message triple.
    ///
    /// # Panics
    ///
    /// Panics if called while [`has_remaining`](Self::has_remaining) is
    /// false.
    fn get(&self) -> &VersionSubsequenceMessage;

    /// Advances past the current message.
    ///
    /// # Panics
    ///
    /// Panics if called while [`has_remaining`](Self::has_remaining) is
    /// false.
    fn next(&mut self);

    /// Rewinds to the position captured at the last refill so the buffered
    /// batch can be replayed.
    fn reset(&mut self);

    /// Fetches more data from the remote.
    ///
    /// `Ok(true)` means new messages are buffered; `Ok(false)` means the
    /// remote had nothing yet and the caller should retry later.
    async fn remote_more_available(&mut self) -> Result<bool>;

    /// Version of the current message.
    fn version(&self) -> Version {
        self.get().version
    }

    /// Subsequence of the current message.
    fn subsequence(&self) -> Subsequence {
        self.get().subsequence
    }

    /// Highest version any reply has reported. Never decreases.
    fn max_known_version(&self) -> Version;

    /// Lowest cluster-wide committed version any reply has reported. Never
    /// decreases.
    fn min_known_committed_version(&self) -> Version;
}
