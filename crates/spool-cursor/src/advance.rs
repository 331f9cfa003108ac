//! Fast-forward protocol for peek cursors.

use spool_core::{Result, Subsequence, Version};

use crate::cursor::PeekCursor;

/// Moves `cursor` forward until its current message is at or past
/// `(version, subsequence)`, refilling from the remote as needed.
///
/// If the exact coordinate does not exist the cursor lands on the closest
/// following message. When the remote reports no more data before the target
/// is reached, returns without reaching it; the caller inspects
/// [`version`](PeekCursor::version). A target at or before the current
/// position is a no-op.
pub async fn advance_to<C>(
    cursor: &mut C,
    version: Version,
    subsequence: Subsequence,
) -> Result<()>
where
    C: PeekCursor + ?Sized,
{
    loop {
        while cursor.has_remaining() {
            if cursor.version() > version
                || (cursor.version() == version && cursor.subsequence() >= subsequence)
            {
                return Ok(());
            }
            cursor.next();
        }

        // Local data consumed; ask the remote for more.
        if !cursor.remote_more_available().await? {
            // The target lies in the future; leave the cursor where it is.
            return Ok(());
        }
    }
}
