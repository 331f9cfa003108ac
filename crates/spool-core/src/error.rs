//! Error taxonomy of the Spool peek path.

use thiserror::Error;
use uuid::Uuid;

use crate::types::Version;

/// A specialized `Result` type for Spool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the peek cursor engine.
///
/// The cursor recovers locally from [`Error::OperationObsolete`] and
/// [`Error::TimedOut`], absorbs [`Error::EndOfStream`] until every storage
/// team has ended, and reports the transport class upward with the current
/// watermark intact so the caller can build a replacement cursor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The epoch covering this storage team has ended; no further data will
    /// ever be returned for it.
    #[error("end of stream")]
    EndOfStream,

    /// A reply arrived for a request that is no longer the cursor's current
    /// watermark; the cursor discards it and restarts.
    #[error("operation obsolete: reply began at version {actual}, expected {expected}")]
    OperationObsolete {
        /// Begin version the cursor requested.
        expected: Version,
        /// Begin version the reply actually covered.
        actual: Version,
    },

    /// The remote was too slow to answer; treated like an obsolete reply.
    #[error("peek timed out after {elapsed_ms}ms")]
    TimedOut {
        /// How long the cursor waited.
        elapsed_ms: u64,
    },

    /// The remote endpoint died or the connection broke. The caller should
    /// rebuild the cursor starting at `last_version + 1`.
    #[error("transport failure on endpoint {endpoint}: {reason}")]
    Transport {
        /// Endpoint the failure was observed on.
        endpoint: Uuid,
        /// Transport-level description.
        reason: String,
    },

    /// A peek reply payload violated the wire framing. This indicates a
    /// producer bug; the reply is discarded.
    #[error("malformed peek payload: {reason}")]
    Malformed {
        /// What the deserializer rejected.
        reason: String,
    },
}

impl Error {
    /// Creates a transport error for the given endpoint.
    #[must_use]
    pub fn transport(endpoint: Uuid, reason: impl Into<String>) -> Self {
        Self::Transport { endpoint, reason: reason.into() }
    }

    /// Creates a malformed-payload error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed { reason: reason.into() }
    }

    /// True for the expected terminal signal of a storage team.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// True when the cursor may transparently retry the peek at its current
    /// watermark.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationObsolete { .. } | Self::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::EndOfStream.is_end_of_stream());
        assert!(!Error::EndOfStream.is_retryable());

        assert!(Error::TimedOut { elapsed_ms: 10 }.is_retryable());
        assert!(Error::OperationObsolete { expected: 5, actual: 9 }.is_retryable());

        let transport = Error::transport(Uuid::new_v4(), "connection reset by peer");
        assert!(!transport.is_retryable());
        assert!(!transport.is_end_of_stream());
    }

    #[test]
    fn test_display() {
        let err = Error::OperationObsolete { expected: 100, actual: 120 };
        assert_eq!(err.to_string(), "operation obsolete: reply began at version 120, expected 100");

        let err = Error::malformed("bad magic");
        assert_eq!(err.to_string(), "malformed peek payload: bad magic");
    }
}
