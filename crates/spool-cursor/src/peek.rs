//! Peek RPC surface consumed by leaf cursors.
//!
//! The TLog server is a remote service; cursors reach it through the
//! [`TLogPeek`] trait. One implementation per transport (and an in-memory
//! fake in [`crate::testing`]).

use async_trait::async_trait;
use bytes::Bytes;
use spool_core::{Result, StorageTeamId, Version};
use uuid::Uuid;

/// Request for the mutation suffix of one storage team.
#[derive(Debug, Clone)]
pub struct PeekRequest {
    /// Correlation id propagated into the server's traces.
    pub debug_id: Option<Uuid>,

    /// First version the reply may contain.
    pub begin_version: Version,

    /// Exclusive upper bound on returned versions; unbounded when absent.
    pub end_version: Option<Version>,

    /// The storage team whose suffix is requested.
    pub storage_team_id: StorageTeamId,

    /// When set, the server answers immediately instead of blocking until
    /// data past `begin_version` exists.
    pub return_if_blocked: bool,

    /// Continue a scan of spilled (evicted-from-memory) data.
    pub only_spilled: bool,
}

impl PeekRequest {
    /// Creates an unbounded request starting at `begin_version`.
    #[must_use]
    pub fn new(storage_team_id: StorageTeamId, begin_version: Version) -> Self {
        Self {
            debug_id: None,
            begin_version,
            end_version: None,
            storage_team_id,
            return_if_blocked: false,
            only_spilled: false,
        }
    }
}

/// Reply to a [`PeekRequest`].
#[derive(Debug, Clone)]
pub struct PeekReply {
    /// Serialized message payload; see [`crate::wire`] for framing.
    pub payload: Bytes,

    /// First version the reply covers.
    pub begin_version: Version,

    /// Exclusive upper bound of the returned range. The next peek should
    /// begin here.
    pub end_version: Version,

    /// Highest version the server knows about for this team.
    pub max_known_version: Version,

    /// Lowest version the server knows to be committed cluster-wide.
    pub min_known_committed_version: Version,

    /// Oldest version still retained for this team, when known.
    pub popped_version: Option<Version>,

    /// True when the reply was served from spilled storage; the next
    /// request should carry it back to continue the spilled scan.
    pub only_spilled: bool,
}

/// Client handle to one TLog endpoint.
///
/// Endpoints of the same storage team are replicas returning the same
/// logical suffix; divergence is not handled at this layer.
#[async_trait]
pub trait TLogPeek: Send + Sync {
    /// Requests the mutation suffix described by `request`.
    ///
    /// Returns [`spool_core::Error::EndOfStream`] once the epoch covering
    /// the team has ended and no data at or past `begin_version` remains.
    async fn peek(&self, request: PeekRequest) -> Result<PeekReply>;

    /// Stable identifier of this endpoint, used for peek-location
    /// observables and slow-replica accounting.
    fn endpoint_id(&self) -> Uuid;

    /// Asks the transport to tear down and rebuild the connection behind
    /// this endpoint. Advisory; the default does nothing.
    fn reset_connection(&self) {}
}
