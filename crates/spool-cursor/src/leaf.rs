//! Per-storage-team leaf cursor.
//!
//! A leaf cursor pulls the mutation suffix of a single storage team from one
//! or more replica endpoints, feeds the deserializer, and tracks the
//! watermark versions the merge layer and the storage server observe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use spool_core::{Result, StorageTeamId, Version, VersionSubsequenceMessage, INVALID_VERSION};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CursorConfig;
use crate::container::CursorKey;
use crate::cursor::PeekCursor;
use crate::peek::{PeekRequest, TLogPeek};
use crate::stats::PeekStats;
use crate::wire::MessageDeserializer;

/// Leaf cursor over one storage team.
///
/// `last_version` is the exclusive upper bound of consumed data: it starts
/// at `begin_version - 1` and equals the `end_version` of the most recent
/// non-empty reply; every peek requests `last_version + 1` onward.
pub struct StorageTeamCursor {
    storage_team_id: StorageTeamId,
    endpoints: Vec<Arc<dyn TLogPeek>>,
    config: CursorConfig,
    deserializer: MessageDeserializer,
    report_empty_versions: bool,
    begin_version: Version,
    last_version: Version,
    max_known_version: Version,
    min_known_committed_version: Version,
    popped_version: Version,
    only_spilled: bool,
    current_peek_location: Option<Uuid>,
    debug_id: Uuid,
    stats: HashMap<Uuid, PeekStats>,
}

impl StorageTeamCursor {
    /// Creates a leaf cursor peeking `storage_team_id` from `endpoints`,
    /// starting at `begin_version`.
    ///
    /// With `report_empty_versions` set, synthetic markers for versions that
    /// carried no data for the team are surfaced to the consumer; the
    /// broadcast merge cursor requires this.
    ///
    /// # Panics
    ///
    /// Panics if `endpoints` is empty.
    #[must_use]
    pub fn new(
        begin_version: Version,
        storage_team_id: StorageTeamId,
        endpoints: Vec<Arc<dyn TLogPeek>>,
        report_empty_versions: bool,
        config: CursorConfig,
    ) -> Self {
        assert!(!endpoints.is_empty(), "leaf cursor needs at least one endpoint");
        Self {
            storage_team_id,
            endpoints,
            config,
            deserializer: MessageDeserializer::new(true),
            report_empty_versions,
            begin_version,
            last_version: begin_version - 1,
            max_known_version: INVALID_VERSION,
            min_known_committed_version: INVALID_VERSION,
            popped_version: INVALID_VERSION,
            only_spilled: false,
            current_peek_location: None,
            debug_id: Uuid::new_v4(),
            stats: HashMap::new(),
        }
    }

    /// Convenience constructor for a single replica endpoint.
    #[must_use]
    pub fn single(
        begin_version: Version,
        storage_team_id: StorageTeamId,
        endpoint: Arc<dyn TLogPeek>,
        report_empty_versions: bool,
        config: CursorConfig,
    ) -> Self {
        Self::new(begin_version, storage_team_id, vec![endpoint], report_empty_versions, config)
    }

    /// The storage team this cursor covers.
    #[must_use]
    pub fn storage_team_id(&self) -> StorageTeamId {
        self.storage_team_id
    }

    /// The version this cursor was constructed at.
    #[must_use]
    pub fn begin_version(&self) -> Version {
        self.begin_version
    }

    /// Exclusive upper bound of data buffered so far; the next peek begins
    /// at `last_version() + 1`.
    #[must_use]
    pub fn last_version(&self) -> Version {
        self.last_version
    }

    /// Whether empty-version markers are surfaced to the consumer.
    #[must_use]
    pub fn reports_empty_versions(&self) -> bool {
        self.report_empty_versions
    }

    /// Oldest version the server still retains for this team, when any
    /// reply has said so. Never decreases.
    #[must_use]
    pub fn popped_version(&self) -> Option<Version> {
        (self.popped_version != INVALID_VERSION).then_some(self.popped_version)
    }

    /// True while replies are being served from spilled storage.
    #[must_use]
    pub fn only_spilled(&self) -> bool {
        self.only_spilled
    }

    /// Endpoint the most recent reply came from.
    #[must_use]
    pub fn current_peek_location(&self) -> Option<Uuid> {
        self.current_peek_location
    }

    /// First-configured replica endpoint.
    #[must_use]
    pub fn primary_peek_location(&self) -> Uuid {
        self.endpoints[0].endpoint_id()
    }

    /// Position key of the current message, used by the merge containers.
    ///
    /// # Panics
    ///
    /// Panics if no message is buffered.
    pub(crate) fn cursor_key(&self) -> CursorKey {
        let current = self.get();
        CursorKey {
            version: current.version,
            subsequence: current.subsequence,
            team: self.storage_team_id,
        }
    }

    async fn peek_remote(&mut self) -> Result<bool> {
        loop {
            // Uniform pick among replicas; they serve the same suffix.
            let endpoint = {
                let index = rand::thread_rng().gen_range(0..self.endpoints.len());
                Arc::clone(&self.endpoints[index])
            };
            let request = PeekRequest {
                debug_id: Some(self.debug_id),
                begin_version: self.last_version + 1,
                end_version: None,
                storage_team_id: self.storage_team_id,
                return_if_blocked: false,
                only_spilled: self.only_spilled,
            };
            let begin = request.begin_version;
            debug!(
                team = %self.storage_team_id,
                begin,
                endpoint = %endpoint.endpoint_id(),
                "issuing peek"
            );
            counter!("spool_peeks_issued").increment(1);

            let started = Instant::now();
            match endpoint.peek(request).await {
                Ok(reply) => {
                    self.record_reply(&endpoint, started.elapsed(), reply.payload.len());
                    if reply.begin_version != begin {
                        warn!(
                            team = %self.storage_team_id,
                            expected = begin,
                            actual = reply.begin_version,
                            "obsolete peek reply, restarting at watermark"
                        );
                        continue;
                    }
                    self.current_peek_location = Some(endpoint.endpoint_id());
                    self.deserializer.reset(reply.payload)?;
                    if self.deserializer.is_empty() {
                        // No new data responded in this request; the
                        // watermark stays put.
                        counter!("spool_peek_empty_replies").increment(1);
                        return Ok(false);
                    }
                    self.last_version = reply.end_version;
                    self.max_known_version = self.max_known_version.max(reply.max_known_version);
                    self.min_known_committed_version =
                        self.min_known_committed_version.max(reply.min_known_committed_version);
                    if let Some(popped) = reply.popped_version {
                        self.popped_version = self.popped_version.max(popped);
                    }
                    self.only_spilled = reply.only_spilled;
                    return Ok(true);
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        team = %self.storage_team_id,
                        error = %error,
                        "transient peek failure, restarting at watermark"
                    );
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn record_reply(&mut self, endpoint: &Arc<dyn TLogPeek>, latency: std::time::Duration, bytes: usize) {
        let id = endpoint.endpoint_id();
        let stats = self.stats.entry(id).or_insert_with(|| PeekStats::new(&self.config));
        if stats.record_reply(latency, bytes) {
            warn!(
                endpoint = %id,
                team = %self.storage_team_id,
                "slow peek replies, requesting connection reset"
            );
            endpoint.reset_connection();
        }
    }
}

#[async_trait]
impl PeekCursor for StorageTeamCursor {
    fn has_remaining(&mut self) -> bool {
        if !self.report_empty_versions {
            while self.deserializer.peek().is_some_and(|m| m.message.is_empty_version()) {
                self.deserializer.advance();
            }
        }
        self.deserializer.peek().is_some()
    }

    fn get(&self) -> &VersionSubsequenceMessage {
        match self.deserializer.peek() {
            Some(message) => message,
            None => panic!("get() on a drained leaf cursor for team {}", self.storage_team_id),
        }
    }

    fn next(&mut self) {
        assert!(
            self.deserializer.peek().is_some(),
            "next() on a drained leaf cursor for team {}",
            self.storage_team_id
        );
        self.deserializer.advance();
    }

    fn reset(&mut self) {
        self.deserializer.rewind();
    }

    async fn remote_more_available(&mut self) -> Result<bool> {
        self.peek_remote().await
    }

    fn max_known_version(&self) -> Version {
        self.max_known_version
    }

    fn min_known_committed_version(&self) -> Version {
        self.min_known_committed_version
    }
}
