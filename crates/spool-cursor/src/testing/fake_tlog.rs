//! In-memory TLog peek service.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use spool_core::{Error, Message, Result, StorageTeamId, Version, INVALID_VERSION};
use uuid::Uuid;

use crate::peek::{PeekReply, PeekRequest, TLogPeek};
use crate::wire::MessageSerializer;

/// An in-memory [`TLogPeek`] endpoint holding committed messages per
/// storage team.
///
/// Shared between a feeder task and the cursor under test via `Arc`.
/// Supports chunked replies (`max_versions_per_peek`), artificial latency,
/// epoch ends and injected transient faults.
pub struct FakeTLog {
    endpoint_id: Uuid,
    max_versions_per_peek: usize,
    latency: Option<(Duration, Duration)>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    teams: BTreeMap<StorageTeamId, TeamLog>,
    faults: VecDeque<Error>,
    connection_resets: usize,
}

#[derive(Default)]
struct TeamLog {
    messages: BTreeMap<Version, Vec<Message>>,
    epoch_end: Option<Version>,
    popped: Option<Version>,
}

impl FakeTLog {
    /// Creates an empty fake with unbounded reply size and no latency.
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoint_id: Uuid::new_v4(),
            max_versions_per_peek: usize::MAX,
            latency: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Caps the number of version groups per reply, forcing cursors
    /// through multiple peeks.
    #[must_use]
    pub fn with_max_versions_per_peek(mut self, versions: usize) -> Self {
        assert!(versions > 0);
        self.max_versions_per_peek = versions;
        self
    }

    /// Adds a uniformly random reply delay in `[min, max]`.
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        assert!(max >= min);
        self.latency = Some((min, max));
        self
    }

    /// Commits messages for a team at a version; subsequences are assigned
    /// densely from 1 in order.
    ///
    /// # Panics
    ///
    /// Panics if the team already has messages at that version.
    pub fn commit(&self, team: StorageTeamId, version: Version, messages: Vec<Message>) {
        let mut state = self.state.lock();
        let log = state.teams.entry(team).or_default();
        let replaced = log.messages.insert(version, messages);
        assert!(replaced.is_none(), "duplicate commit for team {team} at version {version}");
    }

    /// Records an empty version for a team: the broadcast alignment marker.
    pub fn commit_empty_version(&self, team: StorageTeamId, version: Version) {
        self.commit(team, version, Vec::new());
    }

    /// Ends the epoch for a team: peeks at or past `cut`, or past all
    /// remaining data, return `EndOfStream`.
    pub fn end_epoch(&self, team: StorageTeamId, cut: Version) {
        self.state.lock().teams.entry(team).or_default().epoch_end = Some(cut);
    }

    /// Pops (discards) team data below `version` and records the popped
    /// watermark reported in replies.
    pub fn pop(&self, team: StorageTeamId, version: Version) {
        let mut state = self.state.lock();
        let log = state.teams.entry(team).or_default();
        log.messages.retain(|&v, _| v >= version);
        log.popped = Some(version);
    }

    /// Queues an error returned by the next peek, any team.
    pub fn inject_fault(&self, error: Error) {
        self.state.lock().faults.push_back(error);
    }

    /// Number of connection resets requested against this endpoint.
    #[must_use]
    pub fn connection_resets(&self) -> usize {
        self.state.lock().connection_resets
    }
}

impl Default for FakeTLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TLogPeek for FakeTLog {
    async fn peek(&self, request: PeekRequest) -> Result<PeekReply> {
        if let Some((min, max)) = self.latency {
            let span = max.saturating_sub(min);
            let jitter = if span.is_zero() {
                Duration::ZERO
            } else {
                span.mul_f64(rand::thread_rng().gen::<f64>())
            };
            tokio::time::sleep(min + jitter).await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.faults.pop_front() {
            return Err(error);
        }

        let team = request.storage_team_id;
        let begin = request.begin_version;
        let log = state.teams.entry(team).or_default();

        if let Some(cut) = log.epoch_end {
            let remaining = log.messages.range(begin..cut).next().is_some();
            if begin >= cut || !remaining {
                return Err(Error::EndOfStream);
            }
        }

        let bound = match (log.epoch_end, request.end_version) {
            (Some(cut), Some(end)) => Some(cut.min(end)),
            (Some(cut), None) => Some(cut),
            (None, Some(end)) => Some(end),
            (None, None) => None,
        };

        let mut serializer = MessageSerializer::new(team);
        let mut included = 0usize;
        let mut last_version = None;
        for (&version, messages) in log.messages.range(begin..) {
            if bound.is_some_and(|b| version >= b) || included == self.max_versions_per_peek {
                break;
            }
            if messages.is_empty() {
                serializer.empty_version(version);
            } else {
                serializer.open_version(version);
                for (index, message) in messages.iter().enumerate() {
                    serializer.push(index as u32 + 1, message);
                }
            }
            last_version = Some(version);
            included += 1;
        }

        let max_known = log.messages.keys().next_back().copied().unwrap_or(INVALID_VERSION);
        Ok(PeekReply {
            payload: serializer.finish(),
            begin_version: begin,
            end_version: last_version.map_or(begin, |v| v + 1),
            max_known_version: max_known,
            min_known_committed_version: max_known,
            popped_version: log.popped,
            only_spilled: false,
        })
    }

    fn endpoint_id(&self) -> Uuid {
        self.endpoint_id
    }

    fn reset_connection(&self) {
        self.state.lock().connection_resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team() -> StorageTeamId {
        StorageTeamId::from_bytes([9; 16])
    }

    #[tokio::test]
    async fn test_chunked_replies() {
        let tlog = FakeTLog::new().with_max_versions_per_peek(2);
        for version in 1000..1005 {
            tlog.commit(team(), version, vec![Message::LogProtocol { protocol_version: 1 }]);
        }

        let first = tlog.peek(PeekRequest::new(team(), 1000)).await.unwrap();
        assert_eq!(first.begin_version, 1000);
        assert_eq!(first.end_version, 1002);
        assert_eq!(first.max_known_version, 1004);

        let second = tlog.peek(PeekRequest::new(team(), first.end_version)).await.unwrap();
        assert_eq!(second.end_version, 1004);
    }

    #[tokio::test]
    async fn test_no_data_returns_empty_reply() {
        let tlog = FakeTLog::new();
        let reply = tlog.peek(PeekRequest::new(team(), 1000)).await.unwrap();
        assert_eq!(reply.end_version, 1000);
        assert_eq!(reply.max_known_version, INVALID_VERSION);
    }

    #[tokio::test]
    async fn test_epoch_end() {
        let tlog = FakeTLog::new();
        tlog.commit(team(), 1000, vec![Message::LogProtocol { protocol_version: 1 }]);
        tlog.end_epoch(team(), 1001);

        // Remaining data is still served...
        let reply = tlog.peek(PeekRequest::new(team(), 1000)).await.unwrap();
        assert_eq!(reply.end_version, 1001);

        // ...after which the stream ends.
        let err = tlog.peek(PeekRequest::new(team(), 1001)).await.unwrap_err();
        assert_eq!(err, Error::EndOfStream);
    }

    #[tokio::test]
    async fn test_injected_fault_is_returned_once() {
        let tlog = FakeTLog::new();
        tlog.inject_fault(Error::TimedOut { elapsed_ms: 3 });

        let err = tlog.peek(PeekRequest::new(team(), 1000)).await.unwrap_err();
        assert_eq!(err, Error::TimedOut { elapsed_ms: 3 });
        assert!(tlog.peek(PeekRequest::new(team(), 1000)).await.is_ok());
    }

    #[tokio::test]
    async fn test_pop_reports_watermark() {
        let tlog = FakeTLog::new();
        for version in 1000..1004 {
            tlog.commit(team(), version, vec![Message::LogProtocol { protocol_version: 1 }]);
        }
        tlog.pop(team(), 1002);

        let reply = tlog.peek(PeekRequest::new(team(), 1002)).await.unwrap();
        assert_eq!(reply.popped_version, Some(1002));
        assert_eq!(reply.end_version, 1004);
    }

    #[tokio::test]
    async fn test_bounded_peek() {
        let tlog = FakeTLog::new();
        for version in 1000..1010 {
            tlog.commit(team(), version, vec![Message::LogProtocol { protocol_version: 1 }]);
        }

        let mut request = PeekRequest::new(team(), 1000);
        request.end_version = Some(1003);
        let reply = tlog.peek(request).await.unwrap();
        assert_eq!(reply.end_version, 1003);
    }
}
