//! Merge cursor whose storage-team set follows in-band membership
//! mutations.
//!
//! A distinguished private-mutations storage team carries team-assignment
//! mutations for one storage server. The cursor delivers them like any other
//! message and, as they pass, diffs the announced team set against its live
//! leaves: new teams get a leaf starting at the current version, unassigned
//! teams are dropped at the next refill. The producer stops emitting entries
//! for an unassigned team after the membership version, so within a version
//! the team set is fixed and nothing is lost by deferring the removal.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use spool_core::{
    Message, MutationKind, Result, StorageServerTeams, StorageTeamId, Version,
    VersionSubsequenceMessage,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CursorConfig;
use crate::cursor::PeekCursor;
use crate::leaf::StorageTeamCursor;
use crate::merge::BroadcastCursor;
use crate::peek::TLogPeek;

/// Resolves the replica endpoints serving a storage team.
///
/// Must return at least one endpoint for any team it has announced in an
/// assignment.
pub trait EndpointResolver: Send + Sync {
    /// Returns the endpoints for `team`.
    fn resolve(&self, team: StorageTeamId) -> Vec<Arc<dyn TLogPeek>>;
}

impl<F> EndpointResolver for F
where
    F: Fn(StorageTeamId) -> Vec<Arc<dyn TLogPeek>> + Send + Sync,
{
    fn resolve(&self, team: StorageTeamId) -> Vec<Arc<dyn TLogPeek>> {
        self(team)
    }
}

/// Ordered merge cursor for one storage server whose team set adapts to
/// in-band assignments.
pub struct MutableTeamCursor {
    storage_server_id: Uuid,
    private_team: StorageTeamId,
    assignment_key: Bytes,
    resolver: Arc<dyn EndpointResolver>,
    inner: BroadcastCursor,
    pending_removals: BTreeMap<StorageTeamId, Version>,
}

impl MutableTeamCursor {
    /// Creates a mutable-team cursor following `storage_server_id`'s
    /// assignments, starting with only the private-mutations team at
    /// `begin_version`.
    #[must_use]
    pub fn new(
        storage_server_id: Uuid,
        private_team: StorageTeamId,
        resolver: Arc<dyn EndpointResolver>,
        begin_version: Version,
        config: CursorConfig,
    ) -> Self {
        let mut inner = BroadcastCursor::ordered(config.clone());
        inner.add_cursor(StorageTeamCursor::new(
            begin_version,
            private_team,
            resolver.resolve(private_team),
            true,
            config,
        ));
        Self {
            storage_server_id,
            private_team,
            assignment_key: StorageServerTeams::assignment_key(storage_server_id),
            resolver,
            inner,
            pending_removals: BTreeMap::new(),
        }
    }

    /// The storage server whose assignments this cursor follows.
    #[must_use]
    pub fn storage_server_id(&self) -> Uuid {
        self.storage_server_id
    }

    /// The private-mutations storage team.
    #[must_use]
    pub fn private_team(&self) -> StorageTeamId {
        self.private_team
    }

    /// The teams with live leaf cursors.
    #[must_use]
    pub fn team_ids(&self) -> Vec<StorageTeamId> {
        self.inner.team_ids()
    }

    /// The commit version the cursor is currently synchronized on.
    #[must_use]
    pub fn current_version(&self) -> Version {
        self.inner.current_version()
    }

    fn apply_membership(&mut self, version: Version, assignment: &StorageServerTeams) {
        assert_eq!(
            assignment.private_team(),
            self.private_team,
            "team assignment names a different private team"
        );
        for team in assignment.iter() {
            self.pending_removals.remove(&team);
            if !self.inner.contains_team(team) {
                info!(team = %team, version, "storage team assigned");
                let endpoints = self.resolver.resolve(team);
                let config = self.inner.config().clone();
                self.inner.add_cursor(StorageTeamCursor::new(
                    version, team, endpoints, true, config,
                ));
            }
        }
        for team in self.inner.team_ids() {
            if team != self.private_team && !assignment.contains(team) {
                info!(team = %team, version, "storage team unassigned, dropping at next refill");
                self.pending_removals.insert(team, version);
            }
        }
    }

    /// Drops unassigned teams. Only runs between versions so in-flight
    /// messages of the current version are still delivered.
    fn apply_due_removals(&mut self) {
        if self.pending_removals.is_empty() || !self.inner.at_version_boundary() {
            return;
        }
        for (team, observed_at) in std::mem::take(&mut self.pending_removals) {
            info!(team = %team, observed_at, "removing unassigned storage team");
            self.inner.remove_cursor(team);
        }
    }
}

#[async_trait]
impl PeekCursor for MutableTeamCursor {
    fn has_remaining(&mut self) -> bool {
        self.inner.has_remaining()
    }

    fn get(&self) -> &VersionSubsequenceMessage {
        self.inner.get()
    }

    fn next(&mut self) {
        let (version, assignment_value) = {
            let current = self.inner.get();
            let value = match &current.message {
                Message::Mutation(mutation)
                    if mutation.kind == MutationKind::Set
                        && mutation.key == self.assignment_key =>
                {
                    Some(mutation.value.clone())
                }
                _ => None,
            };
            (current.version, value)
        };
        if let Some(value) = assignment_value {
            match StorageServerTeams::decode(value) {
                Ok(assignment) => self.apply_membership(version, &assignment),
                Err(error) => {
                    warn!(version, error = %error, "undecodable team assignment, ignoring");
                }
            }
        }
        self.inner.next();
    }

    fn reset(&mut self) {
        // Replay re-observes assignments; additions are idempotent and
        // removals stay pending until the next refill either way.
        self.inner.reset();
    }

    async fn remote_more_available(&mut self) -> Result<bool> {
        self.apply_due_removals();
        // Dropping an unassigned empty team may unblock locally buffered
        // versions of the remaining teams; that still starts a new replay
        // window, so a snapshot is due either way.
        self.inner.mark_snapshot_pending();
        if self.inner.has_remaining() {
            return Ok(true);
        }
        self.inner.remote_more_available().await
    }

    fn max_known_version(&self) -> Version {
        self.inner.max_known_version()
    }

    fn min_known_committed_version(&self) -> Version {
        self.inner.min_known_committed_version()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spool_core::{Error, Mutation};

    use super::*;
    use crate::testing::FakeTLog;

    fn test_config() -> CursorConfig {
        CursorConfig::new()
            .retry_delay(Duration::from_millis(1))
            .max_retry_delay(Duration::from_millis(5))
            .retry_times(2)
    }

    fn team(seed: u8) -> StorageTeamId {
        StorageTeamId::from_bytes([seed; 16])
    }

    fn assignment_mutation(
        storage_server_id: Uuid,
        private_team: StorageTeamId,
        teams: &[StorageTeamId],
    ) -> Message {
        let assignment =
            StorageServerTeams::new(private_team).with_teams(teams.iter().copied());
        Message::Mutation(Mutation::set(
            StorageServerTeams::assignment_key(storage_server_id),
            assignment.encode(),
        ))
    }

    fn data_mutation(name: &str) -> Message {
        Message::Mutation(Mutation::set(
            Bytes::from(format!("key-{name}")),
            Bytes::from(format!("value-{name}")),
        ))
    }

    async fn drain(cursor: &mut MutableTeamCursor) -> Vec<VersionSubsequenceMessage> {
        let mut out = Vec::new();
        loop {
            match cursor.remote_more_available().await {
                Ok(true) => {
                    while cursor.has_remaining() {
                        if !cursor.get().message.is_empty_version() {
                            out.push(cursor.get().clone());
                        }
                        cursor.next();
                    }
                }
                Ok(false) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(error) => {
                    assert_eq!(error, Error::EndOfStream);
                    return out;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_membership_add_and_remove() {
        let storage_server_id = Uuid::new_v4();
        let private = team(1);
        let team_a = team(2);
        let team_b = team(3);

        let tlog = Arc::new(FakeTLog::new().with_max_versions_per_peek(1));

        // Version 1000: server is assigned team A; the assignment takes
        // effect between versions, so A's entries begin at 1001.
        tlog.commit(
            private,
            1000,
            vec![assignment_mutation(storage_server_id, private, &[team_a])],
        );

        // Version 1001: plain data on A.
        tlog.commit_empty_version(private, 1001);
        tlog.commit(team_a, 1001, vec![data_mutation("a1")]);

        // Version 1002: A swapped out for B. A's data of 1002 is part of the
        // fixed team set of that version and is still delivered.
        tlog.commit(
            private,
            1002,
            vec![assignment_mutation(storage_server_id, private, &[team_b])],
        );
        tlog.commit(team_a, 1002, vec![data_mutation("a2")]);

        // Version 1003: only the new assignment produces.
        tlog.commit_empty_version(private, 1003);
        tlog.commit(team_b, 1003, vec![data_mutation("b1")]);

        tlog.end_epoch(private, 1004);
        tlog.end_epoch(team_b, 1004);

        let resolver_tlog = tlog.clone();
        let resolver: Arc<dyn EndpointResolver> = Arc::new(move |_team: StorageTeamId| {
            vec![resolver_tlog.clone() as Arc<dyn TLogPeek>]
        });

        let mut cursor = MutableTeamCursor::new(
            storage_server_id,
            private,
            resolver,
            1000,
            test_config(),
        );
        let drained = drain(&mut cursor).await;

        let positions: Vec<(Version, u32)> = drained.iter().map(|m| m.position()).collect();
        assert_eq!(
            positions,
            vec![(1000, 1), (1001, 1), (1002, 1), (1002, 1), (1003, 1)]
        );

        // The assignment mutations themselves were delivered, in order with
        // the data. The private team sorts first on the (1002, 1) tie.
        assert_eq!(drained[0].message, assignment_mutation(storage_server_id, private, &[team_a]));
        assert_eq!(drained[1].message, data_mutation("a1"));
        assert_eq!(drained[2].message, assignment_mutation(storage_server_id, private, &[team_b]));
        assert_eq!(drained[3].message, data_mutation("a2"));
        assert_eq!(drained[4].message, data_mutation("b1"));

        // A was dropped on unassignment; the rest retired at end of stream.
        assert!(cursor.team_ids().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_assignments_are_ignored() {
        let storage_server_id = Uuid::new_v4();
        let other_server_id = Uuid::new_v4();
        let private = team(1);
        let team_a = team(2);

        let tlog = Arc::new(FakeTLog::new());
        // An assignment for a different storage server rides the same
        // private team; it is delivered but not applied.
        tlog.commit(
            private,
            1000,
            vec![assignment_mutation(other_server_id, private, &[team_a])],
        );
        tlog.end_epoch(private, 1001);

        let resolver_tlog = tlog.clone();
        let resolver: Arc<dyn EndpointResolver> = Arc::new(move |_team: StorageTeamId| {
            vec![resolver_tlog.clone() as Arc<dyn TLogPeek>]
        });

        let mut cursor = MutableTeamCursor::new(
            storage_server_id,
            private,
            resolver,
            1000,
            test_config(),
        );
        let drained = drain(&mut cursor).await;

        assert_eq!(drained.len(), 1);
        // No team was ever added for the foreign assignment; the private
        // team itself retired at end of stream.
        assert!(cursor.team_ids().is_empty());
    }
}
