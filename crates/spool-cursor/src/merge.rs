//! Broadcast merge cursors over many storage-team leaf cursors.
//!
//! In the broadcast model every storage team of a TLog group receives a
//! message (possibly an empty-version marker) at every commit version, so
//! all non-retired leaves expose the same version after a successful refill.
//! The merge cursor synchronizes its leaves on that version and hands their
//! messages out through a ready container: globally `(version, subsequence)`
//! ordered for the ordered variant, team-grouped per version for the
//! unordered one.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use futures_util::future::join_all;
use metrics::gauge;
use spool_core::{
    Error, Result, StorageTeamId, Version, VersionSubsequenceMessage, INVALID_VERSION,
};
use tracing::{debug, info, warn};

use crate::config::CursorConfig;
use crate::container::CursorContainer;
use crate::cursor::PeekCursor;
use crate::leaf::StorageTeamCursor;

/// State captured right after a refill so the buffered batch can be
/// replayed.
#[derive(Debug)]
struct ReplaySnapshot {
    /// Set by a refill; the snapshot itself is captured lazily on the next
    /// `has_remaining`, once the container reflects the refilled state.
    pending: bool,
    version: Version,
    container: CursorContainer,
}

/// Outcome of refilling one leaf.
enum PeekOutcome {
    Filled,
    EndOfStream,
    TimedOut,
    Failed(Error),
}

/// Merge cursor over the storage teams of one TLog group.
///
/// Owns its leaves exclusively. A leaf is in exactly one logical state:
/// *ready* (buffered messages at the current version), *empty* (drained,
/// needs an RPC) or *retired* (remote ended and buffer drained); retired
/// leaves are dropped at the start of the next refill.
///
/// Call [`remote_more_available`](PeekCursor::remote_more_available) only
/// after [`has_remaining`](PeekCursor::has_remaining) has returned false;
/// draining through `has_remaining` is what tracks which leaves need a
/// refill.
pub struct BroadcastCursor {
    leaves: BTreeMap<StorageTeamId, StorageTeamCursor>,
    container: CursorContainer,
    empty_teams: BTreeSet<StorageTeamId>,
    retired_teams: BTreeSet<StorageTeamId>,
    current_version: Version,
    max_known_version: Version,
    min_known_committed_version: Version,
    snapshot: ReplaySnapshot,
    config: CursorConfig,
}

impl BroadcastCursor {
    /// Creates a merge cursor whose output is globally ordered by
    /// `(version, subsequence)` across teams.
    #[must_use]
    pub fn ordered(config: CursorConfig) -> Self {
        Self::with_container(CursorContainer::ordered(), config)
    }

    /// Creates a merge cursor that drains one team at a time within each
    /// version, preserving per-team order.
    #[must_use]
    pub fn unordered(config: CursorConfig) -> Self {
        Self::with_container(CursorContainer::unordered(), config)
    }

    fn with_container(container: CursorContainer, config: CursorConfig) -> Self {
        Self {
            leaves: BTreeMap::new(),
            snapshot: ReplaySnapshot {
                pending: false,
                version: INVALID_VERSION,
                container: container.same_kind(),
            },
            container,
            empty_teams: BTreeSet::new(),
            retired_teams: BTreeSet::new(),
            current_version: INVALID_VERSION,
            max_known_version: INVALID_VERSION,
            min_known_committed_version: INVALID_VERSION,
            config,
        }
    }

    /// Adds a leaf cursor for a new storage team.
    ///
    /// # Panics
    ///
    /// Panics if the team already has a cursor, or if the leaf suppresses
    /// empty versions — the broadcast alignment depends on them.
    pub fn add_cursor(&mut self, cursor: StorageTeamCursor) {
        assert!(
            cursor.reports_empty_versions(),
            "broadcast merge requires empty-version reporting"
        );
        let team = cursor.storage_team_id();
        assert!(!self.leaves.contains_key(&team), "storage team {team} already has a cursor");
        debug!(team = %team, begin = cursor.begin_version(), "adding storage team cursor");
        self.empty_teams.insert(team);
        self.leaves.insert(team, cursor);
    }

    /// Removes a storage team's leaf cursor, returning it if present.
    pub fn remove_cursor(&mut self, team: StorageTeamId) -> Option<StorageTeamCursor> {
        self.container.erase(team);
        self.empty_teams.remove(&team);
        self.leaves.remove(&team)
    }

    /// Number of live leaf cursors.
    #[must_use]
    pub fn cursor_count(&self) -> usize {
        self.leaves.len()
    }

    /// True if the team currently has a leaf cursor.
    #[must_use]
    pub fn contains_team(&self, team: StorageTeamId) -> bool {
        self.leaves.contains_key(&team)
    }

    /// The storage teams with live leaf cursors.
    #[must_use]
    pub fn team_ids(&self) -> Vec<StorageTeamId> {
        self.leaves.keys().copied().collect()
    }

    /// The commit version the cursor is currently synchronized on.
    #[must_use]
    pub fn current_version(&self) -> Version {
        self.current_version
    }

    /// True between versions: the ready container holds no positions, so
    /// the team set may change without tearing a version apart.
    pub(crate) fn at_version_boundary(&self) -> bool {
        self.container.is_empty()
    }

    pub(crate) fn config(&self) -> &CursorConfig {
        &self.config
    }

    /// Requests a fresh replay snapshot at the next `has_remaining`. Used by
    /// wrappers whose `remote_more_available` can succeed without reaching
    /// the remote; every such call starts a new replay window.
    pub(crate) fn mark_snapshot_pending(&mut self) {
        self.snapshot.pending = true;
    }

    /// Synchronizes the leaves on a common version and fills the ready
    /// container. Returns false when any leaf needs an RPC first, or when
    /// nothing remains.
    fn try_fill_container(&mut self) -> bool {
        if self.leaves.is_empty() {
            return false;
        }
        debug_assert!(self.container.is_empty());

        let previous_version = self.current_version;
        self.current_version = INVALID_VERSION;
        let total_leaves = self.leaves.len();
        for (team, leaf) in self.leaves.iter_mut() {
            if !leaf.has_remaining() {
                self.empty_teams.insert(*team);
                continue;
            }
            let version = leaf.version();
            if self.current_version == INVALID_VERSION {
                self.current_version = version;
            } else {
                // Leaves with data must share one version; a lagging leaf
                // would break the subsequence order. Producer bug.
                assert_eq!(
                    version, self.current_version,
                    "broadcast storage teams diverged: team {} at version {}",
                    team, version
                );
            }
        }

        // Leaves that are empty because their stream ended are not waiting
        // for an RPC; keep them out of the refill set.
        let retired_and_drained: BTreeSet<StorageTeamId> =
            self.empty_teams.intersection(&self.retired_teams).copied().collect();
        self.empty_teams.retain(|team| !retired_and_drained.contains(team));

        if !self.empty_teams.is_empty() {
            // With a single live leaf, an empty refill must not regress the
            // version; a cursor added later would otherwise begin at 0.
            if total_leaves == 1 {
                self.current_version = previous_version;
            }
            return false;
        }
        if self.leaves.is_empty() || self.current_version == INVALID_VERSION {
            return false;
        }

        for (team, leaf) in self.leaves.iter() {
            if !retired_and_drained.contains(team) {
                self.container.push(leaf.cursor_key());
            }
        }
        true
    }

    async fn refill_remote(&mut self) -> Result<bool> {
        self.snapshot.pending = true;

        let retired: Vec<StorageTeamId> = self.retired_teams.iter().copied().collect();
        for team in retired {
            debug!(team = %team, "dropping retired storage team");
            self.remove_cursor(team);
        }
        self.retired_teams.clear();

        if self.empty_teams.is_empty() {
            // Nothing left to refill: every team has ended.
            return Err(Error::EndOfStream);
        }

        let config = self.config.clone();
        let empty = &self.empty_teams;
        let tasks = self
            .leaves
            .iter_mut()
            .filter(|(team, _)| empty.contains(*team))
            .map(|(team, leaf)| {
                let team = *team;
                let config = &config;
                async move { (team, peek_one(leaf, config).await) }
            });
        let results = join_all(tasks).await;

        let mut ready = true;
        let mut failure = None;
        let mut peeked = Vec::with_capacity(results.len());
        for (team, outcome) in results {
            peeked.push(team);
            match outcome {
                PeekOutcome::Filled => {
                    self.empty_teams.remove(&team);
                }
                PeekOutcome::EndOfStream => {
                    info!(team = %team, "storage team reached end of stream");
                    assert!(self.retired_teams.insert(team), "storage team retired twice");
                    self.empty_teams.remove(&team);
                }
                PeekOutcome::TimedOut => {
                    warn!(team = %team, "peek retries exhausted, merge cursor not ready");
                    ready = false;
                }
                PeekOutcome::Failed(error) => failure = Some(error),
            }
        }
        if let Some(error) = failure {
            return Err(error);
        }
        if !ready {
            return Ok(false);
        }

        for team in peeked {
            if let Some(leaf) = self.leaves.get(&team) {
                self.max_known_version = self.max_known_version.max(leaf.max_known_version());
                self.min_known_committed_version =
                    self.min_known_committed_version.max(leaf.min_known_committed_version());
            }
        }
        gauge!("spool_cursor_max_known_version").set(self.max_known_version as f64);
        Ok(true)
    }
}

/// Refills one leaf, retrying empty replies with exponential backoff up to
/// the configured budget.
async fn peek_one(leaf: &mut StorageTeamCursor, config: &CursorConfig) -> PeekOutcome {
    if leaf.has_remaining() {
        // A cancelled refill can leave a leaf already filled; peeking again
        // would skip past its buffered batch.
        return PeekOutcome::Filled;
    }
    for attempt in 0..config.retry_times {
        match leaf.remote_more_available().await {
            Ok(true) => return PeekOutcome::Filled,
            Ok(false) => {
                if attempt + 1 == config.retry_times {
                    break;
                }
                tokio::time::sleep(config.backoff_for_retry(attempt)).await;
            }
            Err(error) if error.is_end_of_stream() => return PeekOutcome::EndOfStream,
            Err(error) => return PeekOutcome::Failed(error),
        }
    }
    PeekOutcome::TimedOut
}

#[async_trait]
impl PeekCursor for BroadcastCursor {
    fn has_remaining(&mut self) -> bool {
        let mut filled = true;
        if self.container.is_empty() {
            filled = self.try_fill_container();
        }

        // The refill marked a snapshot as pending; capture it now that the
        // container reflects the refilled state.
        if self.snapshot.pending {
            self.snapshot.pending = false;
            self.snapshot.version = self.current_version;
            self.snapshot.container = self.container.clone();
        }

        filled
    }

    fn get(&self) -> &VersionSubsequenceMessage {
        let front = match self.container.front() {
            Some(front) => front,
            None => panic!("get() on a drained merge cursor"),
        };
        self.leaves[&front.team].get()
    }

    fn next(&mut self) {
        if self.container.is_empty() && !self.try_fill_container() {
            panic!("next() on a merge cursor with nothing remaining");
        }

        if self.container.is_ordered() {
            // Consume the globally smallest message, then re-queue its leaf
            // while it still has data at the current version.
            let front = self.container.pop().expect("container refilled above");
            let leaf = self.leaves.get_mut(&front.team).expect("front leaf exists");
            leaf.next();
            if leaf.has_remaining() && leaf.version() == self.current_version {
                let key = leaf.cursor_key();
                self.container.push(key);
            }
        } else {
            // Drain the front leaf through the current version before
            // moving to the next team.
            let front = self.container.front().expect("container refilled above");
            let leaf = self.leaves.get_mut(&front.team).expect("front leaf exists");
            leaf.next();
            if !leaf.has_remaining() || leaf.version() != self.current_version {
                self.container.pop();
            }
        }
    }

    fn reset(&mut self) {
        // An invalid snapshot version means end of stream; nothing to
        // replay.
        if self.snapshot.version == INVALID_VERSION {
            return;
        }

        self.current_version = self.snapshot.version;
        self.container = self.snapshot.container.clone();

        // Empty leaves are re-discovered during re-iteration; retirement is
        // only learned from RPCs, so that set stays.
        self.empty_teams.clear();

        let current = self.current_version;
        for (team, leaf) in self.leaves.iter_mut() {
            if self.retired_teams.contains(team) {
                continue;
            }
            // All replayed data is local; rewind and scan forward to the
            // snapshot version.
            leaf.reset();
            while leaf.has_remaining() && leaf.version() < current {
                leaf.next();
            }
        }
    }

    async fn remote_more_available(&mut self) -> Result<bool> {
        self.refill_remote().await
    }

    fn max_known_version(&self) -> Version {
        self.max_known_version
    }

    fn min_known_committed_version(&self) -> Version {
        self.min_known_committed_version
    }
}
