//! Deterministic commit workloads and expected-sequence extraction.

use std::collections::BTreeMap;

use bytes::Bytes;
use rand::seq::SliceRandom;
use spool_core::{
    Message, Mutation, StorageTeamId, Subsequence, Version, VersionSubsequenceMessage,
    INVALID_VERSION,
};

use super::FakeTLog;

/// A generated workload: what was committed, per version and storage team.
///
/// The generator is deterministic: mutation `i` of each version goes to
/// team `i % teams`, with per-team subsequences dense from 1. Extraction
/// helpers produce the sequences a cursor is expected to yield.
pub struct CommitRecord {
    teams: Vec<StorageTeamId>,
    messages: BTreeMap<Version, BTreeMap<StorageTeamId, Vec<(Subsequence, Message)>>>,
}

impl CommitRecord {
    /// Generates `num_versions` consecutive versions starting at
    /// `initial_version`, each carrying `mutations_per_version` mutations
    /// spread round-robin over `teams`.
    #[must_use]
    pub fn generate(
        initial_version: Version,
        num_versions: usize,
        mutations_per_version: usize,
        teams: Vec<StorageTeamId>,
    ) -> Self {
        assert!(!teams.is_empty());
        let mut messages = BTreeMap::new();
        for offset in 0..num_versions {
            let version = initial_version + offset as Version;
            let mut by_team: BTreeMap<StorageTeamId, Vec<(Subsequence, Message)>> =
                BTreeMap::new();
            let mut counters: BTreeMap<StorageTeamId, Subsequence> = BTreeMap::new();
            for index in 0..mutations_per_version {
                let team = teams[index % teams.len()];
                let counter = counters.entry(team).or_insert(0);
                *counter += 1;
                let mutation = Mutation::set(
                    Bytes::from(format!("key-{version}-{index}")),
                    Bytes::from(format!("value-{team}-{counter}")),
                );
                by_team.entry(team).or_default().push((*counter, Message::Mutation(mutation)));
            }
            messages.insert(version, by_team);
        }
        Self { teams, messages }
    }

    /// Gives every team an entry at every version, modeling the broadcast
    /// alignment: teams without data get an empty version.
    pub fn broadcast_empty_versions(&mut self) {
        for by_team in self.messages.values_mut() {
            for team in &self.teams {
                by_team.entry(*team).or_default();
            }
        }
    }

    /// Commits the whole record into a fake TLog.
    pub fn feed(&self, tlog: &FakeTLog) {
        for (&version, by_team) in &self.messages {
            for (&team, entries) in by_team {
                if entries.is_empty() {
                    tlog.commit_empty_version(team, version);
                } else {
                    tlog.commit(
                        team,
                        version,
                        entries.iter().map(|(_, message)| message.clone()).collect(),
                    );
                }
            }
        }
    }

    /// The storage teams of this workload.
    #[must_use]
    pub fn teams(&self) -> &[StorageTeamId] {
        &self.teams
    }

    /// Highest generated version.
    #[must_use]
    pub fn max_version(&self) -> Version {
        self.messages.keys().next_back().copied().unwrap_or(INVALID_VERSION)
    }

    /// Total number of generated mutations.
    #[must_use]
    pub fn total_messages(&self) -> usize {
        self.messages
            .values()
            .flat_map(|by_team| by_team.values())
            .map(|entries| entries.len())
            .sum()
    }

    /// The expected sequence of one team, in `(version, subsequence)`
    /// order.
    #[must_use]
    pub fn team_messages(&self, team: StorageTeamId) -> Vec<VersionSubsequenceMessage> {
        let mut out = Vec::new();
        for (&version, by_team) in &self.messages {
            if let Some(entries) = by_team.get(&team) {
                for (subsequence, message) in entries {
                    out.push(VersionSubsequenceMessage::new(
                        version,
                        *subsequence,
                        message.clone(),
                    ));
                }
            }
        }
        out
    }

    /// The expected output of an ordered merge over all teams: every
    /// mutation sorted by `(version, subsequence)` with ties broken by
    /// team id, matching the cursor's deterministic tie-break.
    #[must_use]
    pub fn all_messages_ordered(&self) -> Vec<VersionSubsequenceMessage> {
        let mut entries: Vec<(Version, Subsequence, StorageTeamId, &Message)> = Vec::new();
        for (&version, by_team) in &self.messages {
            for (&team, team_entries) in by_team {
                for (subsequence, message) in team_entries {
                    entries.push((version, *subsequence, team, message));
                }
            }
        }
        entries.sort_by_key(|(version, subsequence, team, _)| (*version, *subsequence, *team));
        entries
            .into_iter()
            .map(|(version, subsequence, _, message)| {
                VersionSubsequenceMessage::new(version, subsequence, message.clone())
            })
            .collect()
    }

    /// The committed entries at one version, per team.
    #[must_use]
    pub fn messages_at(
        &self,
        version: Version,
    ) -> Option<&BTreeMap<StorageTeamId, Vec<(Subsequence, Message)>>> {
        self.messages.get(&version)
    }

    /// A uniformly random `(version, subsequence)` coordinate present in
    /// the record.
    #[must_use]
    pub fn random_position(&self) -> (Version, Subsequence) {
        let mut rng = rand::thread_rng();
        let positions: Vec<(Version, Subsequence)> = self
            .messages
            .iter()
            .flat_map(|(&version, by_team)| {
                by_team.values().flatten().map(move |(subsequence, _)| (version, *subsequence))
            })
            .collect();
        *positions.choose(&mut rng).expect("record holds at least one message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teams(count: usize) -> Vec<StorageTeamId> {
        (0..count).map(|seed| StorageTeamId::from_bytes([seed as u8 + 1; 16])).collect()
    }

    #[test]
    fn test_generation_is_dense_per_team() {
        let record = CommitRecord::generate(1000, 3, 7, teams(3));
        assert_eq!(record.total_messages(), 21);
        assert_eq!(record.max_version(), 1002);

        for team in record.teams().to_vec() {
            for window in record.team_messages(team).windows(2) {
                assert!(window[0].position() < window[1].position());
                if window[0].version == window[1].version {
                    assert_eq!(window[1].subsequence, window[0].subsequence + 1);
                }
            }
        }
    }

    #[test]
    fn test_ordered_extraction_is_sorted() {
        let record = CommitRecord::generate(1000, 4, 10, teams(3));
        let ordered = record.all_messages_ordered();
        assert_eq!(ordered.len(), record.total_messages());
        for window in ordered.windows(2) {
            assert!(window[0].position() <= window[1].position());
        }
    }

    #[test]
    fn test_broadcast_fills_every_team() {
        // Two mutations over three teams: one team per version is silent.
        let mut record = CommitRecord::generate(1000, 2, 2, teams(3));
        record.broadcast_empty_versions();

        for version in 1000..=1001 {
            let by_team = record.messages_at(version).unwrap();
            assert_eq!(by_team.len(), 3);
            assert!(by_team.values().any(|entries| entries.is_empty()));
        }
    }

    #[test]
    fn test_random_position_exists() {
        let record = CommitRecord::generate(1000, 3, 5, teams(2));
        let (version, subsequence) = record.random_position();
        let by_team = record.messages_at(version).unwrap();
        assert!(by_team
            .values()
            .flatten()
            .any(|(candidate, _)| *candidate == subsequence));
    }
}
