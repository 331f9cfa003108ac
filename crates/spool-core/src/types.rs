// Copyright 2024 The Spool Authors
// SPDX-License-Identifier: Apache-2.0

//! Common types used throughout Spool.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A commit version assigned by the transaction proxy.
///
/// Versions are strictly increasing across commits but not dense; gaps are
/// normal. [`INVALID_VERSION`] marks an unset version.
pub type Version = i64;

/// Sentinel marking an unset version.
pub const INVALID_VERSION: Version = -1;

/// Ordering token within a single version for a single storage team.
///
/// Starts at 1 and is dense; subsequence 0 is reserved for the synthetic
/// empty-version marker.
pub type Subsequence = u32;

/// Key prefix of team-assignment mutations carried on the private-mutations
/// storage team. The full key is the prefix followed by the 16-byte storage
/// server id.
pub const TEAM_ASSIGNMENT_PREFIX: &[u8] = b"\xff/storageTeamAssignment/";

/// Identifier of a storage team.
///
/// A storage team is a replication unit whose log suffix is produced
/// cooperatively by one or more TLog endpoints.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct StorageTeamId(Uuid);

impl StorageTeamId {
    /// Creates a storage team id from a UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Creates a random storage team id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a storage team id from its 16-byte representation.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16-byte representation.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for StorageTeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a TLog group: a set of storage teams sharing TLog replicas.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TLogGroupId(Uuid);

impl TLogGroupId {
    /// Creates a TLog group id from a UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Creates a random TLog group id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TLogGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a key-value mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Set a key to a value.
    Set,
    /// Clear the key range `[key, value)`.
    ClearRange,
    /// Atomically add the little-endian value to the key.
    AtomicAdd,
}

impl MutationKind {
    /// Returns the wire tag for this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Set => 0,
            Self::ClearRange => 1,
            Self::AtomicAdd => 2,
        }
    }

    /// Parses a wire tag.
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Set),
            1 => Some(Self::ClearRange),
            2 => Some(Self::AtomicAdd),
            _ => None,
        }
    }
}

/// A key-value mutation committed through the transaction pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// What the mutation does.
    pub kind: MutationKind,
    /// First parameter: the key, or the begin key of a cleared range.
    pub key: Bytes,
    /// Second parameter: the value, or the end key of a cleared range.
    pub value: Bytes,
}

impl Mutation {
    /// Creates a set mutation.
    #[must_use]
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { kind: MutationKind::Set, key: key.into(), value: value.into() }
    }

    /// Creates a clear-range mutation over `[begin, end)`.
    #[must_use]
    pub fn clear_range(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self { kind: MutationKind::ClearRange, key: begin.into(), value: end.into() }
    }
}

/// A message carried at one `(version, subsequence)` coordinate of a storage
/// team's log suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A key-value mutation destined for the storage team.
    Mutation(Mutation),

    /// Marker for a commit version that carried no real mutations for this
    /// team. Used in the broadcast model to keep teams version-aligned.
    EmptyVersion,

    /// Control record announcing the wire protocol version of subsequent
    /// messages. Cursors skip over it on demand.
    LogProtocol {
        /// The announced protocol version.
        protocol_version: u64,
    },

    /// Tracing span propagated alongside the commit. Cursors skip over it on
    /// demand.
    SpanContext {
        /// The 16-byte span identifier.
        span_id: [u8; 16],
    },
}

impl Message {
    /// True for the empty-version marker.
    #[must_use]
    pub const fn is_empty_version(&self) -> bool {
        matches!(self, Self::EmptyVersion)
    }

    /// True for a key-value mutation.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(self, Self::Mutation(_))
    }
}

/// The fundamental unit of cursor iteration: a message at its log coordinate.
///
/// The total order over emissions is lexicographic on
/// `(version, subsequence)`; [`VersionSubsequenceMessage::position`] exposes
/// that key. Equality additionally compares the message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSubsequenceMessage {
    /// Commit version of the message.
    pub version: Version,
    /// Subsequence within the version for the originating team.
    pub subsequence: Subsequence,
    /// The message itself.
    pub message: Message,
}

impl VersionSubsequenceMessage {
    /// Creates a new triple.
    #[must_use]
    pub const fn new(version: Version, subsequence: Subsequence, message: Message) -> Self {
        Self { version, subsequence, message }
    }

    /// Returns the ordering key `(version, subsequence)`.
    #[must_use]
    pub const fn position(&self) -> (Version, Subsequence) {
        (self.version, self.subsequence)
    }
}

impl std::fmt::Display for VersionSubsequenceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.version, self.subsequence)
    }
}

/// The set of storage teams assigned to one storage server, as carried in
/// team-assignment mutations.
///
/// The private-mutations team is always a member and always serialized first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageServerTeams {
    private_team: StorageTeamId,
    teams: BTreeSet<StorageTeamId>,
}

impl StorageServerTeams {
    /// Creates an assignment holding only the private-mutations team.
    #[must_use]
    pub fn new(private_team: StorageTeamId) -> Self {
        let mut teams = BTreeSet::new();
        teams.insert(private_team);
        Self { private_team, teams }
    }

    /// Adds the given teams to the assignment.
    #[must_use]
    pub fn with_teams(mut self, teams: impl IntoIterator<Item = StorageTeamId>) -> Self {
        self.teams.extend(teams);
        self
    }

    /// Adds one team.
    pub fn insert(&mut self, team: StorageTeamId) {
        self.teams.insert(team);
    }

    /// Removes one team. The private team cannot be removed.
    pub fn remove(&mut self, team: StorageTeamId) {
        if team != self.private_team {
            self.teams.remove(&team);
        }
    }

    /// Returns the private-mutations team of this assignment.
    #[must_use]
    pub const fn private_team(&self) -> StorageTeamId {
        self.private_team
    }

    /// True if the team is part of the assignment.
    #[must_use]
    pub fn contains(&self, team: StorageTeamId) -> bool {
        self.teams.contains(&team)
    }

    /// Iterates the assigned teams, private team included.
    pub fn iter(&self) -> impl Iterator<Item = StorageTeamId> + '_ {
        self.teams.iter().copied()
    }

    /// Number of assigned teams, private team included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    /// True if only the private team is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.teams.len() <= 1
    }

    /// Builds the mutation key announcing this assignment for the given
    /// storage server.
    #[must_use]
    pub fn assignment_key(storage_server_id: Uuid) -> Bytes {
        let mut key = BytesMut::with_capacity(TEAM_ASSIGNMENT_PREFIX.len() + 16);
        key.put_slice(TEAM_ASSIGNMENT_PREFIX);
        key.put_slice(storage_server_id.as_bytes());
        key.freeze()
    }

    /// Encodes the assignment as a mutation value: a count followed by
    /// 16-byte team ids, private team first.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.teams.len() * 16);
        buf.put_u32_le(self.teams.len() as u32);
        buf.put_slice(self.private_team.as_bytes());
        for team in &self.teams {
            if *team != self.private_team {
                buf.put_slice(team.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decodes an assignment from a mutation value.
    pub fn decode(mut value: Bytes) -> Result<Self> {
        if value.remaining() < 4 {
            return Err(Error::malformed("team assignment value shorter than its count"));
        }
        let count = value.get_u32_le() as usize;
        if count == 0 {
            return Err(Error::malformed("team assignment with zero teams"));
        }
        if value.remaining() != count * 16 {
            return Err(Error::malformed(format!(
                "team assignment length mismatch: {} teams, {} trailing bytes",
                count,
                value.remaining()
            )));
        }
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let mut raw = [0u8; 16];
            value.copy_to_slice(&mut raw);
            ids.push(StorageTeamId::from_bytes(raw));
        }
        let private_team = ids[0];
        Ok(Self { private_team, teams: ids.into_iter().collect() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_sentinel() {
        assert!(INVALID_VERSION < 0);
        let v: Version = 1000;
        assert!(v > INVALID_VERSION);
    }

    #[test]
    fn test_storage_team_id_roundtrip() {
        let id = StorageTeamId::random();
        let bytes = *id.as_bytes();
        assert_eq!(StorageTeamId::from_bytes(bytes), id);
        assert_eq!(id.to_string(), id.as_uuid().to_string());
    }

    #[test]
    fn test_mutation_kind_tags() {
        for kind in [MutationKind::Set, MutationKind::ClearRange, MutationKind::AtomicAdd] {
            assert_eq!(MutationKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(MutationKind::from_u8(7), None);
    }

    #[test]
    fn test_vsm_position_ordering() {
        let a = VersionSubsequenceMessage::new(10, 2, Message::EmptyVersion);
        let b = VersionSubsequenceMessage::new(10, 3, Message::EmptyVersion);
        let c = VersionSubsequenceMessage::new(11, 1, Message::EmptyVersion);
        assert!(a.position() < b.position());
        assert!(b.position() < c.position());
    }

    #[test]
    fn test_storage_server_teams_roundtrip() {
        let private_team = StorageTeamId::random();
        let others: Vec<_> = (0..3).map(|_| StorageTeamId::random()).collect();
        let teams = StorageServerTeams::new(private_team).with_teams(others.iter().copied());

        let decoded = StorageServerTeams::decode(teams.encode()).unwrap();
        assert_eq!(decoded, teams);
        assert_eq!(decoded.private_team(), private_team);
        for team in &others {
            assert!(decoded.contains(*team));
        }
    }

    #[test]
    fn test_storage_server_teams_private_always_member() {
        let private_team = StorageTeamId::random();
        let mut teams = StorageServerTeams::new(private_team);
        assert!(teams.contains(private_team));
        assert!(teams.is_empty());

        teams.remove(private_team);
        assert!(teams.contains(private_team));
    }

    #[test]
    fn test_storage_server_teams_decode_rejects_garbage() {
        assert!(StorageServerTeams::decode(Bytes::from_static(b"\x01")).is_err());
        assert!(StorageServerTeams::decode(Bytes::from_static(b"\x00\x00\x00\x00")).is_err());

        // Count says two teams, payload holds one.
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_slice(StorageTeamId::random().as_bytes());
        assert!(StorageServerTeams::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_assignment_key_prefix() {
        let key = StorageServerTeams::assignment_key(Uuid::new_v4());
        assert!(key.starts_with(TEAM_ASSIGNMENT_PREFIX));
        assert_eq!(key.len(), TEAM_ASSIGNMENT_PREFIX.len() + 16);
    }
}
