//! Core types and utilities for the Spool partitioned transaction log.
//!
//! This crate provides the fundamental building blocks shared by all Spool
//! components:
//! - Scalar types for the log coordinate system (versions, subsequences)
//! - Identifiers for storage teams and TLog groups
//! - The message model consumed by peek cursors
//! - The error taxonomy of the peek path

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    Message, Mutation, MutationKind, StorageServerTeams, StorageTeamId, Subsequence, TLogGroupId,
    Version, VersionSubsequenceMessage, INVALID_VERSION, TEAM_ASSIGNMENT_PREFIX,
};
