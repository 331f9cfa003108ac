//! Ordering disciplines for the broadcast merge cursor.
//!
//! The two merge variants share one control flow and differ only in how the
//! ready container hands out leaves: the ordered container is a min-heap
//! yielding the globally smallest message, the unordered container is a FIFO
//! that drains one team at a time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use spool_core::{StorageTeamId, Subsequence, Version};

/// Position of a leaf cursor: its current message coordinate plus the team
/// id as a deterministic tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CursorKey {
    pub version: Version,
    pub subsequence: Subsequence,
    pub team: StorageTeamId,
}

/// Ready container over leaf cursor positions.
///
/// Cloning is cheap (one key per leaf), which is what makes the replay
/// snapshot affordable.
#[derive(Debug, Clone)]
pub(crate) enum CursorContainer {
    Ordered(BinaryHeap<Reverse<CursorKey>>),
    Unordered(VecDeque<CursorKey>),
}

impl CursorContainer {
    pub fn ordered() -> Self {
        Self::Ordered(BinaryHeap::new())
    }

    pub fn unordered() -> Self {
        Self::Unordered(VecDeque::new())
    }

    /// An empty container of the same discipline.
    pub fn same_kind(&self) -> Self {
        match self {
            Self::Ordered(_) => Self::ordered(),
            Self::Unordered(_) => Self::unordered(),
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Ordered(_))
    }

    pub fn push(&mut self, key: CursorKey) {
        match self {
            Self::Ordered(heap) => heap.push(Reverse(key)),
            Self::Unordered(queue) => queue.push_back(key),
        }
    }

    /// The next leaf to consume from: smallest position for the ordered
    /// discipline, oldest enqueued for the unordered one.
    pub fn front(&self) -> Option<CursorKey> {
        match self {
            Self::Ordered(heap) => heap.peek().map(|entry| entry.0),
            Self::Unordered(queue) => queue.front().copied(),
        }
    }

    pub fn pop(&mut self) -> Option<CursorKey> {
        match self {
            Self::Ordered(heap) => heap.pop().map(|entry| entry.0),
            Self::Unordered(queue) => queue.pop_front(),
        }
    }

    /// Drops every entry of the given team.
    pub fn erase(&mut self, team: StorageTeamId) {
        match self {
            Self::Ordered(heap) => {
                let kept: Vec<_> =
                    heap.drain().filter(|entry| entry.0.team != team).collect();
                *heap = kept.into_iter().collect();
            }
            Self::Unordered(queue) => queue.retain(|key| key.team != team),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Ordered(heap) => heap.is_empty(),
            Self::Unordered(queue) => queue.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ordered(heap) => heap.len(),
            Self::Unordered(queue) => queue.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(version: Version, subsequence: Subsequence, seed: u8) -> CursorKey {
        CursorKey { version, subsequence, team: StorageTeamId::from_bytes([seed; 16]) }
    }

    #[test]
    fn test_ordered_yields_smallest_position() {
        let mut container = CursorContainer::ordered();
        container.push(key(10, 2, 1));
        container.push(key(9, 5, 2));
        container.push(key(10, 1, 3));

        assert_eq!(container.front(), Some(key(9, 5, 2)));
        assert_eq!(container.pop(), Some(key(9, 5, 2)));
        assert_eq!(container.pop(), Some(key(10, 1, 3)));
        assert_eq!(container.pop(), Some(key(10, 2, 1)));
        assert_eq!(container.pop(), None);
    }

    #[test]
    fn test_ordered_ties_break_on_team() {
        let mut container = CursorContainer::ordered();
        container.push(key(5, 1, 9));
        container.push(key(5, 1, 1));

        assert_eq!(container.pop(), Some(key(5, 1, 1)));
        assert_eq!(container.pop(), Some(key(5, 1, 9)));
    }

    #[test]
    fn test_unordered_is_fifo() {
        let mut container = CursorContainer::unordered();
        container.push(key(10, 2, 1));
        container.push(key(9, 5, 2));

        assert_eq!(container.front(), Some(key(10, 2, 1)));
        assert_eq!(container.pop(), Some(key(10, 2, 1)));
        assert_eq!(container.pop(), Some(key(9, 5, 2)));
    }

    #[test]
    fn test_erase_removes_team() {
        for mut container in [CursorContainer::ordered(), CursorContainer::unordered()] {
            container.push(key(1, 1, 1));
            container.push(key(2, 1, 2));
            container.push(key(3, 1, 1));

            container.erase(StorageTeamId::from_bytes([1; 16]));
            assert_eq!(container.len(), 1);
            assert_eq!(container.front(), Some(key(2, 1, 2)));
        }
    }

    #[test]
    fn test_clone_preserves_contents() {
        let mut container = CursorContainer::ordered();
        container.push(key(2, 1, 1));
        container.push(key(1, 1, 2));

        let mut snapshot = container.clone();
        container.pop();
        container.pop();

        assert!(container.is_empty());
        assert_eq!(snapshot.pop(), Some(key(1, 1, 2)));
        assert_eq!(snapshot.pop(), Some(key(2, 1, 1)));
    }

    #[test]
    fn test_same_kind_is_empty() {
        let mut container = CursorContainer::unordered();
        container.push(key(1, 1, 1));

        let fresh = container.same_kind();
        assert!(fresh.is_empty());
        assert!(!fresh.is_ordered());
    }
}
