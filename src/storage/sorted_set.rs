//! Sorted set: a member index plus a skiplist.
//!
//! The `HashMap` answers "what is the score of m" in O(1); the skiplist keeps
//! members ordered for rank and range queries. Both are updated together and
//! always agree on every member's score.
//!
//! A `SortedSet` is not thread-safe on its own. It is only reached through
//! the keyspace entry that owns it, under that shard's lock.

use crate::storage::skiplist::{Border, Element, Skiplist};
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;

/// The member is not in the set.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no such member")]
pub struct NotFound;

#[derive(Debug, Default)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    skiplist: Skiplist,
}

impl Clone for SortedSet {
    fn clone(&self) -> Self {
        let mut copy = SortedSet::new();
        for el in self.iter() {
            copy.put(el.member.clone(), el.score);
        }
        copy
    }
}

impl PartialEq for SortedSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Adds a member or changes its score.
    ///
    /// Returns 0 only when the member already had exactly this score, 1 for
    /// both a new member and a score change.
    pub fn put(&mut self, member: Bytes, score: f64) -> usize {
        match self.scores.insert(member.clone(), score) {
            Some(old) if old == score => 0,
            Some(old) => {
                self.skiplist.remove(&member, old);
                self.skiplist.insert(member, score);
                1
            }
            None => {
                self.skiplist.insert(member, score);
                1
            }
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        self.scores.contains_key(member)
    }

    /// Removes a member from both indexes. Returns 1 if it was present.
    pub fn remove(&mut self, member: &[u8]) -> usize {
        match self.scores.remove(member) {
            Some(score) => {
                self.skiplist.remove(member, score);
                1
            }
            None => 0,
        }
    }

    /// 0-based rank; descending ranks count from the highest score.
    pub fn rank(&self, member: &[u8], desc: bool) -> Result<usize, NotFound> {
        let score = self.score(member).ok_or(NotFound)?;
        let rank = self.skiplist.rank(member, score);
        if rank == 0 {
            return Err(NotFound);
        }
        Ok(if desc { self.len() - rank } else { rank - 1 })
    }

    /// Elements at 0-based ranks `start..=stop`; bounds must already be
    /// clamped to the set.
    pub fn range_by_rank(&self, start: usize, stop: usize, desc: bool) -> Vec<Element> {
        if start > stop || start >= self.len() {
            return Vec::new();
        }
        let first = if desc { self.len() - start } else { start + 1 };
        self.skiplist
            .iter_from_rank(first, desc)
            .take(stop - start + 1)
            .cloned()
            .collect()
    }

    /// Elements with scores in `[min, max]`, after skipping `offset`,
    /// at most `limit` of them.
    pub fn range_by_score(
        &self,
        min: &Border,
        max: &Border,
        offset: usize,
        limit: Option<usize>,
        desc: bool,
    ) -> Vec<Element> {
        self.skiplist
            .iter_in_range(min, max, desc)
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn count_in_range(&self, min: &Border, max: &Border) -> usize {
        let first = self.skiplist.first_in_range(min, max);
        let last = self.skiplist.last_in_range(min, max);
        match (first, last) {
            (Some(first), Some(last)) => {
                let lo = self.skiplist.rank(&first.member, first.score);
                let hi = self.skiplist.rank(&last.member, last.score);
                hi + 1 - lo
            }
            _ => 0,
        }
    }

    /// Removes 0-based ranks `start..=stop` (already clamped).
    pub fn remove_range_by_rank(&mut self, start: usize, stop: usize) -> usize {
        let removed = self.skiplist.remove_range_by_rank(start + 1, stop + 1);
        self.forget(&removed)
    }

    pub fn remove_range_by_score(&mut self, min: &Border, max: &Border) -> usize {
        let removed = self.skiplist.remove_range_by_score(min, max, usize::MAX);
        self.forget(&removed)
    }

    fn forget(&mut self, removed: &[Element]) -> usize {
        for el in removed {
            self.scores.remove(&el.member);
        }
        removed.len()
    }

    /// Members in ascending `(score, member)` order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.skiplist.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zset(pairs: &[(&str, f64)]) -> SortedSet {
        let mut set = SortedSet::new();
        for (m, s) in pairs {
            set.put(Bytes::from(m.to_string()), *s);
        }
        set
    }

    fn names(elements: &[Element]) -> Vec<&[u8]> {
        elements.iter().map(|e| &e.member[..]).collect()
    }

    #[test]
    fn test_put_is_idempotent_for_same_score() {
        let mut set = SortedSet::new();
        assert_eq!(set.put(Bytes::from("a"), 1.0), 1);
        assert_eq!(set.put(Bytes::from("b"), 2.0), 1);
        let rank = set.rank(b"a", false);

        assert_eq!(set.put(Bytes::from("a"), 1.0), 0);
        assert_eq!(set.len(), 2);
        assert_eq!(set.rank(b"a", false), rank);
    }

    #[test]
    fn test_score_change_reorders() {
        let mut set = zset(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        assert_eq!(set.put(Bytes::from("a"), 10.0), 1);
        assert_eq!(set.len(), 3);
        assert_eq!(set.score(b"a"), Some(10.0));
        assert_eq!(set.rank(b"a", false), Ok(2));
        assert_eq!(set.rank(b"a", true), Ok(0));
        assert_eq!(set.iter().count(), 3);
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let mut set = zset(&[("a", 1.0), ("b", 2.0)]);
        assert_eq!(set.remove(b"a"), 1);
        assert_eq!(set.remove(b"a"), 0);
        assert!(!set.contains(b"a"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().count(), 1);
        assert_eq!(set.rank(b"a", false), Err(NotFound));
        assert_eq!(set.rank(b"zz", true), Err(NotFound));
    }

    #[test]
    fn test_rank_ranges() {
        let set = zset(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        assert_eq!(names(&set.range_by_rank(0, 3, false)), vec![b"a", b"b", b"c", b"d"]);
        assert_eq!(names(&set.range_by_rank(1, 2, false)), vec![b"b", b"c"]);
        assert_eq!(names(&set.range_by_rank(0, 1, true)), vec![b"d", b"c"]);
        assert!(set.range_by_rank(2, 1, false).is_empty());
        assert!(set.range_by_rank(9, 10, false).is_empty());
    }

    #[test]
    fn test_score_ranges() {
        let set = zset(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let two = Border::inclusive(2.0);
        let four_ex = Border::Finite { value: 4.0, exclusive: true };

        assert_eq!(
            names(&set.range_by_score(&two, &Border::PosInf, 0, None, false)),
            vec![b"b", b"c", b"d"]
        );
        assert_eq!(
            names(&set.range_by_score(&two, &four_ex, 0, None, true)),
            vec![b"c", b"b"]
        );
        assert_eq!(
            names(&set.range_by_score(&Border::NegInf, &Border::PosInf, 1, Some(2), false)),
            vec![b"b", b"c"]
        );
        assert_eq!(set.count_in_range(&two, &four_ex), 2);
        assert_eq!(set.count_in_range(&Border::inclusive(5.0), &Border::PosInf), 0);
        assert_eq!(SortedSet::new().count_in_range(&Border::NegInf, &Border::PosInf), 0);
    }

    #[test]
    fn test_remove_ranges_keep_indexes_in_sync() {
        let mut set = zset(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)]);
        assert_eq!(set.remove_range_by_rank(0, 1), 2);
        assert!(!set.contains(b"a") && !set.contains(b"b"));
        assert_eq!(
            set.remove_range_by_score(&Border::inclusive(4.0), &Border::PosInf),
            2
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.score(b"c"), Some(3.0));
    }

    #[test]
    fn test_clone_and_eq() {
        let set = zset(&[("x", 1.5), ("y", -2.0)]);
        let copy = set.clone();
        assert_eq!(set, copy);
        assert_ne!(set, zset(&[("x", 1.5)]));
    }
}
