//! Interval sets for sparse coverage bookkeeping
//!
//! A time series is sparse: only some sample ranges are valid, and each valid
//! range was produced by some pipeline task. Both facts are kept as
//! [`IntervalSet`]s of inclusive `[start, end]` ranges.
//!
//! The set is always canonical:
//! - sorted by start, pairwise disjoint
//! - neighbours that touch or overlap and carry the same tag are coalesced
//!
//! The canonical form is a function of the point→tag mapping alone, so two
//! sets built from the same final coverage compare equal regardless of the
//! order in which the intervals were inserted.
//!
//! Insertion is last-writer-wins: where a new interval overlaps intervals with
//! a different tag, the overlapped region takes the new tag and the
//! non-overlapped remainders keep their old one.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A range type that can live in an [`IntervalSet`]
pub trait Span: Clone + PartialEq + fmt::Debug {
    /// Inclusive start
    fn start(&self) -> i64;
    /// Inclusive end
    fn end(&self) -> i64;
    /// Same tag, new bounds
    fn with_bounds(&self, start: i64, end: i64) -> Self;
    /// Whether two ranges may be coalesced when they touch
    fn same_tag(&self, other: &Self) -> bool;

    fn is_empty(&self) -> bool {
        self.start() > self.end()
    }

    fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end().abs_diff(self.start()).saturating_add(1)
        }
    }

    fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start() <= end && self.end() >= start
    }
}

/// Untagged inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    pub end: i64,
}

impl Interval {
    /// Create a range; `start > end` yields an empty range that sets ignore
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

impl Span for Interval {
    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn with_bounds(&self, start: i64, end: i64) -> Self {
        Interval { start, end }
    }

    fn same_tag(&self, _other: &Self) -> bool {
        true
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// Inclusive range tagged with the id of the task that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedInterval {
    pub start: i64,
    pub end: i64,
    pub tag: u64,
}

impl TaggedInterval {
    pub fn new(start: i64, end: i64, tag: u64) -> Self {
        Self { start, end, tag }
    }

    /// Drop the tag
    pub fn interval(&self) -> Interval {
        Interval::new(self.start, self.end)
    }
}

impl Span for TaggedInterval {
    fn start(&self) -> i64 {
        self.start
    }

    fn end(&self) -> i64 {
        self.end
    }

    fn with_bounds(&self, start: i64, end: i64) -> Self {
        TaggedInterval {
            start,
            end,
            tag: self.tag,
        }
    }

    fn same_tag(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl fmt::Display for TaggedInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]->{}", self.start, self.end, self.tag)
    }
}

/// Canonical, sorted, non-overlapping collection of ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSet<I> {
    intervals: Vec<I>,
}

impl<I> Default for IntervalSet<I> {
    fn default() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }
}

impl<I: Span> IntervalSet<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from intervals in any order, overlapping or not. Later items win
    /// where tags disagree.
    pub fn from_intervals(items: impl IntoIterator<Item = I>) -> Self {
        let mut set = Self::new();
        for item in items {
            set.insert(item);
        }
        set
    }

    /// Adopt an already canonical, sorted list. Returns `None` if the list
    /// violates the canonical-form invariant.
    pub fn from_canonical(intervals: Vec<I>) -> Option<Self> {
        let set = Self { intervals };
        if set.is_canonical() {
            Some(set)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, I> {
        self.intervals.iter()
    }

    pub fn as_slice(&self) -> &[I] {
        &self.intervals
    }

    /// Total number of points covered
    pub fn covered_points(&self) -> u64 {
        self.intervals
            .iter()
            .fold(0u64, |total, iv| total.saturating_add(iv.len()))
    }

    /// Smallest start and largest end, if any
    pub fn bounds(&self) -> Option<(i64, i64)> {
        match (self.intervals.first(), self.intervals.last()) {
            (Some(first), Some(last)) => Some((first.start(), last.end())),
            _ => None,
        }
    }

    /// Merge `new` into the set (last writer wins on overlap)
    pub fn insert(&mut self, new: I) {
        if new.is_empty() {
            return;
        }

        // [lo, hi) are the intervals that touch or overlap `new`
        let lo = self
            .intervals
            .partition_point(|iv| iv.end() < new.start().saturating_sub(1));
        let hi = self
            .intervals
            .partition_point(|iv| iv.start() <= new.end().saturating_add(1));

        let mut before = None;
        let mut after = None;
        let mut merged = new.clone();

        for iv in &self.intervals[lo..hi] {
            if iv.same_tag(&new) {
                merged = merged.with_bounds(
                    merged.start().min(iv.start()),
                    merged.end().max(iv.end()),
                );
                continue;
            }
            if iv.start() < new.start() {
                before = Some(iv.with_bounds(iv.start(), iv.end().min(new.start() - 1)));
            }
            if iv.end() > new.end() {
                after = Some(iv.with_bounds(iv.start().max(new.end() + 1), iv.end()));
            }
        }

        let replacement = before.into_iter().chain(Some(merged)).chain(after);
        self.intervals.splice(lo..hi, replacement);
        debug_assert!(self.is_canonical(), "insert broke canonical form: {:?}", self.intervals);
    }

    /// Remove every point in `[start, end]`, splitting intervals that straddle
    /// the boundaries.
    pub fn remove(&mut self, start: i64, end: i64) {
        if start > end {
            return;
        }
        let lo = self.intervals.partition_point(|iv| iv.end() < start);
        let hi = self.intervals.partition_point(|iv| iv.start() <= end);
        if lo >= hi {
            return;
        }

        let mut keep = Vec::with_capacity(2);
        let first = &self.intervals[lo];
        if first.start() < start {
            keep.push(first.with_bounds(first.start(), start - 1));
        }
        let last = &self.intervals[hi - 1];
        if last.end() > end {
            keep.push(last.with_bounds(end + 1, last.end()));
        }
        self.intervals.splice(lo..hi, keep);
    }

    /// Intervals overlapping `[start, end]`, optionally clipped to it
    pub fn spanned(&self, start: i64, end: i64, clip: bool) -> Vec<I> {
        if start > end {
            return Vec::new();
        }
        let lo = self.intervals.partition_point(|iv| iv.end() < start);
        let hi = self.intervals.partition_point(|iv| iv.start() <= end);
        self.intervals[lo..hi.max(lo)]
            .iter()
            .map(|iv| {
                if clip {
                    iv.with_bounds(iv.start().max(start), iv.end().min(end))
                } else {
                    iv.clone()
                }
            })
            .collect()
    }

    /// Restrict the set to `[start, end]`
    pub fn clipped(&self, start: i64, end: i64) -> Self {
        Self {
            intervals: self.spanned(start, end, true),
        }
    }

    /// Interval containing `point`
    pub fn find(&self, point: i64) -> Option<&I> {
        let idx = self.intervals.partition_point(|iv| iv.end() < point);
        self.intervals
            .get(idx)
            .filter(|iv| iv.start() <= point)
    }

    pub fn contains(&self, point: i64) -> bool {
        self.find(point).is_some()
    }

    /// Whether a single interval of the set covers all of `[start, end]`
    pub fn covers(&self, start: i64, end: i64) -> bool {
        if start > end {
            return true;
        }
        self.find(start).map(|iv| iv.end() >= end).unwrap_or(false)
    }

    /// Check sortedness, disjointness and coalescing
    pub fn is_canonical(&self) -> bool {
        if self.intervals.iter().any(|iv| iv.is_empty()) {
            return false;
        }
        self.intervals.windows(2).all(|w| {
            let (a, b) = (&w[0], &w[1]);
            if a.end() >= b.start() {
                return false;
            }
            !(a.same_tag(b) && a.end() + 1 == b.start())
        })
    }
}

impl IntervalSet<TaggedInterval> {
    /// Tag that produced `point`, if any
    pub fn tag_at(&self, point: i64) -> Option<u64> {
        self.find(point).map(|iv| iv.tag)
    }
}

impl<I> IntoIterator for IntervalSet<I> {
    type Item = I;
    type IntoIter = std::vec::IntoIter<I>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.into_iter()
    }
}

impl<'a, I> IntoIterator for &'a IntervalSet<I> {
    type Item = &'a I;
    type IntoIter = std::slice::Iter<'a, I>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

impl<I: fmt::Display> fmt::Display for IntervalSet<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, iv) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", iv)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn tagged(items: &[(i64, i64, u64)]) -> Vec<TaggedInterval> {
        items
            .iter()
            .map(|&(s, e, t)| TaggedInterval::new(s, e, t))
            .collect()
    }

    #[test]
    fn test_overlapping_writes_from_two_tasks() {
        let mut valid = IntervalSet::new();
        let mut origin = IntervalSet::new();

        valid.insert(Interval::new(0, 99));
        origin.insert(TaggedInterval::new(0, 99, 1));
        valid.insert(Interval::new(50, 149));
        origin.insert(TaggedInterval::new(50, 149, 2));

        assert_eq!(valid.as_slice(), &[Interval::new(0, 149)]);
        assert_eq!(origin.as_slice(), tagged(&[(0, 49, 1), (50, 149, 2)]).as_slice());
    }

    #[test]
    fn test_extreme_spans_saturate() {
        assert_eq!(Interval::new(i64::MIN, i64::MAX).len(), u64::MAX);
        assert_eq!(Interval::new(i64::MAX, i64::MAX).len(), 1);
        assert_eq!(Interval::new(1, 0).len(), 0);

        let mut set = IntervalSet::new();
        set.insert(Interval::new(i64::MIN, -10));
        set.insert(Interval::new(10, i64::MAX));
        assert_eq!(set.len(), 2);
        assert_eq!(set.covered_points(), u64::MAX);

        set.insert(Interval::new(-9, 9));
        assert_eq!(set.as_slice(), &[Interval::new(i64::MIN, i64::MAX)]);
    }

    #[test]
    fn test_adjacent_same_tag_coalesces() {
        let mut set = IntervalSet::new();
        set.insert(TaggedInterval::new(10, 19, 4));
        set.insert(TaggedInterval::new(20, 29, 4));
        set.insert(TaggedInterval::new(0, 9, 4));
        assert_eq!(set.as_slice(), tagged(&[(0, 29, 4)]).as_slice());

        set.insert(TaggedInterval::new(30, 39, 5));
        assert_eq!(set.as_slice(), tagged(&[(0, 29, 4), (30, 39, 5)]).as_slice());
    }

    #[test]
    fn test_insert_splits_enclosing_interval() {
        let mut set = IntervalSet::new();
        set.insert(TaggedInterval::new(0, 100, 1));
        set.insert(TaggedInterval::new(40, 60, 2));
        assert_eq!(
            set.as_slice(),
            tagged(&[(0, 39, 1), (40, 60, 2), (61, 100, 1)]).as_slice()
        );

        // Rewriting the middle with the original tag heals the split
        set.insert(TaggedInterval::new(40, 60, 1));
        assert_eq!(set.as_slice(), tagged(&[(0, 100, 1)]).as_slice());
    }

    #[test]
    fn test_insert_swallows_many() {
        let mut set = IntervalSet::from_intervals(tagged(&[
            (0, 4, 1),
            (10, 14, 2),
            (20, 24, 3),
            (30, 34, 1),
        ]));
        set.insert(TaggedInterval::new(2, 32, 9));
        assert_eq!(set.as_slice(), tagged(&[(0, 1, 1), (2, 32, 9), (33, 34, 1)]).as_slice());
    }

    #[test]
    fn test_remove_splits() {
        let mut set = IntervalSet::from_intervals(vec![Interval::new(0, 100), Interval::new(200, 300)]);
        set.remove(50, 250);
        assert_eq!(set.as_slice(), &[Interval::new(0, 49), Interval::new(251, 300)]);

        set.remove(0, 49);
        assert_eq!(set.as_slice(), &[Interval::new(251, 300)]);

        // Removing a hole is a no-op
        set.remove(100, 200);
        assert_eq!(set.as_slice(), &[Interval::new(251, 300)]);
    }

    #[test]
    fn test_spanned_and_clip() {
        let set = IntervalSet::from_intervals(vec![
            Interval::new(0, 9),
            Interval::new(20, 29),
            Interval::new(40, 49),
        ]);
        assert_eq!(
            set.spanned(5, 25, false),
            vec![Interval::new(0, 9), Interval::new(20, 29)]
        );
        assert_eq!(
            set.spanned(5, 25, true),
            vec![Interval::new(5, 9), Interval::new(20, 25)]
        );
        assert!(set.spanned(10, 19, true).is_empty());
        assert!(set.spanned(50, 60, true).is_empty());
        assert!(set.covers(21, 28));
        assert!(!set.covers(5, 25));
        assert!(set.contains(45));
        assert!(!set.contains(30));
    }

    #[test]
    fn test_from_canonical_rejects_bad_lists() {
        assert!(IntervalSet::from_canonical(vec![Interval::new(0, 5), Interval::new(3, 9)]).is_none());
        assert!(IntervalSet::from_canonical(vec![Interval::new(0, 5), Interval::new(6, 9)]).is_none());
        assert!(IntervalSet::from_canonical(tagged(&[(0, 5, 1), (6, 9, 2)])).is_some());
    }

    /// Point-wise model of tagged coverage, used to derive a canonical set
    fn model_set(points: &[Option<u64>]) -> IntervalSet<TaggedInterval> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < points.len() {
            if let Some(tag) = points[i] {
                let start = i;
                while i + 1 < points.len() && points[i + 1] == Some(tag) {
                    i += 1;
                }
                out.push(TaggedInterval::new(start as i64, i as i64, tag));
            }
            i += 1;
        }
        IntervalSet::from_canonical(out).unwrap()
    }

    #[test]
    fn test_matches_pointwise_model() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let mut points = vec![None; 128];
            let mut set = IntervalSet::new();
            for _ in 0..rng.gen_range(1..20) {
                let s = rng.gen_range(0..128);
                let e = rng.gen_range(s..128);
                let tag = rng.gen_range(0..4u64);
                set.insert(TaggedInterval::new(s as i64, e as i64, tag));
                for p in points.iter_mut().take(e + 1).skip(s) {
                    *p = Some(tag);
                }
            }
            assert!(set.is_canonical());
            assert_eq!(set, model_set(&points));
        }
    }

    #[test]
    fn test_insertion_order_independence() {
        // Disjoint inserts with a fixed tag-per-point mapping, shuffled
        let mut rng = StdRng::seed_from_u64(42);
        let pieces = tagged(&[
            (0, 9, 1),
            (10, 19, 1),
            (20, 29, 2),
            (30, 30, 2),
            (31, 50, 1),
            (60, 70, 3),
            (71, 80, 3),
        ]);
        let expected = IntervalSet::from_intervals(pieces.clone());
        assert_eq!(
            expected.as_slice(),
            tagged(&[(0, 19, 1), (20, 30, 2), (31, 50, 1), (60, 80, 3)]).as_slice()
        );

        for _ in 0..50 {
            let mut shuffled = pieces.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(IntervalSet::from_intervals(shuffled), expected);
        }
    }
}
