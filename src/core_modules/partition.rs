// THEORY:
// The partition planner decides which indices of a region belong together.
// Every partition is a total, disjoint assignment of the index domain 0..N-1
// to colors, and every kind answers a different question:
//
// 1.  **Even**: which indices does each concurrently running color own? Colors
//     are contiguous ranges whose sizes differ by at most one element.
// 2.  **Batched**: which indices are admitted together? Ranges of a fixed size,
//     the last one holding the remainder.
// 3.  **Predicate-derived**: which indices share a value computed mid-run? The
//     colors are the literal values stored in a field, which is how compaction
//     rebuilds the set of items that passed the filter.
//
// Partitions are plain values. They are created when a stage needs them and
// dropped as soon as their consumer is done.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{PipelineError, Result};

/// A half-open range of indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn single(index: usize) -> Self {
        Self::new(index, index + 1)
    }

    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    pub fn overlaps(&self, other: &IndexRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    pub fn iter(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for IndexRange {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// A partition of `0..domain_len` into contiguous colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    domain_len: usize,
    colors: Vec<IndexRange>,
}

impl Partition {
    pub fn domain_len(&self) -> usize {
        self.domain_len
    }

    pub fn num_colors(&self) -> usize {
        self.colors.len()
    }

    pub fn color(&self, color: usize) -> Option<IndexRange> {
        self.colors.get(color).copied()
    }

    pub fn colors(&self) -> &[IndexRange] {
        &self.colors
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.colors.iter().map(IndexRange::len).collect()
    }

    /// The color that owns `index`.
    pub fn color_of(&self, index: usize) -> Option<usize> {
        if index >= self.domain_len {
            return None;
        }
        // Colors are sorted and contiguous; empty colors sort before their
        // non-empty successor because they share its start.
        let candidate = self.colors.partition_point(|range| range.end <= index);
        self.colors
            .get(candidate)
            .filter(|range| range.contains(index))
            .map(|_| candidate)
    }
}

/// Splits `0..n` into `k` contiguous colors of balanced size.
///
/// Color `i` receives `ceil(remaining_items / (k - i))` items, so the largest
/// and smallest colors differ by at most one element.
pub fn even_partition(n: usize, k: usize) -> Result<Partition> {
    if k == 0 {
        if n == 0 {
            return Ok(Partition {
                domain_len: 0,
                colors: Vec::new(),
            });
        }
        return Err(PipelineError::Partition(format!(
            "cannot split {n} items into zero colors"
        )));
    }

    let mut colors = Vec::with_capacity(k);
    let mut allocated = 0usize;
    for i in 0..k {
        let remaining_items = n - allocated;
        let remaining_colors = k - i;
        let elements = remaining_items.div_ceil(remaining_colors);
        colors.push(IndexRange::new(allocated, allocated + elements));
        allocated += elements;
    }
    debug_assert_eq!(allocated, n);

    Ok(Partition {
        domain_len: n,
        colors,
    })
}

/// Splits `0..n` into `ceil(n / b)` ranges of `b` items; the last range holds
/// the remainder.
pub fn batched_partition(n: usize, b: usize) -> Result<Partition> {
    if b == 0 {
        return Err(PipelineError::Partition("batch size must be at least 1".into()));
    }
    let colors = (0..n.div_ceil(b))
        .map(|batch| {
            let start = batch * b;
            IndexRange::new(start, (start + b).min(n))
        })
        .collect();
    Ok(Partition {
        domain_len: n,
        colors,
    })
}

/// A partition whose colors are the distinct values of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicatePartition<K> {
    groups: BTreeMap<K, Vec<usize>>,
}

impl<K: Ord> PredicatePartition<K> {
    /// Indices of color `key`, in their original relative order.
    pub fn color(&self, key: &K) -> &[usize] {
        self.groups.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn size(&self, key: &K) -> usize {
        self.color(key).len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.groups.keys()
    }

    pub fn num_colors(&self) -> usize {
        self.groups.len()
    }

    /// Consumes the partition, keeping only color `key`.
    pub fn into_color(mut self, key: &K) -> Vec<usize> {
        self.groups.remove(key).unwrap_or_default()
    }
}

/// Groups indices by key, preserving the order in which they are yielded.
pub fn group_by_key<K: Ord>(values: impl IntoIterator<Item = (usize, K)>) -> PredicatePartition<K> {
    let mut groups: BTreeMap<K, Vec<usize>> = BTreeMap::new();
    for (index, key) in values {
        groups.entry(key).or_default().push(index);
    }
    PredicatePartition { groups }
}

/// Builds a partition of `0..flags.len()` from literal stored flag values.
pub fn predicate_partition(flags: &[i32]) -> PredicatePartition<i32> {
    group_by_key(flags.iter().copied().enumerate())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_partition_balances_the_remainder_at_the_front() {
        let partition = even_partition(10, 3).unwrap();
        assert_eq!(partition.sizes(), vec![4, 3, 3]);
        assert_eq!(
            partition.colors(),
            &[
                IndexRange::new(0, 4),
                IndexRange::new(4, 7),
                IndexRange::new(7, 10)
            ]
        );
    }

    #[test]
    fn even_partition_with_more_colors_than_items_leaves_empty_colors() {
        let partition = even_partition(2, 4).unwrap();
        assert_eq!(partition.sizes(), vec![1, 1, 0, 0]);
        assert_eq!(partition.color_of(1), Some(1));
        assert_eq!(partition.color_of(2), None);
    }

    #[test]
    fn even_partition_rejects_zero_colors_for_items() {
        assert!(even_partition(3, 0).is_err());
        assert_eq!(even_partition(0, 0).unwrap().num_colors(), 0);
    }

    #[test]
    fn batched_partition_keeps_remainder_last() {
        let partition = batched_partition(5, 2).unwrap();
        assert_eq!(partition.sizes(), vec![2, 2, 1]);
        assert_eq!(batched_partition(4, 2).unwrap().sizes(), vec![2, 2]);
        assert_eq!(batched_partition(0, 2).unwrap().num_colors(), 0);
        assert!(batched_partition(3, 0).is_err());
    }

    #[test]
    fn color_of_finds_owner() {
        let partition = batched_partition(7, 3).unwrap();
        assert_eq!(partition.color_of(0), Some(0));
        assert_eq!(partition.color_of(3), Some(1));
        assert_eq!(partition.color_of(6), Some(2));
        assert_eq!(partition.color_of(7), None);
    }

    #[test]
    fn predicate_partition_groups_by_literal_value() {
        let partition = predicate_partition(&[0, -1, 0, -1, 0]);
        assert_eq!(partition.color(&0), &[0, 2, 4]);
        assert_eq!(partition.color(&-1), &[1, 3]);
        assert_eq!(partition.size(&7), 0);
        assert_eq!(partition.num_colors(), 2);
    }

    #[test]
    fn range_overlap() {
        let a = IndexRange::new(0, 4);
        assert!(a.overlaps(&IndexRange::new(3, 5)));
        assert!(!a.overlaps(&IndexRange::new(4, 5)));
        assert!(!a.overlaps(&IndexRange::new(2, 2)));
    }
}
