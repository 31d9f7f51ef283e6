//! Interval index over ordered boundary keys
//!
//! Each inserted value covers the closed range `[lower, upper]`. The tree
//! keeps one segment per boundary key: `set` holds the values whose range
//! continues past that key and `closing_set` the values whose range ends
//! exactly there. The number of overlapping values at a boundary is the sum
//! of both sizes.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Values live at one boundary key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<V: Ord> {
    set: BTreeSet<V>,
    closing_set: BTreeSet<V>,
}

impl<V: Ord + Clone> Segment<V> {
    fn open(set: BTreeSet<V>) -> Self {
        Self {
            set,
            closing_set: BTreeSet::new(),
        }
    }

    /// Values continuing past this key
    pub fn set(&self) -> &BTreeSet<V> {
        &self.set
    }

    /// Values ending at this key
    pub fn closing_set(&self) -> &BTreeSet<V> {
        &self.closing_set
    }

    /// Number of values covering this key
    pub fn overlaps(&self) -> usize {
        self.set.len() + self.closing_set.len()
    }

    /// All values covering this key
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.set.iter().chain(self.closing_set.iter())
    }
}

/// Range tree keyed by `K` holding values `V`
#[derive(Debug, Clone)]
pub struct RangeTree<K: Ord, V: Ord> {
    segments: BTreeMap<K, Segment<V>>,
}

impl<K: Ord + Clone, V: Ord + Clone> Default for RangeTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Ord + Clone> RangeTree<K, V> {
    pub fn new() -> Self {
        Self {
            segments: BTreeMap::new(),
        }
    }

    /// Boundary segments in key order
    pub fn segments(&self) -> &BTreeMap<K, Segment<V>> {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Insert `value` over `[lower, upper]`
    pub fn put(&mut self, lower: K, upper: K, value: V) {
        self.ensure_segment(&lower);
        self.ensure_segment(&upper);

        for (_, segment) in self
            .segments
            .range_mut((Bound::Included(&lower), Bound::Excluded(&upper)))
        {
            segment.set.insert(value.clone());
        }
        if let Some(segment) = self.segments.get_mut(&upper) {
            segment.closing_set.insert(value);
        }
    }

    /// Remove `value` previously inserted over `[lower, upper]`
    pub fn remove(&mut self, lower: &K, upper: &K, value: &V) -> bool {
        let mut removed = false;
        for (_, segment) in self
            .segments
            .range_mut((Bound::Included(lower), Bound::Excluded(upper)))
        {
            removed |= segment.set.remove(value);
        }
        if let Some(segment) = self.segments.get_mut(upper) {
            removed |= segment.closing_set.remove(value);
        }

        self.cleanup(lower);
        self.cleanup(upper);
        removed
    }

    /// Values whose range intersects `[low, high]`
    pub fn get_range(&self, low: &K, high: &K) -> BTreeSet<V> {
        let mut result = BTreeSet::new();
        if low > high {
            return result;
        }

        if let Some((_, segment)) = self.segments.range(..low).next_back() {
            result.extend(segment.set.iter().cloned());
        }
        for (_, segment) in self.segments.range(low..=high) {
            result.extend(segment.values().cloned());
        }
        result
    }

    fn ensure_segment(&mut self, key: &K) {
        if self.segments.contains_key(key) {
            return;
        }
        let inherited = self
            .segments
            .range(..key)
            .next_back()
            .map(|(_, prev)| prev.set.clone())
            .unwrap_or_default();
        self.segments.insert(key.clone(), Segment::open(inherited));
    }

    /// Drop a boundary that no longer separates anything
    fn cleanup(&mut self, key: &K) {
        let redundant = match self.segments.get(key) {
            Some(segment) if segment.closing_set.is_empty() => {
                match self.segments.range(..key).next_back() {
                    Some((_, prev)) => prev.set == segment.set,
                    None => segment.set.is_empty(),
                }
            }
            _ => false,
        };
        if redundant {
            self.segments.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(ranges: &[(i32, i32, u64)]) -> RangeTree<i32, u64> {
        let mut tree = RangeTree::new();
        for &(lo, hi, v) in ranges {
            tree.put(lo, hi, v);
        }
        tree
    }

    fn ids(set: BTreeSet<u64>) -> Vec<u64> {
        set.into_iter().collect()
    }

    #[test]
    fn test_range_tree_get_range() {
        let t = tree(&[(1, 5, 1), (3, 8, 2), (10, 12, 3)]);

        assert_eq!(ids(t.get_range(&0, &0)), Vec::<u64>::new());
        assert_eq!(ids(t.get_range(&2, &2)), vec![1]);
        assert_eq!(ids(t.get_range(&4, &4)), vec![1, 2]);
        assert_eq!(ids(t.get_range(&5, &5)), vec![1, 2]);
        assert_eq!(ids(t.get_range(&6, &9)), vec![2]);
        assert_eq!(ids(t.get_range(&9, &9)), Vec::<u64>::new());
        assert_eq!(ids(t.get_range(&0, &100)), vec![1, 2, 3]);
    }

    #[test]
    fn test_range_tree_overlaps() {
        let t = tree(&[(1, 5, 1), (3, 8, 2), (4, 4, 3)]);
        let overlaps: Vec<(i32, usize)> = t.segments().iter().map(|(k, s)| (*k, s.overlaps())).collect();
        assert_eq!(overlaps, vec![(1, 1), (3, 2), (4, 3), (5, 2), (8, 1)]);
    }

    #[test]
    fn test_range_tree_point_range() {
        let t = tree(&[(7, 7, 1)]);
        assert_eq!(ids(t.get_range(&7, &7)), vec![1]);
        assert_eq!(ids(t.get_range(&8, &9)), Vec::<u64>::new());
        assert_eq!(t.segments()[&7].closing_set().len(), 1);
    }

    #[test]
    fn test_range_tree_remove() {
        let mut t = tree(&[(1, 5, 1), (3, 8, 2)]);
        assert!(t.remove(&3, &8, &2));
        assert_eq!(ids(t.get_range(&0, &100)), vec![1]);
        assert_eq!(t.segments().keys().copied().collect::<Vec<_>>(), vec![1, 5]);

        assert!(t.remove(&1, &5, &1));
        assert!(t.is_empty());
        assert!(!t.remove(&1, &5, &1));
    }
}
