//! Chunk descriptors and chunk-set diffs

use crate::types::PrimaryKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Storage-assigned chunk handle
pub type ChunkId = u64;

/// Immutable descriptor of one persisted chunk
///
/// Records inside the chunk are sorted ascending by the full key and share
/// the same partition-key prefix. `min_key` and `max_key` are the keys of
/// the first and last record written.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregationChunk {
    /// Chunk id
    pub id: ChunkId,
    /// Measures stored in this chunk
    pub measures: Vec<String>,
    /// First key (inclusive)
    pub min_key: PrimaryKey,
    /// Last key (inclusive)
    pub max_key: PrimaryKey,
    /// Number of records
    pub count: u64,
}

impl AggregationChunk {
    /// Create a new chunk descriptor
    pub fn new(
        id: ChunkId,
        measures: Vec<String>,
        min_key: PrimaryKey,
        max_key: PrimaryKey,
        count: u64,
    ) -> Self {
        Self {
            id,
            measures,
            min_key,
            max_key,
            count,
        }
    }

    /// Check whether the chunk stores a measure
    pub fn has_measure(&self, measure: &str) -> bool {
        self.measures.iter().any(|m| m == measure)
    }

    /// Check whether the chunk stores any of the given measures
    pub fn has_any_measure<S: AsRef<str>>(&self, measures: &[S]) -> bool {
        measures.iter().any(|m| self.has_measure(m.as_ref()))
    }

    /// Check whether two chunks have intersecting key ranges
    pub fn overlaps(&self, other: &AggregationChunk) -> bool {
        self.min_key <= other.max_key && other.min_key <= self.max_key
    }
}

impl fmt::Display for AggregationChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}..{} ({} records, {:?})",
            self.id, self.min_key, self.max_key, self.count, self.measures
        )
    }
}

/// Chunk-set delta produced by ingestion or consolidation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationDiff {
    pub added: BTreeSet<AggregationChunk>,
    pub removed: BTreeSet<AggregationChunk>,
}

impl AggregationDiff {
    /// The identity diff
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(
        added: impl IntoIterator<Item = AggregationChunk>,
        removed: impl IntoIterator<Item = AggregationChunk>,
    ) -> Self {
        Self {
            added: added.into_iter().collect(),
            removed: removed.into_iter().collect(),
        }
    }

    /// Diff that only adds chunks
    pub fn added(chunks: impl IntoIterator<Item = AggregationChunk>) -> Self {
        Self::of(chunks, std::iter::empty())
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Diff that undoes this one
    pub fn inverse(&self) -> Self {
        Self {
            added: self.removed.clone(),
            removed: self.added.clone(),
        }
    }

    /// Apply `next` after `self`.
    ///
    /// A chunk added by `self` and removed by `next` disappears from both sides.
    pub fn concat(&self, next: &AggregationDiff) -> Self {
        let cancelled: HashSet<ChunkId> = self
            .added
            .iter()
            .filter(|c| next.removed.iter().any(|r| r.id == c.id))
            .map(|c| c.id)
            .collect();

        let added = self
            .added
            .iter()
            .chain(next.added.iter())
            .filter(|c| !cancelled.contains(&c.id))
            .cloned()
            .collect();
        let removed = self
            .removed
            .iter()
            .chain(next.removed.iter())
            .filter(|c| !cancelled.contains(&c.id))
            .cloned()
            .collect();

        Self { added, removed }
    }

    /// Ids of added chunks
    pub fn added_ids(&self) -> Vec<ChunkId> {
        self.added.iter().map(|c| c.id).collect()
    }

    /// Ids of removed chunks
    pub fn removed_ids(&self) -> Vec<ChunkId> {
        self.removed.iter().map(|c| c.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: ChunkId, min: i64, max: i64) -> AggregationChunk {
        AggregationChunk::new(
            id,
            vec!["sum".to_string()],
            PrimaryKey::new(vec![min.into()]),
            PrimaryKey::new(vec![max.into()]),
            1,
        )
    }

    #[test]
    fn test_chunk_overlap() {
        assert!(chunk(1, 1, 5).overlaps(&chunk(2, 5, 9)));
        assert!(chunk(1, 1, 5).overlaps(&chunk(2, 2, 3)));
        assert!(!chunk(1, 1, 5).overlaps(&chunk(2, 6, 9)));
        assert!(chunk(1, 1, 1).has_any_measure(&["count", "sum"]));
        assert!(!chunk(1, 1, 1).has_measure("count"));
    }

    #[test]
    fn test_diff_concat_identity() {
        let diff = AggregationDiff::added(vec![chunk(1, 1, 2)]);
        assert_eq!(diff.concat(&AggregationDiff::empty()), diff);
        assert_eq!(AggregationDiff::empty().concat(&diff), diff);
    }

    #[test]
    fn test_diff_concat_cancels() {
        let first = AggregationDiff::added(vec![chunk(1, 1, 2), chunk(2, 3, 4)]);
        let second = AggregationDiff::of(vec![chunk(3, 1, 4)], vec![chunk(1, 1, 2), chunk(2, 3, 4)]);

        let combined = first.concat(&second);
        assert_eq!(combined.added_ids(), vec![3]);
        assert!(combined.removed.is_empty());
    }

    #[test]
    fn test_diff_inverse() {
        let diff = AggregationDiff::of(vec![chunk(3, 1, 4)], vec![chunk(1, 1, 2)]);
        let inverse = diff.inverse();
        assert_eq!(inverse.added_ids(), vec![1]);
        assert_eq!(inverse.removed_ids(), vec![3]);
    }
}
