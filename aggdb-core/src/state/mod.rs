//! Chunk index
//!
//! `AggregationState` is the registry of live chunks. Next to the chunk map
//! it keeps one [`RangeTree`] per key-prefix length, so a range scan over a
//! key prefix of length `n` is answered by tree `n`, and the full-key tree
//! doubles as the overlap map used to pick consolidation candidates.
//!
//! The state is mutated only through [`AggregationState::apply_diff`], which
//! validates the whole diff before touching anything.

mod range_tree;

pub use range_tree::{RangeTree, Segment};

use crate::chunk::{AggregationChunk, AggregationDiff, ChunkId};
use crate::predicate::{AggregationPredicate, RangeScan};
use crate::structure::AggregationStructure;
use crate::types::PrimaryKey;
use crate::{AggregationError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, info};

/// How a consolidation candidate set was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PickingStrategy {
    /// Chunks spanning more than one partition
    Partitioning,
    /// Segment with the most overlapping chunks
    HotSegment,
    /// First overlapping segment from the lowest key
    MinKey,
    /// Chunks whose size differs from the target chunk size
    SizeFix,
}

impl fmt::Display for PickingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PickingStrategy::Partitioning => "partitioning",
            PickingStrategy::HotSegment => "hot_segment",
            PickingStrategy::MinKey => "min_key",
            PickingStrategy::SizeFix => "size_fix",
        };
        write!(f, "{}", name)
    }
}

/// One boundary of the full-key overlap map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub key: PrimaryKey,
    pub open: Vec<ChunkId>,
    pub closing: Vec<ChunkId>,
    pub overlaps: usize,
}

/// Registry of live chunks
#[derive(Debug, Clone)]
pub struct AggregationState {
    keys: Vec<String>,
    partitioning_key_len: usize,
    chunks: BTreeMap<ChunkId, AggregationChunk>,
    /// Tree `n` indexes chunk key ranges truncated to `n` columns
    prefix_ranges: Vec<RangeTree<PrimaryKey, ChunkId>>,
}

impl AggregationState {
    /// Create an empty index over the given keys
    pub fn new(keys: Vec<String>, partitioning_key_len: usize) -> Self {
        let prefix_ranges = (0..=keys.len()).map(|_| RangeTree::new()).collect();
        Self {
            keys,
            partitioning_key_len,
            chunks: BTreeMap::new(),
            prefix_ranges,
        }
    }

    pub fn from_structure(structure: &AggregationStructure) -> Self {
        Self::new(structure.keys().to_vec(), structure.partitioning_key().len())
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Number of live chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, id: ChunkId) -> Option<&AggregationChunk> {
        self.chunks.get(&id)
    }

    /// Live chunks in id order
    pub fn chunks(&self) -> impl Iterator<Item = &AggregationChunk> {
        self.chunks.values()
    }

    /// Cloned list of live chunks
    pub fn snapshot(&self) -> Vec<AggregationChunk> {
        self.chunks.values().cloned().collect()
    }

    /// Check that a diff applies cleanly
    pub fn validate_diff(&self, diff: &AggregationDiff) -> Result<()> {
        let mut removed = HashSet::new();
        for chunk in &diff.removed {
            match self.chunks.get(&chunk.id) {
                Some(live) if live == chunk => {}
                Some(_) => {
                    return Err(AggregationError::InvalidDiff(format!(
                        "chunk {} differs from the live descriptor",
                        chunk.id
                    )))
                }
                None => {
                    return Err(AggregationError::InvalidDiff(format!(
                        "cannot remove absent chunk {}",
                        chunk.id
                    )))
                }
            }
            if !removed.insert(chunk.id) {
                return Err(AggregationError::InvalidDiff(format!(
                    "chunk {} removed twice",
                    chunk.id
                )));
            }
        }

        let mut added = HashSet::new();
        for chunk in &diff.added {
            if self.chunks.contains_key(&chunk.id) && !removed.contains(&chunk.id) {
                return Err(AggregationError::InvalidDiff(format!(
                    "chunk {} is already present",
                    chunk.id
                )));
            }
            if !added.insert(chunk.id) {
                return Err(AggregationError::InvalidDiff(format!(
                    "chunk {} added twice",
                    chunk.id
                )));
            }
            if chunk.min_key.len() != self.keys.len() || chunk.max_key.len() != self.keys.len() {
                return Err(AggregationError::InvalidDiff(format!(
                    "chunk {} has keys of the wrong arity",
                    chunk.id
                )));
            }
            if chunk.min_key > chunk.max_key {
                return Err(AggregationError::InvalidDiff(format!(
                    "chunk {} has min key above max key",
                    chunk.id
                )));
            }
        }
        Ok(())
    }

    /// Apply a diff: removals first, then additions. Nothing changes on error.
    pub fn apply_diff(&mut self, diff: &AggregationDiff) -> Result<()> {
        self.validate_diff(diff)?;
        for chunk in &diff.removed {
            self.remove_from_index(chunk);
        }
        for chunk in &diff.added {
            self.add_to_index(chunk.clone());
        }
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            live = self.chunks.len(),
            "Applied chunk diff"
        );
        Ok(())
    }

    pub fn add_chunks(&mut self, chunks: impl IntoIterator<Item = AggregationChunk>) -> Result<()> {
        self.apply_diff(&AggregationDiff::added(chunks))
    }

    pub fn remove_chunks(&mut self, chunks: impl IntoIterator<Item = AggregationChunk>) -> Result<()> {
        self.apply_diff(&AggregationDiff::of(std::iter::empty(), chunks))
    }

    fn add_to_index(&mut self, chunk: AggregationChunk) {
        for (size, tree) in self.prefix_ranges.iter_mut().enumerate() {
            tree.put(chunk.min_key.prefix(size), chunk.max_key.prefix(size), chunk.id);
        }
        self.chunks.insert(chunk.id, chunk);
    }

    fn remove_from_index(&mut self, chunk: &AggregationChunk) {
        for (size, tree) in self.prefix_ranges.iter_mut().enumerate() {
            tree.remove(&chunk.min_key.prefix(size), &chunk.max_key.prefix(size), &chunk.id);
        }
        self.chunks.remove(&chunk.id);
    }

    fn resolve<'a>(&self, ids: impl IntoIterator<Item = &'a ChunkId>) -> Vec<AggregationChunk> {
        ids.into_iter()
            .filter_map(|id| self.chunks.get(id).cloned())
            .collect()
    }

    fn full_key_tree(&self) -> &RangeTree<PrimaryKey, ChunkId> {
        &self.prefix_ranges[self.keys.len()]
    }

    /// Chunks that store any requested measure and whose key range is not
    /// provably disjoint from the predicate. Returned in id order.
    pub fn find_chunks<S: AsRef<str>>(
        &self,
        predicate: &AggregationPredicate,
        measures: &[S],
    ) -> Vec<AggregationChunk> {
        let (from, to) = match predicate.to_range_scan(&self.keys[..]) {
            RangeScan::NoScan => return Vec::new(),
            RangeScan::Range { from, to } => (from, to),
        };
        let size = from.len().min(self.keys.len());
        let ids = self.prefix_ranges[size].get_range(&from.prefix(size), &to.prefix(size));

        self.resolve(&ids)
            .into_iter()
            .filter(|chunk| chunk.has_any_measure(measures))
            .collect()
    }

    /// Chunks sharing a full-key boundary with at least one other chunk
    pub fn find_overlapping_chunks(&self) -> Vec<AggregationChunk> {
        let mut ids = BTreeSet::new();
        for segment in self.full_key_tree().segments().values() {
            if segment.overlaps() >= 2 {
                ids.extend(segment.values().copied());
            }
        }
        self.resolve(&ids)
    }

    /// Number of chunks involved in overlaps
    pub fn number_of_overlapping_chunks(&self) -> usize {
        self.find_overlapping_chunks().len()
    }

    /// Chunks of the segment with the most (at least two) overlaps
    pub fn find_chunks_group_with_most_overlaps(&self) -> Vec<AggregationChunk> {
        let ids = most_overlapping_segment(self.full_key_tree());
        self.resolve(&ids)
    }

    /// Candidates for consolidation starting from the lowest key
    pub fn find_chunks_for_consolidation_min_key(
        &self,
        max_chunks: usize,
        optimal_chunk_size: u64,
    ) -> Vec<AggregationChunk> {
        let partitions = match self.group_by_partition() {
            Some(partitions) => partitions,
            None => {
                let picked = self.find_chunks_for_partitioning(max_chunks);
                log_selection(&picked, PickingStrategy::Partitioning);
                return picked;
            }
        };

        for tree in partitions.values() {
            let (strategy, ids) = self.min_key_or_size_fix(tree, max_chunks, optimal_chunk_size);
            if ids.len() >= 2 {
                return self.process_selection(ids, max_chunks, tree, strategy);
            }
        }

        log_selection(&[], PickingStrategy::MinKey);
        Vec::new()
    }

    /// Candidates for consolidation from the most overlapped key region
    pub fn find_chunks_for_consolidation_hot_segment(&self, max_chunks: usize) -> Vec<AggregationChunk> {
        let tree = self.full_key_tree();
        let ids = most_overlapping_segment(tree);
        self.process_selection(ids, max_chunks, tree, PickingStrategy::HotSegment)
    }

    /// Full-key segments with their open and closing chunks
    pub fn consolidation_debug_info(&self) -> Vec<SegmentInfo> {
        self.full_key_tree()
            .segments()
            .iter()
            .map(|(key, segment)| SegmentInfo {
                key: key.clone(),
                open: segment.set().iter().copied().collect(),
                closing: segment.closing_set().iter().copied().collect(),
                overlaps: segment.overlaps(),
            })
            .collect()
    }

    /// Per-partition trees, or `None` when some chunk spans partitions
    fn group_by_partition(&self) -> Option<BTreeMap<PrimaryKey, RangeTree<PrimaryKey, ChunkId>>> {
        let mut partitions: BTreeMap<PrimaryKey, RangeTree<PrimaryKey, ChunkId>> = BTreeMap::new();
        for chunk in self.chunks.values() {
            let min_prefix = chunk.min_key.prefix(self.partitioning_key_len);
            let max_prefix = chunk.max_key.prefix(self.partitioning_key_len);
            if min_prefix != max_prefix {
                return None;
            }
            partitions
                .entry(min_prefix)
                .or_default()
                .put(chunk.min_key.clone(), chunk.max_key.clone(), chunk.id);
        }
        Some(partitions)
    }

    fn find_chunks_for_partitioning(&self, max_chunks: usize) -> Vec<AggregationChunk> {
        let mut all: Vec<&AggregationChunk> = self.chunks.values().collect();
        all.sort_by(|a, b| a.min_key.cmp(&b.min_key).then(a.id.cmp(&b.id)));

        all.into_iter()
            .filter(|chunk| {
                chunk.min_key.prefix(self.partitioning_key_len)
                    != chunk.max_key.prefix(self.partitioning_key_len)
            })
            .take(max_chunks)
            .cloned()
            .collect()
    }

    fn min_key_or_size_fix(
        &self,
        tree: &RangeTree<PrimaryKey, ChunkId>,
        max_chunks: usize,
        optimal_chunk_size: u64,
    ) -> (PickingStrategy, BTreeSet<ChunkId>) {
        let mut tail_from = None;
        for (key, segment) in tree.segments() {
            if segment.overlaps() >= 2 {
                return (PickingStrategy::MinKey, segment.values().copied().collect());
            }
            if segment.overlaps() == 1 {
                let id = segment.values().next().copied();
                let count = id.and_then(|id| self.chunks.get(&id)).map(|c| c.count);
                if count != Some(optimal_chunk_size) {
                    tail_from = Some(key.clone());
                    break;
                }
            }
        }

        let tail_from = match tail_from {
            Some(key) => key,
            None => return (PickingStrategy::SizeFix, BTreeSet::new()),
        };

        let mut ids = BTreeSet::new();
        for (_, segment) in tree.segments().range(tail_from..) {
            if ids.len() >= max_chunks {
                break;
            }
            ids.extend(segment.values().copied());
        }

        if ids.len() == 1 {
            let oversized = ids
                .iter()
                .next()
                .and_then(|id| self.chunks.get(id))
                .is_some_and(|c| c.count > optimal_chunk_size);
            if !oversized {
                ids.clear();
            }
        }
        (PickingStrategy::SizeFix, ids)
    }

    fn process_selection(
        &self,
        ids: BTreeSet<ChunkId>,
        max_chunks: usize,
        tree: &RangeTree<PrimaryKey, ChunkId>,
        strategy: PickingStrategy,
    ) -> Vec<AggregationChunk> {
        let chunks = self.resolve(&ids);
        let picked = if chunks.is_empty() || chunks.len() == max_chunks {
            chunks
        } else if chunks.len() > max_chunks {
            trim_chunks(chunks, max_chunks)
        } else if strategy == PickingStrategy::SizeFix {
            chunks
        } else {
            let expanded = self.resolve(&expand_range(tree, &self.chunks, ids, max_chunks));
            if expanded.len() > max_chunks {
                trim_chunks(expanded, max_chunks)
            } else {
                expanded
            }
        };

        log_selection(&picked, strategy);
        picked
    }
}

fn most_overlapping_segment(tree: &RangeTree<PrimaryKey, ChunkId>) -> BTreeSet<ChunkId> {
    let mut max_overlaps = 2;
    let mut result = BTreeSet::new();
    for segment in tree.segments().values() {
        let overlaps = segment.overlaps();
        if overlaps >= max_overlaps {
            max_overlaps = overlaps;
            result = segment.values().copied().collect();
        }
    }
    result
}

/// Grow a selection to every chunk intersecting its combined key range
fn expand_range(
    tree: &RangeTree<PrimaryKey, ChunkId>,
    chunks: &BTreeMap<ChunkId, AggregationChunk>,
    mut ids: BTreeSet<ChunkId>,
    max_chunks: usize,
) -> BTreeSet<ChunkId> {
    while ids.len() < max_chunks {
        let selected = ids.iter().filter_map(|id| chunks.get(id));
        let (min, max) = match selected.fold(None, |acc: Option<(&PrimaryKey, &PrimaryKey)>, c| match acc {
            None => Some((&c.min_key, &c.max_key)),
            Some((lo, hi)) => Some((lo.min(&c.min_key), hi.max(&c.max_key))),
        }) {
            Some(bounds) => bounds,
            None => break,
        };

        let before = ids.len();
        let in_range = tree.get_range(min, max);
        ids.extend(in_range);
        if ids.len() == before {
            break;
        }
    }
    ids
}

fn trim_chunks(mut chunks: Vec<AggregationChunk>, max_chunks: usize) -> Vec<AggregationChunk> {
    chunks.sort_by(|a, b| a.min_key.cmp(&b.min_key).then(a.id.cmp(&b.id)));
    chunks.truncate(max_chunks);
    chunks
}

fn log_selection(chunks: &[AggregationChunk], strategy: PickingStrategy) {
    let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
    info!(count = ids.len(), ?ids, %strategy, "Chunks for consolidation");
}
