//! Query planner
//!
//! Splits a set of possibly overlapping chunks into the fewest runs of
//! non-overlapping chunks per measure subset. Each run ([`Sequence`]) can be
//! read by concatenating its chunks; runs are merged afterwards.

use crate::chunk::{AggregationChunk, ChunkId};
use crate::types::PrimaryKey;
use std::collections::BTreeMap;
use std::fmt;

/// Ordered run of non-overlapping chunks sharing a measure subset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    fields: Vec<String>,
    chunks: Vec<AggregationChunk>,
}

impl Sequence {
    fn new(fields: Vec<String>) -> Self {
        Self {
            fields,
            chunks: Vec::new(),
        }
    }

    /// Query measures this sequence supplies, in query order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Chunks in ascending key order
    pub fn chunks(&self) -> &[AggregationChunk] {
        &self.chunks
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.iter().map(|c| c.id).collect()
    }
}

/// Planner output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    sequences: Vec<Sequence>,
}

impl QueryPlan {
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn into_sequences(self) -> Vec<Sequence> {
        self.sequences
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Total number of chunks read by the plan
    pub fn chunk_count(&self) -> usize {
        self.sequences.iter().map(|s| s.chunks.len()).sum()
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryPlan[")?;
        for (i, sequence) in self.sequences.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}: {:?}", sequence.fields, sequence.chunk_ids())?;
        }
        write!(f, "]")
    }
}

/// Build a plan over `chunks` for the requested measures.
///
/// Chunks are visited in ascending `min_key` order. Each chunk extends the
/// open sequence of its measure subset whose end key is the greatest key
/// strictly below the chunk's `min_key`; a chunk whose `min_key` equals a
/// sequence end does not chain onto it. When no sequence qualifies a new
/// one is started.
///
/// # Panics
///
/// Panics if a chunk stores none of `fields`. Chunks must be filtered by
/// measure before planning.
pub fn create_plan<S: AsRef<str>>(mut chunks: Vec<AggregationChunk>, fields: &[S]) -> QueryPlan {
    chunks.sort_by(|a, b| a.min_key.cmp(&b.min_key).then(a.id.cmp(&b.id)));

    let mut sequences: Vec<Sequence> = Vec::new();
    // Per measure subset: sequence end key -> indices of sequences ending there
    let mut open: BTreeMap<Vec<String>, BTreeMap<PrimaryKey, Vec<usize>>> = BTreeMap::new();

    for chunk in chunks {
        let chunk_fields: Vec<String> = fields
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| chunk.has_measure(f))
            .map(str::to_string)
            .collect();
        assert!(
            !chunk_fields.is_empty(),
            "chunk {} supplies none of the requested measures",
            chunk.id
        );

        let ends = open.entry(chunk_fields.clone()).or_default();
        let extend = ends
            .range::<PrimaryKey, _>(..&chunk.min_key)
            .next_back()
            .map(|(end, _)| end.clone());

        let index = match extend {
            Some(end) => {
                let mut index = None;
                if let Some(bucket) = ends.get_mut(&end) {
                    index = bucket.pop();
                    if bucket.is_empty() {
                        ends.remove(&end);
                    }
                }
                index
            }
            None => None,
        };
        let index = index.unwrap_or_else(|| {
            sequences.push(Sequence::new(chunk_fields));
            sequences.len() - 1
        });

        let end = chunk.max_key.clone();
        sequences[index].chunks.push(chunk);
        ends.entry(end).or_default().push(index);
    }

    debug_assert!(sequences
        .iter()
        .all(|s| s.chunks.windows(2).all(|w| w[0].max_key < w[1].min_key)));

    QueryPlan { sequences }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyValue;
    use rand::seq::SliceRandom;
    use std::collections::BTreeSet;

    fn key(v: i64) -> PrimaryKey {
        PrimaryKey::new(vec![KeyValue::Int(v)])
    }

    fn chunk(id: ChunkId, measures: &[&str], min: i64, max: i64) -> AggregationChunk {
        AggregationChunk::new(
            id,
            measures.iter().map(|m| m.to_string()).collect(),
            key(min),
            key(max),
            (max - min + 1) as u64,
        )
    }

    fn ids(plan: &QueryPlan) -> Vec<Vec<ChunkId>> {
        plan.sequences().iter().map(|s| s.chunk_ids()).collect()
    }

    #[test]
    fn test_disjoint_chunks_form_one_sequence() {
        let chunks = vec![
            chunk(3, &["clicks"], 21, 30),
            chunk(1, &["clicks"], 1, 10),
            chunk(2, &["clicks"], 11, 20),
        ];
        let plan = create_plan(chunks, &["clicks"]);
        assert_eq!(ids(&plan), vec![vec![1, 2, 3]]);
        assert_eq!(plan.chunk_count(), 3);
    }

    #[test]
    fn test_overlapping_chunks_split() {
        let chunks = vec![
            chunk(1, &["clicks"], 1, 10),
            chunk(2, &["clicks"], 5, 15),
            chunk(3, &["clicks"], 11, 20),
            chunk(4, &["clicks"], 16, 25),
        ];
        let plan = create_plan(chunks, &["clicks"]);
        assert_eq!(ids(&plan), vec![vec![1, 3], vec![2, 4]]);
    }

    #[test]
    fn test_touching_ranges_do_not_chain() {
        let chunks = vec![chunk(1, &["clicks"], 1, 10), chunk(2, &["clicks"], 10, 20)];
        let plan = create_plan(chunks, &["clicks"]);
        assert_eq!(plan.sequences().len(), 2);
    }

    #[test]
    fn test_sequences_per_measure_subset() {
        let chunks = vec![
            chunk(1, &["clicks", "views"], 1, 10),
            chunk(2, &["clicks"], 11, 20),
            chunk(3, &["clicks", "cost"], 21, 30),
        ];
        let plan = create_plan(chunks, &["clicks", "views"]);
        assert_eq!(ids(&plan), vec![vec![1], vec![2, 3]]);
        assert_eq!(plan.sequences()[0].fields(), ["clicks", "views"]);
        assert_eq!(plan.sequences()[1].fields(), ["clicks"]);
    }

    #[test]
    #[should_panic(expected = "supplies none")]
    fn test_chunk_without_requested_measures_panics() {
        create_plan(vec![chunk(1, &["cost"], 1, 10)], &["clicks"]);
    }

    #[test]
    fn test_plan_properties_on_random_input() {
        let mut rng = rand::thread_rng();
        let mut chunks = Vec::new();
        for id in 1..=60u64 {
            let min = (id as i64 * 7) % 50;
            let max = min + (id as i64 % 9);
            let measures: &[&str] = if id % 3 == 0 { &["a"] } else { &["a", "b"] };
            chunks.push(chunk(id, measures, min, max));
        }

        let reference = create_plan(chunks.clone(), &["a", "b"]);
        chunks.shuffle(&mut rng);
        let plan = create_plan(chunks.clone(), &["a", "b"]);
        assert_eq!(plan, reference);

        let mut seen = BTreeSet::new();
        for sequence in plan.sequences() {
            for pair in sequence.chunks().windows(2) {
                assert!(pair[0].max_key < pair[1].min_key);
            }
            for c in sequence.chunks() {
                assert!(seen.insert(c.id));
            }
        }
        assert_eq!(seen.len(), chunks.len());
    }
}
