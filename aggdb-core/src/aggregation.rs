//! Aggregation facade
//!
//! [`Aggregation`] owns the chunk index and is the only component that
//! talks to chunk storage. Ingestion and consolidation build a diff, commit
//! the new chunks with `finish` and only then apply the diff to the index,
//! so a failed or cancelled call never leaves a partial chunk set behind.

use crate::chunk::{AggregationChunk, AggregationDiff, ChunkId};
use crate::chunker::{Chunker, PendingChunks};
use crate::compaction::{ConsolidationStats, ConsolidationStrategy};
use crate::config;
use crate::ingest::{GroupReducer, ReducerSettings};
use crate::predicate::AggregationPredicate;
use crate::query::{create_plan, AggregationQuery, QueryExecutor};
use crate::schema::SchemaRegistry;
use crate::state::{AggregationState, SegmentInfo};
use crate::storage::ChunkStorage;
use crate::stream::RecordStream;
use crate::structure::AggregationStructure;
use crate::types::Record;
use crate::{AggregationError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Aggregation thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Records per chunk
    pub chunk_size: usize,
    /// Distinct keys buffered before a flush; `chunk_size` when unset
    pub buffer_size: Option<usize>,
    /// Flushes that may run while ingestion continues
    pub max_outstanding_flushes: usize,
    /// Capacity of the channels between streaming stages
    pub reducer_buffer_size: usize,
    /// Records the external sorter keeps in memory
    pub sorter_items_in_memory: usize,
    /// Upper bound of chunks per consolidation
    pub max_chunks_to_consolidate: usize,
    /// Skip unreadable chunks at query time instead of failing
    pub ignore_chunk_reading_errors: bool,
    /// Directory for sort spill files; a fresh temp dir when unset
    pub temporary_sort_dir: Option<PathBuf>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            chunk_size: config::DEFAULT_CHUNK_SIZE,
            buffer_size: None,
            max_outstanding_flushes: config::MAX_OUTSTANDING_FLUSHES,
            reducer_buffer_size: config::DEFAULT_REDUCER_BUFFER_SIZE,
            sorter_items_in_memory: config::DEFAULT_SORTER_ITEMS_IN_MEMORY,
            max_chunks_to_consolidate: config::DEFAULT_MAX_CHUNKS_TO_CONSOLIDATE,
            ignore_chunk_reading_errors: false,
            temporary_sort_dir: None,
        }
    }
}

impl AggregationConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    pub fn with_max_chunks_to_consolidate(mut self, max: usize) -> Self {
        self.max_chunks_to_consolidate = max;
        self
    }

    pub fn with_sorter_items_in_memory(mut self, items: usize) -> Self {
        self.sorter_items_in_memory = items;
        self
    }

    pub fn with_temporary_sort_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temporary_sort_dir = Some(dir.into());
        self
    }

    pub fn with_ignore_chunk_reading_errors(mut self, ignore: bool) -> Self {
        self.ignore_chunk_reading_errors = ignore;
        self
    }

    /// Effective flush threshold
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(self.chunk_size)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("chunk_size", self.chunk_size),
            ("buffer_size", self.buffer_size()),
            ("reducer_buffer_size", self.reducer_buffer_size),
            ("sorter_items_in_memory", self.sorter_items_in_memory),
            ("max_chunks_to_consolidate", self.max_chunks_to_consolidate),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AggregationError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Snapshot of index and consolidation counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationStats {
    pub chunks: usize,
    pub records: u64,
    pub overlapping_chunks: usize,
    pub consolidation: ConsolidationStats,
}

/// Pre-aggregating chunk store over one structure
pub struct Aggregation<S> {
    structure: Arc<AggregationStructure>,
    registry: Arc<SchemaRegistry>,
    storage: Arc<S>,
    config: AggregationConfig,
    executor: QueryExecutor<S>,
    state: RwLock<AggregationState>,
    stats: Mutex<ConsolidationStats>,
    // One consolidation at a time, so two runs never pick the same chunks
    consolidation: tokio::sync::Mutex<()>,
}

impl<S: ChunkStorage> Aggregation<S> {
    pub fn new(structure: AggregationStructure, storage: Arc<S>, config: AggregationConfig) -> Result<Self> {
        structure.validate()?;
        config.validate()?;

        let structure = Arc::new(structure);
        let registry = Arc::new(SchemaRegistry::new(Arc::clone(&structure)));
        let executor = QueryExecutor::new(Arc::clone(&storage), Arc::clone(&registry), &config);
        let state = AggregationState::from_structure(&structure);

        Ok(Self {
            structure,
            registry,
            storage,
            config,
            executor,
            state: RwLock::new(state),
            stats: Mutex::new(ConsolidationStats::default()),
            consolidation: tokio::sync::Mutex::new(()),
        })
    }

    pub fn structure(&self) -> &Arc<AggregationStructure> {
        &self.structure
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Install chunks recovered at startup
    pub fn load_chunks(&self, chunks: impl IntoIterator<Item = AggregationChunk>) -> Result<()> {
        let mut state = self.state.write();
        state.add_chunks(chunks)?;
        info!(chunks = state.len(), "Loaded chunk index");
        Ok(())
    }

    /// Cloned list of live chunks, in id order
    pub fn state_snapshot(&self) -> Vec<AggregationChunk> {
        self.state.read().snapshot()
    }

    /// Apply an externally built diff
    pub fn apply_diff(&self, diff: &AggregationDiff) -> Result<()> {
        self.state.write().apply_diff(diff)
    }

    /// Ingest records carrying every structure key and `measures`, in order
    ///
    /// Returns the diff of added chunks once they are committed and live.
    pub async fn consume<M: AsRef<str>>(&self, input: RecordStream, measures: &[M]) -> Result<AggregationDiff> {
        self.structure.validate_measures(measures)?;
        let distinct: HashSet<&str> = measures.iter().map(|m| m.as_ref()).collect();
        if distinct.len() != measures.len() {
            return Err(AggregationError::Config("duplicate measure in input".into()));
        }

        let input_schema = self.registry.chunk_schema(measures)?;
        let chunk_schema = self
            .registry
            .chunk_schema(&self.structure.sorted_measures(measures)[..])?;
        info!(keys = ?self.structure.keys(), measures = ?chunk_schema.measures(), "Consuming records");

        let settings = ReducerSettings {
            buffer_size: self.config.buffer_size(),
            chunk_size: self.config.chunk_size,
            partition_len: self.structure.partitioning_key().len(),
            max_outstanding_flushes: self.config.max_outstanding_flushes,
        };
        let pending = PendingChunks::new(Arc::clone(&self.storage));
        let reducer = GroupReducer::new(Arc::clone(&self.storage), chunk_schema, input_schema, settings)
            .with_tracker(pending.tracker());
        let chunks = match reducer.consume(input).await {
            Ok(chunks) => chunks,
            Err(e) => return Err(discard(pending, e).await),
        };

        let diff = self.commit(chunks, Vec::new(), pending).await?;
        info!(added = diff.added.len(), "Consume finished");
        Ok(diff)
    }

    /// Ingest records already in memory
    pub async fn consume_records<M: AsRef<str>>(&self, records: Vec<Record>, measures: &[M]) -> Result<AggregationDiff> {
        self.consume(RecordStream::from_vec(records), measures).await
    }

    /// Stream the query result laid out as query keys then query measures
    ///
    /// Unknown names and ill-typed predicate values fail before any read.
    pub fn query(&self, query: &AggregationQuery) -> Result<RecordStream> {
        query.validate(&self.structure)?;
        let chunks = self
            .state
            .read()
            .find_chunks(&query.predicate, &query.measures[..]);
        let plan = create_plan(chunks, &query.measures[..]);
        info!(
            keys = ?query.keys,
            measures = ?query.measures,
            sequences = plan.sequences().len(),
            chunks = plan.chunk_count(),
            "Query plan: {}",
            plan
        );
        self.executor
            .execute(plan, &query.keys, &query.measures, &query.predicate)
    }

    /// Number of chunks a query would read
    pub fn estimate_cost(&self, query: &AggregationQuery) -> Result<usize> {
        query.validate(&self.structure)?;
        Ok(self
            .state
            .read()
            .find_chunks(&query.predicate, &query.measures[..])
            .len())
    }

    pub fn number_of_overlapping_chunks(&self) -> usize {
        self.state.read().number_of_overlapping_chunks()
    }

    pub fn consolidation_debug_info(&self) -> Vec<SegmentInfo> {
        self.state.read().consolidation_debug_info()
    }

    pub fn consolidation_stats(&self) -> ConsolidationStats {
        self.stats.lock().clone()
    }

    pub fn stats(&self) -> AggregationStats {
        let (chunks, records, overlapping_chunks) = {
            let state = self.state.read();
            (
                state.len(),
                state.chunks().map(|c| c.count).sum::<u64>(),
                state.number_of_overlapping_chunks(),
            )
        };
        AggregationStats {
            chunks,
            records,
            overlapping_chunks,
            consolidation: self.consolidation_stats(),
        }
    }

    /// Consolidate the lowest overlapping group
    pub async fn consolidate_min_key(&self) -> Result<AggregationDiff> {
        self.consolidate(ConsolidationStrategy::MinKey).await
    }

    /// Consolidate the most overlapped key region
    pub async fn consolidate_hot_segment(&self) -> Result<AggregationDiff> {
        self.consolidate(ConsolidationStrategy::HotSegment).await
    }

    /// Pick candidates with `strategy` and replace them with merged chunks
    ///
    /// A failure leaves the index unchanged and is recorded in the stats.
    pub async fn consolidate(&self, strategy: ConsolidationStrategy) -> Result<AggregationDiff> {
        let _running = self.consolidation.lock().await;

        let candidates = {
            let state = self.state.read();
            let max = self.config.max_chunks_to_consolidate;
            match strategy {
                ConsolidationStrategy::MinKey => {
                    state.find_chunks_for_consolidation_min_key(max, self.config.chunk_size as u64)
                }
                ConsolidationStrategy::HotSegment => state.find_chunks_for_consolidation_hot_segment(max),
            }
        };

        self.stats.lock().record_start();
        let started = Instant::now();
        let result = self.consolidate_chunks(candidates).await;
        match &result {
            Ok(diff) => self.stats.lock().record_success(started.elapsed(), diff),
            Err(e) => {
                warn!(%strategy, "Consolidation failed: {}", e);
                self.stats.lock().record_failure(started.elapsed(), e);
            }
        }
        result
    }

    async fn consolidate_chunks(&self, candidates: Vec<AggregationChunk>) -> Result<AggregationDiff> {
        if candidates.is_empty() {
            info!("Nothing to consolidate");
            return Ok(AggregationDiff::empty());
        }

        let present: BTreeSet<&str> = candidates
            .iter()
            .flat_map(|c| c.measures.iter().map(String::as_str))
            .collect();
        let present: Vec<&str> = present.into_iter().collect();
        let measures = self.structure.sorted_measures(&present[..]);
        info!(
            chunks = candidates.len(),
            ids = ?candidates.iter().map(|c| c.id).collect::<Vec<_>>(),
            "Starting consolidation"
        );

        let plan = create_plan(candidates.clone(), &measures[..]);
        let merged = self.executor.execute(
            plan,
            self.structure.keys(),
            &measures,
            &AggregationPredicate::AlwaysTrue,
        )?;
        let schema = self.registry.chunk_schema(&measures[..])?;
        let pending = PendingChunks::new(Arc::clone(&self.storage));
        let chunker = Chunker::new(
            Arc::clone(&self.storage),
            schema,
            self.config.chunk_size,
            self.structure.partitioning_key().len(),
        )
        .with_tracker(pending.tracker());
        let chunks = match chunker.run(merged).await {
            Ok(chunks) => chunks,
            Err(e) => return Err(discard(pending, e).await),
        };

        let diff = self.commit(chunks, candidates, pending).await?;
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Consolidation finished"
        );
        Ok(diff)
    }

    /// Commit written chunks and apply the diff to the index
    ///
    /// The diff is checked before `finish`, so a diff the index would
    /// reject never commits its chunks.
    async fn commit(
        &self,
        added: Vec<AggregationChunk>,
        removed: Vec<AggregationChunk>,
        pending: PendingChunks<S>,
    ) -> Result<AggregationDiff> {
        let diff = AggregationDiff::of(added, removed);
        let checked = self.state.read().validate_diff(&diff);
        if let Err(e) = checked {
            return Err(discard(pending, e).await);
        }

        let ids: Vec<ChunkId> = diff.added_ids();
        if !ids.is_empty() {
            if let Err(e) = self.storage.finish(&ids).await {
                return Err(discard(pending, e).await);
            }
        }
        pending.commit();
        self.state.write().apply_diff(&diff)?;
        Ok(diff)
    }
}

/// Drop uncommitted chunks after `cause` ended the operation
async fn discard<S: ChunkStorage>(pending: PendingChunks<S>, cause: AggregationError) -> AggregationError {
    if let Err(e) = pending.abandon().await {
        warn!("Failed to discard uncommitted chunks: {}", e);
    }
    cause
}
