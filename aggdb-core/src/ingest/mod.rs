//! Ingestion buffer
//!
//! [`GroupReducer`] pre-aggregates incoming records by full key in memory.
//! Once `buffer_size` distinct keys are held, the buffer is sorted and
//! handed to a fresh [`Chunker`] on its own task. While more than
//! `max_outstanding_flushes` flushes are running, ingestion waits for one
//! to complete.

use crate::chunk::AggregationChunk;
use crate::chunker::{ChunkTracker, Chunker};
use crate::schema::RecordSchema;
use crate::storage::ChunkStorage;
use crate::stream::RecordStream;
use crate::types::{PrimaryKey, Record};
use crate::{AggregationError, Result};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

/// Buffer and flush settings
#[derive(Debug, Clone, Copy)]
pub struct ReducerSettings {
    /// Distinct keys held before a flush
    pub buffer_size: usize,
    /// Records per chunk
    pub chunk_size: usize,
    /// Leading keys that must not span a chunk
    pub partition_len: usize,
    /// Flushes allowed to run while ingestion continues
    pub max_outstanding_flushes: usize,
}

/// Pre-aggregating buffer in front of the chunk writer
pub struct GroupReducer<S: ChunkStorage> {
    storage: Arc<S>,
    tracker: Option<Arc<ChunkTracker<S>>>,
    schema: Arc<RecordSchema>,
    input: Arc<RecordSchema>,
    settings: ReducerSettings,
    buffer: HashMap<PrimaryKey, Record>,
    flushes: JoinSet<(usize, Result<Vec<AggregationChunk>>)>,
    results: BTreeMap<usize, Vec<AggregationChunk>>,
    next_flush: usize,
}

impl<S: ChunkStorage> GroupReducer<S> {
    /// Accumulate `input`-shaped records into chunks laid out as `schema`
    ///
    /// Both layouts carry every structure key; measures are matched by name.
    pub fn new(
        storage: Arc<S>,
        schema: Arc<RecordSchema>,
        input: Arc<RecordSchema>,
        settings: ReducerSettings,
    ) -> Self {
        Self {
            storage,
            tracker: None,
            schema,
            input,
            settings,
            buffer: HashMap::new(),
            flushes: JoinSet::new(),
            results: BTreeMap::new(),
            next_flush: 0,
        }
    }

    /// Register every chunk the flushes open with `tracker`
    pub fn with_tracker(mut self, tracker: Arc<ChunkTracker<S>>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Number of flushes still running
    pub fn outstanding(&self) -> usize {
        self.flushes.len()
    }

    /// Number of distinct keys buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Add one raw record, flushing when the buffer is full
    pub async fn push(&mut self, raw: Record) -> Result<()> {
        self.input.check_record(&raw)?;
        let raw = if self.input.measures() == self.schema.measures() {
            raw
        } else {
            self.schema.project(&raw, &self.input)
        };

        match self.buffer.entry(raw.key.clone()) {
            Entry::Occupied(mut entry) => self.schema.accumulate(entry.get_mut(), &raw),
            Entry::Vacant(entry) => {
                entry.insert(self.schema.init_accumulator(&raw));
            }
        }

        if self.buffer.len() >= self.settings.buffer_size.max(1) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Drain `input`, then flush and collect every chunk
    pub async fn consume(mut self, mut input: RecordStream) -> Result<Vec<AggregationChunk>> {
        while let Some(record) = input.next().await.transpose()? {
            self.push(record).await?;
        }
        self.finish().await
    }

    /// Flush the remainder and wait for every flush, in flush order
    pub async fn finish(mut self) -> Result<Vec<AggregationChunk>> {
        self.flush().await?;
        while !self.flushes.is_empty() {
            self.join_next().await?;
        }
        Ok(self.results.into_values().flatten().collect())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut records: Vec<Record> = std::mem::take(&mut self.buffer).into_values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));

        let index = self.next_flush;
        self.next_flush += 1;
        debug!(flush = index, records = records.len(), "Flushing buffer");

        let mut chunker = Chunker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.schema),
            self.settings.chunk_size,
            self.settings.partition_len,
        );
        if let Some(tracker) = &self.tracker {
            chunker = chunker.with_tracker(Arc::clone(tracker));
        }
        self.flushes
            .spawn(async move { (index, chunker.run(RecordStream::from_vec(records)).await) });

        while self.flushes.len() > self.settings.max_outstanding_flushes {
            self.join_next().await?;
        }
        Ok(())
    }

    async fn join_next(&mut self) -> Result<()> {
        let outcome = match self.flushes.join_next().await {
            None => return Ok(()),
            Some(Ok((index, Ok(chunks)))) => {
                self.results.insert(index, chunks);
                return Ok(());
            }
            Some(Ok((index, Err(e)))) => {
                debug!(flush = index, "Flush failed: {}", e);
                e
            }
            Some(Err(e)) => AggregationError::Internal(format!("flush task failed: {}", e)),
        };
        self.flushes.abort_all();
        Err(outcome)
    }
}
