//! Query execution
//!
//! Turns a [`QueryPlan`] into a record stream: each sequence is read chunk
//! by chunk, filtered and projected onto the sequence layout, re-sorted when
//! the query keys are not a prefix of the structure keys, and finally either
//! projected straight to the output or reduced by a [`StreamReducer`].

use super::merge::{project_stream, StreamReducer};
use super::planner::{QueryPlan, Sequence};
use super::sorter::ExternalSorter;
use crate::aggregation::AggregationConfig;
use crate::chunk::ChunkId;
use crate::predicate::{AggregationPredicate, RecordFilter};
use crate::schema::{RecordSchema, SchemaRegistry};
use crate::storage::ChunkStorage;
use crate::stream::{RecordSender, RecordStream};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes query plans against chunk storage
pub struct QueryExecutor<S> {
    storage: Arc<S>,
    registry: Arc<SchemaRegistry>,
    sorter: ExternalSorter,
    capacity: usize,
    ignore_chunk_reading_errors: bool,
}

impl<S: ChunkStorage> QueryExecutor<S> {
    pub fn new(storage: Arc<S>, registry: Arc<SchemaRegistry>, config: &AggregationConfig) -> Self {
        Self {
            storage,
            registry,
            sorter: ExternalSorter::new(
                config.sorter_items_in_memory,
                config.temporary_sort_dir.clone(),
            )
            .with_capacity(config.reducer_buffer_size),
            capacity: config.reducer_buffer_size,
            ignore_chunk_reading_errors: config.ignore_chunk_reading_errors,
        }
    }

    /// Stream the records of `plan` laid out as `keys` + `measures`.
    ///
    /// Layout and predicate errors are returned before any chunk is read.
    pub fn execute(
        &self,
        plan: QueryPlan,
        keys: &[String],
        measures: &[String],
        predicate: &AggregationPredicate,
    ) -> Result<RecordStream> {
        let output = self.registry.get(keys, measures)?;
        let structure_keys = self.registry.structure().keys();
        let full_keys = self.registry.chunk_schema(measures)?;
        let filter = Arc::new(RecordFilter::compile(predicate, &full_keys)?);

        if plan.is_empty() {
            return Ok(RecordStream::empty());
        }

        let needs_sort = !full_keys.is_key_prefix(keys);
        let mut inputs = Vec::with_capacity(plan.sequences().len());
        for sequence in plan.into_sequences() {
            let schema = self.registry.chunk_schema(sequence.fields())?;
            let mut stream = self.sequence_stream(sequence, Arc::clone(&schema), Arc::clone(&filter))?;
            if needs_sort {
                stream = self.sorter.sort(stream, Arc::clone(&schema), keys);
            }
            inputs.push((stream, schema));
        }

        let all_keys = keys.iter().collect::<HashSet<_>>() == structure_keys.iter().collect();
        if inputs.len() == 1 && all_keys {
            if let Some((stream, schema)) = inputs.pop() {
                debug!("Projecting single sequence");
                return Ok(project_stream(stream, schema, output, self.capacity));
            }
        }

        let mut reducer = StreamReducer::new(output);
        for (stream, schema) in inputs {
            reducer.add_input(stream, schema);
        }
        Ok(reducer.into_stream(self.capacity))
    }

    /// Concatenate a sequence's chunks, filtered and laid out as `schema`
    fn sequence_stream(
        &self,
        sequence: Sequence,
        schema: Arc<RecordSchema>,
        filter: Arc<RecordFilter>,
    ) -> Result<RecordStream> {
        let mut chunk_schemas = Vec::with_capacity(sequence.chunks().len());
        for chunk in sequence.chunks() {
            chunk_schemas.push((chunk.id, self.registry.chunk_schema(&chunk.measures)?));
        }

        let (sender, stream) = RecordStream::channel(self.capacity);
        let storage = Arc::clone(&self.storage);
        let ignore_errors = self.ignore_chunk_reading_errors;
        tokio::spawn(async move {
            for (id, chunk_schema) in chunk_schemas {
                let read = read_chunk(
                    storage.as_ref(),
                    id,
                    &chunk_schema,
                    &schema,
                    &filter,
                    &sender,
                )
                .await;
                match read {
                    Ok(true) => {}
                    // Consumer went away
                    Ok(false) => return,
                    Err(e) if ignore_errors => {
                        warn!("Skipping unreadable chunk {}: {}", id, e);
                    }
                    Err(e) => {
                        sender.fail(e).await;
                        return;
                    }
                }
            }
        });
        Ok(stream)
    }
}

/// Forward one chunk; `Ok(false)` when the downstream stream is gone
async fn read_chunk<S: ChunkStorage>(
    storage: &S,
    id: ChunkId,
    chunk_schema: &Arc<RecordSchema>,
    schema: &RecordSchema,
    filter: &RecordFilter,
    sender: &RecordSender,
) -> Result<bool> {
    let mut records = storage.read(Arc::clone(chunk_schema), id).await?;
    while let Some(record) = records.next().await.transpose()? {
        if !filter.matches(&record) {
            continue;
        }
        if sender.send(schema.project(&record, chunk_schema)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}
