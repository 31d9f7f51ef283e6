//! Chunk writer
//!
//! Cuts a key-sorted record stream into chunks of at most `chunk_size`
//! records that never span a partition. Ids are allocated only when a chunk
//! receives its first record, so no id is spent on an empty chunk. Chunks
//! are closed but not committed; the caller runs `finish` on the ids.
//!
//! [`PendingChunks`] records every chunk a chunker opens until the caller
//! commits them. Chunks still pending when it is abandoned or dropped are
//! discarded from storage.

use crate::chunk::{AggregationChunk, ChunkId};
use crate::schema::RecordSchema;
use crate::storage::ChunkStorage;
use crate::stream::{RecordSink, RecordStream};
use crate::types::{PrimaryKey, Record};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

struct OpenChunk {
    id: ChunkId,
    sink: RecordSink,
    min_key: PrimaryKey,
    max_key: PrimaryKey,
    count: u64,
}

impl OpenChunk {
    async fn write(&mut self, record: Record) -> Result<()> {
        self.max_key = record.key.clone();
        self.count += 1;
        self.sink.write(record).await
    }
}

#[derive(Default)]
struct Tracked {
    ids: Vec<ChunkId>,
    released: bool,
}

/// Shared record of opened, uncommitted chunks
pub struct ChunkTracker<S: ChunkStorage> {
    storage: Arc<S>,
    tracked: Mutex<Tracked>,
}

impl<S: ChunkStorage> ChunkTracker<S> {
    fn register(&self, id: ChunkId) {
        let mut tracked = self.tracked.lock();
        if tracked.released {
            drop(tracked);
            // Opened after its owner gave up on the batch
            discard(Arc::clone(&self.storage), vec![id]);
        } else {
            tracked.ids.push(id);
        }
    }

    fn release(&self) -> Vec<ChunkId> {
        let mut tracked = self.tracked.lock();
        tracked.released = true;
        std::mem::take(&mut tracked.ids)
    }
}

/// Chunks written for one commit
///
/// Dropping it before [`commit`](Self::commit) discards every chunk it
/// tracked, which is what happens when a consume or consolidation future
/// is cancelled.
pub struct PendingChunks<S: ChunkStorage> {
    tracker: Arc<ChunkTracker<S>>,
}

impl<S: ChunkStorage> PendingChunks<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            tracker: Arc::new(ChunkTracker {
                storage,
                tracked: Mutex::new(Tracked::default()),
            }),
        }
    }

    /// Handle for chunkers writing into this batch
    pub fn tracker(&self) -> Arc<ChunkTracker<S>> {
        Arc::clone(&self.tracker)
    }

    /// Ids opened so far, in open order
    pub fn ids(&self) -> Vec<ChunkId> {
        self.tracker.tracked.lock().ids.clone()
    }

    /// Stop tracking once the chunks are committed
    pub fn commit(self) {
        self.tracker.release();
    }

    /// Discard every tracked chunk now
    pub async fn abandon(self) -> Result<()> {
        let ids = self.tracker.release();
        if ids.is_empty() {
            return Ok(());
        }
        debug!("Abandoning chunks {:?}", ids);
        self.tracker.storage.abandon(&ids).await
    }
}

impl<S: ChunkStorage> Drop for PendingChunks<S> {
    fn drop(&mut self) {
        let ids = self.tracker.release();
        if !ids.is_empty() {
            discard(Arc::clone(&self.tracker.storage), ids);
        }
    }
}

/// Abandon chunks from a background task
fn discard<S: ChunkStorage>(storage: Arc<S>, ids: Vec<ChunkId>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = storage.abandon(&ids).await {
                    warn!("Failed to abandon chunks {:?}: {}", ids, e);
                }
            });
        }
        Err(_) => warn!("No runtime to abandon chunks {:?}", ids),
    }
}

/// Splits a sorted stream into chunks
pub struct Chunker<S: ChunkStorage> {
    storage: Arc<S>,
    schema: Arc<RecordSchema>,
    chunk_size: u64,
    partition_len: usize,
    tracker: Option<Arc<ChunkTracker<S>>>,
}

impl<S: ChunkStorage> Chunker<S> {
    /// Write chunks laid out as `schema`, partitioned by the first
    /// `partition_len` keys
    pub fn new(
        storage: Arc<S>,
        schema: Arc<RecordSchema>,
        chunk_size: usize,
        partition_len: usize,
    ) -> Self {
        Self {
            storage,
            schema,
            chunk_size: chunk_size.max(1) as u64,
            partition_len,
            tracker: None,
        }
    }

    /// Register closed chunks with `tracker`
    pub fn with_tracker(mut self, tracker: Arc<ChunkTracker<S>>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Consume `input`, which must be sorted by the full key
    ///
    /// On error the open chunk is abandoned and its sink aborted.
    pub async fn run(self, mut input: RecordStream) -> Result<Vec<AggregationChunk>> {
        let mut chunks = Vec::new();
        let mut open: Option<OpenChunk> = None;

        while let Some(record) = input.next().await.transpose()? {
            if let Some(current) = open.take() {
                if current.max_key.same_prefix(&record.key, self.partition_len) {
                    open = Some(current);
                } else {
                    chunks.push(self.close(current).await?);
                }
            }

            let mut current = match open.take() {
                Some(current) => current,
                None => self.open(record.key.clone()).await?,
            };
            current.write(record).await?;

            if current.count >= self.chunk_size {
                chunks.push(self.close(current).await?);
            } else {
                open = Some(current);
            }
        }

        if let Some(current) = open {
            chunks.push(self.close(current).await?);
        }
        Ok(chunks)
    }

    async fn open(&self, min_key: PrimaryKey) -> Result<OpenChunk> {
        let id = self.storage.create_id().await?;
        let sink = self.storage.write(Arc::clone(&self.schema), id).await?;
        if let Some(tracker) = &self.tracker {
            tracker.register(id);
        }
        Ok(OpenChunk {
            id,
            sink,
            max_key: min_key.clone(),
            min_key,
            count: 0,
        })
    }

    async fn close(&self, chunk: OpenChunk) -> Result<AggregationChunk> {
        chunk.sink.close().await?;
        debug!(
            chunk = chunk.id,
            count = chunk.count,
            "Chunk written {}..{}",
            chunk.min_key,
            chunk.max_key
        );
        Ok(AggregationChunk::new(
            chunk.id,
            self.schema.measures().to_vec(),
            chunk.min_key,
            chunk.max_key,
            chunk.count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure;
    use crate::storage::MemoryChunkStorage;
    use crate::structure::AggregationStructure;
    use crate::types::{KeyType, KeyValue, MeasureType, MeasureValue};
    use crate::AggregationError;

    fn schema() -> Arc<RecordSchema> {
        let structure = AggregationStructure::new()
            .with_key("site", KeyType::String)
            .with_key("day", KeyType::Int)
            .with_measure("clicks", measure::sum(MeasureType::Int));
        Arc::new(RecordSchema::new(&structure, &["site", "day"], &["clicks"]).unwrap())
    }

    fn rec(site: &str, day: i64) -> Record {
        Record::new(
            vec![KeyValue::from(site), KeyValue::Int(day)],
            vec![MeasureValue::Int(day)],
        )
    }

    fn key(site: &str, day: i64) -> PrimaryKey {
        PrimaryKey::new(vec![KeyValue::from(site), KeyValue::Int(day)])
    }

    #[tokio::test]
    async fn test_split_by_chunk_size() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let chunker = Chunker::new(Arc::clone(&storage), schema(), 2, 0);
        let chunks = chunker
            .run(vec![rec("a", 1), rec("a", 2), rec("a", 3)].into())
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].min_key.clone(), chunks[0].max_key.clone()), (key("a", 1), key("a", 2)));
        assert_eq!(chunks[0].count, 2);
        assert_eq!((chunks[1].min_key.clone(), chunks[1].max_key.clone()), (key("a", 3), key("a", 3)));
        assert_eq!(chunks[1].count, 1);
        assert_eq!(chunks[0].measures, vec!["clicks".to_string()]);

        // Closed but not committed
        assert_eq!(storage.pending_ids(), vec![chunks[0].id, chunks[1].id]);
    }

    #[tokio::test]
    async fn test_split_at_partition_boundary() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let chunker = Chunker::new(Arc::clone(&storage), schema(), 100, 1);
        let chunks = chunker
            .run(vec![rec("a", 1), rec("a", 2), rec("b", 1), rec("b", 5)].into())
            .await
            .unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].max_key, key("a", 2));
        assert_eq!(chunks[1].min_key, key("b", 1));
        assert_eq!(chunks[1].count, 2);
    }

    #[tokio::test]
    async fn test_no_id_spent_on_empty_tail() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let chunker = Chunker::new(Arc::clone(&storage), schema(), 2, 0);
        let chunks = chunker
            .run(vec![rec("a", 1), rec("a", 2)].into())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(storage.create_id().await.unwrap(), 2);

        let chunker = Chunker::new(Arc::clone(&storage), schema(), 2, 0);
        assert!(chunker.run(RecordStream::empty()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunk_records_are_sorted() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let input: Vec<Record> = (0..25).map(|d| rec("a", d)).collect();
        let chunks = Chunker::new(Arc::clone(&storage), schema(), 10, 0)
            .run(input.into())
            .await
            .unwrap();
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
        storage.finish(&ids).await.unwrap();

        for chunk in &chunks {
            let records = storage.records(chunk.id).unwrap();
            assert_eq!(records.len() as u64, chunk.count);
            assert!(records.windows(2).all(|w| w[0].key <= w[1].key));
            assert_eq!(records.first().map(|r| &r.key), Some(&chunk.min_key));
            assert_eq!(records.last().map(|r| &r.key), Some(&chunk.max_key));
        }
    }

    #[tokio::test]
    async fn test_storage_failure_aborts() {
        let storage = Arc::new(MemoryChunkStorage::new());
        storage.fail_writes(true);
        let result = Chunker::new(Arc::clone(&storage), schema(), 2, 0)
            .run(vec![rec("a", 1)].into())
            .await;
        assert!(matches!(result, Err(AggregationError::Storage(_))));
        assert!(storage.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn test_pending_chunks_are_discarded_unless_committed() {
        let storage = Arc::new(MemoryChunkStorage::new());
        let input = || -> RecordStream { vec![rec("a", 1), rec("a", 2), rec("a", 3)].into() };

        let pending = PendingChunks::new(Arc::clone(&storage));
        let chunks = Chunker::new(Arc::clone(&storage), schema(), 2, 0)
            .with_tracker(pending.tracker())
            .run(input())
            .await
            .unwrap();
        assert_eq!(pending.ids(), chunks.iter().map(|c| c.id).collect::<Vec<_>>());
        pending.abandon().await.unwrap();
        assert!(storage.pending_ids().is_empty());

        let pending = PendingChunks::new(Arc::clone(&storage));
        let chunks = Chunker::new(Arc::clone(&storage), schema(), 2, 0)
            .with_tracker(pending.tracker())
            .run(input())
            .await
            .unwrap();
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
        storage.finish(&ids).await.unwrap();
        pending.commit();
        assert_eq!(storage.committed_ids(), ids);

        // Dropped without commit
        let pending = PendingChunks::new(Arc::clone(&storage));
        Chunker::new(Arc::clone(&storage), schema(), 2, 0)
            .with_tracker(pending.tracker())
            .run(input())
            .await
            .unwrap();
        assert_eq!(storage.pending_ids().len(), 2);
        drop(pending);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(storage.pending_ids().is_empty());
        assert_eq!(storage.committed_ids(), ids);
    }
}
