//! Chunk storage
//!
//! The engine never touches chunk bytes directly. It allocates ids, opens
//! record sinks for new chunks, commits them with `finish` and later reads
//! them back as record streams, all through [`ChunkStorage`]. A chunk only
//! becomes readable once `finish` has succeeded for it; chunks that will not
//! be committed are handed back with `abandon`.

pub mod codec;
mod local_fs;
mod memory;

pub use local_fs::LocalFsChunkStorage;
pub use memory::MemoryChunkStorage;

use crate::chunk::ChunkId;
use crate::schema::RecordSchema;
use crate::stream::{RecordSink, RecordStream};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Durable chunk byte storage and id generator
pub trait ChunkStorage: Send + Sync + 'static {
    /// Allocate an id unique for the lifetime of the aggregation
    fn create_id(&self) -> impl Future<Output = Result<ChunkId>> + Send;

    /// Read a committed chunk laid out as `schema`
    fn read(
        &self,
        schema: Arc<RecordSchema>,
        id: ChunkId,
    ) -> impl Future<Output = Result<RecordStream>> + Send;

    /// Open a sink for a new chunk; the chunk stays invisible until `finish`
    fn write(
        &self,
        schema: Arc<RecordSchema>,
        id: ChunkId,
    ) -> impl Future<Output = Result<RecordSink>> + Send;

    /// Durably commit a batch of closed chunks
    fn finish(&self, ids: &[ChunkId]) -> impl Future<Output = Result<()>> + Send;

    /// Discard written chunks that will never be committed
    ///
    /// Waits for in-flight writes of these chunks to stop first. Ids that
    /// are unknown or already discarded are ignored.
    fn abandon(&self, ids: &[ChunkId]) -> impl Future<Output = Result<()>> + Send;
}

/// Chunk writer tasks still running, by chunk id
#[derive(Clone, Default)]
pub(crate) struct Writers(Arc<Mutex<HashMap<ChunkId, JoinHandle<()>>>>);

impl Writers {
    /// Run the writer of chunk `id` on its own task
    pub(crate) fn spawn<F>(&self, id: ChunkId, writer: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let writers = self.clone();
        let mut running = self.0.lock();
        let handle = tokio::spawn(async move {
            writer.await;
            writers.0.lock().remove(&id);
        });
        running.insert(id, handle);
    }

    /// Wait until the writers of `ids` have stopped
    pub(crate) async fn settle(&self, ids: &[ChunkId]) {
        let handles: Vec<(ChunkId, JoinHandle<()>)> = {
            let mut running = self.0.lock();
            ids.iter()
                .filter_map(|id| running.remove(id).map(|handle| (*id, handle)))
                .collect()
        };
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(chunk = id, "Chunk writer failed: {}", e);
            }
        }
    }
}

/// Run blocking file work off the async workers
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| crate::AggregationError::Internal(format!("blocking task failed: {}", e)))?
}

/// Stream the records of a block file from a reader task
///
/// With a schema every record is checked against the layout. The task stops
/// when the stream is dropped.
pub(crate) fn stream_blocks(
    file: BufReader<File>,
    schema: Option<Arc<RecordSchema>>,
    capacity: usize,
) -> RecordStream {
    let (sender, stream) = RecordStream::channel(capacity);
    tokio::spawn(async move {
        let mut reader = Some(file);
        while let Some(mut r) = reader.take() {
            let next = blocking(move || {
                let block = codec::read_block(&mut r)?;
                Ok((r, block))
            })
            .await;

            let records = match next {
                Ok((r, Some(records))) => {
                    reader = Some(r);
                    records
                }
                Ok((_, None)) => return,
                Err(e) => {
                    sender.fail(e).await;
                    return;
                }
            };

            for record in records {
                if let Some(schema) = &schema {
                    if let Err(e) = codec::check_layout(schema, &record) {
                        sender.fail(e).await;
                        return;
                    }
                }
                if sender.send(record).await.is_err() {
                    return;
                }
            }
        }
    });
    stream
}
