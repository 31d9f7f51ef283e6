//! In-memory chunk storage
//!
//! Closed chunks wait in a pending area until `finish` promotes them, which
//! mirrors the temporary-then-rename protocol of the filesystem storage.
//! Faults can be injected per operation for tests.

use super::codec::check_layout;
use super::{ChunkStorage, Writers};
use crate::chunk::ChunkId;
use crate::config;
use crate::schema::RecordSchema;
use crate::stream::{RecordSink, RecordStream, SinkEvent};
use crate::types::Record;
use crate::{AggregationError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Inner {
    pending: HashMap<ChunkId, Arc<Vec<Record>>>,
    committed: HashMap<ChunkId, Arc<Vec<Record>>>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    create_id: bool,
    write: bool,
    finish: bool,
    reads: HashSet<ChunkId>,
}

/// Chunk storage kept in process memory
pub struct MemoryChunkStorage {
    next_id: AtomicU64,
    inner: Arc<Mutex<Inner>>,
    writers: Writers,
}

impl Default for MemoryChunkStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChunkStorage {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Arc::new(Mutex::new(Inner::default())),
            writers: Writers::default(),
        }
    }

    /// Make `create_id` fail
    pub fn fail_create_id(&self, fail: bool) {
        self.inner.lock().faults.create_id = fail;
    }

    /// Make `write` fail
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().faults.write = fail;
    }

    /// Make `finish` fail
    pub fn fail_finish(&self, fail: bool) {
        self.inner.lock().faults.finish = fail;
    }

    /// Make reads of one chunk fail
    pub fn fail_read(&self, id: ChunkId) {
        self.inner.lock().faults.reads.insert(id);
    }

    /// Ids of committed chunks, ascending
    pub fn committed_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.inner.lock().committed.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of closed chunks still waiting for `finish`, ascending
    pub fn pending_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.inner.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Records of a committed chunk
    pub fn records(&self, id: ChunkId) -> Option<Vec<Record>> {
        self.inner.lock().committed.get(&id).map(|r| r.as_ref().clone())
    }
}

impl ChunkStorage for MemoryChunkStorage {
    async fn create_id(&self) -> Result<ChunkId> {
        if self.inner.lock().faults.create_id {
            return Err(AggregationError::Storage("id allocation failed".into()));
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn read(&self, schema: Arc<RecordSchema>, id: ChunkId) -> Result<RecordStream> {
        let records = {
            let inner = self.inner.lock();
            if inner.faults.reads.contains(&id) {
                return Err(AggregationError::Storage(format!("cannot read chunk {}", id)));
            }
            inner
                .committed
                .get(&id)
                .cloned()
                .ok_or(AggregationError::ChunkNotFound(id))?
        };
        for record in records.iter() {
            check_layout(&schema, record)?;
        }
        Ok(RecordStream::from_vec(records.as_ref().clone()))
    }

    async fn write(&self, schema: Arc<RecordSchema>, id: ChunkId) -> Result<RecordSink> {
        {
            let inner = self.inner.lock();
            if inner.faults.write {
                return Err(AggregationError::Storage(format!("cannot write chunk {}", id)));
            }
            if inner.pending.contains_key(&id) || inner.committed.contains_key(&id) {
                return Err(AggregationError::Storage(format!("chunk {} already written", id)));
            }
        }

        let (sink, mut receiver) = RecordSink::channel(config::DEFAULT_REDUCER_BUFFER_SIZE);
        let inner = Arc::clone(&self.inner);
        self.writers.spawn(id, async move {
            let mut records = Vec::new();
            loop {
                match receiver.recv().await {
                    SinkEvent::Record(record) => {
                        if let Err(e) = check_layout(&schema, &record) {
                            receiver.finish(Err(e));
                            return;
                        }
                        records.push(record);
                    }
                    SinkEvent::Closed => {
                        debug!(chunk = id, records = records.len(), "Chunk closed");
                        inner.lock().pending.insert(id, Arc::new(records));
                        if !receiver.finish(Ok(())) {
                            debug!(chunk = id, "Chunk close unobserved, discarding");
                            inner.lock().pending.remove(&id);
                        }
                        return;
                    }
                    SinkEvent::Aborted => {
                        debug!(chunk = id, "Chunk write aborted");
                        return;
                    }
                }
            }
        });
        Ok(sink)
    }

    async fn finish(&self, ids: &[ChunkId]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.faults.finish {
            return Err(AggregationError::Storage("finish failed".into()));
        }
        if let Some(missing) = ids.iter().find(|id| !inner.pending.contains_key(id)) {
            return Err(AggregationError::ChunkNotFound(*missing));
        }
        for id in ids {
            if let Some(records) = inner.pending.remove(id) {
                inner.committed.insert(*id, records);
            }
        }
        Ok(())
    }

    async fn abandon(&self, ids: &[ChunkId]) -> Result<()> {
        self.writers.settle(ids).await;
        let mut inner = self.inner.lock();
        for id in ids {
            if inner.pending.remove(id).is_some() {
                debug!(chunk = id, "Chunk abandoned");
            }
        }
        Ok(())
    }
}
