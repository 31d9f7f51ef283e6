//! Chunk storage on the local filesystem
//!
//! Each chunk is one file in the storage directory. A chunk is written to
//! `<id>.temp` and renamed to `<id>.log` by `finish`, so readers never see
//! a partially written chunk. Files are sequences of codec blocks.

use super::codec::{check_layout, encode_block, BLOCK_RECORDS};
use super::{blocking, stream_blocks, ChunkStorage, Writers};
use crate::chunk::ChunkId;
use crate::schema::RecordSchema;
use crate::stream::{RecordSink, RecordStream, SinkEvent, SinkReceiver};
use crate::types::Record;
use crate::{AggregationError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const CHUNK_EXT: &str = "log";
const TEMP_EXT: &str = "temp";

/// Chunk storage backed by a directory of chunk files
pub struct LocalFsChunkStorage {
    dir: PathBuf,
    next_id: AtomicU64,
    writers: Writers,
}

impl LocalFsChunkStorage {
    /// Open (or create) a storage directory
    ///
    /// Ids continue after the largest id found on disk, temporary files
    /// included, so a restarted writer never reuses an id.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut max_id = 0;
        for (id, _) in Self::scan(&dir)? {
            max_id = max_id.max(id);
        }

        info!("Opened chunk storage at {:?}, next id {}", dir, max_id + 1);
        Ok(Self {
            dir,
            next_id: AtomicU64::new(max_id + 1),
            writers: Writers::default(),
        })
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids of committed chunks, ascending
    pub fn list_chunks(&self) -> Result<Vec<ChunkId>> {
        let mut ids: Vec<ChunkId> = Self::scan(&self.dir)?
            .into_iter()
            .filter(|(_, ext)| ext == CHUNK_EXT)
            .map(|(id, _)| id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Remove temporary files left behind by interrupted writes
    pub fn cleanup_temporary(&self) -> Result<usize> {
        let mut removed = 0;
        for (id, ext) in Self::scan(&self.dir)? {
            if ext == TEMP_EXT {
                fs::remove_file(self.path(id, TEMP_EXT))?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} temporary chunk files", removed);
        }
        Ok(removed)
    }

    fn path(&self, id: ChunkId, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, ext))
    }

    fn scan(dir: &Path) -> Result<Vec<(ChunkId, String)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let parsed = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<ChunkId>().ok())
                .zip(path.extension().and_then(|e| e.to_str()));
            if let Some((id, ext)) = parsed {
                if ext == CHUNK_EXT || ext == TEMP_EXT {
                    files.push((id, ext.to_string()));
                }
            }
        }
        Ok(files)
    }
}

impl ChunkStorage for LocalFsChunkStorage {
    async fn create_id(&self) -> Result<ChunkId> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn read(&self, schema: Arc<RecordSchema>, id: ChunkId) -> Result<RecordStream> {
        let path = self.path(id, CHUNK_EXT);
        let file = blocking(move || match File::open(&path) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AggregationError::ChunkNotFound(id))
            }
            Err(e) => Err(e.into()),
        })
        .await?;

        debug!(chunk = id, "Reading chunk");
        Ok(stream_blocks(file, Some(schema), BLOCK_RECORDS))
    }

    async fn write(&self, schema: Arc<RecordSchema>, id: ChunkId) -> Result<RecordSink> {
        let (sink, receiver) = RecordSink::channel(BLOCK_RECORDS);
        let (opened_tx, opened_rx) = oneshot::channel();
        // The writer task creates the file, so it is cleaned up even when
        // this call is dropped before returning the sink
        self.writers.spawn(
            id,
            write_chunk(
                id,
                schema,
                self.path(id, TEMP_EXT),
                self.path(id, CHUNK_EXT),
                receiver,
                opened_tx,
            ),
        );
        match opened_rx.await {
            Ok(Ok(())) => Ok(sink),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AggregationError::Storage(format!("chunk {} writer stopped", id))),
        }
    }

    async fn finish(&self, ids: &[ChunkId]) -> Result<()> {
        let moves: Vec<(ChunkId, PathBuf, PathBuf)> = ids
            .iter()
            .map(|&id| (id, self.path(id, TEMP_EXT), self.path(id, CHUNK_EXT)))
            .collect();
        let dir = self.dir.clone();
        blocking(move || {
            if let Some((id, _, _)) = moves.iter().find(|(_, temp, _)| !temp.exists()) {
                return Err(AggregationError::ChunkNotFound(*id));
            }
            for (_, temp, committed) in &moves {
                fs::rename(temp, committed)?;
            }
            sync_dir(&dir)
        })
        .await?;
        debug!("Committed chunks {:?}", ids);
        Ok(())
    }

    async fn abandon(&self, ids: &[ChunkId]) -> Result<()> {
        self.writers.settle(ids).await;
        let paths: Vec<PathBuf> = ids.iter().map(|&id| self.path(id, TEMP_EXT)).collect();
        let removed = blocking(move || {
            let mut removed = 0;
            for path in &paths {
                match fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(removed)
        })
        .await?;
        debug!(removed, "Abandoned chunks {:?}", ids);
        Ok(())
    }
}

/// Make renames inside `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Create the temporary file for a chunk and drain its sink into it
///
/// The file is removed unless the producer closed the sink and received
/// the confirmation.
async fn write_chunk(
    id: ChunkId,
    schema: Arc<RecordSchema>,
    temp: PathBuf,
    committed: PathBuf,
    mut receiver: SinkReceiver,
    opened: oneshot::Sender<Result<()>>,
) {
    let path = temp.clone();
    let created = blocking(move || {
        if committed.exists() {
            return Err(AggregationError::Storage(format!("chunk {} already written", id)));
        }
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(BufWriter::new(file))
    })
    .await;
    let file = match created {
        Ok(file) => file,
        Err(e) => {
            if opened.send(Err(e)).is_err() {
                debug!(chunk = id, "Chunk writer abandoned before open");
            }
            return;
        }
    };
    if opened.send(Ok(())).is_err() {
        debug!(chunk = id, "Chunk writer abandoned after open");
    }

    match drain(&schema, file, &mut receiver).await {
        Ok(Some(written)) => {
            if receiver.finish(Ok(())) {
                debug!(chunk = id, records = written, "Chunk file closed");
            } else {
                debug!(chunk = id, "Chunk close unobserved, removing {:?}", temp);
                remove_temp(temp).await;
            }
        }
        Ok(None) => {
            debug!(chunk = id, "Chunk write aborted, removing {:?}", temp);
            remove_temp(temp).await;
        }
        Err(e) => {
            warn!("Failed to write chunk {}: {}", id, e);
            remove_temp(temp).await;
            receiver.finish(Err(e));
        }
    }
}

/// Remove a temporary chunk file; one already gone is fine
async fn remove_temp(path: PathBuf) {
    let target = path.clone();
    let result = blocking(move || match fs::remove_file(&target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    })
    .await;
    if let Err(e) = result {
        warn!("Failed to remove temporary chunk {:?}: {}", path, e);
    }
}

/// Write blocks until the producer closes (record count) or aborts (`None`)
async fn drain(
    schema: &RecordSchema,
    file: BufWriter<File>,
    receiver: &mut SinkReceiver,
) -> Result<Option<usize>> {
    let mut writer = file;
    let mut block: Vec<Record> = Vec::with_capacity(BLOCK_RECORDS);
    let mut written = 0;

    loop {
        let closed = match receiver.recv().await {
            SinkEvent::Record(record) => {
                check_layout(schema, &record)?;
                block.push(record);
                false
            }
            SinkEvent::Closed => true,
            SinkEvent::Aborted => return Ok(None),
        };

        if block.len() >= BLOCK_RECORDS || (closed && !block.is_empty()) {
            let records = std::mem::take(&mut block);
            written += records.len();
            let mut w = writer;
            writer = blocking(move || {
                w.write_all(&encode_block(&records)?)?;
                Ok(w)
            })
            .await?;
        }

        if closed {
            blocking(move || {
                writer.flush()?;
                writer.get_ref().sync_all()?;
                Ok(())
            })
            .await?;
            return Ok(Some(written));
        }
    }
}
