//! External sorter
//!
//! Sorts a record stream by a key subset while holding a bounded number of
//! records in memory. Full buffers are sorted and spilled as runs of codec
//! blocks; the runs are then merged back with [`KWayMerge`].

use super::merge::KWayMerge;
use crate::schema::RecordSchema;
use crate::storage::codec::{encode_block, BLOCK_RECORDS};
use crate::storage::{blocking, stream_blocks};
use crate::stream::{RecordSender, RecordStream};
use crate::types::Record;
use crate::{AggregationError, Result};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sorts streams that may not fit in memory
#[derive(Debug, Clone)]
pub struct ExternalSorter {
    items_in_memory: usize,
    dir: Option<PathBuf>,
    capacity: usize,
}

impl ExternalSorter {
    /// Spill after `items_in_memory` records, under `dir` or a fresh temp dir
    pub fn new(items_in_memory: usize, dir: Option<PathBuf>) -> Self {
        Self {
            items_in_memory: items_in_memory.max(1),
            dir,
            capacity: crate::config::DEFAULT_REDUCER_BUFFER_SIZE,
        }
    }

    /// Capacity of the output channel
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sort `input`, laid out as `schema`, by `keys`
    pub fn sort<S: AsRef<str>>(
        &self,
        input: RecordStream,
        schema: Arc<RecordSchema>,
        keys: &[S],
    ) -> RecordStream {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let (sender, stream) = RecordStream::channel(self.capacity);
        let sorter = self.clone();
        tokio::spawn(async move {
            match sorter.run(input, schema, keys, &sender).await {
                Ok(()) | Err(AggregationError::Cancelled(_)) => {}
                Err(e) => sender.fail(e).await,
            }
        });
        stream
    }

    async fn run(
        &self,
        mut input: RecordStream,
        schema: Arc<RecordSchema>,
        keys: Vec<String>,
        sender: &RecordSender,
    ) -> Result<()> {
        let positions = Arc::new(schema.key_positions(&keys[..]));
        let mut runs = SpillRuns::new(self.dir.clone());
        let mut buffer = Vec::new();

        while let Some(record) = input.next().await.transpose()? {
            buffer.push(record);
            if buffer.len() >= self.items_in_memory {
                runs.spill(std::mem::take(&mut buffer), Arc::clone(&positions))
                    .await?;
            }
        }

        if runs.is_empty() {
            let p = Arc::clone(&positions);
            let sorted = blocking(move || {
                sort_records(&mut buffer, &p);
                Ok(buffer)
            })
            .await?;
            for record in sorted {
                sender.send(record).await?;
            }
            return Ok(());
        }

        if !buffer.is_empty() {
            runs.spill(buffer, positions).await?;
        }
        debug!(runs = runs.len(), "Merging sorted runs");

        let mut merge = KWayMerge::new(&keys[..]);
        for path in runs.paths() {
            let path = path.clone();
            let file = blocking(move || Ok(BufReader::new(File::open(&path)?))).await?;
            merge.add_input(stream_blocks(file, None, BLOCK_RECORDS), Arc::clone(&schema));
        }
        while let Some((_, _, record)) = merge.next().await? {
            sender.send(record).await?;
        }
        drop(merge);
        runs.close().await;
        Ok(())
    }
}

fn compare(a: &Record, b: &Record, positions: &[usize]) -> Ordering {
    for &p in positions {
        match a.key.get(p).cmp(&b.key.get(p)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn sort_records(records: &mut [Record], positions: &[usize]) {
    records.sort_by(|a, b| compare(a, b, positions));
}

/// Spilled run files in a private directory, removed with it
struct SpillRuns {
    base: Option<PathBuf>,
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
}

impl SpillRuns {
    fn new(base: Option<PathBuf>) -> Self {
        Self {
            base,
            dir: None,
            files: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn len(&self) -> usize {
        self.files.len()
    }

    fn paths(&self) -> &[PathBuf] {
        &self.files
    }

    async fn run_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.path().to_path_buf());
        }
        let base = self.base.clone();
        let dir = blocking(move || {
            let mut builder = tempfile::Builder::new();
            builder.prefix("aggdb-sort-");
            let dir = match base {
                Some(base) => {
                    fs::create_dir_all(&base)?;
                    builder.tempdir_in(base)?
                }
                None => builder.tempdir()?,
            };
            Ok(dir)
        })
        .await?;
        let path = dir.path().to_path_buf();
        self.dir = Some(dir);
        Ok(path)
    }

    async fn spill(&mut self, mut records: Vec<Record>, positions: Arc<Vec<usize>>) -> Result<()> {
        let dir = self.run_dir().await?;
        let path = dir.join(format!("{}.sort", Uuid::new_v4()));
        self.files.push(path.clone());

        let count = records.len();
        blocking(move || {
            sort_records(&mut records, &positions);
            let mut writer = BufWriter::new(File::create(&path)?);
            for block in records.chunks(BLOCK_RECORDS) {
                writer.write_all(&encode_block(block)?)?;
            }
            writer.flush()?;
            Ok(())
        })
        .await?;
        debug!(records = count, "Spilled sorted run");
        Ok(())
    }

    /// Remove the run directory, logging failures
    async fn close(mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        if let Err(e) = blocking(move || Ok(dir.close()?)).await {
            warn!("Failed to remove sort directory {:?}: {}", path, e);
        }
    }
}
