//! Persisted chunk index
//!
//! The live chunk list is written as JSON next to the chunk files. Chunk
//! files are never deleted by the server, so an older index file still
//! describes readable chunks.

use aggdb_core::{Aggregation, AggregationChunk, ChunkStorage};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
    // Saves are serialized so the newest snapshot is the one left on disk
    write: Arc<Mutex<()>>,
}

impl IndexFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write: Arc::new(Mutex::new(())),
        }
    }

    /// Chunks of the last saved index; empty when none was saved
    pub async fn load(&self) -> anyhow::Result<Vec<AggregationChunk>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save the current chunk list of `aggregation`
    pub async fn save_snapshot<S: ChunkStorage>(&self, aggregation: &Aggregation<S>) -> anyhow::Result<()> {
        let _write = self.write.lock().await;
        let chunks = aggregation.state_snapshot();
        self.write_chunks(&chunks).await
    }

    /// Replace the saved index atomically
    async fn write_chunks(&self, chunks: &[AggregationChunk]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(chunks)?;
        let temp = self.path.with_extension("json.temp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(chunks = chunks.len(), "Saved chunk index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggdb_core::measure;
    use aggdb_core::{
        AggregationConfig, AggregationStructure, KeyType, KeyValue, MeasureType, MeasureValue,
        MemoryChunkStorage, Record,
    };

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = IndexFile::new(dir.path().join("index.json"));
        assert!(index.load().await.unwrap().is_empty());

        let structure = AggregationStructure::new()
            .with_key("date", KeyType::Int)
            .with_measure("events", measure::count());
        let aggregation = Aggregation::new(
            structure,
            Arc::new(MemoryChunkStorage::new()),
            AggregationConfig::default(),
        )
        .unwrap();
        let record = Record::new(vec![KeyValue::Int(1)], vec![MeasureValue::Null]);
        aggregation
            .consume_records(vec![record], &["events"])
            .await
            .unwrap();

        index.save_snapshot(&aggregation).await.unwrap();
        assert_eq!(index.load().await.unwrap(), aggregation.state_snapshot());
        assert!(!dir.path().join("index.json.temp").exists());
    }
}
