//! AggDB Core - Pre-aggregating LSM Chunk Engine
//!
//! Records arrive keyed by a fixed list of dimensions and carry aggregatable
//! measures. They are pre-aggregated in memory, written as immutable sorted
//! chunks and merged back together at query time.
//!
//! # Architecture
//!
//! - **Ingestion buffer** ([`ingest`]): combines records with equal keys and
//!   flushes sorted batches, at most two flushes in flight
//! - **Chunk writer** ([`chunker`]): cuts sorted batches into bounded chunks
//!   that never span a partition
//! - **Chunk index** ([`state`]): range trees over chunk key ranges
//! - **Query engine** ([`query`]): plans non-overlapping chunk sequences and
//!   K-way merges them, combining equal keys
//! - **Consolidation** ([`compaction`]): replaces overlapping chunks with
//!   merged ones
//! - **Facade** ([`Aggregation`]): the only owner of the index and the only
//!   caller of chunk storage

pub mod aggregation;
pub mod chunk;
pub mod chunker;
pub mod compaction;
pub mod ingest;
pub mod measure;
pub mod predicate;
pub mod query;
pub mod schema;
pub mod state;
pub mod storage;
pub mod stream;
pub mod structure;

mod error;
mod types;

pub use aggregation::{Aggregation, AggregationConfig, AggregationStats};
pub use chunk::{AggregationChunk, AggregationDiff, ChunkId};
pub use compaction::{ConsolidationScheduler, ConsolidationStats, ConsolidationStrategy};
pub use error::{AggregationError, Result};
pub use predicate::AggregationPredicate;
pub use query::AggregationQuery;
pub use storage::{ChunkStorage, LocalFsChunkStorage, MemoryChunkStorage};
pub use stream::RecordStream;
pub use structure::AggregationStructure;
pub use types::*;

/// AggDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Records per chunk
    pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

    /// Flushes that may run while ingestion continues
    pub const MAX_OUTSTANDING_FLUSHES: usize = 2;

    /// Capacity of the channels between streaming stages
    pub const DEFAULT_REDUCER_BUFFER_SIZE: usize = 256;

    /// Records the external sorter keeps in memory
    pub const DEFAULT_SORTER_ITEMS_IN_MEMORY: usize = 1_000_000;

    /// Upper bound of chunks per consolidation
    pub const DEFAULT_MAX_CHUNKS_TO_CONSOLIDATE: usize = 1000;
}
