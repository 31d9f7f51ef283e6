//! AggDB Server - HTTP API for the pre-aggregating chunk engine

mod api;
mod index;

use aggdb_core::structure::{KeyDef, MeasureDef, StructureDef};
use aggdb_core::measure::MeasureKind;
use aggdb_core::{
    Aggregation, AggregationConfig, AggregationStructure, ConsolidationScheduler,
    ConsolidationStrategy, KeyType, LocalFsChunkStorage, MeasureType,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
    /// Declared keys and measures
    pub structure: StructureDef,
    pub aggregation: AggregationConfig,
    /// Seconds between scheduled consolidations; zero disables them
    pub consolidation_interval_secs: u64,
    pub consolidation_strategy: ConsolidationStrategy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8086)),
            data_dir: PathBuf::from("data"),
            structure: StructureDef {
                keys: vec![KeyDef {
                    name: "date".to_string(),
                    key_type: KeyType::Int,
                }],
                measures: vec![MeasureDef {
                    name: "events".to_string(),
                    value_type: MeasureType::Int,
                    measure: MeasureKind::Count,
                }],
                partitioning_key: Vec::new(),
            },
            aggregation: AggregationConfig::default(),
            consolidation_interval_secs: 60,
            consolidation_strategy: ConsolidationStrategy::MinKey,
        }
    }
}

impl ServerConfig {
    /// Read the JSON file named by `AGGDB_CONFIG`, or use defaults
    fn load() -> anyhow::Result<Self> {
        match std::env::var_os("AGGDB_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = ServerConfig::load()?;

    info!("Starting AggDB server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    let structure = AggregationStructure::from_def(&config.structure).context("invalid structure")?;
    let storage = LocalFsChunkStorage::open(config.data_dir.join("chunks"))?;
    let abandoned = storage.cleanup_temporary()?;
    if abandoned > 0 {
        info!("Removed {} unfinished chunk files", abandoned);
    }

    let index = index::IndexFile::new(config.data_dir.join("index.json"));
    let aggregation = Arc::new(Aggregation::new(
        structure,
        Arc::new(storage),
        config.aggregation.clone(),
    )?);
    aggregation.load_chunks(index.load().await?)?;

    let scheduler = (config.consolidation_interval_secs > 0).then(|| {
        let scheduler = ConsolidationScheduler::new(
            config.consolidation_strategy,
            Duration::from_secs(config.consolidation_interval_secs),
        );
        let token = scheduler.shutdown_token();
        (token, scheduler.spawn(Arc::clone(&aggregation)))
    });

    let app = api::create_router(api::AppState {
        aggregation: Arc::clone(&aggregation),
        index: index.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("AggDB server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some((token, handle)) = scheduler {
        token.cancel();
        handle.await?;
    }
    index.save_snapshot(&aggregation).await?;
    info!("AggDB server stopped");

    Ok(())
}
