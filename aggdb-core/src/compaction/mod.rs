//! Background consolidation
//!
//! Consolidation replaces a group of overlapping chunks with fewer,
//! non-overlapping ones. The candidate selection lives in the chunk index
//! and the merge itself in [`Aggregation`]; this module holds the strategy
//! switch, the counters reported to operators and the recurring scheduler.

use crate::aggregation::Aggregation;
use crate::chunk::AggregationDiff;
use crate::storage::ChunkStorage;
use crate::AggregationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Candidate selection policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStrategy {
    /// Lowest overlapping group first, bounded by output size
    #[default]
    MinKey,
    /// Segment with the most overlaps first
    HotSegment,
}

impl fmt::Display for ConsolidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsolidationStrategy::MinKey => write!(f, "min_key"),
            ConsolidationStrategy::HotSegment => write!(f, "hot_segment"),
        }
    }
}

impl FromStr for ConsolidationStrategy {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min_key" => Ok(ConsolidationStrategy::MinKey),
            "hot_segment" => Ok(ConsolidationStrategy::HotSegment),
            other => Err(AggregationError::Config(format!(
                "unknown consolidation strategy: {}",
                other
            ))),
        }
    }
}

/// Consolidation counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    /// Consolidations that produced a diff, no-ops included
    pub completed: u64,
    pub failed: u64,
    pub chunks_added: u64,
    pub chunks_removed: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ConsolidationStats {
    pub(crate) fn record_start(&mut self) {
        self.last_started_at = Some(Utc::now());
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration, diff: &AggregationDiff) {
        self.completed += 1;
        self.chunks_added += diff.added.len() as u64;
        self.chunks_removed += diff.removed.len() as u64;
        self.last_duration_ms = Some(elapsed.as_millis() as u64);
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, elapsed: Duration, error: &AggregationError) {
        self.failed += 1;
        self.last_duration_ms = Some(elapsed.as_millis() as u64);
        self.last_error = Some(error.to_string());
    }
}

/// Runs a consolidation strategy on a fixed period
///
/// Failures are logged and the next tick tries again; a consolidation is
/// never retried within one tick.
pub struct ConsolidationScheduler {
    strategy: ConsolidationStrategy,
    period: Duration,
    shutdown: CancellationToken,
}

impl ConsolidationScheduler {
    pub fn new(strategy: ConsolidationStrategy, period: Duration) -> Self {
        Self {
            strategy,
            period,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the scheduler when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the loop on the current runtime
    pub fn spawn<S: ChunkStorage>(self, aggregation: Arc<Aggregation<S>>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(aggregation).await })
    }

    /// Tick until shut down
    pub async fn run<S: ChunkStorage>(self, aggregation: Arc<Aggregation<S>>) {
        info!(
            strategy = %self.strategy,
            period_ms = self.period.as_millis() as u64,
            "Consolidation scheduler started"
        );
        let mut tick = tokio::time::interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            let consolidation = aggregation.consolidate(self.strategy);
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = consolidation => result,
            };
            match result {
                Ok(diff) if diff.is_empty() => debug!("Nothing to consolidate"),
                Ok(diff) => debug!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "Scheduled consolidation finished"
                ),
                Err(e) if e.is_retryable() => warn!("Scheduled consolidation failed, retrying next tick: {}", e),
                Err(e) => error!("Scheduled consolidation failed: {}", e),
            }
        }
        info!("Consolidation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationConfig;
    use crate::measure;
    use crate::storage::MemoryChunkStorage;
    use crate::structure::AggregationStructure;
    use crate::types::{KeyType, KeyValue, MeasureType, MeasureValue, Record};

    #[test]
    fn test_strategy_names() {
        assert_eq!("min_key".parse::<ConsolidationStrategy>().unwrap(), ConsolidationStrategy::MinKey);
        assert_eq!(
            "hot_segment".parse::<ConsolidationStrategy>().unwrap(),
            ConsolidationStrategy::HotSegment
        );
        assert!("oldest".parse::<ConsolidationStrategy>().unwrap_err().is_config());
        assert_eq!(
            serde_json::to_string(&ConsolidationStrategy::HotSegment).unwrap(),
            "\"hot_segment\""
        );
        assert_eq!(ConsolidationStrategy::MinKey.to_string(), "min_key");
    }

    #[test]
    fn test_stats_bookkeeping() {
        let mut stats = ConsolidationStats::default();
        stats.record_start();
        stats.record_failure(
            Duration::from_millis(5),
            &AggregationError::Storage("disk full".into()),
        );
        assert_eq!(stats.failed, 1);
        assert!(stats.last_error.as_deref().unwrap().contains("disk full"));
        assert!(stats.last_started_at.is_some());

        stats.record_success(Duration::from_millis(7), &AggregationDiff::empty());
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.last_duration_ms, Some(7));
        assert!(stats.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_consolidates_and_stops() {
        let structure = AggregationStructure::new()
            .with_key("day", KeyType::Int)
            .with_measure("clicks", measure::sum(MeasureType::Int));
        let aggregation = Arc::new(
            Aggregation::new(
                structure,
                Arc::new(MemoryChunkStorage::new()),
                AggregationConfig::default(),
            )
            .unwrap(),
        );
        for day in [1, 1] {
            let record = Record::new(vec![KeyValue::Int(day)], vec![MeasureValue::Int(1)]);
            aggregation
                .consume_records(vec![record], &["clicks"])
                .await
                .unwrap();
        }
        assert_eq!(aggregation.number_of_overlapping_chunks(), 2);

        let scheduler = ConsolidationScheduler::new(ConsolidationStrategy::MinKey, Duration::from_secs(60));
        let token = scheduler.shutdown_token();
        let handle = scheduler.spawn(Arc::clone(&aggregation));

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            if aggregation.consolidation_stats().completed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(aggregation.consolidation_stats().completed, 1);
        assert_eq!(aggregation.number_of_overlapping_chunks(), 0);
        assert_eq!(aggregation.state_snapshot().len(), 1);

        token.cancel();
        handle.await.unwrap();
    }
}
