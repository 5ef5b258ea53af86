//! Aggregation service: answers metric queries from the cache tier or the
//! rollup store, bounding store load with a shared concurrency gate.

mod gate;

pub use gate::*;

use crate::cache::{CacheBackend, CacheTier};
use crate::config::ServiceConfig;
use crate::freshness::FreshnessTracker;
use crate::query::{
    build_cache_key, elapsed_ms, CacheStrategy, InvalidQuery, MetricQuery, MetricResult,
    QueryPlanner,
};
use crate::source::{AggregationSource, RetrievalError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One element of a batch: a query, or the reason it was rejected.
pub trait BatchEntry: Sync {
    fn entry(&self) -> Result<&MetricQuery, &InvalidQuery>;
}

impl BatchEntry for MetricQuery {
    fn entry(&self) -> Result<&MetricQuery, &InvalidQuery> {
        Ok(self)
    }
}

impl BatchEntry for Result<MetricQuery, InvalidQuery> {
    fn entry(&self) -> Result<&MetricQuery, &InvalidQuery> {
        self.as_ref()
    }
}

/// Errors surfaced by [`AggregationService::get_metric`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] InvalidQuery),
    #[error("store retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("capacity exceeded: no store permit within {0:?}")]
    CapacityExceeded(Duration),
}

#[derive(Debug, Default)]
struct ServiceStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    store_queries: AtomicU64,
    store_failures: AtomicU64,
    capacity_rejections: AtomicU64,
}

/// Point-in-time copy of the service counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_faults: u64,
    pub store_queries: u64,
    pub store_failures: u64,
    pub capacity_rejections: u64,
    pub store_in_flight: usize,
    pub max_concurrent_queries: usize,
}

/// Orchestrates planner, cache tier, store client and freshness tracker.
pub struct AggregationService {
    planner: QueryPlanner,
    cache: CacheTier,
    source: Arc<dyn AggregationSource>,
    freshness: Arc<dyn FreshnessTracker>,
    gate: ConcurrencyGate,
    metric_types: HashSet<String>,
    hot_ttl: Duration,
    warm_ttl: Duration,
    ttl_jitter_pct: u32,
    store_timeout: Duration,
    stats: ServiceStats,
}

impl AggregationService {
    pub fn new(
        cfg: &ServiceConfig,
        cache: Arc<dyn CacheBackend>,
        source: Arc<dyn AggregationSource>,
        freshness: Arc<dyn FreshnessTracker>,
    ) -> Self {
        Self {
            planner: QueryPlanner::from_config(cfg),
            cache: CacheTier::new(cache, cfg.cache_timeout()),
            source,
            freshness,
            gate: ConcurrencyGate::new(cfg.max_concurrent_queries, cfg.permit_timeout()),
            metric_types: cfg.metric_types.iter().cloned().collect(),
            hot_ttl: Duration::from_secs(cfg.hot_ttl_secs),
            warm_ttl: Duration::from_secs(cfg.warm_ttl_secs),
            ttl_jitter_pct: cfg.ttl_jitter_pct,
            store_timeout: cfg.store_timeout(),
            stats: ServiceStats::default(),
        }
    }

    /// Answer a single query.
    ///
    /// HOT and WARM queries are read through the cache; COLD queries go
    /// straight to the store. Store results for HOT and WARM queries are
    /// written back best-effort. Performs at most one cache read, one store
    /// query and one cache write.
    pub async fn get_metric(&self, query: &MetricQuery) -> Result<MetricResult, AggregationError> {
        let started = Instant::now();

        if !self.metric_types.contains(query.metric_type()) {
            return Err(InvalidQuery(format!("unknown metric type: {}", query.metric_type())).into());
        }

        let strategy = self.planner.classify(query.start_date(), Utc::now());
        let cache_key = strategy.uses_cache().then(|| build_cache_key(query));

        if let Some(key) = &cache_key {
            if let Some(rows) = self.cache.get_rows(key).await {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                let result = MetricResult::from_cache(rows, started);
                tracing::info!(
                    "AggregationService: cache hit for {} ({}) in {:.1}ms",
                    query.metric_type(),
                    strategy.as_str(),
                    result.query_time_ms
                );
                return Ok(result);
            }
            self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let rows = {
            let _permit = self.gate.acquire().await.map_err(|e| {
                self.stats.capacity_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "AggregationService: no store permit for {} ({} in flight)",
                    query.metric_type(),
                    self.gate.in_flight()
                );
                match e {
                    GateError::TimedOut(waited) => AggregationError::CapacityExceeded(waited),
                    GateError::Closed => AggregationError::CapacityExceeded(Duration::ZERO),
                }
            })?;

            self.stats.store_queries.fetch_add(1, Ordering::Relaxed);
            match tokio::time::timeout(self.store_timeout, self.source.query(query)).await {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => return Err(self.store_failed(query, e)),
                Err(_) => return Err(self.store_failed(query, RetrievalError::Timeout(self.store_timeout))),
            }
        };

        let write_back = async {
            if let Some(key) = &cache_key {
                let ttl = self.ttl_for(strategy);
                self.cache.set_rows(key, &rows, ttl).await;
            }
        };
        let ((), freshness) = tokio::join!(write_back, self.data_freshness());

        let result = MetricResult::from_store(rows, started, freshness);
        tracing::info!(
            "AggregationService: cache miss for {} ({}), {} rows in {:.1}ms",
            query.metric_type(),
            strategy.as_str(),
            result.data.len(),
            result.query_time_ms
        );
        Ok(result)
    }

    /// Answer several queries concurrently.
    ///
    /// The output has one result per input, in input order. A query that
    /// fails, or an entry rejected while parsing, yields an empty result
    /// carrying the error instead of failing the batch.
    pub async fn batch_get_metrics<E: BatchEntry>(&self, entries: &[E]) -> Vec<MetricResult> {
        join_all(
            entries
                .iter()
                .enumerate()
                .map(|(index, entry)| self.batch_slot(index, entry.entry())),
        )
        .await
    }

    async fn batch_slot(&self, index: usize, entry: Result<&MetricQuery, &InvalidQuery>) -> MetricResult {
        let started = Instant::now();
        let outcome = match entry {
            Ok(query) => self.get_metric(query).await,
            Err(invalid) => Err(AggregationError::InvalidQuery(invalid.clone())),
        };
        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("AggregationService: batch query {} failed: {}", index, e);
                MetricResult::failed(elapsed_ms(started), &e)
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            cache_faults: self.cache.fault_count(),
            store_queries: self.stats.store_queries.load(Ordering::Relaxed),
            store_failures: self.stats.store_failures.load(Ordering::Relaxed),
            capacity_rejections: self.stats.capacity_rejections.load(Ordering::Relaxed),
            store_in_flight: self.gate.in_flight(),
            max_concurrent_queries: self.gate.capacity(),
        }
    }

    fn store_failed(&self, query: &MetricQuery, err: RetrievalError) -> AggregationError {
        self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            "AggregationService: store query for {} failed: {}",
            query.metric_type(),
            err
        );
        AggregationError::Retrieval(err)
    }

    /// TTL for a cacheable tier, extended by up to `ttl_jitter_pct` percent.
    fn ttl_for(&self, strategy: CacheStrategy) -> Duration {
        let base = match strategy {
            CacheStrategy::Warm => self.warm_ttl,
            _ => self.hot_ttl,
        };
        if self.ttl_jitter_pct == 0 {
            return base;
        }
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let max_extra = (base_ms / 100).saturating_mul(u64::from(self.ttl_jitter_pct));
        base.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra)))
    }

    /// Last rollup refresh, bounded by the store timeout. When it is unknown,
    /// unreadable or slow "now" is reported, with a warning, so a successful
    /// store read still succeeds.
    async fn data_freshness(&self) -> DateTime<Utc> {
        let lookup = tokio::time::timeout(self.store_timeout, self.freshness.last_refresh()).await;
        match lookup.unwrap_or(Err(RetrievalError::Timeout(self.store_timeout))) {
            Ok(Some(at)) => at,
            Ok(None) => {
                tracing::warn!("AggregationService: no rollup refresh recorded, reporting now as freshness");
                Utc::now()
            }
            Err(e) => {
                tracing::warn!("AggregationService: freshness lookup failed, reporting now: {}", e);
                Utc::now()
            }
        }
    }
}
