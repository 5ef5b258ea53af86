//! Aggregation store client.
//!
//! [`AggregationSource`] is the contract the service queries through;
//! [`SqliteSource`] runs it against the rollup [`Store`].

use crate::db::{AggregatedRow, Store, StoreError};
use crate::query::MetricQuery;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Backing store failures. Never retried here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("store query timed out after {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Backend(String),
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl From<StoreError> for RetrievalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Malformed(msg) => RetrievalError::Malformed(msg),
            other => RetrievalError::Backend(other.to_string()),
        }
    }
}

/// Executes pre-aggregated range queries.
///
/// Implementations return rows ordered by period ascending and must only
/// apply whitelisted filters.
#[async_trait]
pub trait AggregationSource: Send + Sync {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<AggregatedRow>, RetrievalError>;
}

/// [`AggregationSource`] backed by the SQLite rollup store.
#[derive(Clone)]
pub struct SqliteSource {
    store: Store,
}

impl SqliteSource {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AggregationSource for SqliteSource {
    async fn query(&self, query: &MetricQuery) -> Result<Vec<AggregatedRow>, RetrievalError> {
        let store = self.store.clone();
        let query = query.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(abandoned.clone());

        // rusqlite blocks; if the caller goes away while the closure still
        // waits for the connection, the query is skipped.
        tokio::task::spawn_blocking(move || {
            let filters = query.whitelisted_filters();
            store.query_rollups(
                query.metric_type(),
                query.start_date(),
                query.end_date(),
                query.granularity(),
                &filters,
                &abandoned,
            )
        })
        .await
        .map_err(|e| RetrievalError::Backend(format!("query task failed: {}", e)))?
        .map_err(RetrievalError::from)
    }
}

/// Flags the blocking query as abandoned when the awaiting future is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}
