//! Cache tier for recent query results.
//!
//! The backend is reached through [`CacheBackend`]; the service only ever
//! talks to [`CacheTier`], whose operations cannot fail. A broken or slow
//! cache reads as a miss and writes become no-ops.

mod memory;

pub use memory::*;

use crate::db::AggregatedRow;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Cache transport failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache call timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache value codec error: {0}")]
    Codec(String),
}

/// A keyed byte store with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}

/// Fault-absorbing wrapper around a [`CacheBackend`].
pub struct CacheTier {
    backend: Arc<dyn CacheBackend>,
    timeout: Duration,
    faults: AtomicU64,
}

impl CacheTier {
    pub fn new(backend: Arc<dyn CacheBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            faults: AtomicU64::new(0),
        }
    }

    /// Look up cached rows. Any failure is logged, counted and reported as
    /// a miss.
    pub async fn get_rows(&self, key: &str) -> Option<Vec<AggregatedRow>> {
        let bytes = match tokio::time::timeout(self.timeout, self.backend.get(key)).await {
            Ok(Ok(bytes)) => bytes?,
            Ok(Err(e)) => {
                self.record_fault("read", key, &e);
                return None;
            }
            Err(_) => {
                self.record_fault("read", key, &CacheError::Timeout(self.timeout));
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(rows) => Some(rows),
            Err(e) => {
                self.record_fault("read", key, &CacheError::Codec(e.to_string()));
                None
            }
        }
    }

    /// Store rows with the given TTL. Best effort: returns whether the write
    /// was acknowledged.
    pub async fn set_rows(&self, key: &str, rows: &[AggregatedRow], ttl: Duration) -> bool {
        let bytes = match serde_json::to_vec(rows) {
            Ok(b) => b,
            Err(e) => {
                self.record_fault("write", key, &CacheError::Codec(e.to_string()));
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, self.backend.set(key, bytes, ttl)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.record_fault("write", key, &e);
                false
            }
            Err(_) => {
                self.record_fault("write", key, &CacheError::Timeout(self.timeout));
                false
            }
        }
    }

    /// Number of absorbed cache failures since startup.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    fn record_fault(&self, op: &str, key: &str, err: &CacheError) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("CacheTier: {} failed for {}: {}", op, key, err);
    }
}
