//! Freshness tracking for the rollup source.

use crate::db::Store;
use crate::source::RetrievalError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Reports when the pre-aggregated data was last refreshed.
///
/// `Ok(None)` means no refresh has been recorded. The service decides what
/// to report in that case.
#[async_trait]
pub trait FreshnessTracker: Send + Sync {
    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, RetrievalError>;
}

/// Reads the refresh time recorded in the store's `mv_metadata` table.
#[derive(Clone)]
pub struct StoreFreshness {
    store: Store,
    source_name: String,
}

impl StoreFreshness {
    pub fn new(store: Store, source_name: &str) -> Self {
        Self {
            store,
            source_name: source_name.to_string(),
        }
    }
}

#[async_trait]
impl FreshnessTracker for StoreFreshness {
    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, RetrievalError> {
        let store = self.store.clone();
        let name = self.source_name.clone();

        tokio::task::spawn_blocking(move || store.get_last_refresh(&name))
            .await
            .map_err(|e| RetrievalError::Backend(format!("freshness task failed: {}", e)))?
            .map_err(RetrievalError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_store_freshness() {
        let store = Store::open_in_memory().unwrap();
        let tracker = StoreFreshness::new(store.clone(), "metrics");

        assert_eq!(assert_ok!(tracker.last_refresh().await), None);

        let refreshed = Utc.with_ymd_and_hms(2024, 2, 1, 8, 30, 0).unwrap();
        store.set_last_refresh("metrics", refreshed).unwrap();
        store
            .set_last_refresh("other_view", refreshed + chrono::Duration::hours(1))
            .unwrap();

        assert_eq!(assert_ok!(tracker.last_refresh().await), Some(refreshed));
    }
}
