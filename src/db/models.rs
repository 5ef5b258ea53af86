//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pre-aggregated input row, already bucketed by the refresh job.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupRecord {
    pub metric_type: String,
    pub bucket_time: DateTime<Utc>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    pub value: f64,
}

#[cfg(test)]
impl RollupRecord {
    pub fn new(metric_type: &str, bucket_time: DateTime<Utc>, value: f64) -> Self {
        Self {
            metric_type: metric_type.to_string(),
            bucket_time,
            tenant_id: None,
            user_id: None,
            event_type: None,
            value,
        }
    }
}

/// An aggregated row for one period of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub period: DateTime<Utc>,
    pub total: f64,
    pub count: i64,
    pub average: f64,
}
