//! Query and result types shared by the planner, the store and the service.

pub mod planner;

pub use planner::*;

use crate::config::is_valid_metric_type;
use crate::db::AggregatedRow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

/// Reason a query was rejected before any I/O happened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidQuery(pub String);

/// Time bucket size for aggregated rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
        }
    }

    /// Width of one bucket in seconds.
    pub fn bucket_seconds(&self) -> i64 {
        match self {
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
            Granularity::Week => 604_800,
        }
    }

    /// Offset of bucket boundaries from the unix epoch. Weeks start on
    /// Monday and 1970-01-05 is the first Monday after the epoch.
    pub fn bucket_offset(&self) -> i64 {
        match self {
            Granularity::Week => 4 * 86_400,
            _ => 0,
        }
    }

    /// Truncate a timestamp to the start of its containing bucket.
    pub fn truncate(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let ts = dt.timestamp();
        let width = self.bucket_seconds();
        let shifted = ts - self.bucket_offset();
        let truncated = shifted - shifted.rem_euclid(width) + self.bucket_offset();
        DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = InvalidQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            other => Err(InvalidQuery(format!("unknown granularity: {}", other))),
        }
    }
}

/// Filter fields accepted by the aggregation store. Anything else a caller
/// sends is dropped before it reaches a cache key or a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterField {
    EventType,
    TenantId,
    UserId,
}

impl FilterField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "event_type" => Some(FilterField::EventType),
            "tenant_id" => Some(FilterField::TenantId),
            "user_id" => Some(FilterField::UserId),
            _ => None,
        }
    }

    /// Field name as callers spell it; also the rollup table column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::EventType => "event_type",
            FilterField::TenantId => "tenant_id",
            FilterField::UserId => "user_id",
        }
    }
}

/// Wire shape of a query, validated into a [`MetricQuery`].
#[derive(Debug, Deserialize)]
struct RawMetricQuery {
    metric_type: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    granularity: Granularity,
    #[serde(default)]
    filters: BTreeMap<String, String>,
}

impl TryFrom<RawMetricQuery> for MetricQuery {
    type Error = InvalidQuery;

    fn try_from(raw: RawMetricQuery) -> Result<Self, Self::Error> {
        MetricQuery::new(
            raw.metric_type,
            raw.start_date,
            raw.end_date,
            raw.granularity,
            raw.filters,
        )
    }
}

/// An analytical time-range query. Fields are private so a constructed
/// query always satisfies `start_date < end_date`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMetricQuery")]
pub struct MetricQuery {
    metric_type: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    granularity: Granularity,
    filters: BTreeMap<String, String>,
}

impl MetricQuery {
    pub fn new(
        metric_type: impl Into<String>,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        granularity: Granularity,
        filters: BTreeMap<String, String>,
    ) -> Result<Self, InvalidQuery> {
        let metric_type = metric_type.into();
        if !is_valid_metric_type(&metric_type) {
            return Err(InvalidQuery(format!(
                "malformed metric type: {:?}",
                metric_type
            )));
        }
        if start_date >= end_date {
            return Err(InvalidQuery(format!(
                "start_date {} must be before end_date {}",
                start_date, end_date
            )));
        }
        Ok(Self {
            metric_type,
            start_date,
            end_date,
            granularity,
            filters,
        })
    }

    /// Add a filter, returning the new query.
    #[cfg(test)]
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    pub fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Whitelisted filters in field-name order.
    pub fn whitelisted_filters(&self) -> Vec<(FilterField, &str)> {
        self.filters
            .iter()
            .filter_map(|(name, value)| match FilterField::from_name(name) {
                Some(field) => Some((field, value.as_str())),
                None => {
                    tracing::debug!("Query: dropping unlisted filter field {:?}", name);
                    None
                }
            })
            .collect()
    }
}

/// Outcome of one metric query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub data: Vec<AggregatedRow>,
    pub cached: bool,
    pub query_time_ms: f64,
    /// Last rollup refresh; only set when the data came from the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_freshness: Option<DateTime<Utc>>,
    /// Set on the placeholder result of a failed batch slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricResult {
    pub fn from_cache(data: Vec<AggregatedRow>, started: Instant) -> Self {
        Self {
            data,
            cached: true,
            query_time_ms: elapsed_ms(started),
            data_freshness: None,
            error: None,
        }
    }

    pub fn from_store(
        data: Vec<AggregatedRow>,
        started: Instant,
        freshness: DateTime<Utc>,
    ) -> Self {
        Self {
            data,
            cached: false,
            query_time_ms: elapsed_ms(started),
            data_freshness: Some(freshness),
            error: None,
        }
    }

    /// Empty placeholder for a query that failed inside a batch.
    pub fn failed(query_time_ms: f64, error: impl fmt::Display) -> Self {
        Self {
            data: Vec::new(),
            cached: false,
            query_time_ms,
            data_freshness: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Parse a JSON array of queries, validating each element on its own.
///
/// Only input that is not an array fails outright; a bad element becomes an
/// [`InvalidQuery`] in its own slot.
pub fn parse_query_batch(input: &str) -> Result<Vec<Result<MetricQuery, InvalidQuery>>, serde_json::Error> {
    let elements: Vec<serde_json::Value> = serde_json::from_str(input)?;
    Ok(elements
        .into_iter()
        .map(|element| serde_json::from_value(element).map_err(|e| InvalidQuery(e.to_string())))
        .collect())
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
