//! Cache strategy selection and cache key construction.

use super::MetricQuery;
use crate::config::ServiceConfig;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// Caching policy for a query, derived from the age of its start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Recent data: always read through the cache.
    Hot,
    /// Older data: cached on first access with a longer TTL.
    Warm,
    /// Historical data: straight to the store, never cached.
    Cold,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::Hot => "hot",
            CacheStrategy::Warm => "warm",
            CacheStrategy::Cold => "cold",
        }
    }

    pub fn uses_cache(&self) -> bool {
        !matches!(self, CacheStrategy::Cold)
    }
}

/// Classifies queries into cache tiers.
#[derive(Debug, Clone, Copy)]
pub struct QueryPlanner {
    hot_window: ChronoDuration,
    warm_window: ChronoDuration,
}

impl QueryPlanner {
    pub fn new(hot_window: ChronoDuration, warm_window: ChronoDuration) -> Self {
        Self {
            hot_window,
            warm_window,
        }
    }

    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(cfg.hot_window(), cfg.warm_window())
    }

    /// Pick the cache tier for a query starting at `start`.
    ///
    /// `age < hot` is HOT, `hot <= age < warm` is WARM, anything older is
    /// COLD. A start date in the future has negative age and is HOT.
    pub fn classify(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> CacheStrategy {
        let age = now - start;
        if age < self.hot_window {
            CacheStrategy::Hot
        } else if age < self.warm_window {
            CacheStrategy::Warm
        } else {
            CacheStrategy::Cold
        }
    }
}

/// Build the cache key for a query:
/// `metric:{metric_type}:{start}:{end}:{granularity}:{filter_digest}`.
pub fn build_cache_key(query: &MetricQuery) -> String {
    format!(
        "metric:{}:{}:{}:{}:{}",
        query.metric_type(),
        format_key_time(query.start_date()),
        format_key_time(query.end_date()),
        query.granularity().as_str(),
        filter_digest(query),
    )
}

/// First 8 hex chars of the MD5 of the canonical filter JSON, or an empty
/// string when no whitelisted filter is present.
pub fn filter_digest(query: &MetricQuery) -> String {
    match canonical_filters(query) {
        Some(canonical) => {
            let digest = format!("{:x}", md5::compute(canonical.as_bytes()));
            digest[..8].to_string()
        }
        None => String::new(),
    }
}

/// Whitelisted filters rendered as a JSON object with sorted keys and
/// `", "` / `": "` separators, e.g. `{"tenant_id": "acme", "user_id": "42"}`.
pub fn canonical_filters(query: &MetricQuery) -> Option<String> {
    let filters = query.whitelisted_filters();
    if filters.is_empty() {
        return None;
    }

    let entries: Vec<String> = filters
        .iter()
        .map(|(field, value)| {
            format!(
                "{}: {}",
                Value::String(field.as_str().to_string()),
                Value::String(value.to_string())
            )
        })
        .collect();

    Some(format!("{{{}}}", entries.join(", ")))
}

fn format_key_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}
