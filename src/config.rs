//! Configuration module for the tiered metrics service.
//!
//! Loads configuration from environment variables with sensible defaults.

use regex::Regex;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the SQLite rollup database (default: "tiered_metrics.db")
    pub db_path: String,
    /// Queries starting less than this many hours ago are HOT (default: 24)
    pub hot_window_hours: i64,
    /// Queries starting less than this many days ago are WARM (default: 7)
    pub warm_window_days: i64,
    /// Cache TTL for HOT results in seconds (default: 300)
    pub hot_ttl_secs: u64,
    /// Cache TTL for WARM results in seconds (default: 600)
    pub warm_ttl_secs: u64,
    /// Upper bound of the random TTL extension, in percent (default: 0)
    pub ttl_jitter_pct: u32,
    /// Maximum simultaneous store queries across the service (default: 100)
    pub max_concurrent_queries: usize,
    /// How long a query may wait for a store permit (default: 2000ms)
    pub permit_timeout_ms: u64,
    /// Upper bound on a single store query (default: 5000ms)
    pub store_timeout_ms: u64,
    /// Upper bound on a single cache round trip (default: 50ms)
    pub cache_timeout_ms: u64,
    /// Maximum number of entries held by the in-process cache (default: 10000)
    pub cache_capacity: u64,
    /// Metric types with a pre-aggregated source
    pub metric_types: Vec<String>,
    /// Name under which the rollup refresh time is recorded (default: "metrics")
    pub freshness_source: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: "tiered_metrics.db".to_string(),
            hot_window_hours: 24,
            warm_window_days: 7,
            hot_ttl_secs: 300,
            warm_ttl_secs: 600,
            ttl_jitter_pct: 0,
            max_concurrent_queries: 100,
            permit_timeout_ms: 2000,
            store_timeout_ms: 5000,
            cache_timeout_ms: 50,
            cache_capacity: 10_000,
            metric_types: ["active_users", "page_views", "sessions", "events"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            freshness_source: "metrics".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field has a `TIERED_METRICS_*` variable (for example
    /// `TIERED_METRICS_HOT_TTL_SECS`). Values that fail to parse are ignored
    /// and the default is kept. `TIERED_METRICS_METRIC_TYPES` is a comma
    /// separated list.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("TIERED_METRICS_DB_PATH") {
            cfg.db_path = db_path;
        }

        override_parsed("TIERED_METRICS_HOT_WINDOW_HOURS", &mut cfg.hot_window_hours);
        override_parsed("TIERED_METRICS_WARM_WINDOW_DAYS", &mut cfg.warm_window_days);
        override_parsed("TIERED_METRICS_HOT_TTL_SECS", &mut cfg.hot_ttl_secs);
        override_parsed("TIERED_METRICS_WARM_TTL_SECS", &mut cfg.warm_ttl_secs);
        override_parsed("TIERED_METRICS_TTL_JITTER_PCT", &mut cfg.ttl_jitter_pct);
        override_parsed(
            "TIERED_METRICS_MAX_CONCURRENT_QUERIES",
            &mut cfg.max_concurrent_queries,
        );
        override_parsed("TIERED_METRICS_PERMIT_TIMEOUT_MS", &mut cfg.permit_timeout_ms);
        override_parsed("TIERED_METRICS_STORE_TIMEOUT_MS", &mut cfg.store_timeout_ms);
        override_parsed("TIERED_METRICS_CACHE_TIMEOUT_MS", &mut cfg.cache_timeout_ms);
        override_parsed("TIERED_METRICS_CACHE_CAPACITY", &mut cfg.cache_capacity);

        if let Ok(types) = env::var("TIERED_METRICS_METRIC_TYPES") {
            let parsed: Vec<String> = types
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.metric_types = parsed;
            }
        }

        if let Ok(source) = env::var("TIERED_METRICS_FRESHNESS_SOURCE") {
            cfg.freshness_source = source;
        }

        cfg
    }

    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_queries == 0 {
            return Err("max_concurrent_queries must be at least 1".to_string());
        }
        if self.hot_window_hours <= 0 {
            return Err("hot_window_hours must be positive".to_string());
        }
        if chrono::Duration::try_hours(self.hot_window_hours).is_none() {
            return Err(format!("hot_window_hours out of range: {}", self.hot_window_hours));
        }
        if chrono::Duration::try_days(self.warm_window_days).is_none() {
            return Err(format!("warm_window_days out of range: {}", self.warm_window_days));
        }
        let warm_hours = self.warm_window_days.checked_mul(24).unwrap_or(i64::MAX);
        if warm_hours <= self.hot_window_hours {
            return Err(format!(
                "warm window ({}d) must be longer than hot window ({}h)",
                self.warm_window_days, self.hot_window_hours
            ));
        }
        if self.ttl_jitter_pct > 100 {
            return Err("ttl_jitter_pct cannot exceed 100".to_string());
        }
        if self.metric_types.is_empty() {
            return Err("at least one metric type is required".to_string());
        }
        for name in &self.metric_types {
            if !is_valid_metric_type(name) {
                return Err(format!("invalid metric type name: {:?}", name));
            }
        }
        Ok(())
    }

    pub fn hot_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.hot_window_hours)
    }

    pub fn warm_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.warm_window_days)
    }

    pub fn permit_timeout(&self) -> Duration {
        Duration::from_millis(self.permit_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }
}

fn override_parsed<T: FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = env::var(var) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Config: ignoring unparseable {}={:?}", var, raw),
        }
    }
}

/// Metric type names double as identifiers in logs and cache keys, so they
/// are restricted to lowercase snake case.
pub fn is_valid_metric_type(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").unwrap());
    re.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.hot_window_hours, 24);
        assert_eq!(cfg.warm_window_days, 7);
        assert_eq!(cfg.hot_ttl_secs, 300);
        assert_eq!(cfg.warm_ttl_secs, 600);
        assert_eq!(cfg.max_concurrent_queries, 100);
        assert!(cfg.metric_types.iter().any(|m| m == "active_users"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = ServiceConfig::default();
        cfg.max_concurrent_queries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.warm_window_days = 1;
        cfg.hot_window_hours = 48;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.metric_types.push("Robert'); DROP TABLE".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.ttl_jitter_pct = 150;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.warm_window_days = i64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.hot_window_hours = i64::MAX;
        cfg.warm_window_days = i64::MAX / 24;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_metric_type_names() {
        assert!(is_valid_metric_type("active_users"));
        assert!(is_valid_metric_type("p95"));
        assert!(!is_valid_metric_type(""));
        assert!(!is_valid_metric_type("9lives"));
        assert!(!is_valid_metric_type("page-views"));
        assert!(!is_valid_metric_type("mv_metrics;--"));
    }
}
