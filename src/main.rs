//! Tiered metrics - read-path aggregation over pre-aggregated rollups.
//!
//! `tiered-metrics [query] [FILE]` reads a JSON array of metric queries and
//! prints one JSON result per line. `tiered-metrics load [FILE]` ingests a
//! JSON array of rollup records and marks the rollups refreshed. Input is
//! read from stdin when no file is given.

mod cache;
mod config;
mod db;
mod freshness;
mod query;
mod service;
mod source;

use cache::MemoryCache;
use config::ServiceConfig;
use db::{RollupRecord, Store};
use freshness::StoreFreshness;
use service::AggregationService;
use source::SqliteSource;

use chrono::Utc;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Logs go to stderr; stdout carries results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("tiered_metrics=info".parse()?))
        .init();

    let cfg = ServiceConfig::load();
    cfg.validate()?;
    tracing::info!("Using database at {}", cfg.db_path);

    let store = if cfg.db_path == ":memory:" {
        Store::open_in_memory()?
    } else {
        Store::new(&cfg.db_path)?
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, path) = match args.first().map(String::as_str) {
        Some("load") => ("load", args.get(1)),
        Some("query") => ("query", args.get(1)),
        _ => ("query", args.first()),
    };
    let input = read_input(path.map(String::as_str))?;

    if mode == "load" {
        return load_rollups(&store, &cfg, &input);
    }

    let service = AggregationService::new(
        &cfg,
        Arc::new(MemoryCache::new(cfg.cache_capacity)),
        Arc::new(SqliteSource::new(store.clone())),
        Arc::new(StoreFreshness::new(store, &cfg.freshness_source)),
    );

    let entries = query::parse_query_batch(&input)?;
    tracing::info!(
        "Running {} queries with up to {} concurrent store queries",
        entries.len(),
        cfg.max_concurrent_queries
    );

    let results = service.batch_get_metrics(&entries).await;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for result in &results {
        serde_json::to_writer(&mut out, result)?;
        writeln!(out)?;
    }

    let failed = results.iter().filter(|r| r.is_failed()).count();
    tracing::info!(
        "Done: {} ok, {} failed, stats {}",
        results.len() - failed,
        failed,
        serde_json::to_string(&service.stats())?
    );

    Ok(())
}

fn load_rollups(store: &Store, cfg: &ServiceConfig, input: &str) -> Result<(), BoxError> {
    let records: Vec<RollupRecord> = serde_json::from_str(input)?;
    store.add_rollups(&records)?;
    store.set_last_refresh(&cfg.freshness_source, Utc::now())?;
    tracing::info!("Loaded {} rollup records", records.len());
    Ok(())
}

fn read_input(path: Option<&str>) -> Result<String, BoxError> {
    match path {
        Some(p) => Ok(std::fs::read_to_string(p)?),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}
