//! push-ingest - Push-subscription ingestion endpoint
//!
//! Receives pushed messages over HTTP and streams them into a sink:
//! - Bounded admission with fast 503 backpressure
//! - Batched, retried appends from a single writer task
//! - Graceful drain with aggregated shutdown errors

mod config;
mod gate;
mod serializer;
mod sink;
mod stream;
mod web;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::sink::SqliteSink;
use crate::stream::StreamWriter;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting push-ingest...");

    let sink = SqliteSink::connect(&config.database).await?;
    sink.run_migrations().await?;
    info!(
        "Database initialized ({} records stored)",
        sink.count().await?
    );

    let writer = Arc::new(StreamWriter::start(Arc::new(sink), &config.writer));

    let state = Arc::new(AppState::new(
        writer.clone(),
        serializer::from_format(config.serializer.format),
        &config.push,
    ));

    info!(
        "Admitting up to {} concurrent pushes",
        state.gate.capacity()
    );

    // Stop accepting requests first, then drain what they enqueued
    let served = web::start_server(&config, state).await;

    if let Err(e) = writer.shutdown().await {
        error!(
            "Stream writer shut down with {} errors:\n{}",
            e.errors().len(),
            e
        );
        return Err(e).context("stream writer shutdown failed");
    }
    info!("Stream writer {}", writer.state());

    served
}
