mod config;
mod engine;
mod error;
mod evaluator;
mod executor;
mod handlers;
mod metrics;
mod queue;
mod results;
mod routes;
mod scanner;
mod scheduler;
mod telemetry;

use anyhow::Context;
use axum::Router;
use config::LanguageConfigManager;
use engine::DockerEngine;
use proctor_common::config::QueueConfig;
use queue::QueueService;
use results::{MemoryResultStore, RedisResultStore, ResultStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub queue: QueueService,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Proctor queue booting...");

    let queue_config = QueueConfig::from_env();
    info!(
        max_concurrency = queue_config.max_concurrency,
        max_queue_depth = queue_config.max_queue_depth,
        aging_threshold_ms = queue_config.aging_threshold.as_millis() as u64,
        "Queue configuration loaded"
    );

    // Load language configurations
    let languages = LanguageConfigManager::load_default().map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        error!("Make sure config/languages.json exists");
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let results: Arc<dyn ResultStore> = match &queue_config.redis_url {
        Some(url) => {
            let store = RedisResultStore::connect(url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", url))?;
            info!("Storing results in Redis: {}", url);
            Arc::new(store)
        }
        None => {
            info!(
                capacity = queue_config.result_cache_capacity,
                "REDIS_URL not set, storing results in memory"
            );
            Arc::new(MemoryResultStore::new(queue_config.result_cache_capacity))
        }
    };

    let sandbox = Arc::new(DockerEngine::new()?);
    telemetry::register();

    // Fails on an invalid security rule; the service does not start
    let queue = QueueService::new(&queue_config, languages, sandbox, results)?;
    let aging = queue.spawn_aging(queue_config.aging_tick);

    let state = Arc::new(AppState { queue });

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&queue_config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", queue_config.bind_addr))?;

    info!("HTTP server listening on {}", queue_config.bind_addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    aging.abort();
    info!("Proctor queue stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", e);
        return;
    }
    warn!("Received shutdown signal, no longer accepting jobs");
}
