mod config;
mod db;
mod engine;
mod errors;
mod gateway;
mod metrics;
mod model;
mod mqtt;
mod queue;
mod realtime;
mod repo;
mod rest;
mod service;
mod validate;
mod worker;
mod ws;

#[cfg(test)]
mod testing;

use axum::{routing::get, Router};
use config::Config;
use engine::RuleEngine;
use queue::{JobQueue, PgJobQueue};
use realtime::ChannelRegistry;
use repo::{PgHeartbeats, PgNotifications, PgRules};
use rest::AppState;
use service::HeartbeatService;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use worker::WorkerPool;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting heartbeat pipeline");
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );
    info!(
        "Workers: {}, max attempts: {}, backoff: {}ms",
        config.worker_concurrency,
        config.retry.max_attempts,
        config.retry.backoff.as_millis()
    );

    metrics::init_metrics();

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    // Shared dependencies, built once and passed down explicitly.
    let registry = Arc::new(ChannelRegistry::new());
    let heartbeats = Arc::new(PgHeartbeats::new(pool.clone()));
    let rules = Arc::new(PgRules::new(pool.clone()));
    let notifications = Arc::new(PgNotifications::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool.clone(), config.retry));

    let engine = RuleEngine::new(rules.clone(), notifications.clone(), registry.clone());
    let service = HeartbeatService::new(heartbeats, engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handles = WorkerPool::new(
        queue.clone(),
        service.clone(),
        config.worker_poll,
        config.job_lease,
    )
    .spawn(config.worker_concurrency, shutdown_rx);

    let mqtt_handle = if config.mqtt_enabled {
        info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
        let client_id = format!("heartbeat-gateway-{}", uuid::Uuid::new_v4());
        let mqtt_queue = queue.clone();
        let (broker, port, topic) = (
            config.mqtt_broker.clone(),
            config.mqtt_port,
            config.mqtt_topic.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(broker, port, client_id, topic, mqtt_queue).await {
                error!("MQTT task failed: {}", e);
            }
        }))
    } else {
        info!("MQTT gateway disabled");
        None
    };

    let state = AppState {
        service,
        rules,
        notifications,
        queue,
        registry,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    let mqtt_done = async {
        match mqtt_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = mqtt_done => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Stop claiming; jobs already picked up run to completion.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
