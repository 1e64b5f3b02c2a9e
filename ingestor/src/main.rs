mod admission;
mod audit;
mod cache;
mod config;
mod db;
mod errors;
mod geo;
mod metrics;
mod model;
mod mqtt;
mod pipeline;
mod resolver;
mod rest;
mod staleness;
mod store;
#[cfg(test)]
mod testing;
mod validate;

use admission::AdmissionController;
use anyhow::Context;
use audit::AuditLog;
use axum::{routing::get, Router};
use cache::RedisCache;
use config::Config;
use db::PgRepository;
use pipeline::Pipeline;
use std::net::SocketAddr;
use std::sync::Arc;
use store::{Cache, Repository};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting telemetry ingestor");
    info!("HTTP server: {}", config.http_addr);
    if config.trust_proxy_headers {
        info!("Keying HTTP admission on proxy forwarding headers");
    }
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );
    info!(
        "Rate limit: {} req/s, burst {}, delay {:?}",
        config.rate_limit.requests_per_second,
        config.rate_limit.burst,
        config.rate_limit.request_delay
    );

    metrics::init_metrics();

    let pool = db::make_pool(&config.database_url, config.db_max_connections)
        .await
        .context("failed to connect to database")?;
    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool));

    let cache: Arc<dyn Cache> = Arc::new(
        RedisCache::connect(&config.redis_url, config.cache_ttl)
            .await
            .context("failed to connect to cache")?,
    );

    let audit = Arc::new(AuditLog::open(&config.audit).context("failed to open audit logs")?);

    let pipeline = Arc::new(Pipeline::new(
        repo.clone(),
        cache.clone(),
        audit.clone(),
        config.io_timeout,
    ));

    let admission = Arc::new(AdmissionController::new(&config.rate_limit)?);
    admission.spawn_sweeper();

    let mqtt_handle = config.mqtt.clone().map(|mqtt_config| {
        let ingress = mqtt::MqttIngress {
            pipeline: pipeline.clone(),
            admission: admission.clone(),
            audit: audit.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(mqtt_config, ingress).await {
                error!("MQTT task failed: {}", e);
            }
        })
    });
    if mqtt_handle.is_none() {
        info!("MQTT ingress disabled");
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(rest::AppState {
            pipeline,
            admission: admission.clone(),
            audit,
            repo: repo.clone(),
            cache: cache.clone(),
            io_timeout: config.io_timeout,
            trust_proxy_headers: config.trust_proxy_headers,
        }));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    let mqtt_task = async {
        match mqtt_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = mqtt_task => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    admission.shutdown();
    if let Err(e) = cache.close().await {
        error!("Failed to close cache: {}", e);
    }
    if let Err(e) = repo.close().await {
        error!("Failed to close database: {}", e);
    }

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
