//! Estate Shield
//!
//! This is the main entry point for the request-defense gateway.
//! It initializes the application components and starts the web server.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;

use estate_shield::api::{self, ApiState};
use estate_shield::config;
use estate_shield::core::{Monitoring, RedisStore, ShieldState, Store};
use estate_shield::middleware::{RateLimit, SecurityScan};
use estate_shield::models::StorageBackend;
use estate_shield::proxy::{self, Upstream};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Estate Shield...");

    // Load configuration
    let config = config::load_config().context("failed to load configuration")?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    };

    let store = match config.storage.backend {
        StorageBackend::Memory => Store::memory(),
        StorageBackend::Redis => {
            let redis = RedisStore::connect(&config.redis.url, &config.redis.key_prefix)
                .await
                .with_context(|| format!("failed to connect to Redis at {}", config.redis.url))?;
            Store::Redis(redis)
        }
    };
    info!("Using {} store", store.backend_name());

    let upstream = Upstream::from_config(&config.upstream).context("failed to build upstream client")?;
    if upstream.is_none() {
        warn!("No upstream configured, unmatched routes will return 404");
    }

    let bind = (config.server.host.clone(), config.server.port);
    let monitoring_config = config.monitoring.clone();
    let shield = Arc::new(ShieldState::new(config, store).context("invalid security configuration")?);

    // Start background maintenance
    actix_rt::spawn(Monitoring::new(shield.clone(), monitoring_config).start_monitoring());

    let state = web::Data::new(ApiState {
        shield: shield.clone(),
        upstream,
        metrics,
    });

    info!("Listening on {}:{}", bind.0, bind.1);

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(RateLimit::new(shield.clone()))
            .wrap(SecurityScan::new(shield.clone()))
            .configure(api::config)
            .default_service(web::to(proxy::forward))
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}
