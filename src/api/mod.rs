//! API endpoints for the request-defense gateway.
//!
//! This module provides the health check, the Prometheus scrape endpoint
//! and the admin security dashboard: blocked IP management, counters,
//! the recent event feed and rate limit resets.

use std::future::{ready, Ready};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest, HttpResponse, Responder};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::core::analytics::{EventKind, SecurityEvent, SecurityStats};
use crate::core::rate_limiter::PolicySummary;
use crate::core::ShieldState;
use crate::error::ShieldError;
use crate::models::{BlockEntry, BlockSource};
use crate::proxy::Upstream;

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

pub struct ApiState {
    pub shield: Arc<ShieldState>,
    pub upstream: Option<Upstream>,
    pub metrics: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/metrics").route(web::get().to(metrics)))
        .service(
            web::scope("/api/v1")
                .service(web::resource("/health").route(web::get().to(health_check)))
                .service(
                    web::scope("/admin/security")
                        .service(
                            web::resource("/blocked-ips")
                                .route(web::get().to(list_blocked))
                                .route(web::post().to(block_ip)),
                        )
                        .service(web::resource("/blocked-ips/{ip}").route(web::delete().to(unblock_ip)))
                        .service(web::resource("/stats").route(web::get().to(stats)))
                        .service(web::resource("/events").route(web::get().to(events)))
                        .service(web::resource("/rate-limits/reset").route(web::post().to(reset_rate_limit))),
                ),
        );
}

/// Extractor that admits only requests carrying the configured admin token
pub struct AdminGuard;

impl FromRequest for AdminGuard {
    type Error = ShieldError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let expected = req
            .app_data::<web::Data<ApiState>>()
            .map(|state| state.shield.config.admin.token.clone())
            .unwrap_or_default();

        if expected.is_empty() {
            return ready(Err(ShieldError::NotFound("admin API".to_string())));
        }

        let provided = req
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if token_matches(provided, &expected) {
            ready(Ok(AdminGuard))
        } else {
            ready(Err(ShieldError::Unauthorized))
        }
    }
}

/// Constant-time token comparison; a length mismatch is also detected
/// without an early exit
fn token_matches(provided: &str, expected: &str) -> bool {
    let len = provided.len().max(expected.len());
    let mut a = vec![0u8; len];
    let mut b = vec![0xFFu8; len];
    a[..provided.len()].copy_from_slice(provided.as_bytes());
    b[..expected.len()].copy_from_slice(expected.as_bytes());

    (provided.len().ct_eq(&expected.len()) & a.ct_eq(&b)).into()
}

fn parse_ip(raw: &str) -> Result<String, ShieldError> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| ShieldError::InvalidIp(raw.to_string()))
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: &'static str,
}

/// Manual block request
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    pub reason: String,
    /// Omit for a permanent block
    pub duration_seconds: Option<u64>,
}

/// Rate limit reset request
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetRequest {
    pub policy_id: String,
    /// Identifier as the policy derives it, e.g. `ip:203.0.113.9`
    pub identifier: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub kind: Option<String>,
}

#[derive(Serialize)]
struct BlockedList {
    count: usize,
    blocked: Vec<BlockEntry>,
}

#[derive(Serialize)]
struct StatsResponse {
    store: &'static str,
    blocked_ips: usize,
    stats: SecurityStats,
    policies: Vec<PolicySummary>,
}

#[derive(Serialize)]
struct EventsResponse {
    events: Vec<SecurityEvent>,
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    let store = state.shield.store.backend_name();
    match state.shield.store.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            store,
        }),
        Err(_) => HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "degraded",
            version: env!("CARGO_PKG_VERSION"),
            store,
        }),
    }
}

async fn metrics(state: web::Data<ApiState>) -> HttpResponse {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

async fn list_blocked(
    _admin: AdminGuard,
    state: web::Data<ApiState>,
) -> Result<HttpResponse, ShieldError> {
    let blocked = state.shield.registry.list_blocked().await?;
    Ok(HttpResponse::Ok().json(BlockedList {
        count: blocked.len(),
        blocked,
    }))
}

async fn block_ip(
    _admin: AdminGuard,
    state: web::Data<ApiState>,
    req: web::Json<BlockRequest>,
) -> Result<HttpResponse, ShieldError> {
    let ip = parse_ip(&req.ip)?;

    let entry = state
        .shield
        .registry
        .block(
            &ip,
            &req.reason,
            BlockSource::Manual,
            req.duration_seconds.map(Duration::from_secs),
        )
        .await?;
    state.shield.events.record_block(&ip, &req.reason).await;

    Ok(HttpResponse::Created().json(entry))
}

async fn unblock_ip(
    _admin: AdminGuard,
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ShieldError> {
    let ip = parse_ip(&path.into_inner())?;
    if state.shield.registry.unblock(&ip).await? {
        state.shield.events.record_unblock(&ip).await;
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(ShieldError::NotFound(format!("block for {}", ip)))
    }
}

async fn stats(_admin: AdminGuard, state: web::Data<ApiState>) -> Result<HttpResponse, ShieldError> {
    let blocked = state.shield.registry.list_blocked().await?;
    Ok(HttpResponse::Ok().json(StatsResponse {
        store: state.shield.store.backend_name(),
        blocked_ips: blocked.len(),
        stats: state.shield.events.snapshot(),
        policies: state.shield.limiter.policies(),
    }))
}

async fn events(
    _admin: AdminGuard,
    state: web::Data<ApiState>,
    query: web::Query<EventsQuery>,
) -> Result<HttpResponse, ShieldError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let kind = match query.kind.as_deref() {
        Some(name) => Some(
            EventKind::parse(name)
                .ok_or_else(|| ShieldError::BadRequest(format!("unknown event kind `{}`", name)))?,
        ),
        None => None,
    };
    Ok(HttpResponse::Ok().json(EventsResponse {
        events: state.shield.events.recent(limit, kind).await,
    }))
}

async fn reset_rate_limit(
    _admin: AdminGuard,
    state: web::Data<ApiState>,
    req: web::Json<ResetRequest>,
) -> Result<HttpResponse, ShieldError> {
    if state
        .shield
        .limiter
        .reset(&req.policy_id, &req.identifier)
        .await?
    {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(ShieldError::NotFound(format!(
            "window {} for policy {}",
            req.identifier, req.policy_id
        )))
    }
}
