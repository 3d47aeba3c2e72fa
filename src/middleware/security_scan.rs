//! Security scan interceptor.
//!
//! Rejects requests from blocked IPs, guards against request floods and runs
//! the threat detector. Matches are reported to the IP registry as weighted
//! violations, which may block the IP.

use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpResponse};
use futures::future::LocalBoxFuture;
use log::{error, warn};
use serde::Serialize;

use crate::core::ip_registry::remaining_secs;
use crate::core::threat_detector::total_weight;
use crate::core::{ShieldState, ThreatCategory};
use crate::models::BlockEntry;

#[derive(Serialize)]
struct BlockedBody<'a> {
    error: &'static str,
    message: &'a str,
    /// Seconds until the block expires, absent for permanent blocks
    retry_after: Option<i64>,
}

#[derive(Serialize)]
struct ThreatBody {
    error: &'static str,
    categories: Vec<ThreatCategory>,
}

fn blocked_response(entry: &BlockEntry) -> HttpResponse {
    let retry_after = remaining_secs(entry);
    let mut builder = HttpResponse::Forbidden();
    if let Some(secs) = retry_after {
        builder.insert_header(("Retry-After", secs.max(1).to_string()));
    }
    builder.json(BlockedBody {
        error: "ip_blocked",
        message: "Access from this address is blocked",
        retry_after,
    })
}

/// Middleware factory
#[derive(Clone)]
pub struct SecurityScan {
    state: Arc<ShieldState>,
}

impl SecurityScan {
    pub fn new(state: Arc<ShieldState>) -> Self {
        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecurityScan
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = SecurityScanMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityScanMiddleware {
            service: Rc::new(service),
            state: self.state.clone(),
        }))
    }
}

pub struct SecurityScanMiddleware<S> {
    service: Rc<S>,
    state: Arc<ShieldState>,
}

impl<S, B> Service<ServiceRequest> for SecurityScanMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let state = self.state.clone();

        Box::pin(async move {
            if state.is_exempt(req.path()) {
                return service.call(req).await.map(ServiceResponse::map_into_left_body);
            }

            let facts = state.facts(req.request());
            let ip = facts.client_ip.as_str();
            state.events.record_request();

            // Store failures fail open
            match state.registry.is_blocked(ip).await {
                Ok(Some(entry)) => {
                    state.events.record_blocked_request(ip, &facts.path).await;
                    return Ok(req.into_response(blocked_response(&entry)).map_into_right_body());
                }
                Ok(None) => {}
                Err(e) => error!("Blocklist lookup for {} failed: {}", ip, e),
            }

            match state.registry.check_flood(ip).await {
                Ok(Some(entry)) => {
                    state.events.record_block(ip, &entry.reason).await;
                    state.events.record_blocked_request(ip, &facts.path).await;
                    return Ok(req.into_response(blocked_response(&entry)).map_into_right_body());
                }
                Ok(None) => {}
                Err(e) => error!("Flood check for {} failed: {}", ip, e),
            }

            let matches = state.detector.scan(&facts);
            if !matches.is_empty() {
                let categories: Vec<ThreatCategory> = matches.iter().map(|m| m.category).collect();
                warn!(
                    "Threat from {} on {} {}: {:?}",
                    ip, facts.method, facts.path, categories
                );
                state.events.record_threats(ip, &facts.path, &matches).await;

                let reason = format!(
                    "threat scan: {}",
                    categories
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                match state
                    .registry
                    .record_violation(ip, total_weight(&matches), &reason)
                    .await
                {
                    Ok(outcome) => {
                        if let Some(entry) = outcome.blocked {
                            state.events.record_block(ip, &entry.reason).await;
                        }
                    }
                    Err(e) => error!("Recording violation for {} failed: {}", ip, e),
                }

                if state.config.threat.reject_on_match {
                    let response = HttpResponse::Forbidden().json(ThreatBody {
                        error: "threat_detected",
                        categories,
                    });
                    return Ok(req.into_response(response).map_into_right_body());
                }
            }

            service.call(req).await.map(ServiceResponse::map_into_left_body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Store;
    use crate::models::{BlockSource, Config};
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    fn state(config: Config) -> Arc<ShieldState> {
        Arc::new(ShieldState::new(config, Store::memory()).unwrap())
    }

    fn peer(ip: &str) -> std::net::SocketAddr {
        format!("{}:40000", ip).parse().unwrap()
    }

    async fn ok() -> HttpResponse {
        HttpResponse::Ok().body("listing")
    }

    #[actix_web::test]
    async fn test_clean_request_passes() {
        let state = state(Config::default());
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/properties?city=Braga")
            .peer_addr(peer("203.0.113.20"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.events.snapshot().total_requests, 1);
    }

    #[actix_web::test]
    async fn test_blocked_ip_rejected() {
        let state = state(Config::default());
        state
            .registry
            .block("203.0.113.21", "abuse", BlockSource::Manual, None)
            .await
            .unwrap();
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/properties")
            .peer_addr(peer("203.0.113.21"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "ip_blocked");
        assert!(body["retry_after"].is_null());
        assert_eq!(state.events.snapshot().blocked_requests, 1);
    }

    #[actix_web::test]
    async fn test_threats_rejected_then_ip_blocked() {
        let mut config = Config::default();
        config.blocking.block_threshold = 10;
        let state = state(config);
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        // SQL injection weighs 5; the second attempt crosses the threshold
        for _ in 0..2 {
            let req = test::TestRequest::get()
                .uri("/api/v1/properties?id=1%20UNION%20SELECT%20password")
                .peer_addr(peer("198.51.100.30"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            let body: serde_json::Value = test::read_body_json(resp).await;
            assert_eq!(body["error"], "threat_detected");
            assert_eq!(body["categories"][0], "sql_injection");
        }

        let entry = state.registry.is_blocked("198.51.100.30").await.unwrap().unwrap();
        assert_eq!(entry.source, BlockSource::ThreatScan);

        let req = test::TestRequest::get()
            .uri("/api/v1/properties")
            .peer_addr(peer("198.51.100.30"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(resp.headers().contains_key("retry-after"));
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "ip_blocked");
    }

    #[actix_web::test]
    async fn test_report_only_mode() {
        let mut config = Config::default();
        config.threat.reject_on_match = false;
        let state = state(config);
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/.git/config")
            .peer_addr(peer("198.51.100.31"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.events.snapshot().threats_detected, 1);
    }

    #[actix_web::test]
    async fn test_flood_blocks_ip() {
        let mut config = Config::default();
        config.blocking.flood_threshold = 2;
        let state = state(config);
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        let statuses = {
            let mut statuses = Vec::new();
            for _ in 0..3 {
                let req = test::TestRequest::get()
                    .uri("/api/v1/properties")
                    .peer_addr(peer("198.51.100.32"))
                    .to_request();
                statuses.push(test::call_service(&app, req).await.status());
            }
            statuses
        };
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::OK, StatusCode::FORBIDDEN]);
        assert!(state.registry.is_blocked("198.51.100.32").await.unwrap().is_some());
    }

    #[actix_web::test]
    async fn test_lookalike_exempt_paths_are_screened() {
        let state = state(Config::default());
        state
            .registry
            .block("203.0.113.99", "abuse", BlockSource::Manual, None)
            .await
            .unwrap();
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        for uri in [
            "/api/v1/healthz?id=1%20UNION%20SELECT%20password",
            "/api/v1/health/..;/properties?id=1%20UNION%20SELECT%20password",
            "/api/v1/health/%2e%2e/properties",
            "/metrics/../api/v1/properties",
        ] {
            let req = test::TestRequest::get()
                .uri(uri)
                .peer_addr(peer("203.0.113.99"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{} was not screened", uri);
        }
    }

    #[actix_web::test]
    async fn test_ordinary_referer_and_cookie_never_block() {
        let state = state(Config::default());
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        for _ in 0..5 {
            let req = test::TestRequest::get()
                .uri("/api/v1/properties/42")
                .peer_addr(peer("198.51.100.33"))
                .insert_header(("Referer", "https://homes.example/properties?city=Porto&id=42"))
                .insert_header(("Cookie", "session=abc; id=42; lang=pt"))
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        }
        assert!(state.registry.is_blocked("198.51.100.33").await.unwrap().is_none());
        assert_eq!(state.events.snapshot().threats_detected, 0);
    }

    #[actix_web::test]
    async fn test_exempt_path_skips_scan() {
        let state = state(Config::default());
        state
            .registry
            .block("203.0.113.22", "abuse", BlockSource::Manual, None)
            .await
            .unwrap();
        let app = test::init_service(
            App::new()
                .wrap(SecurityScan::new(state.clone()))
                .default_service(web::to(ok)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/health")
            .peer_addr(peer("203.0.113.22"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
