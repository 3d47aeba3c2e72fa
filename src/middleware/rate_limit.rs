//! Rate limit interceptor.

use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::{Error, HttpResponse};
use futures::future::LocalBoxFuture;
use log::{error, info};
use serde::Serialize;

use crate::core::{RateLimitDecision, ShieldState};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Serialize)]
struct RateLimitedBody<'a> {
    error: &'static str,
    policy: &'a str,
    retry_after: u64,
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(decision.limit));
    headers.insert(
        HeaderName::from_static(REMAINING_HEADER),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static(RESET_HEADER),
        HeaderValue::from(decision.reset_after),
    );
    if let Some(retry) = decision.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry));
    }
}

/// Middleware factory
#[derive(Clone)]
pub struct RateLimit {
    state: Arc<ShieldState>,
}

impl RateLimit {
    pub fn new(state: Arc<ShieldState>) -> Self {
        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddleware {
            service: Rc::new(service),
            state: self.state.clone(),
        }))
    }
}

pub struct RateLimitMiddleware<S> {
    service: Rc<S>,
    state: Arc<ShieldState>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
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
            let decision = match state.limiter.check(&facts).await {
                Ok(decision) => decision,
                Err(e) => {
                    error!("Rate limit check for {} failed: {}", facts.client_ip, e);
                    None
                }
            };

            let decision = match decision {
                Some(decision) => decision,
                None => return service.call(req).await.map(ServiceResponse::map_into_left_body),
            };

            if !decision.allowed {
                info!(
                    "Rate limited {} on {} {} (policy {})",
                    facts.client_ip, facts.method, facts.path, decision.policy_id
                );
                state
                    .events
                    .record_rate_limited(&facts.client_ip, &decision.policy_id, &facts.path)
                    .await;

                let mut response = HttpResponse::TooManyRequests().json(RateLimitedBody {
                    error: "rate_limited",
                    policy: &decision.policy_id,
                    retry_after: decision.retry_after.unwrap_or(1),
                });
                apply_headers(response.headers_mut(), &decision);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut res = service.call(req).await?;
            apply_headers(res.headers_mut(), &decision);
            Ok(res.map_into_left_body())
        })
    }
}
