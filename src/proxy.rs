//! Forwarding of admitted requests to the marketplace backend.

use std::time::Duration;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, error};
use reqwest::Client;

use crate::api::ApiState;
use crate::error::ShieldError;
use crate::models::UpstreamConfig;

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Upstream client
pub struct Upstream {
    client: Client,
    base_url: String,
}

impl Upstream {
    /// Returns `None` when no upstream URL is configured
    pub fn from_config(config: &UpstreamConfig) -> Result<Option<Self>, ShieldError> {
        let base_url = match &config.url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => return Ok(None),
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Some(Self { client, base_url }))
    }

    pub fn target_url(&self, req: &HttpRequest) -> String {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.base_url, path_and_query)
    }

    pub async fn forward(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        client_ip: &str,
    ) -> Result<HttpResponse, ShieldError> {
        let url = self.target_url(req);
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        debug!("Forwarding {} {}", method, url);

        let mut builder = self.client.request(method, &url);
        let mut forwarded_for = None;
        for (name, value) in req.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if name.as_str().eq_ignore_ascii_case("x-forwarded-for") {
                forwarded_for = value.to_str().ok().map(str::to_string);
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let forwarded_for = match forwarded_for {
            Some(chain) => format!("{}, {}", chain, client_ip),
            None => client_ip.to_string(),
        };
        builder = builder.header("x-forwarded-for", forwarded_for);

        let upstream = builder.body(body.to_vec()).send().await?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = HttpResponse::build(status);
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response.append_header((name, value));
            }
        }
        let bytes = upstream.bytes().await?;
        Ok(response.body(bytes))
    }
}

/// Default service: forward everything no local route handled
pub async fn forward(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<ApiState>,
) -> Result<HttpResponse, ShieldError> {
    let upstream = state.upstream.as_ref().ok_or(ShieldError::NoUpstream)?;
    let facts = state.shield.facts(&req);

    upstream
        .forward(&req, body, &facts.client_ip)
        .await
        .map_err(|e| {
            error!("Forwarding {} {} failed: {}", req.method(), req.path(), e);
            e
        })
}
