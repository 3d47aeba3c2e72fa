//! Error types shared across the service.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the blocklist and counter storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Errors raised while compiling policies and signatures
#[derive(Error, Debug, PartialEq)]
pub enum PolicyError {
    #[error("invalid key expression `{expression}`: {reason}")]
    InvalidKeyExpression { expression: String, reason: String },
    #[error("invalid path pattern `{0}`")]
    InvalidPathPattern(String),
    #[error("invalid threat pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("unknown threat category `{0}`")]
    UnknownCategory(String),
    #[error("invalid allowlist entry `{0}`")]
    InvalidAllowlistEntry(String),
    #[error("policy `{0}` has a zero limit or window")]
    EmptyWindow(String),
}

/// Top-level service error
#[derive(Error, Debug)]
pub enum ShieldError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("no upstream configured")]
    NoUpstream,
    #[error("{0} is allowlisted and cannot be blocked")]
    Allowlisted(String),
    #[error("`{0}` is not a valid IP address")]
    InvalidIp(String),
    #[error("block duration of {0}s is out of range")]
    InvalidDuration(u64),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("missing or invalid admin token")]
    Unauthorized,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ShieldError {
    fn code(&self) -> &'static str {
        match self {
            ShieldError::Store(_) => "store_unavailable",
            ShieldError::Policy(_) => "invalid_policy",
            ShieldError::Config(_) => "invalid_config",
            ShieldError::Upstream(_) => "upstream_failed",
            ShieldError::NoUpstream => "not_found",
            ShieldError::Allowlisted(_) => "ip_allowlisted",
            ShieldError::InvalidIp(_) => "invalid_ip",
            ShieldError::InvalidDuration(_) => "invalid_duration",
            ShieldError::BadRequest(_) => "bad_request",
            ShieldError::NotFound(_) => "not_found",
            ShieldError::Unauthorized => "unauthorized",
        }
    }
}

impl ResponseError for ShieldError {
    fn status_code(&self) -> StatusCode {
        match self {
            ShieldError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShieldError::Policy(_) | ShieldError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShieldError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ShieldError::NoUpstream | ShieldError::NotFound(_) => StatusCode::NOT_FOUND,
            ShieldError::Allowlisted(_) => StatusCode::CONFLICT,
            ShieldError::InvalidIp(_)
            | ShieldError::InvalidDuration(_)
            | ShieldError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ShieldError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        })
    }
}
