//! Per-endpoint sliding-window rate limiting.
//!
//! Requests are matched against the configured policies in declaration
//! order. The first matching policy derives an identifier (client IP,
//! authenticated user or a custom key template) and counts the request in a
//! sliding window keyed by `(policy, window, identifier)`.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{PolicyError, StoreError};
use crate::models::{KeySpec, PolicyConfig, RateLimitConfig};
use crate::utils::{ceil_secs, format_key, now_millis};

use super::request::RequestFacts;
use super::store::Store;

pub const DEFAULT_POLICY_ID: &str = "default";

/// Rendered in place of a missing template value
const MISSING: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ip,
    User,
    Method,
    Path,
    Header(String),
    Query(String),
}

/// Compiled custom key expression, e.g. `"agent:{header.x-agent-id}:{path}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(expression: &str) -> Result<Self, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidKeyExpression {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = expression;

        while let Some(open) = rest.find(|c: char| c == '{' || c == '}') {
            if rest[open..].starts_with('}') {
                return Err(invalid("unmatched `}`"));
            }
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed `{`"))?;
            let name = after[..close].trim();

            let segment = match name {
                "ip" => Segment::Ip,
                "user" => Segment::User,
                "method" => Segment::Method,
                "path" => Segment::Path,
                _ => {
                    if let Some(header) = name.strip_prefix("header.").filter(|h| !h.is_empty()) {
                        Segment::Header(header.to_ascii_lowercase())
                    } else if let Some(param) = name.strip_prefix("query.").filter(|p| !p.is_empty()) {
                        Segment::Query(param.to_string())
                    } else {
                        return Err(invalid(&format!("unknown placeholder `{{{}}}`", name)));
                    }
                }
            };

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(segment);
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.iter().any(|s| !matches!(s, Segment::Literal(_))) {
            return Err(invalid("no placeholders"));
        }

        Ok(Self {
            source: expression.to_string(),
            segments,
        })
    }

    pub fn render(&self, facts: &RequestFacts) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ip => out.push_str(&facts.client_ip),
                Segment::User => out.push_str(facts.user_id.as_deref().unwrap_or(MISSING)),
                Segment::Method => out.push_str(&facts.method),
                Segment::Path => out.push_str(&facts.route_path()),
                Segment::Header(name) => out.push_str(facts.header(name).unwrap_or(MISSING)),
                Segment::Query(name) => match facts.query_param(name) {
                    Some(value) if !value.is_empty() => out.push_str(&value),
                    _ => out.push_str(MISSING),
                },
            }
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// How a policy identifies the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    Ip,
    /// Authenticated user; anonymous requests fall back to the client IP
    User,
    Custom(KeyTemplate),
}

impl KeyStrategy {
    pub fn from_spec(spec: &KeySpec) -> Result<Self, PolicyError> {
        Ok(match spec {
            KeySpec::Ip => KeyStrategy::Ip,
            KeySpec::User => KeyStrategy::User,
            KeySpec::Custom(expression) => KeyStrategy::Custom(KeyTemplate::parse(expression)?),
        })
    }

    pub fn identifier(&self, facts: &RequestFacts) -> String {
        match self {
            KeyStrategy::Ip => format!("ip:{}", facts.client_ip),
            KeyStrategy::User => match &facts.user_id {
                Some(user) => format!("user:{}", user),
                None => format!("ip:{}", facts.client_ip),
            },
            KeyStrategy::Custom(template) => format!("custom:{}", template.render(facts)),
        }
    }

    fn describe(&self) -> String {
        match self {
            KeyStrategy::Ip => "ip".to_string(),
            KeyStrategy::User => "user".to_string(),
            KeyStrategy::Custom(template) => format!("custom({})", template.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Literal(String),
    Any,
    Rest,
}

/// Path pattern: literal segments, `*` for exactly one segment and a
/// trailing `**` for any remainder (including none)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<PathSegment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PolicyError> {
        if !pattern.starts_with('/') {
            return Err(PolicyError::InvalidPathPattern(pattern.to_string()));
        }

        let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "**" if i == parts.len() - 1 => PathSegment::Rest,
                "*" => PathSegment::Any,
                p if p.contains('*') => {
                    return Err(PolicyError::InvalidPathPattern(pattern.to_string()))
                }
                p => PathSegment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        let mut parts = path.split('/').filter(|s| !s.is_empty());

        for segment in &self.segments {
            match segment {
                PathSegment::Rest => return true,
                PathSegment::Any => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                PathSegment::Literal(expected) => match parts.next() {
                    Some(part) if part == expected.as_str() => {}
                    _ => return false,
                },
            }
        }

        parts.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Compiled rate limit policy
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub id: String,
    pub path: PathPattern,
    /// Uppercase; empty matches any method
    pub methods: Vec<String>,
    pub limit: u32,
    pub window_seconds: u64,
    pub key: KeyStrategy,
}

impl RateLimitPolicy {
    pub fn compile(config: &PolicyConfig) -> Result<Self, PolicyError> {
        if config.limit == 0 || config.window_seconds == 0 {
            return Err(PolicyError::EmptyWindow(config.id.clone()));
        }

        Ok(Self {
            id: config.id.clone(),
            path: PathPattern::parse(&config.path)?,
            methods: config.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            limit: config.limit,
            window_seconds: config.window_seconds,
            key: KeyStrategy::from_spec(&config.key)?,
        })
    }

    /// `path` is the normalized route path, see [`RequestFacts::route_path`]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)))
            && self.path.matches(path)
    }

    /// Counter key for `identifier`: scope, window and identifier
    pub fn counter_key(&self, identifier: &str) -> String {
        format_key(
            "rl",
            &format!("{}:{}:{}", self.id, self.window_seconds, identifier),
        )
    }
}

/// Policy summary for the admin dashboard
#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub id: String,
    pub path: String,
    pub methods: Vec<String>,
    pub limit: u32,
    pub window_seconds: u64,
    pub key: String,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub policy_id: String,
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window
    pub reset_after: u64,
    /// Seconds the caller should wait, set when rejected
    pub retry_after: Option<u64>,
}

/// Sliding-window rate limiter
pub struct RateLimiter {
    store: Arc<Store>,
    policies: Vec<RateLimitPolicy>,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>, config: &RateLimitConfig) -> Result<Self, PolicyError> {
        let mut policies = config
            .policies
            .iter()
            .map(RateLimitPolicy::compile)
            .collect::<Result<Vec<_>, _>>()?;

        if config.apply_default {
            policies.push(RateLimitPolicy::compile(&PolicyConfig {
                id: DEFAULT_POLICY_ID.to_string(),
                path: "/**".to_string(),
                methods: Vec::new(),
                limit: config.default_limit,
                window_seconds: config.window_seconds,
                key: KeySpec::Ip,
            })?);
        }

        Ok(Self { store, policies })
    }

    pub fn find_policy(&self, facts: &RequestFacts) -> Option<&RateLimitPolicy> {
        let path = facts.route_path();
        self.policies.iter().find(|p| p.matches(&facts.method, &path))
    }

    /// Count the request against the first matching policy.
    ///
    /// Returns `None` when no policy applies.
    pub async fn check(&self, facts: &RequestFacts) -> Result<Option<RateLimitDecision>, StoreError> {
        let policy = match self.find_policy(facts) {
            Some(policy) => policy,
            None => return Ok(None),
        };

        let identifier = policy.key.identifier(facts);
        let window_ms = policy.window_seconds as i64 * 1000;
        let now = now_millis();
        let state = self
            .store
            .hit_window(&policy.counter_key(&identifier), policy.limit, window_ms, now)
            .await?;

        let reset_after = ceil_secs(state.oldest_ms + window_ms - now);
        Ok(Some(RateLimitDecision {
            policy_id: policy.id.clone(),
            allowed: state.allowed,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(state.count),
            reset_after,
            retry_after: (!state.allowed).then(|| reset_after.max(1)),
        }))
    }

    /// Clear the window of `identifier` under `policy_id`; returns `false`
    /// when the policy is unknown or nothing was counted
    pub async fn reset(&self, policy_id: &str, identifier: &str) -> Result<bool, StoreError> {
        match self.policies.iter().find(|p| p.id == policy_id) {
            Some(policy) => self.store.reset_window(&policy.counter_key(identifier)).await,
            None => Ok(false),
        }
    }

    pub fn policies(&self) -> Vec<PolicySummary> {
        self.policies
            .iter()
            .map(|p| PolicySummary {
                id: p.id.clone(),
                path: p.path.as_str().to_string(),
                methods: p.methods.clone(),
                limit: p.limit,
                window_seconds: p.window_seconds,
                key: p.key.describe(),
            })
            .collect()
    }
}
