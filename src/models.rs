use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Take the client IP from the first `X-Forwarded-For` hop
    pub trust_forwarded_for: bool,
    /// Local paths that bypass scanning and rate limiting, matched exactly
    pub exempt_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            trust_forwarded_for: false,
            exempt_paths: vec!["/api/v1/health".to_string(), "/metrics".to_string()],
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix prepended to every key the service writes
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "shield".to_string(),
        }
    }
}

/// Which backend holds blocklist and counter state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

/// Upstream marketplace backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to; `None` disables forwarding
    pub url: Option<String>,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: 30,
        }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Shared secret expected in `X-Admin-Token`; empty disables the admin API
    pub token: String,
}

/// How a rate limit policy derives the identifier it counts against
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeySpec {
    #[default]
    Ip,
    User,
    /// Template such as `"agent:{header.x-agent-id}"`
    Custom(String),
}

/// A per-endpoint rate limit policy as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy identifier, used as the counter scope
    pub id: String,
    /// Path pattern, `*` matches one segment and a trailing `**` the rest
    pub path: String,
    /// HTTP methods the policy applies to; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    /// Requests allowed per window
    pub limit: u32,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Identifier strategy
    #[serde(default)]
    pub key: KeySpec,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Default rate limit (requests per window)
    pub default_limit: u32,
    /// Time window in seconds
    pub window_seconds: u64,
    /// Apply the default per-IP limit to requests no policy matches
    pub apply_default: bool,
    /// Header carrying the authenticated user id
    pub user_header: String,
    /// Honor `user_header`. Enable only when a trusted proxy in front of
    /// the gateway sets it and strips client-supplied values.
    pub trust_user_header: bool,
    /// Endpoint policies, first match wins
    pub policies: Vec<PolicyConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            window_seconds: 60,
            apply_default: true,
            user_header: "X-User-Id".to_string(),
            trust_user_header: false,
            policies: Vec::new(),
        }
    }
}

/// IP blocking thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockingConfig {
    /// Violation weight that triggers an automatic block
    pub block_threshold: u32,
    /// Window violations are accumulated over, in seconds
    pub violation_window_seconds: u64,
    /// Duration of automatic blocks, in seconds
    pub block_duration_seconds: u64,
    /// IPs or CIDR networks that are never blocked
    pub allowlist: Vec<String>,
    /// Requests per flood window before an IP is blocked; 0 disables
    pub flood_threshold: u32,
    /// Flood detection window, in seconds
    pub flood_window_seconds: u64,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            block_threshold: 10,
            violation_window_seconds: 600,
            block_duration_seconds: 3600,
            allowlist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            flood_threshold: 1000,
            flood_window_seconds: 60,
        }
    }
}

/// Extra signature supplied through configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Category name, e.g. `sql_injection`
    pub category: String,
    /// Regular expression, matched case-insensitively
    pub pattern: String,
}

/// Threat scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    /// Whether to scan requests at all
    pub enabled: bool,
    /// Answer 403 on a match instead of only recording it
    pub reject_on_match: bool,
    /// Headers inspected besides the path and query
    pub scan_headers: Vec<String>,
    /// Longest accepted path + query, in bytes
    pub max_uri_length: usize,
    pub extra_patterns: Vec<PatternConfig>,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reject_on_match: true,
            scan_headers: vec![
                "user-agent".to_string(),
                "referer".to_string(),
                "cookie".to_string(),
            ],
            max_uri_length: 4096,
            extra_patterns: Vec::new(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether to run the maintenance loop
    pub enabled: bool,
    /// Interval between expired-state purges, in seconds
    pub purge_interval_seconds: u64,
    /// Number of security events kept for the admin dashboard
    pub event_buffer: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            purge_interval_seconds: 60,
            event_buffer: 1000,
        }
    }
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub admin: AdminConfig,
    pub rate_limit: RateLimitConfig,
    pub blocking: BlockingConfig,
    pub threat: ThreatConfig,
    pub monitoring: MonitoringConfig,
}

/// Why an IP was blocked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Manual,
    ThreatScan,
    Flood,
}

/// Block record for one IP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockEntry {
    pub ip: String,
    pub reason: String,
    pub source: BlockSource,
    pub blocked_at: DateTime<Utc>,
    /// `None` for permanent blocks
    pub expires_at: Option<DateTime<Utc>>,
    /// Violation weight accumulated when the block was issued
    pub violations: u32,
}

impl BlockEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at
            .map(|at| at.timestamp_millis() <= now_ms)
            .unwrap_or(false)
    }
}
