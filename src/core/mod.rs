//! Core functionality for the request-defense layer.
//!
//! This module contains the components that sit in front of the
//! marketplace backend: the IP registry, the threat detector, the rate
//! limiter, their shared storage, and the analytics feed.

pub mod analytics;
pub mod ip_registry;
pub mod monitoring;
pub mod rate_limiter;
pub mod request;
pub mod store;
pub mod threat_detector;

use std::sync::Arc;

use crate::error::ShieldError;
use crate::models::Config;

pub use analytics::{EventKind, SecurityEvent, SecurityEvents, SecurityStats};
pub use ip_registry::{IpRegistry, ViolationOutcome};
pub use monitoring::Monitoring;
pub use rate_limiter::{KeyStrategy, KeyTemplate, PathPattern, RateLimitDecision, RateLimiter};
pub use request::RequestFacts;
pub use store::{MemoryStore, RedisStore, Store, WindowState};
pub use threat_detector::{Severity, ThreatCategory, ThreatDetector, ThreatMatch};

/// Everything the interceptors and the admin API share
pub struct ShieldState {
    pub config: Config,
    pub store: Arc<Store>,
    pub registry: IpRegistry,
    pub detector: ThreatDetector,
    pub limiter: RateLimiter,
    pub events: SecurityEvents,
}

impl ShieldState {
    /// Compile policies and signatures from `config` over `store`
    pub fn new(config: Config, store: Store) -> Result<Self, ShieldError> {
        let store = Arc::new(store);
        let registry = IpRegistry::new(store.clone(), config.blocking.clone())?;
        let detector = ThreatDetector::new(&config.threat)?;
        let limiter = RateLimiter::new(store.clone(), &config.rate_limit)?;
        let events = SecurityEvents::new(config.monitoring.event_buffer);

        Ok(Self {
            config,
            store,
            registry,
            detector,
            limiter,
            events,
        })
    }

    /// Exempt paths match exactly, ignoring a trailing slash. Anything below
    /// them reaches the upstream, so it is screened like any other path.
    pub fn is_exempt(&self, path: &str) -> bool {
        if request::is_ambiguous_path(path) {
            return false;
        }
        let path = request::route_path(path);
        let path = path.trim_end_matches('/');
        self.config
            .server
            .exempt_paths
            .iter()
            .any(|exempt| exempt.trim_end_matches('/') == path)
    }

    pub fn facts(&self, req: &actix_web::HttpRequest) -> RequestFacts {
        let limits = &self.config.rate_limit;
        RequestFacts::from_http(
            req,
            self.config.server.trust_forwarded_for,
            limits.trust_user_header.then_some(limits.user_header.as_str()),
        )
    }
}
