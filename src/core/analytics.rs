//! Security analytics for the admin dashboard.
//!
//! Keeps a bounded feed of recent security events and running counters,
//! and mirrors every counter into the `metrics` recorder.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::threat_detector::{ThreatCategory, ThreatMatch};

/// Event types for analytics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ThreatDetected,
    IpBlocked,
    IpUnblocked,
    RateLimited,
    BlockedRequest,
}

impl EventKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "threat_detected" => Some(EventKind::ThreatDetected),
            "ip_blocked" => Some(EventKind::IpBlocked),
            "ip_unblocked" => Some(EventKind::IpUnblocked),
            "rate_limited" => Some(EventKind::RateLimited),
            "blocked_request" => Some(EventKind::BlockedRequest),
            _ => None,
        }
    }
}

/// Analytics event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub ip: String,
    pub detail: String,
}

/// Counter snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SecurityStats {
    pub total_requests: u64,
    pub threats_detected: u64,
    pub blocked_requests: u64,
    pub rate_limited_requests: u64,
    pub ip_blocks: u64,
    pub threats_by_category: HashMap<String, u64>,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    threats_detected: AtomicU64,
    blocked_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    ip_blocks: AtomicU64,
    by_category: [AtomicU64; 6],
}

/// Analytics service
pub struct SecurityEvents {
    capacity: usize,
    events: RwLock<VecDeque<SecurityEvent>>,
    counters: Counters,
}

impl SecurityEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            counters: Counters::default(),
        }
    }

    async fn push(&self, kind: EventKind, ip: &str, detail: String) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.write().await;
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(SecurityEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            ip: ip.to_string(),
            detail,
        });
    }

    pub fn record_request(&self) {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("shield_requests_total");
    }

    pub async fn record_threats(&self, ip: &str, path: &str, matches: &[ThreatMatch]) {
        self.counters.threats_detected.fetch_add(1, Ordering::Relaxed);
        for m in matches {
            self.counters.by_category[m.category.index()].fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("shield_threats_total", "category" => m.category.as_str());
        }

        let detail = matches
            .iter()
            .map(|m| format!("{} in {}: {}", m.category, m.location, m.snippet))
            .collect::<Vec<_>>()
            .join("; ");
        self.push(EventKind::ThreatDetected, ip, format!("{} {}", path, detail)).await;
    }

    pub async fn record_blocked_request(&self, ip: &str, path: &str) {
        self.counters.blocked_requests.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("shield_blocked_requests_total");
        self.push(EventKind::BlockedRequest, ip, path.to_string()).await;
    }

    pub async fn record_rate_limited(&self, ip: &str, policy_id: &str, path: &str) {
        self.counters.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("shield_rate_limited_total", "policy" => policy_id.to_string());
        self.push(
            EventKind::RateLimited,
            ip,
            format!("policy {} on {}", policy_id, path),
        )
        .await;
    }

    pub async fn record_block(&self, ip: &str, reason: &str) {
        self.counters.ip_blocks.fetch_add(1, Ordering::Relaxed);
        self.push(EventKind::IpBlocked, ip, reason.to_string()).await;
    }

    pub async fn record_unblock(&self, ip: &str) {
        self.push(EventKind::IpUnblocked, ip, String::new()).await;
    }

    /// Most recent events first, optionally filtered by kind
    pub async fn recent(&self, limit: usize, kind: Option<EventKind>) -> Vec<SecurityEvent> {
        self.events
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> SecurityStats {
        let c = &self.counters;
        SecurityStats {
            total_requests: c.total_requests.load(Ordering::Relaxed),
            threats_detected: c.threats_detected.load(Ordering::Relaxed),
            blocked_requests: c.blocked_requests.load(Ordering::Relaxed),
            rate_limited_requests: c.rate_limited_requests.load(Ordering::Relaxed),
            ip_blocks: c.ip_blocks.load(Ordering::Relaxed),
            threats_by_category: ThreatCategory::ALL
                .iter()
                .map(|cat| {
                    (
                        cat.as_str().to_string(),
                        c.by_category[cat.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::threat_detector::{Location, Severity};

    fn threat(category: ThreatCategory) -> ThreatMatch {
        ThreatMatch {
            category,
            severity: Severity::High,
            location: Location::Path,
            snippet: "../".to_string(),
        }
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let events = SecurityEvents::new(3);
        for i in 0..5 {
            events.record_blocked_request(&format!("10.0.0.{}", i), "/").await;
        }

        let recent = events.recent(10, None).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].ip, "10.0.0.4");
        assert_eq!(recent[2].ip, "10.0.0.2");
        assert_eq!(events.snapshot().blocked_requests, 5);
    }

    #[tokio::test]
    async fn test_filter_and_counters() {
        let events = SecurityEvents::new(100);
        events.record_request();
        events.record_request();
        events
            .record_threats("10.0.0.1", "/x", &[threat(ThreatCategory::PathTraversal)])
            .await;
        events.record_rate_limited("10.0.0.2", "login", "/login").await;
        events.record_block("10.0.0.1", "threshold").await;
        events.record_unblock("10.0.0.1").await;

        let limited = events.recent(10, Some(EventKind::RateLimited)).await;
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].detail, "policy login on /login");

        let threats = events.recent(10, Some(EventKind::ThreatDetected)).await;
        assert_eq!(threats[0].detail, "/x path_traversal in path: ../");

        let stats = events.snapshot();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.threats_detected, 1);
        assert_eq!(stats.rate_limited_requests, 1);
        assert_eq!(stats.ip_blocks, 1);
        assert_eq!(stats.threats_by_category["path_traversal"], 1);
        assert_eq!(stats.threats_by_category["sql_injection"], 0);

        assert_eq!(events.recent(2, None).await.len(), 2);
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(EventKind::parse("ip_blocked"), Some(EventKind::IpBlocked));
        assert_eq!(EventKind::parse("other"), None);
    }
}
