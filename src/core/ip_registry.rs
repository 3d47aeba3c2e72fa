//! IP reputation store.
//!
//! Tracks blocked IPs with optional expiry, accumulates weighted violations
//! reported by the threat scanner and blocks an IP automatically once its
//! violations cross the configured threshold. Also guards against request
//! floods from a single IP.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ipnet::IpNet;
use log::{info, warn};

use crate::error::{PolicyError, ShieldError, StoreError};
use crate::models::{BlockEntry, BlockSource, BlockingConfig};
use crate::utils::{checked_expiry, format_key, now_millis};

use super::store::Store;

/// Outcome of reporting a violation
#[derive(Debug, Clone)]
pub struct ViolationOutcome {
    /// Violation weight accumulated in the current window
    pub total: u32,
    /// Set when this violation caused the IP to be blocked
    pub blocked: Option<BlockEntry>,
}

pub struct IpRegistry {
    store: Arc<Store>,
    config: BlockingConfig,
    allowlist: Vec<IpNet>,
}

impl IpRegistry {
    pub fn new(store: Arc<Store>, config: BlockingConfig) -> Result<Self, PolicyError> {
        let allowlist = config
            .allowlist
            .iter()
            .map(|entry| parse_network(entry))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            store,
            config,
            allowlist,
        })
    }

    pub fn is_allowlisted(&self, ip: &str) -> bool {
        match ip.parse::<IpAddr>() {
            Ok(addr) => self.allowlist.iter().any(|net| net.contains(&addr)),
            Err(_) => false,
        }
    }

    /// Return the live block record for `ip`, if any
    pub async fn is_blocked(&self, ip: &str) -> Result<Option<BlockEntry>, StoreError> {
        if self.is_allowlisted(ip) {
            return Ok(None);
        }
        self.store.get_block(ip, now_millis()).await
    }

    /// Block `ip` for `duration`, or permanently when `duration` is `None`
    pub async fn block(
        &self,
        ip: &str,
        reason: &str,
        source: BlockSource,
        duration: Option<Duration>,
    ) -> Result<BlockEntry, ShieldError> {
        self.block_with_violations(ip, reason, source, duration, 0).await
    }

    async fn block_with_violations(
        &self,
        ip: &str,
        reason: &str,
        source: BlockSource,
        duration: Option<Duration>,
        violations: u32,
    ) -> Result<BlockEntry, ShieldError> {
        if self.is_allowlisted(ip) {
            return Err(ShieldError::Allowlisted(ip.to_string()));
        }

        let blocked_at = Utc::now();
        let now = blocked_at.timestamp_millis();
        let expires_at = match duration {
            Some(d) => Some(checked_expiry(blocked_at, d).ok_or(ShieldError::InvalidDuration(d.as_secs()))?),
            None => None,
        };
        let entry = BlockEntry {
            ip: ip.to_string(),
            reason: reason.to_string(),
            source,
            blocked_at,
            expires_at,
            violations,
        };
        self.store.put_block(&entry, now).await?;

        metrics::increment_counter!("shield_ip_blocks_total");
        match entry.expires_at {
            Some(until) => warn!("Blocked {} until {} ({:?}): {}", ip, until, source, reason),
            None => warn!("Blocked {} permanently ({:?}): {}", ip, source, reason),
        }

        Ok(entry)
    }

    /// Lift a block and forget accumulated violations
    pub async fn unblock(&self, ip: &str) -> Result<bool, StoreError> {
        let existed = self.store.remove_block(ip).await?;
        self.store.clear_violations(ip).await?;
        if existed {
            info!("Unblocked {}", ip);
        }
        Ok(existed)
    }

    /// Add `weight` to the violation counter of `ip`, blocking it when the
    /// threshold is reached
    pub async fn record_violation(
        &self,
        ip: &str,
        weight: u32,
        reason: &str,
    ) -> Result<ViolationOutcome, ShieldError> {
        if self.is_allowlisted(ip) {
            return Ok(ViolationOutcome {
                total: 0,
                blocked: None,
            });
        }

        let total = self
            .store
            .add_violations(ip, weight, self.config.violation_window_seconds, now_millis())
            .await?;

        if total < self.config.block_threshold {
            return Ok(ViolationOutcome {
                total,
                blocked: None,
            });
        }

        let entry = self
            .block_with_violations(
                ip,
                reason,
                BlockSource::ThreatScan,
                Some(self.block_duration()),
                total,
            )
            .await?;
        self.store.clear_violations(ip).await?;

        Ok(ViolationOutcome {
            total,
            blocked: Some(entry),
        })
    }

    /// Count a request from `ip` against the flood window; blocks the IP and
    /// returns the record when the flood threshold is exceeded
    pub async fn check_flood(&self, ip: &str) -> Result<Option<BlockEntry>, ShieldError> {
        if self.config.flood_threshold == 0 || self.is_allowlisted(ip) {
            return Ok(None);
        }

        let window_ms = self.config.flood_window_seconds as i64 * 1000;
        let state = self
            .store
            .hit_window(
                &format_key("flood", ip),
                self.config.flood_threshold,
                window_ms,
                now_millis(),
            )
            .await?;

        if state.allowed {
            return Ok(None);
        }

        let reason = format!(
            "more than {} requests in {}s",
            self.config.flood_threshold, self.config.flood_window_seconds
        );
        let entry = self
            .block(ip, &reason, BlockSource::Flood, Some(self.block_duration()))
            .await?;
        self.store.reset_window(&format_key("flood", ip)).await?;
        Ok(Some(entry))
    }

    pub async fn list_blocked(&self) -> Result<Vec<BlockEntry>, StoreError> {
        self.store.list_blocks(now_millis()).await
    }

    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(now_millis()).await
    }

    fn block_duration(&self) -> Duration {
        Duration::from_secs(self.config.block_duration_seconds)
    }
}

fn parse_network(entry: &str) -> Result<IpNet, PolicyError> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| PolicyError::InvalidAllowlistEntry(entry.to_string()))
}

/// Seconds remaining on a block, `None` when permanent
pub fn remaining_secs(entry: &BlockEntry) -> Option<i64> {
    entry
        .expires_at
        .map(|at| (at - Utc::now()).num_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(config: BlockingConfig) -> IpRegistry {
        IpRegistry::new(Arc::new(Store::memory()), config).unwrap()
    }

    fn config() -> BlockingConfig {
        BlockingConfig {
            block_threshold: 5,
            violation_window_seconds: 60,
            block_duration_seconds: 300,
            allowlist: vec!["127.0.0.1".to_string(), "10.1.0.0/16".to_string()],
            flood_threshold: 3,
            flood_window_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_manual_block_and_unblock() {
        let registry = registry(config());

        let entry = registry
            .block("203.0.113.7", "abuse report", BlockSource::Manual, None)
            .await
            .unwrap();
        assert!(entry.expires_at.is_none());
        assert_eq!(remaining_secs(&entry), None);

        let found = registry.is_blocked("203.0.113.7").await.unwrap().unwrap();
        assert_eq!(found.reason, "abuse report");
        assert_eq!(found.source, BlockSource::Manual);

        assert!(registry.unblock("203.0.113.7").await.unwrap());
        assert!(registry.is_blocked("203.0.113.7").await.unwrap().is_none());
        assert!(!registry.unblock("203.0.113.7").await.unwrap());
    }

    #[tokio::test]
    async fn test_temporary_block_has_expiry() {
        let registry = registry(config());
        let entry = registry
            .block(
                "203.0.113.8",
                "spam",
                BlockSource::Manual,
                Some(Duration::from_secs(120)),
            )
            .await
            .unwrap();

        let remaining = remaining_secs(&entry).unwrap();
        assert!(remaining > 100 && remaining <= 120);
    }

    #[tokio::test]
    async fn test_unrepresentable_duration_rejected() {
        let registry = registry(config());

        for secs in [10_000_000_000_000, u64::MAX] {
            let err = registry
                .block("203.0.113.9", "forever", BlockSource::Manual, Some(Duration::from_secs(secs)))
                .await
                .unwrap_err();
            assert!(matches!(err, ShieldError::InvalidDuration(s) if s == secs));
        }
        assert!(registry.is_blocked("203.0.113.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_violations_trigger_block() {
        let registry = registry(config());

        let first = registry.record_violation("198.51.100.1", 3, "xss").await.unwrap();
        assert_eq!(first.total, 3);
        assert!(first.blocked.is_none());
        assert!(registry.is_blocked("198.51.100.1").await.unwrap().is_none());

        let second = registry.record_violation("198.51.100.1", 2, "xss").await.unwrap();
        assert_eq!(second.total, 5);
        let entry = second.blocked.unwrap();
        assert_eq!(entry.source, BlockSource::ThreatScan);
        assert_eq!(entry.violations, 5);
        assert!(entry.expires_at.is_some());
        assert!(registry.is_blocked("198.51.100.1").await.unwrap().is_some());

        // The counter restarts after a block
        registry.unblock("198.51.100.1").await.unwrap();
        let again = registry.record_violation("198.51.100.1", 1, "xss").await.unwrap();
        assert_eq!(again.total, 1);
    }

    #[tokio::test]
    async fn test_allowlist() {
        let registry = registry(config());

        assert!(registry.is_allowlisted("127.0.0.1"));
        assert!(registry.is_allowlisted("10.1.200.3"));
        assert!(!registry.is_allowlisted("10.2.0.1"));
        assert!(!registry.is_allowlisted("not-an-ip"));

        let err = registry
            .block("10.1.0.9", "test", BlockSource::Manual, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShieldError::Allowlisted(_)));

        let outcome = registry.record_violation("127.0.0.1", 100, "sqli").await.unwrap();
        assert!(outcome.blocked.is_none());
    }

    #[test]
    fn test_invalid_allowlist_entry() {
        let mut cfg = config();
        cfg.allowlist.push("10.0.0.0/99".to_string());
        let err = IpRegistry::new(Arc::new(Store::memory()), cfg).err().unwrap();
        assert_eq!(err, PolicyError::InvalidAllowlistEntry("10.0.0.0/99".to_string()));
    }

    #[tokio::test]
    async fn test_flood_blocks_ip() {
        let registry = registry(config());

        for _ in 0..3 {
            assert!(registry.check_flood("192.0.2.50").await.unwrap().is_none());
        }
        let entry = registry.check_flood("192.0.2.50").await.unwrap().unwrap();
        assert_eq!(entry.source, BlockSource::Flood);
        assert!(registry.is_blocked("192.0.2.50").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_flood_disabled() {
        let mut cfg = config();
        cfg.flood_threshold = 0;
        let registry = registry(cfg);

        for _ in 0..10 {
            assert!(registry.check_flood("192.0.2.51").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_list_blocked() {
        let registry = registry(config());
        registry.block("192.0.2.1", "a", BlockSource::Manual, None).await.unwrap();
        registry.block("192.0.2.2", "b", BlockSource::Manual, None).await.unwrap();

        assert_eq!(registry.list_blocked().await.unwrap().len(), 2);
    }
}
