//! Background maintenance for the request-defense layer.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time;

use crate::models::MonitoringConfig;

use super::ShieldState;

/// Periodically purges expired blocks and counters and logs a stats line
pub struct Monitoring {
    state: Arc<ShieldState>,
    config: MonitoringConfig,
}

impl Monitoring {
    pub fn new(state: Arc<ShieldState>, config: MonitoringConfig) -> Self {
        Self { state, config }
    }

    /// Run forever; spawn this on the runtime
    pub async fn start_monitoring(self) {
        if !self.config.enabled {
            info!("Monitoring disabled");
            return;
        }

        info!("Starting monitoring service...");
        let period = Duration::from_secs(self.config.purge_interval_seconds.max(1));
        let mut interval = time::interval(period);

        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }

    /// One maintenance pass; returns the number of purged entries
    pub async fn run_once(&self) -> usize {
        let purged = match self.state.registry.purge_expired().await {
            Ok(purged) => purged,
            Err(e) => {
                error!("Purging expired state failed: {}", e);
                return 0;
            }
        };
        if purged > 0 {
            info!("Purged {} expired entries", purged);
        }

        let stats = self.state.events.snapshot();
        debug!(
            "requests={} threats={} blocked={} rate_limited={} ip_blocks={}",
            stats.total_requests,
            stats.threats_detected,
            stats.blocked_requests,
            stats.rate_limited_requests,
            stats.ip_blocks
        );
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Store;
    use crate::models::{BlockSource, Config};

    #[tokio::test]
    async fn test_run_once_purges_expired_blocks() {
        let state = Arc::new(ShieldState::new(Config::default(), Store::memory()).unwrap());
        state
            .registry
            .block("192.0.2.9", "test", BlockSource::Manual, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let monitoring = Monitoring::new(state.clone(), MonitoringConfig::default());
        assert_eq!(monitoring.run_once().await, 1);
        assert_eq!(monitoring.run_once().await, 0);
    }
}
