//! Dashboard Aggregator
//!
//! Rolls queue state and worker liveness into [`DashboardStats`]. Never
//! fails: when the store cannot be read the caller still gets a renderable
//! payload marked stale.

use crate::config::DashboardConfig;
use crate::queue::SyncStateSource;
use crate::types::{Availability, AvailabilityKind, DashboardStats, Heartbeat};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub struct DashboardAggregator {
    source: Arc<dyn SyncStateSource>,
    config: DashboardConfig,
}

impl std::fmt::Debug for DashboardAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardAggregator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DashboardAggregator {
    pub fn new(source: Arc<dyn SyncStateSource>, config: DashboardConfig) -> Self {
        Self { source, config }
    }

    /// Read everything the dashboard shows, tagged with how much of it is live
    pub async fn collect(&self, now: DateTime<Utc>) -> Availability<DashboardStats> {
        let counts = self.source.outcome_counts().await;
        let depth = self.source.depth().await;
        let logs = self.source.recent_logs(self.config.recent_logs_limit).await;

        let (counts, depth, recent_logs) = match (counts, depth, logs) {
            (Ok(c), Ok(d), Ok(l)) => (c, d, l),
            (c, d, l) => {
                let reason = [c.err(), d.err(), l.err()]
                    .into_iter()
                    .flatten()
                    .next()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                tracing::warn!("Dashboard store unavailable: {}", reason);
                return Availability::Unavailable;
            }
        };

        let mut stats = DashboardStats {
            synced_count: counts.success,
            pending_count: depth.pending,
            error_count: counts.error + counts.dead_letter,
            queue_depth: depth,
            recent_logs,
            stale: true,
            last_loop_at: None,
            last_error: None,
            availability: AvailabilityKind::Connected,
        };

        match self.source.heartbeat().await {
            Ok(heartbeat) => {
                let heartbeat = heartbeat.unwrap_or_default();
                stats.stale = self.is_stale(&heartbeat, now);
                stats.last_loop_at = heartbeat.last_loop_at;
                stats.last_error = heartbeat.last_error;
                Availability::Connected(stats)
            }
            Err(e) => {
                tracing::warn!("Heartbeat unavailable: {}", e);
                stats.last_error = Some(format!("Heartbeat unavailable: {}", e));
                stats.availability = AvailabilityKind::Degraded;
                Availability::Degraded(stats)
            }
        }
    }

    /// Dashboard payload, always renderable
    pub async fn stats(&self, now: DateTime<Utc>) -> DashboardStats {
        match self.collect(now).await {
            Availability::Connected(stats) | Availability::Degraded(stats) => stats,
            Availability::Unavailable => DashboardStats::zeroed("Sync store unavailable"),
        }
    }

    fn is_stale(&self, heartbeat: &Heartbeat, now: DateTime<Utc>) -> bool {
        match heartbeat.last_loop_at {
            Some(last) => now - last > Duration::seconds(self.config.stale_after_seconds),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutcomeCounts, QueueDepth, SyncLogEntry};
    use crate::{Error, Result};
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeSource {
        store_down: bool,
        heartbeat_down: bool,
        heartbeat: Option<Heartbeat>,
    }

    #[async_trait]
    impl SyncStateSource for FakeSource {
        async fn outcome_counts(&self) -> Result<OutcomeCounts> {
            if self.store_down {
                return Err(Error::Storage("disk I/O error".to_string()));
            }
            Ok(OutcomeCounts {
                success: 7,
                error: 2,
                dead_letter: 1,
            })
        }

        async fn depth(&self) -> Result<QueueDepth> {
            if self.store_down {
                return Err(Error::Storage("disk I/O error".to_string()));
            }
            Ok(QueueDepth {
                pending: 3,
                in_flight: 1,
                dead_letter: 1,
            })
        }

        async fn recent_logs(&self, _limit: usize) -> Result<Vec<SyncLogEntry>> {
            if self.store_down {
                return Err(Error::Storage("disk I/O error".to_string()));
            }
            Ok(Vec::new())
        }

        async fn heartbeat(&self) -> Result<Option<Heartbeat>> {
            if self.heartbeat_down {
                return Err(Error::Storage("heartbeat table locked".to_string()));
            }
            Ok(self.heartbeat.clone())
        }
    }

    fn aggregator(source: FakeSource) -> DashboardAggregator {
        DashboardAggregator::new(Arc::new(source), DashboardConfig::default())
    }

    #[tokio::test]
    async fn test_rollup_counts() {
        let now = Utc::now();
        let stats = aggregator(FakeSource {
            heartbeat: Some(Heartbeat {
                last_loop_at: Some(now - Duration::seconds(5)),
                last_error: None,
            }),
            ..Default::default()
        })
        .stats(now)
        .await;

        assert_eq!(stats.synced_count, 7);
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.error_count, 3);
        assert!(!stats.stale);
        assert_eq!(stats.availability, AvailabilityKind::Connected);
    }

    #[tokio::test]
    async fn test_stale_after_threshold() {
        let now = Utc::now();
        let stats = aggregator(FakeSource {
            heartbeat: Some(Heartbeat {
                last_loop_at: Some(now - Duration::seconds(301)),
                last_error: Some("timeout".to_string()),
            }),
            ..Default::default()
        })
        .stats(now)
        .await;

        assert!(stats.stale);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_no_heartbeat_is_stale() {
        let stats = aggregator(FakeSource::default()).stats(Utc::now()).await;
        assert!(stats.stale);
        assert_eq!(stats.synced_count, 7);
    }

    #[tokio::test]
    async fn test_store_outage_renders_zeroed_payload() {
        let agg = aggregator(FakeSource {
            store_down: true,
            ..Default::default()
        });

        assert_eq!(agg.collect(Utc::now()).await, Availability::Unavailable);

        let stats = agg.stats(Utc::now()).await;
        assert!(stats.stale);
        assert_eq!(stats.synced_count, 0);
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.availability, AvailabilityKind::Unavailable);
    }

    #[tokio::test]
    async fn test_heartbeat_outage_is_degraded() {
        let stats = aggregator(FakeSource {
            heartbeat_down: true,
            ..Default::default()
        })
        .stats(Utc::now())
        .await;

        assert!(stats.stale);
        assert_eq!(stats.synced_count, 7);
        assert_eq!(stats.availability, AvailabilityKind::Degraded);
    }
}
