//! Background sync worker
//!
//! Every poll interval: claim up to `max_in_flight` items, execute them
//! concurrently, record each outcome, then write the heartbeat.

use crate::config::WorkerConfig;
use crate::executor::SyncExecutor;
use crate::metrics::SyncMetrics;
use crate::queue::QueueHandle;
use crate::types::{Failure, Heartbeat, Outcome, QueueItem};
use crate::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

/// Summary of one loop iteration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct SyncWorker {
    queue: QueueHandle,
    executor: Arc<SyncExecutor>,
    config: WorkerConfig,
    metrics: Option<SyncMetrics>,
}

impl SyncWorker {
    pub fn new(
        queue: QueueHandle,
        executor: Arc<SyncExecutor>,
        config: WorkerConfig,
        metrics: Option<SyncMetrics>,
    ) -> Self {
        Self {
            queue,
            executor,
            config,
            metrics,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_in_flight = self.config.max_in_flight,
            "Sync worker started"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!("Sync loop iteration failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sync worker stopped");
    }

    /// One loop iteration
    pub async fn run_once(&self) -> Result<IterationReport> {
        if let Some(metrics) = &self.metrics {
            metrics.record_loop_iteration();
        }

        let result = self.process_batch().await;

        let last_error = match &result {
            Ok((_, last_failure)) => last_failure.clone(),
            Err(e) => Some(e.to_string()),
        };
        let heartbeat = Heartbeat {
            last_loop_at: Some(Utc::now()),
            last_error,
        };
        if let Err(e) = self.queue.put_heartbeat(heartbeat).await {
            tracing::warn!("Failed to write heartbeat: {}", e);
        }

        result.map(|(report, _)| report)
    }

    async fn process_batch(&self) -> Result<(IterationReport, Option<String>)> {
        let mut report = IterationReport::default();
        let mut last_failure = None;

        // A failed claim ends claiming for this round; whatever was already
        // claimed still runs so nothing is left in_flight.
        let mut claim_error = None;
        let mut claimed: Vec<QueueItem> = Vec::new();
        while claimed.len() < self.config.max_in_flight.max(1) {
            match self.queue.claim_next(Utc::now()).await {
                Ok(Some(item)) => claimed.push(item),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(claimed = claimed.len(), "Failed to claim sync item: {}", e);
                    claim_error = Some(e);
                    break;
                }
            }
        }
        report.claimed = claimed.len();
        if claimed.is_empty() {
            return match claim_error {
                Some(e) => Err(e),
                None => Ok((report, None)),
            };
        }

        let mut unresolved: HashSet<Uuid> = claimed.iter().map(|i| i.id).collect();
        let mut tasks = JoinSet::new();
        for item in claimed {
            let executor = self.executor.clone();
            let item_timeout = self.config.item_timeout();
            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(item_timeout, executor.execute(&item)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::Failed(Failure::Retryable(format!(
                        "Sync timed out after {:?}",
                        item_timeout
                    ))),
                };
                (item.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((item_id, outcome)) => {
                    unresolved.remove(&item_id);
                    if let Outcome::Failed(failure) = &outcome {
                        last_failure = Some(failure.reason().to_string());
                        report.failed += 1;
                    } else {
                        report.succeeded += 1;
                    }
                    self.record(item_id, outcome).await;
                }
                Err(e) => tracing::error!("Sync task aborted: {}", e),
            }
        }

        // Items whose task died go back through the retry policy
        for item_id in unresolved {
            let reason = "Sync task aborted".to_string();
            last_failure = Some(reason.clone());
            report.failed += 1;
            self.record(item_id, Outcome::Failed(Failure::Retryable(reason)))
                .await;
        }

        match claim_error {
            Some(e) => Err(e),
            None => Ok((report, last_failure)),
        }
    }

    async fn record(&self, item_id: Uuid, outcome: Outcome) {
        if let Err(e) = self.queue.mark_result(item_id, outcome, Utc::now()).await {
            tracing::error!(item_id = %item_id, "Failed to record sync outcome: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::loans::{InMemoryLoanRepository, LoanRepository};
    use crate::los::MockLosClient;
    use crate::queue::spawn_queue_actor;
    use crate::retry::RetryPolicy;
    use crate::storage::Storage;
    use crate::types::{LocalLoan, LogStatus, QueueState, SyncMode};
    use crate::Config;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        worker: SyncWorker,
        queue: QueueHandle,
        los: Arc<MockLosClient>,
        _temp: TempDir,
    }

    async fn harness(max_retries: u32) -> Harness {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.retry = RetryConfig {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };
        config.breaker.failure_threshold = 100;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let queue = spawn_queue_actor(storage, RetryPolicy::new(config.retry.clone()), None, 100);

        let loans = Arc::new(InMemoryLoanRepository::new());
        for (id, external) in [("app-1", "1001"), ("app-2", "1002")] {
            loans
                .put(LocalLoan {
                    id: id.to_string(),
                    business_name: None,
                    requested_amount: Some(Decimal::new(42_000, 0)),
                    status: "in_review".to_string(),
                    officer_name: None,
                    external_loan_id: Some(external.to_string()),
                    target_close_date: None,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let los = Arc::new(MockLosClient::seeded());
        let executor = Arc::new(SyncExecutor::new(&config, los.clone(), loans, None));
        let worker = SyncWorker::new(queue.clone(), executor, config.worker.clone(), None);

        Harness {
            worker,
            queue,
            los,
            _temp: temp,
        }
    }

    #[tokio::test]
    async fn test_run_once_resolves_items_and_writes_heartbeat() {
        let h = harness(3).await;
        let a = h.queue.enqueue("app-1", SyncMode::DryRun, None).await.unwrap();
        let b = h.queue.enqueue("app-2", SyncMode::Commit, None).await.unwrap();

        let report = h.worker.run_once().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.succeeded, 2);

        for id in [a.id, b.id] {
            let item = h.queue.get_item(id).await.unwrap().unwrap();
            assert_eq!(item.status.state(), QueueState::Success);
        }

        let heartbeat = h.queue.get_heartbeat().await.unwrap().unwrap();
        assert!(heartbeat.last_loop_at.is_some());
        assert!(heartbeat.last_error.is_none());
    }

    #[tokio::test]
    async fn test_same_loan_items_run_in_separate_iterations() {
        let h = harness(3).await;
        h.queue.enqueue("app-1", SyncMode::DryRun, None).await.unwrap();
        h.queue.enqueue("app-1", SyncMode::Commit, None).await.unwrap();

        assert_eq!(h.worker.run_once().await.unwrap().claimed, 1);
        assert_eq!(h.worker.run_once().await.unwrap().claimed, 1);
        assert_eq!(h.worker.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn test_outage_dead_letters_after_max_attempts() {
        let h = harness(2).await;
        h.los.set_available(false);
        let item = h.queue.enqueue("app-1", SyncMode::DryRun, None).await.unwrap();

        for _ in 0..3 {
            h.worker.run_once().await.unwrap();
        }

        let stored = h.queue.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status.state(), QueueState::DeadLetter);
        assert_eq!(stored.attempts, 3);

        let log = h.queue.get_log(item.id).await.unwrap().unwrap();
        assert_eq!(log.status, LogStatus::DeadLetter);

        let heartbeat = h.queue.get_heartbeat().await.unwrap().unwrap();
        assert!(heartbeat.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_item_timeout_is_retried() {
        let mut h = harness(3).await;
        h.worker.config.item_timeout_ms = 20;
        h.los.set_latency(Duration::from_millis(300));
        let item = h.queue.enqueue("app-1", SyncMode::DryRun, None).await.unwrap();

        let report = h.worker.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = h.queue.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status.state(), QueueState::Pending);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_claim_failure_still_resolves_claimed_items() {
        let h = harness(3).await;
        let first = h.queue.enqueue("app-1", SyncMode::DryRun, None).await.unwrap();
        let second = h.queue.enqueue("app-2", SyncMode::DryRun, None).await.unwrap();

        // A second connection makes claims of app-2 fail
        let conn = rusqlite::Connection::open(h._temp.path().join("los_sync.db")).unwrap();
        conn.execute_batch(
            r#"
            CREATE TRIGGER fail_app2_claim BEFORE UPDATE OF state ON sync_items
            WHEN NEW.loan_id = 'app-2' AND NEW.state = 'in_flight'
            BEGIN SELECT RAISE(ABORT, 'transient'); END;
            "#,
        )
        .unwrap();

        let err = h.worker.run_once().await.unwrap_err();
        assert!(err.to_string().contains("transient"), "{}", err);

        let stored = h.queue.get_item(first.id).await.unwrap().unwrap();
        assert_eq!(stored.status.state(), QueueState::Success);
        assert_eq!(stored.attempts, 1);

        let heartbeat = h.queue.get_heartbeat().await.unwrap().unwrap();
        assert!(heartbeat.last_error.unwrap().contains("transient"));

        conn.execute_batch("DROP TRIGGER fail_app2_claim;").unwrap();
        let report = h.worker.run_once().await.unwrap();
        assert_eq!(report.claimed, 1);

        let stored = h.queue.get_item(second.id).await.unwrap().unwrap();
        assert_eq!(stored.status.state(), QueueState::Success);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_worker() {
        let h = harness(3).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
