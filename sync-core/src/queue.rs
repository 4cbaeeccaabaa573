//! Outbound sync queue
//!
//! All queue mutations go through one actor task that owns the store, so
//! claims never race each other and every transition is applied in order.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  HTTP handlers / SyncWorker / DashboardAggregator     │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               QueueHandle (Clone)                     │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              QueueActor (single task)                 │
//! │   validation, retry policy, replay idempotence        │
//! └─────────────────────┬────────────────────────────────┘
//!                       ▼
//!          Storage (SQLite, one transaction per step)
//! ```

use crate::metrics::SyncMetrics;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::Storage;
use crate::types::{
    Failure, Heartbeat, LogStatus, OutcomeCounts, Outcome, QueueDepth, QueueItem, QueueState,
    SyncLogEntry, SyncMode, SyncStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Longest accepted operator note, in characters
pub const MAX_NOTE_CHARS: usize = 2000;

/// Message sent to the queue actor
#[derive(Debug)]
pub enum QueueMessage {
    Enqueue {
        loan_id: String,
        mode: SyncMode,
        note: Option<String>,
        response: oneshot::Sender<Result<QueueItem>>,
    },

    ClaimNext {
        now: DateTime<Utc>,
        response: oneshot::Sender<Result<Option<QueueItem>>>,
    },

    MarkResult {
        item_id: Uuid,
        outcome: Outcome,
        now: DateTime<Utc>,
        response: oneshot::Sender<Result<QueueItem>>,
    },

    Replay {
        log_id: Uuid,
        response: oneshot::Sender<Result<QueueItem>>,
    },

    RecoverInFlight {
        response: oneshot::Sender<Result<usize>>,
    },

    Depth {
        response: oneshot::Sender<Result<QueueDepth>>,
    },

    OutcomeCounts {
        response: oneshot::Sender<Result<OutcomeCounts>>,
    },

    GetItem {
        item_id: Uuid,
        response: oneshot::Sender<Result<Option<QueueItem>>>,
    },

    GetLog {
        log_id: Uuid,
        response: oneshot::Sender<Result<Option<SyncLogEntry>>>,
    },

    RecentLogs {
        limit: usize,
        response: oneshot::Sender<Result<Vec<SyncLogEntry>>>,
    },

    LoanLogs {
        loan_id: String,
        limit: usize,
        response: oneshot::Sender<Result<Vec<SyncLogEntry>>>,
    },

    DeadLetters {
        limit: usize,
        response: oneshot::Sender<Result<Vec<SyncLogEntry>>>,
    },

    PutHeartbeat {
        heartbeat: Heartbeat,
        response: oneshot::Sender<Result<()>>,
    },

    GetHeartbeat {
        response: oneshot::Sender<Result<Option<Heartbeat>>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the queue store
pub struct QueueActor {
    storage: Arc<Storage>,
    mailbox: mpsc::Receiver<QueueMessage>,
    retry: RetryPolicy,
    metrics: Option<SyncMetrics>,
}

impl QueueActor {
    pub fn new(
        storage: Arc<Storage>,
        mailbox: mpsc::Receiver<QueueMessage>,
        retry: RetryPolicy,
        metrics: Option<SyncMetrics>,
    ) -> Self {
        Self {
            storage,
            mailbox,
            retry,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let QueueMessage::Shutdown = msg {
                tracing::info!("Queue actor shutting down");
                break;
            }
            self.handle_message(msg);
        }
    }

    fn handle_message(&mut self, msg: QueueMessage) {
        match msg {
            QueueMessage::Enqueue {
                loan_id,
                mode,
                note,
                response,
            } => {
                let _ = response.send(self.enqueue(&loan_id, mode, note));
            }

            QueueMessage::ClaimNext { now, response } => {
                let result = self.storage.claim_next(now);
                if let Ok(Some(item)) = &result {
                    tracing::debug!(
                        item_id = %item.id,
                        loan_id = %item.loan_id,
                        attempt = item.attempts,
                        "Item claimed"
                    );
                }
                self.publish_depth();
                let _ = response.send(result);
            }

            QueueMessage::MarkResult {
                item_id,
                outcome,
                now,
                response,
            } => {
                let result = self.mark_result(item_id, outcome, now);
                self.publish_depth();
                let _ = response.send(result);
            }

            QueueMessage::Replay { log_id, response } => {
                let _ = response.send(self.replay(log_id));
            }

            QueueMessage::RecoverInFlight { response } => {
                let result = self.storage.recover_in_flight(Utc::now());
                if let Ok(n) = &result {
                    if *n > 0 {
                        tracing::warn!("Recovered {} in-flight items to pending", n);
                    }
                }
                self.publish_depth();
                let _ = response.send(result);
            }

            QueueMessage::Depth { response } => {
                let _ = response.send(self.storage.queue_depth());
            }

            QueueMessage::OutcomeCounts { response } => {
                let _ = response.send(self.storage.outcome_counts());
            }

            QueueMessage::GetItem { item_id, response } => {
                let _ = response.send(self.storage.get_item(item_id));
            }

            QueueMessage::GetLog { log_id, response } => {
                let _ = response.send(self.storage.get_log(log_id));
            }

            QueueMessage::RecentLogs { limit, response } => {
                let _ = response.send(self.storage.recent_logs(limit));
            }

            QueueMessage::LoanLogs {
                loan_id,
                limit,
                response,
            } => {
                let _ = response.send(self.storage.loan_logs(&loan_id, limit));
            }

            QueueMessage::DeadLetters { limit, response } => {
                let _ = response.send(self.storage.dead_letter_logs(limit));
            }

            QueueMessage::PutHeartbeat {
                heartbeat,
                response,
            } => {
                let _ = response.send(self.storage.put_heartbeat(&heartbeat, Utc::now()));
            }

            QueueMessage::GetHeartbeat { response } => {
                let _ = response.send(self.storage.get_heartbeat());
            }

            QueueMessage::Shutdown => {}
        }
    }

    fn enqueue(&self, loan_id: &str, mode: SyncMode, note: Option<String>) -> Result<QueueItem> {
        let loan_id = loan_id.trim();
        if loan_id.is_empty() {
            return Err(Error::Validation("loanId must not be empty".to_string()));
        }

        let note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        if let Some(note) = &note {
            if note.chars().count() > MAX_NOTE_CHARS {
                return Err(Error::Validation(format!(
                    "note exceeds {} characters",
                    MAX_NOTE_CHARS
                )));
            }
        }

        let item = self
            .storage
            .insert_item(loan_id, mode, note.as_deref(), None, Utc::now())?;

        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued();
        }
        self.publish_depth();

        tracing::info!(item_id = %item.id, loan_id, mode = %mode, "Sync enqueued");

        Ok(item)
    }

    fn mark_result(&self, item_id: Uuid, outcome: Outcome, now: DateTime<Utc>) -> Result<QueueItem> {
        let item = self
            .storage
            .get_item(item_id)?
            .ok_or_else(|| Error::NotFound(format!("Queue item {}", item_id)))?;

        if item.status.state() != QueueState::InFlight {
            return Err(Error::InvalidState(format!(
                "Item {} is {}, expected in_flight",
                item_id,
                item.status.state()
            )));
        }

        let (result, label) = match outcome {
            Outcome::Succeeded {
                summary,
                committed_fields,
            } => (
                self.storage
                    .finish_item(item_id, &SyncStatus::Success, &summary, &committed_fields, now),
                "success",
            ),

            Outcome::Failed(Failure::Terminal(reason)) => {
                tracing::warn!(item_id = %item_id, loan_id = %item.loan_id, "Sync failed: {}", reason);
                (
                    self.storage.finish_item(
                        item_id,
                        &SyncStatus::Error {
                            reason: reason.clone(),
                        },
                        &reason,
                        &[],
                        now,
                    ),
                    "error",
                )
            }

            Outcome::Failed(Failure::Retryable(reason)) => {
                match self.retry.decide(item.attempts, now) {
                    RetryDecision::Retry { next_attempt_at } => {
                        tracing::warn!(
                            item_id = %item_id,
                            attempt = item.attempts,
                            max_attempts = self.retry.max_attempts(),
                            "Sync attempt failed, retrying: {}",
                            reason
                        );
                        (
                            self.storage
                                .reschedule_item(item_id, next_attempt_at, &reason, now),
                            "retry",
                        )
                    }
                    RetryDecision::DeadLetter => {
                        tracing::error!(
                            item_id = %item_id,
                            loan_id = %item.loan_id,
                            attempts = item.attempts,
                            "Retries exhausted, dead-lettering: {}",
                            reason
                        );
                        let message =
                            format!("Failed after {} attempts: {}", item.attempts, reason);
                        (
                            self.storage.finish_item(
                                item_id,
                                &SyncStatus::DeadLetter {
                                    reason,
                                    attempts: item.attempts,
                                },
                                &message,
                                &[],
                                now,
                            ),
                            "dead_letter",
                        )
                    }
                }
            }
        };

        if result.is_ok() {
            if let Some(metrics) = &self.metrics {
                metrics.record_outcome(label);
            }
        }

        result
    }

    fn replay(&self, log_id: Uuid) -> Result<QueueItem> {
        let entry = self
            .storage
            .get_log(log_id)?
            .filter(|e| e.status == LogStatus::DeadLetter)
            .ok_or_else(|| Error::NotFound(format!("Dead-letter entry {}", log_id)))?;

        let original_id = entry.item_id.unwrap_or(entry.id);
        let original = self
            .storage
            .get_item(original_id)?
            .ok_or_else(|| Error::NotFound(format!("Queue item {}", original_id)))?;

        if let Some(existing) = self.storage.active_replay_of(original.id)? {
            tracing::info!(
                original = %original.id,
                replay = %existing.id,
                "Replay already outstanding"
            );
            return Ok(existing);
        }

        let item = self.storage.insert_item(
            &original.loan_id,
            original.mode,
            original.note.as_deref(),
            Some(original.id),
            Utc::now(),
        )?;

        if let Some(metrics) = &self.metrics {
            metrics.record_enqueued();
        }
        self.publish_depth();

        tracing::info!(original = %original.id, replay = %item.id, "Dead letter replayed");

        Ok(item)
    }

    fn publish_depth(&self) {
        if let Some(metrics) = &self.metrics {
            match self.storage.queue_depth() {
                Ok(depth) => metrics.update_queue_depth(&depth),
                Err(e) => tracing::debug!("Queue depth unavailable for metrics: {}", e),
            }
        }
    }
}

/// Handle for sending messages to the queue actor
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<QueueMessage>,
}

impl QueueHandle {
    pub fn new(sender: mpsc::Sender<QueueMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> QueueMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Add a pending item for a loan
    pub async fn enqueue(
        &self,
        loan_id: impl Into<String>,
        mode: SyncMode,
        note: Option<String>,
    ) -> Result<QueueItem> {
        let loan_id = loan_id.into();
        self.request(|response| QueueMessage::Enqueue {
            loan_id,
            mode,
            note,
            response,
        })
        .await
    }

    /// Claim the next eligible item, if any
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        self.request(|response| QueueMessage::ClaimNext { now, response })
            .await
    }

    /// Record the outcome of executing a claimed item
    pub async fn mark_result(
        &self,
        item_id: Uuid,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        self.request(|response| QueueMessage::MarkResult {
            item_id,
            outcome,
            now,
            response,
        })
        .await
    }

    /// Re-enqueue a dead-lettered entry
    pub async fn replay(&self, log_id: Uuid) -> Result<QueueItem> {
        self.request(|response| QueueMessage::Replay { log_id, response })
            .await
    }

    /// Return orphaned in-flight items to pending
    pub async fn recover_in_flight(&self) -> Result<usize> {
        self.request(|response| QueueMessage::RecoverInFlight { response })
            .await
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        self.request(|response| QueueMessage::Depth { response })
            .await
    }

    pub async fn outcome_counts(&self) -> Result<OutcomeCounts> {
        self.request(|response| QueueMessage::OutcomeCounts { response })
            .await
    }

    pub async fn get_item(&self, item_id: Uuid) -> Result<Option<QueueItem>> {
        self.request(|response| QueueMessage::GetItem { item_id, response })
            .await
    }

    pub async fn get_log(&self, log_id: Uuid) -> Result<Option<SyncLogEntry>> {
        self.request(|response| QueueMessage::GetLog { log_id, response })
            .await
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.request(|response| QueueMessage::RecentLogs { limit, response })
            .await
    }

    pub async fn loan_logs(&self, loan_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let loan_id = loan_id.to_string();
        self.request(|response| QueueMessage::LoanLogs {
            loan_id,
            limit,
            response,
        })
        .await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        self.request(|response| QueueMessage::DeadLetters { limit, response })
            .await
    }

    pub async fn put_heartbeat(&self, heartbeat: Heartbeat) -> Result<()> {
        self.request(|response| QueueMessage::PutHeartbeat {
            heartbeat,
            response,
        })
        .await
    }

    pub async fn get_heartbeat(&self) -> Result<Option<Heartbeat>> {
        self.request(|response| QueueMessage::GetHeartbeat { response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(QueueMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Read side of the sync state, as needed by the dashboard
#[async_trait]
pub trait SyncStateSource: Send + Sync {
    async fn outcome_counts(&self) -> Result<OutcomeCounts>;
    async fn depth(&self) -> Result<QueueDepth>;
    async fn recent_logs(&self, limit: usize) -> Result<Vec<SyncLogEntry>>;
    async fn heartbeat(&self) -> Result<Option<Heartbeat>>;
}

#[async_trait]
impl SyncStateSource for QueueHandle {
    async fn outcome_counts(&self) -> Result<OutcomeCounts> {
        QueueHandle::outcome_counts(self).await
    }

    async fn depth(&self) -> Result<QueueDepth> {
        QueueHandle::depth(self).await
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        QueueHandle::recent_logs(self, limit).await
    }

    async fn heartbeat(&self) -> Result<Option<Heartbeat>> {
        self.get_heartbeat().await
    }
}

/// Spawn the queue actor
pub fn spawn_queue_actor(
    storage: Arc<Storage>,
    retry: RetryPolicy,
    metrics: Option<SyncMetrics>,
    mailbox_capacity: usize,
) -> QueueHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = QueueActor::new(storage, rx, retry, metrics);

    tokio::spawn(async move {
        actor.run().await;
    });

    QueueHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::Config;
    use tempfile::TempDir;

    fn setup(max_retries: u32) -> (QueueHandle, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let retry = RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        });
        (spawn_queue_actor(storage, retry, None, 100), temp_dir)
    }

    fn retryable(reason: &str) -> Outcome {
        Outcome::Failed(Failure::Retryable(reason.to_string()))
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let (queue, _temp) = setup(3);

        let err = queue.enqueue("   ", SyncMode::DryRun, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let long_note = "x".repeat(MAX_NOTE_CHARS + 1);
        let err = queue
            .enqueue("L1", SyncMode::DryRun, Some(long_note))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(queue.depth().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_mark_result_requires_claim() {
        let (queue, _temp) = setup(3);
        let item = queue.enqueue("L1", SyncMode::DryRun, None).await.unwrap();

        let err = queue
            .mark_result(
                item.id,
                Outcome::Succeeded {
                    summary: "ok".to_string(),
                    committed_fields: vec![],
                },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_retryable_failures_dead_letter() {
        let (queue, _temp) = setup(2);
        let item = queue.enqueue("L1", SyncMode::Commit, None).await.unwrap();

        for attempt in 1..=3 {
            let claimed = queue.claim_next(Utc::now()).await.unwrap().unwrap();
            assert_eq!(claimed.attempts, attempt);
            queue
                .mark_result(item.id, retryable("timeout"), Utc::now())
                .await
                .unwrap();
        }

        let item = queue.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(
            item.status,
            SyncStatus::DeadLetter {
                reason: "timeout".to_string(),
                attempts: 3
            }
        );
        assert_eq!(queue.depth().await.unwrap().dead_letter, 1);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_not_retried() {
        let (queue, _temp) = setup(3);
        let item = queue.enqueue("L1", SyncMode::Commit, None).await.unwrap();
        queue.claim_next(Utc::now()).await.unwrap();

        let done = queue
            .mark_result(
                item.id,
                Outcome::Failed(Failure::Terminal("Invalid loan amount".to_string())),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(done.attempts, 1);
        assert_eq!(done.status.reason(), Some("Invalid loan amount"));

        let log = queue.get_log(item.id).await.unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Error);
        assert_eq!(log.message, "Invalid loan amount");
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_while_outstanding() {
        let (queue, _temp) = setup(0);
        let item = queue.enqueue("L1", SyncMode::Validate, None).await.unwrap();
        queue.claim_next(Utc::now()).await.unwrap();
        queue
            .mark_result(item.id, retryable("connection reset"), Utc::now())
            .await
            .unwrap();

        let first = queue.replay(item.id).await.unwrap();
        let second = queue.replay(item.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.replay_of, Some(item.id));
        assert_eq!(first.status, SyncStatus::Pending);

        // Original entry stays dead-lettered
        let original = queue.get_log(item.id).await.unwrap().unwrap();
        assert_eq!(original.status, LogStatus::DeadLetter);
    }

    #[tokio::test]
    async fn test_replay_rejects_non_dead_letter() {
        let (queue, _temp) = setup(3);
        let item = queue.enqueue("L1", SyncMode::DryRun, None).await.unwrap();

        assert!(matches!(
            queue.replay(item.id).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            queue.replay(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mailbox_closed_after_shutdown() {
        let (queue, _temp) = setup(3);
        queue.shutdown().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(matches!(
            queue.depth().await,
            Err(Error::Concurrency(_))
        ));
    }
}
