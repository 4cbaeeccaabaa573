//! SyncService: the operations the HTTP layer exposes

use crate::credentials::CredentialStore;
use crate::dashboard::DashboardAggregator;
use crate::executor::SyncExecutor;
use crate::loans::{LoanRepository, SqliteLoanRepository};
use crate::los::LosClient;
use crate::metrics::SyncMetrics;
use crate::queue::{spawn_queue_actor, QueueHandle};
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use crate::types::{
    Availability, ConfigStatus, ConnectionState, DashboardStats, LoanSyncStatus, QueueItem,
    SyncLogEntry, SyncMode,
};
use crate::worker::SyncWorker;
use crate::{Config, Error, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// How often `request_sync` re-reads the log entry while waiting
const SYNC_WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct SyncService {
    queue: QueueHandle,
    executor: Arc<SyncExecutor>,
    loans: Arc<dyn LoanRepository>,
    credentials: Arc<CredentialStore>,
    dashboard: Arc<DashboardAggregator>,
    config: Config,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("queue", &self.queue)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Open the store under `config.data_dir` and start the queue actor
    ///
    /// Returns the service and the worker; the caller decides where the
    /// worker runs.
    pub async fn start(
        config: Config,
        los: Arc<dyn LosClient>,
        metrics: Option<SyncMetrics>,
    ) -> Result<(Self, SyncWorker)> {
        let storage = Arc::new(Storage::open(&config)?);
        let loans: Arc<dyn LoanRepository> = Arc::new(SqliteLoanRepository::new(storage.clone()));
        Self::start_with(config, storage, loans, los, metrics).await
    }

    /// Start with an explicit loan repository
    pub async fn start_with(
        config: Config,
        storage: Arc<Storage>,
        loans: Arc<dyn LoanRepository>,
        los: Arc<dyn LosClient>,
        metrics: Option<SyncMetrics>,
    ) -> Result<(Self, SyncWorker)> {
        let queue = spawn_queue_actor(
            storage.clone(),
            RetryPolicy::new(config.retry.clone()),
            metrics.clone(),
            config.worker.mailbox_capacity,
        );

        let recovered = queue.recover_in_flight().await?;
        if recovered > 0 {
            tracing::warn!("Returned {} orphaned in-flight items to the queue", recovered);
        }

        let executor = Arc::new(SyncExecutor::new(
            &config,
            los.clone(),
            loans.clone(),
            metrics.clone(),
        ));
        let credentials = Arc::new(CredentialStore::new(storage, los));
        credentials.restore()?;

        let dashboard = Arc::new(DashboardAggregator::new(
            Arc::new(queue.clone()),
            config.dashboard.clone(),
        ));

        let worker = SyncWorker::new(
            queue.clone(),
            executor.clone(),
            config.worker.clone(),
            metrics,
        );

        let service = Self {
            queue,
            executor,
            loans,
            credentials,
            dashboard,
            config,
        };

        Ok((service, worker))
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn executor(&self) -> &SyncExecutor {
        &self.executor
    }

    pub fn loans(&self) -> &Arc<dyn LoanRepository> {
        &self.loans
    }

    /// Enqueue a sync and wait (bounded) for its outcome
    ///
    /// Returns the primary log entry; still `pending` if the wait ran out.
    pub async fn request_sync(
        &self,
        loan_id: &str,
        mode: SyncMode,
        note: Option<String>,
    ) -> Result<SyncLogEntry> {
        if !self.credentials.is_configured()? {
            return Err(Error::Configuration(
                "LOS credentials are not configured".to_string(),
            ));
        }

        let item = self.queue.enqueue(loan_id, mode, note).await?;
        self.wait_for_log(item.id, Duration::from_millis(self.config.sync_wait_ms))
            .await
    }

    async fn wait_for_log(&self, log_id: Uuid, wait: Duration) -> Result<SyncLogEntry> {
        let deadline = Instant::now() + wait;

        loop {
            let entry = self
                .queue
                .get_log(log_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Log entry {}", log_id)))?;

            if entry.status.is_terminal() || Instant::now() >= deadline {
                return Ok(entry);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(SYNC_WAIT_POLL.min(remaining)).await;
        }
    }

    /// Field mappings and recent logs for one loan
    pub async fn loan_status(&self, loan_id: &str) -> Result<LoanSyncStatus> {
        let loan = self
            .loans
            .get(loan_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Loan {}", loan_id)))?;

        let (external, connection_state) = match &loan.external_loan_id {
            Some(external_id) => match self.executor.snapshot(external_id).await {
                Availability::Connected(external) => (external, ConnectionState::Connected),
                Availability::Degraded(external) => (external, ConnectionState::Disconnected),
                Availability::Unavailable => (None, ConnectionState::Disconnected),
            },
            None => (None, ConnectionState::Disconnected),
        };

        let field_mappings = match (&external, connection_state) {
            (None, ConnectionState::Disconnected) if loan.external_loan_id.is_some() => Vec::new(),
            _ => self.executor.reconciler().reconcile(&loan, external.as_ref()),
        };

        let sync_logs = self
            .queue
            .loan_logs(loan_id, self.config.dashboard.loan_logs_limit)
            .await?;
        let last_sync_at = sync_logs
            .iter()
            .filter(|l| l.status.is_terminal())
            .map(|l| l.updated_at)
            .max();

        Ok(LoanSyncStatus {
            loan_id: loan.id,
            external_loan_id: loan.external_loan_id,
            connection_state,
            last_sync_at,
            field_mappings,
            sync_logs,
        })
    }

    pub async fn dashboard(&self) -> DashboardStats {
        self.dashboard.stats(Utc::now()).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<SyncLogEntry>> {
        self.queue.dead_letters(self.config.dashboard.dlq_limit).await
    }

    /// Re-enqueue a dead-lettered entry
    pub async fn replay(&self, event_id: Uuid) -> Result<QueueItem> {
        self.queue.replay(event_id).await
    }

    pub async fn configure(&self, username: &str, password: &str, site_name: &str) -> Result<ConfigStatus> {
        let status = self.credentials.configure(username, password, site_name).await?;
        self.executor.breaker().reset().await;
        Ok(status)
    }

    /// Credential status; read failures report "not configured"
    pub fn config_status(&self) -> ConfigStatus {
        self.credentials.status().unwrap_or_else(|e| {
            tracing::warn!("Credential status unavailable: {}", e);
            ConfigStatus::default()
        })
    }
}
