//! Sync Executor
//!
//! Runs one claimed queue item against the LOS and reports an [`Outcome`].
//! The executor never touches queue state; the worker records the outcome.
//!
//! - `dry_run`: reconcile only, reads from the LOS
//! - `validate`: send the would-be change set to the LOS validation endpoint
//! - `commit`: one all-or-nothing patch of mismatched, locally owned,
//!   unlocked fields (or create + link when the loan is not in the LOS yet)

use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::loans::LoanRepository;
use crate::los::{LosClient, LosError};
use crate::mapping::{self, LoanPatch, NewExternalLoan, FIELD_SPECS};
use crate::metrics::SyncMetrics;
use crate::reconciliation::{commit_candidates, dry_run_summary, pull_candidates, Reconciler};
use crate::retry::RetryPolicy;
use crate::types::{
    Availability, ExternalLoan, Failure, FieldMapping, LocalLoan, Outcome, QueueItem,
    SourceOfTruth, SyncMode,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Last-known-good LOS records, keyed by LOS id
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: DashMap<String, (ExternalLoan, DateTime<Utc>)>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, loan: ExternalLoan) {
        self.entries.insert(loan.id.clone(), (loan, Utc::now()));
    }

    /// Cached record and when it was fetched
    pub fn get(&self, external_id: &str) -> Option<(ExternalLoan, DateTime<Utc>)> {
        self.entries.get(external_id).map(|e| e.value().clone())
    }

    pub fn invalidate(&self, external_id: &str) {
        self.entries.remove(external_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct SyncExecutor {
    los: Arc<dyn LosClient>,
    loans: Arc<dyn LoanRepository>,
    reconciler: Reconciler,
    breaker: CircuitBreaker,
    cache: SnapshotCache,
    call_timeout: Duration,
    metrics: Option<SyncMetrics>,
}

impl std::fmt::Debug for SyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncExecutor")
            .field("los", &self.los.name())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl SyncExecutor {
    pub fn new(
        config: &Config,
        los: Arc<dyn LosClient>,
        loans: Arc<dyn LoanRepository>,
        metrics: Option<SyncMetrics>,
    ) -> Self {
        let breaker = CircuitBreaker::new(los.name().to_string(), &config.breaker);
        Self {
            los,
            loans,
            reconciler: Reconciler::new(&config.reconciliation),
            breaker,
            cache: SnapshotCache::new(),
            call_timeout: config.worker.call_timeout(),
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Execute one claimed item
    pub async fn execute(&self, item: &QueueItem) -> Outcome {
        let span = tracing::info_span!(
            "sync_execute",
            item_id = %item.id,
            loan_id = %item.loan_id,
            mode = %item.mode,
            attempt = item.attempts
        );

        self.execute_item(item).instrument(span).await
    }

    async fn execute_item(&self, item: &QueueItem) -> Outcome {
        let result = match self.loans.get(&item.loan_id).await {
            Ok(Some(loan)) => match item.mode {
                SyncMode::DryRun => self.dry_run(&loan).await,
                SyncMode::Validate => self.validate(&loan).await,
                SyncMode::Commit => self.commit(&loan).await,
            },
            Ok(None) => {
                return Outcome::Failed(Failure::Terminal(format!(
                    "Loan {} not found (malformed local data)",
                    item.loan_id
                )))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok((summary, committed_fields)) => {
                tracing::info!("{}", summary);
                Outcome::Succeeded {
                    summary,
                    committed_fields,
                }
            }
            Err(e) => {
                let failure = classify(e);
                tracing::warn!("Sync execution failed: {}", failure.reason());
                Outcome::Failed(failure)
            }
        }
    }

    async fn dry_run(&self, loan: &LocalLoan) -> Result<(String, Vec<String>)> {
        let external = self.fetch_linked(loan).await?;
        let mappings = self.reconciler.reconcile(loan, external.as_ref());
        Ok((dry_run_summary(&mappings), Vec::new()))
    }

    async fn validate(&self, loan: &LocalLoan) -> Result<(String, Vec<String>)> {
        let (external_id, patch) = match &loan.external_loan_id {
            Some(id) => {
                let external = self.fetch_linked(loan).await?;
                let mappings = self.reconciler.reconcile(loan, external.as_ref());
                (Some(id.as_str()), build_patch(loan, &mappings))
            }
            None => (None, full_local_patch(loan)),
        };

        let report = self
            .call("validate", || self.los.validate_loan(external_id, &patch))
            .await?;

        if !report.is_valid() {
            return Err(Error::ExternalRejected(format!(
                "Validation failed: {}",
                report.errors.join("; ")
            )));
        }

        let fields = patch.fields();
        let mut summary = if fields.is_empty() {
            "Validation passed: nothing to commit".to_string()
        } else {
            format!("Validation passed for {}", fields.join(", "))
        };
        if !report.warnings.is_empty() {
            summary.push_str(&format!(" (warnings: {})", report.warnings.join("; ")));
        }

        Ok((summary, Vec::new()))
    }

    async fn commit(&self, loan: &LocalLoan) -> Result<(String, Vec<String>)> {
        let Some(external_id) = loan.external_loan_id.as_deref() else {
            return self.create_and_link(loan).await;
        };

        let external = self.fetch(external_id).await?.ok_or_else(|| {
            Error::ExternalRejected(format!("Loan {} not found in LOS", external_id))
        })?;

        let mappings = self.reconciler.reconcile(loan, Some(&external));
        let patch = build_patch(loan, &mappings);

        let mut summary = if patch.is_empty() {
            "Nothing to commit".to_string()
        } else {
            let updated = self
                .call("update_loan", || self.los.update_loan(external_id, &patch))
                .await?;
            self.cache.put(updated);

            let fields = patch.fields();
            format!("Committed {} field(s): {}", fields.len(), fields.join(", "))
        };

        // LOS-owned values flow the other way, after the LOS write
        let pulled = self.pull_external(loan, &external, &mappings).await?;
        if !pulled.is_empty() {
            summary.push_str(&format!("; pulled from LOS: {}", pulled.join(", ")));
        }

        Ok((summary, patch.fields()))
    }

    /// Write mismatched LOS-owned values into the local record
    async fn pull_external(
        &self,
        loan: &LocalLoan,
        external: &ExternalLoan,
        mappings: &[FieldMapping],
    ) -> Result<Vec<String>> {
        let mut updated = loan.clone();
        let pulled: Vec<String> = pull_candidates(mappings)
            .into_iter()
            .filter(|m| mapping::pull_to_local(&mut updated, external, &m.field))
            .map(|m| m.field.clone())
            .collect();

        if !pulled.is_empty() {
            updated.updated_at = Utc::now();
            self.loans.put(updated).await?;
            tracing::info!(fields = ?pulled, "Pulled LOS-owned fields into local record");
        }

        Ok(pulled)
    }

    /// Create the LOS loan and link it locally
    ///
    /// The create is keyed by the local loan id, so a retry after a failed
    /// link (or a lost response) gets the same LOS loan back.
    async fn create_and_link(&self, loan: &LocalLoan) -> Result<(String, Vec<String>)> {
        let request = NewExternalLoan::from_local(loan);
        let key = create_key(&loan.id);
        let created = self
            .call("create_loan", || self.los.create_loan(&request, &key))
            .await?;

        self.loans.link_external(&loan.id, &created.id).await?;

        let fields = full_local_patch(loan).fields();
        let summary = format!("Created LOS loan {} and linked it", created.id);
        self.cache.put(created);

        Ok((summary, fields))
    }

    async fn fetch_linked(&self, loan: &LocalLoan) -> Result<Option<ExternalLoan>> {
        match &loan.external_loan_id {
            Some(id) => self.fetch(id).await,
            None => Ok(None),
        }
    }

    /// Live LOS read; refreshes the snapshot cache
    pub async fn fetch(&self, external_id: &str) -> Result<Option<ExternalLoan>> {
        let external = self
            .call("get_loan", || self.los.get_loan(external_id))
            .await?;

        match &external {
            Some(loan) => self.cache.put(loan.clone()),
            None => self.cache.invalidate(external_id),
        }

        Ok(external)
    }

    /// Live LOS read, falling back to the last good snapshot
    pub async fn snapshot(&self, external_id: &str) -> Availability<Option<ExternalLoan>> {
        match self.fetch(external_id).await {
            Ok(loan) => Availability::Connected(loan),
            Err(e) => {
                tracing::warn!(external_id, "LOS read failed, using snapshot: {}", e);
                match self.cache.get(external_id) {
                    Some((loan, _)) => Availability::Degraded(Some(loan)),
                    None => Availability::Unavailable,
                }
            }
        }
    }

    /// One LOS call under timeout and circuit breaker
    async fn call<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, LosError>>,
    {
        let started = Instant::now();
        let call_timeout = self.call_timeout;

        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(call_timeout, f()).await {
                    Ok(result) => result.map_err(Error::from),
                    Err(_) => Err(Error::ExternalUnavailable(format!(
                        "LOS {} timed out after {:?}",
                        op, call_timeout
                    ))),
                }
            })
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_external_call(started.elapsed().as_secs_f64());
        }

        result
    }
}

/// Idempotency key for creating the LOS copy of a local loan
pub fn create_key(loan_id: &str) -> String {
    format!("los-create:{}", loan_id)
}

/// Patch for every mismatched, locally owned, unlocked field
fn build_patch(loan: &LocalLoan, mappings: &[FieldMapping]) -> LoanPatch {
    let mut patch = LoanPatch::default();
    for mapping in commit_candidates(mappings) {
        patch.set_from_local(loan, &mapping.field);
    }
    patch
}

/// Patch carrying every locally owned, unlocked field that has a value
fn full_local_patch(loan: &LocalLoan) -> LoanPatch {
    let mut patch = LoanPatch::default();
    for spec in FIELD_SPECS
        .iter()
        .filter(|s| s.source_of_truth == SourceOfTruth::Local && !s.locked)
    {
        patch.set_from_local(loan, spec.name);
    }
    patch
}

/// Map an execution error onto the queue's retry decision
pub fn classify(error: Error) -> Failure {
    if RetryPolicy::is_retryable_error(&error) {
        Failure::Retryable(error.to_string())
    } else {
        Failure::Terminal(error.to_string())
    }
}
