//! Core types for the sync subsystem
//!
//! Wire names follow the staff console's contract: camelCase fields, except
//! the queue depth counters which the console reads as `in_flight` and
//! `dead_letter`.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// How a sync operation touches the external LOS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Reconcile only, no external writes
    DryRun,
    /// Ask the LOS to validate the change set without committing it
    Validate,
    /// Write locally-owned values to the LOS
    Commit,
}

impl SyncMode {
    /// Wire code
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::DryRun => "dry_run",
            SyncMode::Validate => "validate",
            SyncMode::Commit => "commit",
        }
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dry_run" => Ok(SyncMode::DryRun),
            "validate" => Ok(SyncMode::Validate),
            "commit" => Ok(SyncMode::Commit),
            other => Err(Error::Validation(format!(
                "Unknown sync mode '{}': expected dry_run, validate or commit",
                other
            ))),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue item state tag, as stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Waiting to be claimed
    Pending,
    /// Claimed by the worker
    InFlight,
    /// Completed
    Success,
    /// Failed without retry
    Error,
    /// Retries exhausted
    DeadLetter,
}

impl QueueState {
    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::InFlight => "in_flight",
            QueueState::Success => "success",
            QueueState::Error => "error",
            QueueState::DeadLetter => "dead_letter",
        }
    }

    /// Parse a storage code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueState::Pending),
            "in_flight" => Some(QueueState::InFlight),
            "success" => Some(QueueState::Success),
            "error" => Some(QueueState::Error),
            "dead_letter" => Some(QueueState::DeadLetter),
            _ => None,
        }
    }

    /// Terminal states are never left except by replay (which creates a new item)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueState::Success | QueueState::Error | QueueState::DeadLetter
        )
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by the worker
    InFlight,
    /// Completed
    Success,
    /// Failed permanently
    Error {
        /// Failure reason
        reason: String,
    },
    /// Retries exhausted
    DeadLetter {
        /// Last failure reason
        reason: String,
        /// Attempts made
        attempts: u32,
    },
}

impl SyncStatus {
    /// State tag
    pub fn state(&self) -> QueueState {
        match self {
            SyncStatus::Pending => QueueState::Pending,
            SyncStatus::InFlight => QueueState::InFlight,
            SyncStatus::Success => QueueState::Success,
            SyncStatus::Error { .. } => QueueState::Error,
            SyncStatus::DeadLetter { .. } => QueueState::DeadLetter,
        }
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            SyncStatus::Error { reason } | SyncStatus::DeadLetter { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// A unit of outbound sync work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Item id; also the id of its primary log entry
    pub id: Uuid,

    /// Enqueue sequence (total order of enqueues)
    pub seq: i64,

    /// Local loan application id
    pub loan_id: String,

    /// Sync mode
    pub mode: SyncMode,

    /// Operator annotation
    pub note: Option<String>,

    /// Current status
    pub status: SyncStatus,

    /// Number of times the item has been claimed
    pub attempts: u32,

    /// Earliest time the item may be claimed again
    pub next_attempt_at: DateTime<Utc>,

    /// blake3 of (loan id, mode, note)
    pub payload_hash: String,

    /// Item this one was replayed from
    pub replay_of: Option<Uuid>,

    /// Created at
    pub created_at: DateTime<Utc>,

    /// Last transition
    pub updated_at: DateTime<Utc>,
}

/// Hash of the fields that define what an item does
pub fn payload_hash(loan_id: &str, mode: SyncMode, note: Option<&str>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(loan_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(mode.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(note.unwrap_or_default().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Status shown for a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// Completed
    Success,
    /// Queued or being processed
    Pending,
    /// Failed without retry
    Error,
    /// Retries exhausted
    DeadLetter,
    /// Informational (retry scheduled, recovery, ...)
    Info,
}

impl LogStatus {
    /// Storage code
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Pending => "pending",
            LogStatus::Error => "error",
            LogStatus::DeadLetter => "dead_letter",
            LogStatus::Info => "info",
        }
    }

    /// Parse a storage code
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(LogStatus::Success),
            "pending" => Some(LogStatus::Pending),
            "error" => Some(LogStatus::Error),
            "dead_letter" => Some(LogStatus::DeadLetter),
            "info" => Some(LogStatus::Info),
            _ => None,
        }
    }

    /// Terminal log statuses are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LogStatus::Success | LogStatus::Error | LogStatus::DeadLetter
        )
    }
}

impl From<&SyncStatus> for LogStatus {
    fn from(status: &SyncStatus) -> Self {
        match status {
            SyncStatus::Pending | SyncStatus::InFlight => LogStatus::Pending,
            SyncStatus::Success => LogStatus::Success,
            SyncStatus::Error { .. } => LogStatus::Error,
            SyncStatus::DeadLetter { .. } => LogStatus::DeadLetter,
        }
    }
}

/// Audit record of one sync attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    /// Entry id (equals the item id for primary entries)
    pub id: Uuid,

    /// Queue item this entry describes
    pub item_id: Option<Uuid>,

    /// Local loan application id
    pub loan_application_id: String,

    /// Sync mode
    #[serde(rename = "type")]
    pub mode: Option<SyncMode>,

    /// Status
    pub status: LogStatus,

    /// Human-readable summary
    pub message: String,

    /// Operator annotation
    pub note: Option<String>,

    /// Fields written to the LOS by a commit
    #[serde(default)]
    pub committed_fields: Vec<String>,

    /// Original entry when created by replay
    pub replay_of: Option<Uuid>,

    /// Attempts made so far
    pub attempts: u32,

    /// Created at
    pub timestamp: DateTime<Utc>,

    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// Queue depth, counted from stored items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_flight: u64,
    pub dead_letter: u64,
}

/// Terminal outcome counts, counted from stored items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub success: u64,
    pub error: u64,
    pub dead_letter: u64,
}

/// Why an execution failed, and whether the queue should try again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Network/timeout trouble; goes back to the queue with backoff
    Retryable(String),
    /// Malformed local data or LOS rejection; never retried
    Terminal(String),
}

impl Failure {
    /// Failure message
    pub fn reason(&self) -> &str {
        match self {
            Failure::Retryable(r) | Failure::Terminal(r) => r,
        }
    }
}

/// Result of executing one queue item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Completed
    Succeeded {
        /// Log summary
        summary: String,
        /// Fields written to the LOS
        committed_fields: Vec<String>,
    },
    /// Failed
    Failed(Failure),
}

/// Per-field comparison result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Match,
    Mismatch,
}

/// Which system wins for a field during commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceOfTruth {
    Local,
    External,
}

/// One shared field, compared across both systems
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub field: String,
    pub local_value: Option<String>,
    pub external_value: Option<String>,
    pub status: MatchStatus,
    pub source_of_truth: SourceOfTruth,
    pub is_locked: bool,
}

/// Whether the LOS answered the last status read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Per-loan sync snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanSyncStatus {
    pub loan_id: String,
    pub external_loan_id: Option<String>,
    pub connection_state: ConnectionState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub field_mappings: Vec<FieldMapping>,
    pub sync_logs: Vec<SyncLogEntry>,
}

/// Liveness record written by the worker loop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub last_loop_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Data that may come from a live source, a fallback, or nowhere
#[derive(Debug, Clone, PartialEq)]
pub enum Availability<T> {
    /// Live, complete data
    Connected(T),
    /// Partial or last-known-good data
    Degraded(T),
    /// Nothing could be read
    Unavailable,
}

impl<T> Availability<T> {
    /// Wire label
    pub fn kind(&self) -> AvailabilityKind {
        match self {
            Availability::Connected(_) => AvailabilityKind::Connected,
            Availability::Degraded(_) => AvailabilityKind::Degraded,
            Availability::Unavailable => AvailabilityKind::Unavailable,
        }
    }

    /// The carried data, live or not
    pub fn into_inner(self) -> Option<T> {
        match self {
            Availability::Connected(v) | Availability::Degraded(v) => Some(v),
            Availability::Unavailable => None,
        }
    }

    /// True only for live data
    pub fn is_connected(&self) -> bool {
        matches!(self, Availability::Connected(_))
    }
}

/// Label of an [`Availability`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityKind {
    Connected,
    Degraded,
    Unavailable,
}

/// Operator dashboard payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub synced_count: u64,
    pub pending_count: u64,
    pub error_count: u64,
    pub queue_depth: QueueDepth,
    pub recent_logs: Vec<SyncLogEntry>,
    pub stale: bool,
    pub last_loop_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub availability: AvailabilityKind,
}

impl DashboardStats {
    /// Renderable placeholder used when the stores cannot be read
    pub fn zeroed(last_error: impl Into<String>) -> Self {
        Self {
            synced_count: 0,
            pending_count: 0,
            error_count: 0,
            queue_depth: QueueDepth::default(),
            recent_logs: Vec::new(),
            stale: true,
            last_loop_at: None,
            last_error: Some(last_error.into()),
            availability: AvailabilityKind::Unavailable,
        }
    }
}

/// Local loan application document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalLoan {
    pub id: String,
    #[serde(default)]
    pub business_name: Option<String>,
    #[serde(default)]
    pub requested_amount: Option<Decimal>,
    pub status: String,
    #[serde(default)]
    pub officer_name: Option<String>,
    #[serde(default)]
    pub external_loan_id: Option<String>,
    #[serde(default)]
    pub target_close_date: Option<NaiveDate>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Loan record as held by the LOS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLoan {
    pub id: String,
    pub status_name: String,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub officer_name: Option<String>,
    #[serde(default)]
    pub borrower_name: Option<String>,
    #[serde(default)]
    pub close_date: Option<NaiveDate>,
}

/// LOS login credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub site_name: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("site_name", &self.site_name)
            .finish()
    }
}

/// Whether credentials are on file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStatus {
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mode_parse() {
        assert_eq!("dry_run".parse::<SyncMode>().unwrap(), SyncMode::DryRun);
        assert_eq!("commit".parse::<SyncMode>().unwrap(), SyncMode::Commit);
        assert!(matches!(
            "force".parse::<SyncMode>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_sync_mode_wire_name() {
        let json = serde_json::to_string(&SyncMode::DryRun).unwrap();
        assert_eq!(json, "\"dry_run\"");
    }

    #[test]
    fn test_sync_status_state() {
        let status = SyncStatus::DeadLetter {
            reason: "timeout".to_string(),
            attempts: 4,
        };
        assert_eq!(status.state(), QueueState::DeadLetter);
        assert_eq!(status.reason(), Some("timeout"));
        assert!(status.state().is_terminal());
        assert!(!SyncStatus::InFlight.state().is_terminal());
    }

    #[test]
    fn test_payload_hash_distinguishes_mode() {
        let a = payload_hash("L1", SyncMode::DryRun, None);
        let b = payload_hash("L1", SyncMode::Commit, None);
        assert_ne!(a, b);
        assert_eq!(a, payload_hash("L1", SyncMode::DryRun, None));
    }

    #[test]
    fn test_queue_depth_wire_names() {
        let depth = QueueDepth {
            pending: 2,
            in_flight: 1,
            dead_letter: 0,
        };
        let json = serde_json::to_value(depth).unwrap();
        assert_eq!(json["in_flight"], 1);
        assert_eq!(json["dead_letter"], 0);
    }

    #[test]
    fn test_zeroed_dashboard_is_stale() {
        let stats = DashboardStats::zeroed("store offline");
        assert!(stats.stale);
        assert_eq!(stats.synced_count, 0);
        assert_eq!(stats.availability, AvailabilityKind::Unavailable);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["queueDepth"]["pending"], 0);
        assert_eq!(json["lastError"], "store offline");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            username: "ops".to_string(),
            password: "hunter2".to_string(),
            site_name: "ampac".to_string(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
