//! LOS Sync Core
//!
//! Durable outbound queue that pushes local loan applications to an
//! external Loan Origination System (LOS) and reconciles field values
//! between the two.
//!
//! # Architecture
//!
//! - **Single Writer**: One queue actor owns every state transition
//! - **Per-loan FIFO**: Items for one loan are claimed strictly in order
//! - **Bounded Retries**: Exponential backoff, then dead-letter
//! - **Circuit Breaker**: LOS outages fail fast instead of piling up timeouts
//!
//! # Invariants
//!
//! - Locked fields (`externalLoanId`, `loanStatus`) are never written to the LOS
//! - A terminal log entry is never rewritten
//! - Every item terminates within `max_retries + 1` attempts

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod circuit;
pub mod config;
pub mod credentials;
pub mod dashboard;
pub mod error;
pub mod executor;
pub mod loans;
pub mod los;
pub mod mapping;
pub mod metrics;
pub mod queue;
pub mod reconciliation;
pub mod retry;
pub mod service;
pub mod storage;
pub mod types;
pub mod worker;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use los::{LosClient, LosError, MockLosClient};
pub use metrics::SyncMetrics;
pub use queue::QueueHandle;
pub use service::SyncService;
pub use storage::Storage;
pub use types::{
    Availability, ConfigStatus, DashboardStats, ExternalLoan, FieldMapping, LocalLoan,
    LoanSyncStatus, LogStatus, MatchStatus, QueueItem, SyncLogEntry, SyncMode,
};
pub use worker::SyncWorker;
