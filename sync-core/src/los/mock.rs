use super::{LosClient, LosError, ValidationReport};
use crate::mapping::{LoanPatch, NewExternalLoan};
use crate::types::{Credentials, ExternalLoan};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// A call seen by the mock, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LosCall {
    Authenticate(String),
    GetLoan(String),
    CreateLoan(String),
    UpdateLoan { id: String, fields: Vec<String> },
    Validate(Option<String>),
}

/// In-memory LOS
///
/// Used in mock mode and by tests. Failures can be injected per call.
pub struct MockLosClient {
    loans: DashMap<String, ExternalLoan>,
    /// idempotency key -> LOS id
    created_by_key: DashMap<String, String>,
    calls: Mutex<Vec<LosCall>>,
    credentials: Mutex<Option<Credentials>>,
    available: AtomicBool,
    accept_credentials: AtomicBool,
    fail_next: AtomicU32,
    reject_writes: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MockLosClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLosClient")
            .field("loans", &self.loans.len())
            .finish_non_exhaustive()
    }
}

impl Default for MockLosClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLosClient {
    /// Empty LOS
    pub fn new() -> Self {
        Self {
            loans: DashMap::new(),
            created_by_key: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            credentials: Mutex::new(None),
            available: AtomicBool::new(true),
            accept_credentials: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            reject_writes: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(2001),
        }
    }

    /// LOS with the demo portfolio (loans 1001-1003)
    pub fn seeded() -> Self {
        let client = Self::new();
        for loan in default_loans() {
            client.insert(loan);
        }
        client
    }

    pub fn insert(&self, loan: ExternalLoan) {
        self.loans.insert(loan.id.clone(), loan);
    }

    /// Current LOS copy of a loan, bypassing injection and call recording
    pub fn loan(&self, id: &str) -> Option<ExternalLoan> {
        self.loans.get(id).map(|l| l.clone())
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<LosCall> {
        self.calls.lock().clone()
    }

    /// Toggle a full outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls as unavailable
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject creates and updates with `message`
    pub fn reject_writes(&self, message: Option<&str>) {
        *self.reject_writes.lock() = message.map(str::to_string);
    }

    /// Refuse every login
    pub fn set_accept_credentials(&self, accept: bool) {
        self.accept_credentials.store(accept, Ordering::SeqCst);
    }

    /// Delay every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    async fn enter(&self, call: LosCall) -> Result<(), LosError> {
        self.calls.lock().push(call);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(LosError::Unavailable("connection refused".to_string()));
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!("Mock LOS: simulated outage");
            return Err(LosError::Unavailable("simulated outage".to_string()));
        }

        Ok(())
    }

    fn check_write(&self) -> Result<(), LosError> {
        match self.reject_writes.lock().as_ref() {
            Some(message) => Err(LosError::Rejected(message.clone())),
            None => Ok(()),
        }
    }
}

fn check_patch(patch: &LoanPatch) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(balance) = patch.balance {
        if balance <= Decimal::ZERO {
            errors.push("Loan amount must be greater than zero".to_string());
        }
    }
    if let Some(name) = &patch.borrower_name {
        if name.trim().is_empty() {
            errors.push("Borrower name is required".to_string());
        }
    }
    errors
}

#[async_trait]
impl LosClient for MockLosClient {
    async fn authenticate(&self, creds: &Credentials) -> Result<(), LosError> {
        self.enter(LosCall::Authenticate(creds.username.clone())).await?;

        if !self.accept_credentials.load(Ordering::SeqCst) {
            return Err(LosError::Unauthorized("Invalid username or password".to_string()));
        }

        *self.credentials.lock() = Some(creds.clone());
        info!(username = %creds.username, "Mock LOS: login accepted");
        Ok(())
    }

    fn set_credentials(&self, creds: Credentials) {
        *self.credentials.lock() = Some(creds);
    }

    async fn get_loan(&self, external_id: &str) -> Result<Option<ExternalLoan>, LosError> {
        self.enter(LosCall::GetLoan(external_id.to_string())).await?;
        Ok(self.loan(external_id))
    }

    async fn create_loan(
        &self,
        loan: &NewExternalLoan,
        idempotency_key: &str,
    ) -> Result<ExternalLoan, LosError> {
        self.enter(LosCall::CreateLoan(idempotency_key.to_string()))
            .await?;
        self.check_write()?;

        if let Some(existing) = self
            .created_by_key
            .get(idempotency_key)
            .and_then(|id| self.loan(id.value()))
        {
            info!(external_id = %existing.id, "Mock LOS: repeated create, returning existing loan");
            return Ok(existing);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let created = ExternalLoan {
            id: id.clone(),
            status_name: loan
                .status_name
                .clone()
                .unwrap_or_else(|| "New Application".to_string()),
            balance: loan.balance,
            officer_name: loan
                .officer_name
                .clone()
                .or_else(|| Some("Unassigned".to_string())),
            borrower_name: loan.borrower_name.clone(),
            close_date: loan.close_date,
        };
        self.insert(created.clone());
        self.created_by_key
            .insert(idempotency_key.to_string(), id.clone());

        info!(external_id = %id, "Mock LOS: created loan");
        Ok(created)
    }

    async fn update_loan(&self, external_id: &str, patch: &LoanPatch) -> Result<ExternalLoan, LosError> {
        self.enter(LosCall::UpdateLoan {
            id: external_id.to_string(),
            fields: patch.fields(),
        })
        .await?;
        self.check_write()?;

        let errors = check_patch(patch);
        if !errors.is_empty() {
            return Err(LosError::Rejected(errors.join("; ")));
        }

        let mut loan = self
            .loans
            .get_mut(external_id)
            .ok_or_else(|| LosError::Rejected(format!("Loan {} not found", external_id)))?;
        patch.apply_to(&mut loan);

        Ok(loan.clone())
    }

    async fn validate_loan(
        &self,
        external_id: Option<&str>,
        patch: &LoanPatch,
    ) -> Result<ValidationReport, LosError> {
        self.enter(LosCall::Validate(external_id.map(str::to_string)))
            .await?;

        let mut errors = check_patch(patch);
        if let Some(id) = external_id {
            if !self.loans.contains_key(id) {
                errors.push(format!("Loan {} not found", id));
            }
        }

        Ok(ValidationReport {
            errors,
            warnings: Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "ventures-mock"
    }
}

fn default_loans() -> Vec<ExternalLoan> {
    vec![
        ExternalLoan {
            id: "1001".to_string(),
            status_name: "Underwriting".to_string(),
            balance: Some(Decimal::new(500_000, 0)),
            officer_name: Some("Sarah Smith".to_string()),
            borrower_name: Some("Acme Corp".to_string()),
            close_date: None,
        },
        ExternalLoan {
            id: "1002".to_string(),
            status_name: "Approved".to_string(),
            balance: Some(Decimal::new(1_200_000, 0)),
            officer_name: Some("John Doe".to_string()),
            borrower_name: Some("Beta LLC".to_string()),
            close_date: None,
        },
        ExternalLoan {
            id: "1003".to_string(),
            status_name: "Closing".to_string(),
            balance: Some(Decimal::new(75_000, 0)),
            officer_name: Some("Sarah Smith".to_string()),
            borrower_name: Some("Gamma Inc".to_string()),
            close_date: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_portfolio() {
        let los = MockLosClient::seeded();
        let loan = los.get_loan("1001").await.unwrap().unwrap();
        assert_eq!(loan.status_name, "Underwriting");
        assert_eq!(loan.borrower_name.as_deref(), Some("Acme Corp"));
        assert!(los.get_loan("4040").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let los = MockLosClient::seeded();
        los.fail_next(2);

        assert!(matches!(los.get_loan("1001").await, Err(LosError::Unavailable(_))));
        assert!(matches!(los.get_loan("1001").await, Err(LosError::Unavailable(_))));
        assert!(los.get_loan("1001").await.is_ok());
        assert_eq!(los.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_update_is_all_or_nothing() {
        let los = MockLosClient::seeded();
        let patch = LoanPatch {
            borrower_name: Some("Acme Holdings".to_string()),
            balance: Some(Decimal::ZERO),
            close_date: None,
        };

        let err = los.update_loan("1001", &patch).await.unwrap_err();
        assert_eq!(err, LosError::Rejected("Loan amount must be greater than zero".to_string()));

        let loan = los.loan("1001").unwrap();
        assert_eq!(loan.borrower_name.as_deref(), Some("Acme Corp"));
    }

    fn delta() -> NewExternalLoan {
        NewExternalLoan {
            borrower_name: Some("Delta Co".to_string()),
            balance: Some(Decimal::new(90_000, 0)),
            close_date: None,
            officer_name: None,
            status_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_new_id() {
        let los = MockLosClient::new();
        let created = los.create_loan(&delta(), "create:app-9").await.unwrap();

        assert_eq!(created.status_name, "New Application");
        assert_eq!(los.loan(&created.id), Some(created));
    }

    #[tokio::test]
    async fn test_repeated_create_key_returns_same_loan() {
        let los = MockLosClient::new();
        let first = los.create_loan(&delta(), "create:app-9").await.unwrap();
        let again = los.create_loan(&delta(), "create:app-9").await.unwrap();
        let other = los.create_loan(&delta(), "create:app-10").await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(
            los.calls(),
            vec![
                LosCall::CreateLoan("create:app-9".to_string()),
                LosCall::CreateLoan("create:app-9".to_string()),
                LosCall::CreateLoan("create:app-10".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let los = MockLosClient::new();
        los.set_accept_credentials(false);
        let creds = Credentials {
            username: "ops".to_string(),
            password: "wrong".to_string(),
            site_name: "ampac".to_string(),
        };
        assert!(matches!(
            los.authenticate(&creds).await,
            Err(LosError::Unauthorized(_))
        ));
    }
}
