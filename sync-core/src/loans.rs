//! Local loan document store seam

use crate::storage::Storage;
use crate::types::LocalLoan;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

/// Store/retrieve loan documents by id
#[async_trait]
pub trait LoanRepository: Send + Sync {
    async fn get(&self, loan_id: &str) -> Result<Option<LocalLoan>>;

    async fn put(&self, loan: LocalLoan) -> Result<()>;

    /// Record the LOS id a local loan is linked to
    async fn link_external(&self, loan_id: &str, external_id: &str) -> Result<LocalLoan> {
        let mut loan = self
            .get(loan_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Loan {}", loan_id)))?;
        loan.external_loan_id = Some(external_id.to_string());
        loan.updated_at = Utc::now();
        self.put(loan.clone()).await?;
        Ok(loan)
    }
}

/// Loans kept in the sync database
#[derive(Debug, Clone)]
pub struct SqliteLoanRepository {
    storage: Arc<Storage>,
}

impl SqliteLoanRepository {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl LoanRepository for SqliteLoanRepository {
    async fn get(&self, loan_id: &str) -> Result<Option<LocalLoan>> {
        self.storage.get_loan(loan_id)
    }

    async fn put(&self, loan: LocalLoan) -> Result<()> {
        self.storage.put_loan(&loan)
    }
}

/// Loans kept in memory (tests, demos)
#[derive(Debug, Default)]
pub struct InMemoryLoanRepository {
    loans: DashMap<String, LocalLoan>,
}

impl InMemoryLoanRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoanRepository for InMemoryLoanRepository {
    async fn get(&self, loan_id: &str) -> Result<Option<LocalLoan>> {
        Ok(self.loans.get(loan_id).map(|l| l.clone()))
    }

    async fn put(&self, loan: LocalLoan) -> Result<()> {
        self.loans.insert(loan.id.clone(), loan);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use tempfile::TempDir;

    fn loan(id: &str) -> LocalLoan {
        LocalLoan {
            id: id.to_string(),
            business_name: Some("Acme Corp".to_string()),
            requested_amount: None,
            status: "submitted".to_string(),
            officer_name: None,
            external_loan_id: None,
            target_close_date: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_link_external_in_memory() {
        let repo = InMemoryLoanRepository::new();
        repo.put(loan("app-1")).await.unwrap();

        let linked = repo.link_external("app-1", "2001").await.unwrap();
        assert_eq!(linked.external_loan_id.as_deref(), Some("2001"));
        assert_eq!(
            repo.get("app-1").await.unwrap().unwrap().external_loan_id.as_deref(),
            Some("2001")
        );
    }

    #[tokio::test]
    async fn test_link_unknown_loan() {
        let repo = InMemoryLoanRepository::new();
        assert!(matches!(
            repo.link_external("nope", "2001").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_repository_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let repo = SqliteLoanRepository::new(Arc::new(Storage::open(&config).unwrap()));

        repo.put(loan("app-2")).await.unwrap();
        let stored = repo.get("app-2").await.unwrap().unwrap();
        assert_eq!(stored.business_name.as_deref(), Some("Acme Corp"));
    }
}
