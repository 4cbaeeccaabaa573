//! LOS credential management (single tenant)

use crate::los::LosClient;
use crate::storage::Storage;
use crate::types::{ConfigStatus, Credentials};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// Tenant key for the single credential set
pub const DEFAULT_TENANT: &str = "default";

pub struct CredentialStore {
    storage: Arc<Storage>,
    los: Arc<dyn LosClient>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("los", &self.los.name())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(storage: Arc<Storage>, los: Arc<dyn LosClient>) -> Self {
        Self { storage, los }
    }

    /// Verify credentials against the LOS, then store them
    pub async fn configure(&self, username: &str, password: &str, site_name: &str) -> Result<ConfigStatus> {
        let creds = Credentials {
            username: username.trim().to_string(),
            password: password.to_string(),
            site_name: site_name.trim().to_string(),
        };

        if creds.username.is_empty() || creds.password.trim().is_empty() || creds.site_name.is_empty() {
            return Err(Error::Validation(
                "username, password and site_name are required".to_string(),
            ));
        }

        if let Err(e) = self.los.authenticate(&creds).await {
            tracing::warn!(username = %creds.username, "LOS login rejected: {}", e);
            return Err(Error::Configuration(format!("Authentication failed: {}", e)));
        }

        self.storage.put_credentials(DEFAULT_TENANT, &creds, Utc::now())?;
        tracing::info!(username = %creds.username, site = %creds.site_name, "LOS credentials configured");

        Ok(ConfigStatus {
            configured: true,
            username: Some(creds.username),
            site_name: Some(creds.site_name),
        })
    }

    /// What is on file; the password is never returned
    pub fn status(&self) -> Result<ConfigStatus> {
        Ok(match self.storage.get_credentials(DEFAULT_TENANT)? {
            Some(creds) => ConfigStatus {
                configured: true,
                username: Some(creds.username),
                site_name: Some(creds.site_name),
            },
            None => ConfigStatus::default(),
        })
    }

    pub fn is_configured(&self) -> Result<bool> {
        Ok(self.storage.get_credentials(DEFAULT_TENANT)?.is_some())
    }

    /// Hand stored credentials to the LOS client at startup
    pub fn restore(&self) -> Result<bool> {
        match self.storage.get_credentials(DEFAULT_TENANT)? {
            Some(creds) => {
                tracing::info!(username = %creds.username, "Restored LOS credentials");
                self.los.set_credentials(creds);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::los::MockLosClient;
    use crate::Config;
    use tempfile::TempDir;

    fn setup() -> (CredentialStore, Arc<MockLosClient>, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let los = Arc::new(MockLosClient::new());
        (CredentialStore::new(storage, los.clone()), los, temp)
    }

    #[tokio::test]
    async fn test_configure_and_status() {
        let (store, _los, _temp) = setup();
        assert!(!store.status().unwrap().configured);

        let status = store.configure("ops", "s3cret", "ampac").await.unwrap();
        assert!(status.configured);

        let status = store.status().unwrap();
        assert_eq!(status.username.as_deref(), Some("ops"));
        assert_eq!(status.site_name.as_deref(), Some("ampac"));
        assert!(!serde_json::to_string(&status).unwrap().contains("s3cret"));
    }

    #[tokio::test]
    async fn test_blank_field_rejected() {
        let (store, _los, _temp) = setup();
        assert!(matches!(
            store.configure("ops", "  ", "ampac").await,
            Err(Error::Validation(_))
        ));
        assert!(!store.is_configured().unwrap());
    }

    #[tokio::test]
    async fn test_failed_login_not_stored() {
        let (store, los, _temp) = setup();
        los.set_accept_credentials(false);

        let err = store.configure("ops", "wrong", "ampac").await.unwrap_err();
        assert!(err.to_string().starts_with("Authentication failed"));
        assert!(!store.is_configured().unwrap());
        assert!(!store.restore().unwrap());
    }
}
