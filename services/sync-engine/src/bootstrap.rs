//! Service wiring: LOS selection, sync service start, demo data

use crate::config::Config;
use crate::handlers::AppState;
use crate::ventures_client::VenturesClient;
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{LocalLoan, LosClient, MockLosClient, SyncMetrics, SyncService, SyncWorker};
use tracing::{info, warn};

/// Pick the LOS implementation for this deployment
pub fn build_los(config: &Config) -> anyhow::Result<Arc<dyn LosClient>> {
    if config.los.mock_mode {
        info!("LOS mock mode: using in-memory Ventures portfolio");
        return Ok(Arc::new(MockLosClient::seeded()));
    }

    let client = VenturesClient::new(
        &config.los.base_url,
        Duration::from_millis(config.los.request_timeout_ms),
    )
    .context("Failed to build Ventures client")?;
    info!(base_url = %config.los.base_url, "Using Ventures API");
    Ok(Arc::new(client))
}

/// Start the sync service; the worker is returned unstarted
pub async fn build_app(config: &Config, los: Arc<dyn LosClient>) -> anyhow::Result<(AppState, SyncWorker)> {
    let metrics = SyncMetrics::new().context("Failed to register metrics")?;

    let (service, worker) = SyncService::start(config.sync.clone(), los, Some(metrics.clone()))
        .await
        .context("Failed to start sync service")?;

    if config.los.seed_demo_loans {
        seed_demo_loans(&service).await?;
    }

    if let Some(bootstrap) = &config.los.bootstrap {
        if !service.config_status().configured {
            match service
                .configure(&bootstrap.username, &bootstrap.password, &bootstrap.site_name)
                .await
            {
                Ok(_) => info!(username = %bootstrap.username, "Bootstrap LOS credentials configured"),
                Err(e) => warn!("Bootstrap LOS credentials rejected: {}", e),
            }
        }
    }

    Ok((AppState { service, metrics }, worker))
}

/// Local applications linked to the mock portfolio; existing ones are kept
pub async fn seed_demo_loans(service: &SyncService) -> anyhow::Result<usize> {
    let mut seeded = 0;

    for loan in demo_loans() {
        if service.loans().get(&loan.id).await?.is_some() {
            continue;
        }
        service.loans().put(loan).await?;
        seeded += 1;
    }

    if seeded > 0 {
        info!("Seeded {} demo loan applications", seeded);
    }
    Ok(seeded)
}

fn demo_loans() -> Vec<LocalLoan> {
    vec![
        LocalLoan {
            id: "app-1001".to_string(),
            business_name: Some("Acme Corp".to_string()),
            requested_amount: Some(Decimal::new(500_000, 0)),
            status: "in_review".to_string(),
            officer_name: Some("Sarah Smith".to_string()),
            external_loan_id: Some("1001".to_string()),
            target_close_date: NaiveDate::from_ymd_opt(2026, 12, 15),
            updated_at: Utc::now(),
        },
        LocalLoan {
            id: "app-1002".to_string(),
            business_name: Some("Beta LLC".to_string()),
            requested_amount: Some(Decimal::new(1_250_000, 0)),
            status: "conditional_approval".to_string(),
            officer_name: Some("John Doe".to_string()),
            external_loan_id: Some("1002".to_string()),
            target_close_date: None,
            updated_at: Utc::now(),
        },
        LocalLoan {
            id: "app-1003".to_string(),
            business_name: Some("Gamma Inc".to_string()),
            requested_amount: Some(Decimal::new(75_000, 0)),
            status: "closing".to_string(),
            officer_name: Some("Sarah Smith".to_string()),
            external_loan_id: Some("1003".to_string()),
            target_close_date: None,
            updated_at: Utc::now(),
        },
        LocalLoan {
            id: "app-2001".to_string(),
            business_name: Some("Delta Bakery".to_string()),
            requested_amount: Some(Decimal::new(150_000, 0)),
            status: "submitted".to_string(),
            officer_name: None,
            external_loan_id: None,
            target_close_date: None,
            updated_at: Utc::now(),
        },
    ]
}
