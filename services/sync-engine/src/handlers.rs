use crate::errors::{ApiError, Result};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use sync_core::{LogStatus, SyncMetrics, SyncMode, SyncService};
use uuid::Uuid;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: SyncService,
    pub metrics: SyncMetrics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub loan_id: String,
    pub mode: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    pub username: String,
    pub password: String,
    pub site_name: String,
}

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let breaker = state.service.executor().breaker().get_state().await;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "sync-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "los": {
            "breaker": breaker.state,
            "failureCount": breaker.failure_count
        }
    }))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint(state: web::Data<AppState>) -> HttpResponse {
    match state.metrics.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

/// Field mappings and sync history for one loan
pub async fn loan_status(
    state: web::Data<AppState>,
    loan_id: web::Path<String>,
) -> Result<HttpResponse> {
    let status = state.service.loan_status(&loan_id).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// Enqueue a sync and report its log entry
pub async fn sync_loan(
    state: web::Data<AppState>,
    request: web::Json<SyncRequest>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    let mode: SyncMode = request.mode.parse()?;

    let log = state
        .service
        .request_sync(&request.loan_id, mode, request.note)
        .await?;
    let success = !matches!(log.status, LogStatus::Error | LogStatus::DeadLetter);

    Ok(HttpResponse::Ok().json(json!({
        "success": success,
        "log": log
    })))
}

/// Dashboard rollup; always 200
pub async fn dashboard(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.service.dashboard().await)
}

pub async fn configure(
    state: web::Data<AppState>,
    request: web::Json<ConfigureRequest>,
) -> Result<HttpResponse> {
    state
        .service
        .configure(&request.username, &request.password, &request.site_name)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Ventures integration configured successfully"
    })))
}

pub async fn config_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.service.config_status())
}

pub async fn dead_letters(state: web::Data<AppState>) -> Result<HttpResponse> {
    let items = state.service.dead_letters().await?;
    Ok(HttpResponse::Ok().json(json!({ "items": items })))
}

pub async fn replay(
    state: web::Data<AppState>,
    event_id: web::Path<String>,
) -> Result<HttpResponse> {
    let original = Uuid::parse_str(&event_id)
        .map_err(|_| ApiError::NotFound(format!("Not found: Dead-letter entry {}", event_id)))?;

    let item = state.service.replay(original).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "eventId": original,
        "newEventId": item.id,
        "status": "pending"
    })))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .service(
        web::scope("/ventures")
            .route("/status/{loan_id}", web::get().to(loan_status))
            .route("/sync", web::post().to(sync_loan))
            .route("/dashboard", web::get().to(dashboard))
            .route("/configure", web::post().to(configure))
            .route("/config/status", web::get().to(config_status))
            .route("/dlq", web::get().to(dead_letters))
            .route("/replay/{event_id}", web::post().to(replay)),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
