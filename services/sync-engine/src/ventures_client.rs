//! Ventures REST client
//!
//! Bearer-token API: `POST /token` to log in, loans under `/objects/loan`.
//! A 401 on any call triggers one re-login and a single retry.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use sync_core::los::{LosClient, LosError, ValidationReport};
use sync_core::mapping::{LoanPatch, NewExternalLoan};
use sync_core::types::{Credentials, ExternalLoan};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct VenturesClient {
    http: Client,
    base_url: String,
    credentials: RwLock<Option<Credentials>>,
    token: RwLock<Option<String>>,
}

impl std::fmt::Debug for VenturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenturesClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl VenturesClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LosError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LosError::Unavailable(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: RwLock::new(None),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn login_with(&self, creds: &Credentials) -> Result<String, LosError> {
        let response = self
            .http
            .post(self.url("token"))
            .json(&json!({
                "client": creds.site_name,
                "username": creds.username,
                "password": creds.password,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LosError::Unauthorized(error_message(response).await));
        }
        let response = check_status(response).await?;

        // The token comes back either as {"token": ...} or as a bare string
        let body = response.text().await.map_err(transport_error)?;
        let token = serde_json::from_str::<TokenResponse>(&body)
            .map(|t| t.token)
            .unwrap_or_else(|_| body.trim().trim_matches('"').to_string());

        if token.is_empty() {
            return Err(LosError::Unauthorized("empty token".to_string()));
        }

        Ok(token)
    }

    async fn login(&self) -> Result<String, LosError> {
        let creds = self
            .credentials
            .read()
            .clone()
            .ok_or_else(|| LosError::Unauthorized("credentials not configured".to_string()))?;

        let token = self.login_with(&creds).await?;
        *self.token.write() = Some(token.clone());
        debug!(username = %creds.username, "Ventures token refreshed");
        Ok(token)
    }

    async fn bearer(&self) -> Result<String, LosError> {
        let cached = self.token.read().clone();
        match cached {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    /// Send with the current token; on 401 log in again and retry once
    async fn send<F>(&self, build: F) -> Result<Response, LosError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.bearer().await?;
        let response = build(&token).send().await.map_err(transport_error)?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Ventures token rejected, logging in again");
        *self.token.write() = None;
        let token = self.login().await?;
        let response = build(&token).send().await.map_err(transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(LosError::Unauthorized(error_message(response).await));
        }
        Ok(response)
    }
}

#[async_trait]
impl LosClient for VenturesClient {
    async fn authenticate(&self, creds: &Credentials) -> Result<(), LosError> {
        let token = self.login_with(creds).await?;
        *self.credentials.write() = Some(creds.clone());
        *self.token.write() = Some(token);
        info!(username = %creds.username, site = %creds.site_name, "Ventures login succeeded");
        Ok(())
    }

    fn set_credentials(&self, creds: Credentials) {
        *self.credentials.write() = Some(creds);
        *self.token.write() = None;
    }

    async fn get_loan(&self, external_id: &str) -> Result<Option<ExternalLoan>, LosError> {
        let url = self.url(&format!("objects/loan/{}", external_id));
        let response = self
            .send(|token| self.http.get(&url).bearer_auth(token))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = read_json(check_status(response).await?).await?;
        parse_loan(body).map(Some)
    }

    async fn create_loan(
        &self,
        loan: &NewExternalLoan,
        idempotency_key: &str,
    ) -> Result<ExternalLoan, LosError> {
        let url = self.url("objects/loan");
        let response = self
            .send(|token| {
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
                    .json(loan)
            })
            .await?;

        let body = read_json(check_status(response).await?).await?;
        parse_loan(body)
    }

    async fn update_loan(&self, external_id: &str, patch: &LoanPatch) -> Result<ExternalLoan, LosError> {
        let url = self.url(&format!("objects/loan/{}", external_id));
        let response = self
            .send(|token| self.http.patch(&url).bearer_auth(token).json(patch))
            .await?;

        let body = read_json(check_status(response).await?).await?;
        parse_loan(body)
    }

    async fn validate_loan(
        &self,
        external_id: Option<&str>,
        patch: &LoanPatch,
    ) -> Result<ValidationReport, LosError> {
        let url = match external_id {
            Some(id) => self.url(&format!("objects/loan/{}/validate", id)),
            None => self.url("objects/loan/validate"),
        };
        let response = self
            .send(|token| self.http.post(&url).bearer_auth(token).json(patch))
            .await?;

        // 422 carries the report itself
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let body = read_json(response).await?;
            if let Ok(report) = serde_json::from_value::<ValidationReport>(body.clone()) {
                if !report.is_valid() {
                    return Ok(report);
                }
            }
            return Err(LosError::Rejected(message_from(&body)));
        }

        let body = read_json(check_status(response).await?).await?;
        serde_json::from_value(unwrap_data(body))
            .map_err(|e| LosError::Rejected(format!("Unreadable validation report: {}", e)))
    }

    fn name(&self) -> &str {
        "ventures"
    }
}

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

fn transport_error(err: reqwest::Error) -> LosError {
    if err.is_timeout() {
        LosError::Unavailable(format!("request timed out: {}", err))
    } else {
        LosError::Unavailable(err.to_string())
    }
}

/// Pass 2xx through; 5xx and 429 are outages, other statuses rejections
async fn check_status(response: Response) -> Result<Response, LosError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = error_message(response).await;
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(LosError::Unavailable(format!("{} {}", status.as_u16(), message)))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(LosError::Unauthorized(message))
    } else {
        Err(LosError::Rejected(message))
    }
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Value>(&text) {
        Ok(body) => message_from(&body),
        Err(_) if !text.trim().is_empty() => text.trim().to_string(),
        Err(_) => status.to_string(),
    }
}

fn message_from(body: &Value) -> String {
    ["message", "detail", "error", "title"]
        .iter()
        .find_map(|key| body.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

async fn read_json(response: Response) -> Result<Value, LosError> {
    response
        .json::<Value>()
        .await
        .map_err(|e| LosError::Unavailable(format!("Unreadable LOS response: {}", e)))
}

fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Loan objects may wrap in `data` and carry numeric ids
fn parse_loan(body: Value) -> Result<ExternalLoan, LosError> {
    let mut body = unwrap_data(body);
    if let Some(id) = body.get("id").and_then(Value::as_i64) {
        body["id"] = Value::String(id.to_string());
    }
    serde_json::from_value(body)
        .map_err(|e| LosError::Rejected(format!("Unreadable LOS loan: {}", e)))
}
