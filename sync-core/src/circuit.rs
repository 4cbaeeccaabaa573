use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub success_count: u32,
    pub recovery_threshold: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub timeout_duration: i64,
}

/// Breaker around LOS calls
///
/// Only availability failures count against the circuit. A rejection means
/// the LOS answered, so it resets the failure streak like a success.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(id: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::with_config(
            id.into(),
            config.failure_threshold,
            config.recovery_threshold,
            config.reset_timeout_seconds,
        )
    }

    pub fn with_config(
        id: String,
        failure_threshold: u32,
        recovery_threshold: u32,
        timeout_seconds: i64,
    ) -> Self {
        CircuitBreaker {
            state: Arc::new(RwLock::new(CircuitBreakerState {
                id,
                state: CircuitState::Closed,
                failure_count: 0,
                failure_threshold,
                success_count: 0,
                recovery_threshold,
                last_failure_time: None,
                timeout_duration: timeout_seconds,
            })),
        }
    }

    /// Execute a function with circuit breaker protection
    pub async fn call<F, T, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        {
            let mut state = self.state.write().await;
            if state.state == CircuitState::Open && Self::should_attempt_reset(&state) {
                info!("Circuit breaker {} transitioning to HalfOpen", state.id);
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
            }

            if state.state == CircuitState::Open {
                warn!("Circuit breaker {} is OPEN, rejecting request", state.id);
                return Err(Error::ExternalUnavailable(format!(
                    "{} circuit open after {} consecutive failures",
                    state.id, state.failure_threshold
                )));
            }
        }

        match f().await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(e @ Error::ExternalUnavailable(_)) => {
                self.on_failure().await;
                Err(e)
            }
            Err(e) => {
                self.on_success().await;
                Err(e)
            }
        }
    }

    /// Record a successful operation
    pub async fn on_success(&self) {
        let mut state = self.state.write().await;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= state.recovery_threshold {
                    info!(
                        "Circuit breaker {} recovered - transitioning to Closed",
                        state.id
                    );
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_time = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= state.failure_threshold {
                    warn!(
                        "Circuit breaker {} TRIPPED - transitioning to Open (failures: {})",
                        state.id, state.failure_count
                    );
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker {} failed in HalfOpen - back to Open",
                    state.id
                );
                state.state = CircuitState::Open;
                state.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Manually reset the circuit breaker (new credentials, operator action)
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!("Circuit breaker {} manually reset to Closed", state.id);
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
    }

    pub async fn get_state(&self) -> CircuitBreakerState {
        self.state.read().await.clone()
    }

    fn should_attempt_reset(state: &CircuitBreakerState) -> bool {
        match state.last_failure_time {
            Some(last_failure) => (Utc::now() - last_failure).num_seconds() >= state.timeout_duration,
            None => true,
        }
    }
}
