use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::contract::HEALTH_PATH;
use crate::endpoint::{EndpointState, ServiceEndpoint};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("probe failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("service unavailable after {attempts} readiness probes (last: {last_error})")]
    ServiceUnavailable { attempts: u32, last_error: String },
    #[error("readiness wait cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled { attempts: u32 },
    Exhausted { attempts: u32, last: Option<E> },
}

/// Cancellable exponential backoff.
///
/// Attempt 1 runs after `initial_delay`; each later attempt waits the previous
/// delay times `factor`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scale = self.factor.max(1).saturating_pow(exponent);
        self.initial_delay.saturating_mul(scale).min(self.max_delay)
    }

    pub async fn retry<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last = None;
        for attempt in 1..=self.max_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt - 1 }),
                _ = tokio::time::sleep(self.delay_before(attempt)) => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt - 1 }),
                result = op(attempt) => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(error) => last = Some(error),
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

impl From<&HealthConfig> for Backoff {
    fn from(value: &HealthConfig) -> Self {
        Self {
            initial_delay: value.initial_delay(),
            factor: value.backoff_factor,
            max_delay: value.max_delay(),
            max_attempts: value.max_attempts,
        }
    }
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<(), ProbeError>;
}

/// `GET /health`; any 2xx means ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, endpoint: &ServiceEndpoint) -> Result<(), ProbeError> {
        let url = format!("{}{HEALTH_PATH}", endpoint.base_url());
        let response = self.client.get(&url).send().await.map_err(|error| {
            if error.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::Failed(error.to_string())
            }
        })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Failed(format!("{url} returned {}", response.status())))
        }
    }
}

pub struct HealthMonitor {
    probe: Arc<dyn ReadinessProbe>,
    backoff: Backoff,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn ReadinessProbe>, backoff: Backoff, probe_timeout: Duration) -> Self {
        Self {
            probe,
            backoff,
            probe_timeout,
        }
    }

    pub fn from_config(probe: Arc<dyn ReadinessProbe>, config: &HealthConfig) -> Self {
        Self::new(probe, Backoff::from(config), config.probe_timeout())
    }

    /// Probes until one success (`Ready`) or until the attempt budget is spent (`Failed`).
    pub async fn wait_ready(
        &self,
        endpoint: &ServiceEndpoint,
        cancel: &CancellationToken,
    ) -> Result<(), HealthError> {
        let probe = &self.probe;
        let probe_timeout = self.probe_timeout;
        let outcome = self
            .backoff
            .retry(cancel, |attempt| async move {
                let result = tokio::time::timeout(probe_timeout, probe.probe(endpoint))
                    .await
                    .unwrap_or(Err(ProbeError::Timeout));
                if let Err(error) = &result {
                    tracing::debug!(port = endpoint.port(), attempt, %error, "readiness probe failed");
                }
                result
            })
            .await;

        match outcome {
            Ok(()) => {
                if endpoint.transition_from(EndpointState::Starting, EndpointState::Ready) {
                    Ok(())
                } else {
                    tracing::warn!(state = %endpoint.state(), "probe succeeded after endpoint left starting");
                    Err(HealthError::Cancelled)
                }
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                endpoint.transition(EndpointState::Failed);
                let last_error = last
                    .map(|error| error.to_string())
                    .unwrap_or_else(|| "no attempts made".to_string());
                tracing::error!(port = endpoint.port(), attempts, %last_error, "backend never became ready");
                Err(HealthError::ServiceUnavailable {
                    attempts,
                    last_error,
                })
            }
            Err(RetryError::Cancelled { attempts }) => {
                tracing::info!(port = endpoint.port(), attempts, "readiness wait cancelled");
                Err(HealthError::Cancelled)
            }
        }
    }
}
