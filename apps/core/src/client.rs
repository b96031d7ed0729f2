//! Query client for one search surface.
//!
//! Every submission takes the next generation number and cancels whatever the
//! surface had in flight. A response is delivered only if its generation is
//! still the newest when it settles; anything older resolves to
//! [`Outcome::Superseded`], including late errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{EmptyQueryPolicy, SearchConfig};
use crate::model::{ResultSource, SearchHit, SearchParams, SearchRequest, SearchResults};
use crate::transport::SearchBackend;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("request timed out")]
    Timeout,
    #[error("could not decode backend response: {0}")]
    DecodeFailed(String),
    #[error("backend reported an error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Delivered(SearchResults),
    Superseded { generation: u64 },
}

impl Outcome {
    pub fn delivered(self) -> Option<SearchResults> {
        match self {
            Self::Delivered(results) => Some(results),
            Self::Superseded { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub debounce: Duration,
    pub request_timeout: Duration,
    pub defaults: SearchParams,
    pub recent_count: u32,
    pub empty_query: EmptyQueryPolicy,
}

impl From<&SearchConfig> for ClientSettings {
    fn from(value: &SearchConfig) -> Self {
        Self {
            debounce: value.debounce(),
            request_timeout: value.request_timeout(),
            defaults: SearchParams {
                limit: value.default_limit,
                threshold: value.default_threshold,
            },
            recent_count: value.recent_count,
            empty_query: value.empty_query,
        }
    }
}

enum Work {
    Search(SearchRequest),
    Recent(u32),
    Similar(PathBuf, u32),
    Clear,
}

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
}

struct SurfaceState {
    generation: u64,
    in_flight: Option<InFlight>,
}

struct Inner {
    backend: Arc<dyn SearchBackend>,
    settings: ClientSettings,
    state: Mutex<SurfaceState>,
}

/// Cloning yields a handle to the same surface and generation counter.
#[derive(Clone)]
pub struct SearchClient {
    inner: Arc<Inner>,
}

impl SearchClient {
    pub fn new(backend: Arc<dyn SearchBackend>, settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                settings,
                state: Mutex::new(SurfaceState {
                    generation: 0,
                    in_flight: None,
                }),
            }),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub fn default_params(&self) -> SearchParams {
        self.inner.settings.defaults
    }

    /// Debounced search; an empty query short-circuits per the empty-query policy.
    pub async fn submit(
        &self,
        query: &str,
        params: Option<SearchParams>,
    ) -> Result<Outcome, ClientError> {
        let params = params.unwrap_or(self.inner.settings.defaults);
        let (generation, cancel) = self.begin();
        let request = SearchRequest::new(query, params, generation);

        let work = if !request.query().is_empty() {
            Work::Search(request)
        } else {
            match self.inner.settings.empty_query {
                EmptyQueryPolicy::Recent => Work::Recent(self.inner.settings.recent_count),
                EmptyQueryPolicy::Clear => Work::Clear,
            }
        };
        self.run(generation, cancel, work).await
    }

    /// Images similar to an already indexed one. Not debounced.
    pub async fn similar(&self, path: &Path, limit: u32) -> Result<Outcome, ClientError> {
        let (generation, cancel) = self.begin();
        self.run(generation, cancel, Work::Similar(path.to_path_buf(), limit))
            .await
    }

    /// Cancels whatever is in flight; its result will never be delivered.
    pub fn cancel(&self) {
        let (generation, _) = self.begin();
        let mut state = self.inner.state.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            state.in_flight = None;
        }
    }

    fn begin(&self) -> (u64, CancellationToken) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        let previous = state.in_flight.replace(InFlight {
            generation,
            cancel: cancel.clone(),
        });
        drop(state);

        if let Some(previous) = previous {
            tracing::debug!(
                superseded = previous.generation,
                by = generation,
                "cancelling in-flight request"
            );
            previous.cancel.cancel();
        }
        (generation, cancel)
    }

    async fn run(
        &self,
        generation: u64,
        cancel: CancellationToken,
        work: Work,
    ) -> Result<Outcome, ClientError> {
        let settings = &self.inner.settings;
        let backend = &self.inner.backend;

        let (source, fetched) = match work {
            Work::Clear => (ResultSource::Cleared, Some(Ok(Vec::new()))),
            Work::Recent(count) => (
                ResultSource::Recent,
                dispatch(&cancel, settings.request_timeout, backend.recent(count)).await,
            ),
            Work::Similar(path, limit) => (
                ResultSource::Similar,
                dispatch(
                    &cancel,
                    settings.request_timeout,
                    backend.similar(&path, limit),
                )
                .await,
            ),
            Work::Search(request) => {
                let debounced = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(settings.debounce) => true,
                };
                if !debounced {
                    (ResultSource::Search, None)
                } else {
                    tracing::debug!(generation, query = request.query(), "dispatching search");
                    (
                        ResultSource::Search,
                        dispatch(&cancel, settings.request_timeout, backend.search(&request))
                            .await,
                    )
                }
            }
        };

        self.settle(generation, source, fetched)
    }

    fn settle(
        &self,
        generation: u64,
        source: ResultSource,
        fetched: Option<Result<Vec<SearchHit>, ClientError>>,
    ) -> Result<Outcome, ClientError> {
        let mut state = self.inner.state.lock();
        let latest = state.generation == generation;
        if state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation)
        {
            state.in_flight = None;
        }
        drop(state);

        match fetched {
            Some(Ok(hits)) if latest => Ok(Outcome::Delivered(SearchResults {
                generation,
                source,
                hits,
            })),
            Some(Err(error)) if latest => {
                tracing::warn!(generation, %error, "search request failed");
                Err(error)
            }
            _ => {
                tracing::debug!(generation, "discarding superseded response");
                Ok(Outcome::Superseded { generation })
            }
        }
    }
}

async fn dispatch<F>(
    cancel: &CancellationToken,
    timeout: Duration,
    call: F,
) -> Option<Result<Vec<SearchHit>, ClientError>>
where
    F: std::future::Future<Output = Result<Vec<SearchHit>, ClientError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        outcome = tokio::time::timeout(timeout, call) => Some(outcome.unwrap_or(Err(ClientError::Timeout))),
    }
}
