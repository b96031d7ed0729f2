//! Wires config, supervisor, health monitor, query clients and the image cache
//! into one object the interface layer holds for the life of the app.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::cache::{CacheSettings, ImageCache, ThumbnailDecoder};
use crate::client::{ClientError, ClientSettings, SearchClient};
use crate::config::{validate, Config, ConfigError};
use crate::endpoint::ServiceEndpoint;
use crate::health::{HealthError, HealthMonitor, HttpProbe, ReadinessProbe};
use crate::model::{SearchHit, SearchRequest};
use crate::port::PortError;
use crate::progress::ProgressFeed;
use crate::supervisor::{ServiceSupervisor, SupervisorError, SupervisorEvent};
use crate::transport::{http_client, HttpBackend, SearchBackend};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to spawn backend '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },
    #[error(transparent)]
    Health(#[from] HealthError),
    #[error("backend on port {port} exited during startup (code {code:?})")]
    UnexpectedExit { port: u16, code: Option<i32> },
}

impl SessionError {
    /// Whether offering "retry" can help without the user changing the config.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::SpawnFailed { .. })
    }
}

impl From<SupervisorError> for SessionError {
    fn from(value: SupervisorError) -> Self {
        match value {
            SupervisorError::Port(error) => Self::Port(error),
            SupervisorError::SpawnFailed { program, reason } => Self::SpawnFailed { program, reason },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The ready backend died on its own. Search is degraded until `restart`.
    BackendExited { port: u16, code: Option<i32> },
}

/// Forwards to whichever launch is current, so clients outlive restarts.
struct RoutedBackend {
    current: RwLock<Arc<HttpBackend>>,
}

impl RoutedBackend {
    fn route_to(&self, backend: HttpBackend) {
        tracing::debug!(base_url = backend.base_url(), "search traffic rerouted");
        *self.current.write() = Arc::new(backend);
    }

    fn current(&self) -> Arc<HttpBackend> {
        self.current.read().clone()
    }
}

#[async_trait]
impl SearchBackend for RoutedBackend {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ClientError> {
        self.current().search(request).await
    }

    async fn recent(&self, count: u32) -> Result<Vec<SearchHit>, ClientError> {
        self.current().recent(count).await
    }

    async fn similar(&self, path: &Path, limit: u32) -> Result<Vec<SearchHit>, ClientError> {
        self.current().similar(path, limit).await
    }
}

pub struct Session {
    config: Config,
    supervisor: ServiceSupervisor,
    supervisor_events: mpsc::UnboundedReceiver<SupervisorEvent>,
    health: HealthMonitor,
    http: reqwest::Client,
    backend: Arc<RoutedBackend>,
    cache: ImageCache,
}

impl Session {
    /// Allocates a port, spawns the backend and waits for it to report ready.
    pub async fn start(config: Config) -> Result<Self, SessionError> {
        let http = http_client(config.health.probe_timeout());
        let probe = Arc::new(HttpProbe::new(http.clone()));
        Self::start_with_probe(config, probe).await
    }

    pub async fn start_with_probe(
        config: Config,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self, SessionError> {
        validate(&config).map_err(ConfigError::Invalid)?;

        let http = http_client(config.health.probe_timeout());
        let (supervisor, supervisor_events) = ServiceSupervisor::new(config.backend.clone());
        let health = HealthMonitor::from_config(probe, &config.health);
        let cache = ImageCache::new(
            CacheSettings::from(&config.cache),
            Arc::new(ThumbnailDecoder),
            Handle::current(),
        );
        let unrouted = HttpBackend::with_client(
            http.clone(),
            format!("http://{}:{}", config.backend.host, config.backend.base_port),
        );

        let mut session = Self {
            config,
            supervisor,
            supervisor_events,
            health,
            http,
            backend: Arc::new(RoutedBackend {
                current: RwLock::new(Arc::new(unrouted)),
            }),
            cache,
        };
        session.launch().await?;
        Ok(session)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A client for one query surface, with its own generation counter.
    pub fn search_client(&self) -> SearchClient {
        SearchClient::new(self.backend.clone(), ClientSettings::from(&self.config.search))
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn endpoint(&self) -> Option<Arc<ServiceEndpoint>> {
        self.supervisor.endpoint()
    }

    pub fn take_progress(&mut self) -> Option<ProgressFeed> {
        self.supervisor.take_progress()
    }

    /// Waits for the next thing the interface layer has to surface.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let SupervisorEvent::Exited {
                launch,
                port,
                code,
                expected,
            } = self.supervisor_events.recv().await?;
            // A restart can reuse the port, so only the launch id tells runs apart.
            if expected || self.supervisor.launch_id() != Some(launch) {
                tracing::debug!(launch, port, expected, "ignoring exit of a previous launch");
                continue;
            }
            tracing::warn!(port, ?code, "backend lost, search degraded until restart");
            return Some(SessionEvent::BackendExited { port, code });
        }
    }

    /// Manual restart after a failure. Clients handed out earlier keep working.
    pub async fn restart(&mut self) -> Result<Arc<ServiceEndpoint>, SessionError> {
        tracing::info!("restarting backend");
        self.launch().await
    }

    pub async fn shutdown(&mut self) {
        self.supervisor.stop().await;
        self.cache.clear();
        tracing::info!("session shut down");
    }

    async fn launch(&mut self) -> Result<Arc<ServiceEndpoint>, SessionError> {
        let attempts = self.config.backend.startup_attempts;
        let mut base_port = self.config.backend.base_port;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let endpoint = self.supervisor.start(base_port).await?;
            let launch = self.supervisor.launch_id().unwrap_or_default();
            let exited = self.supervisor.exit_token().unwrap_or_default();

            match self.health.wait_ready(&endpoint, &exited).await {
                Ok(()) => {
                    self.backend
                        .route_to(HttpBackend::with_client(self.http.clone(), endpoint.base_url()));
                    tracing::info!(port = endpoint.port(), attempt, "backend ready");
                    return Ok(endpoint);
                }
                Err(HealthError::Cancelled) => {
                    let port = endpoint.port();
                    let code = self.drain_exit(launch);
                    tracing::warn!(port, ?code, attempt, attempts, "backend exited during startup");
                    if attempt >= attempts {
                        self.supervisor.stop().await;
                        return Err(SessionError::UnexpectedExit { port, code });
                    }
                    // Likely lost a bind race on this port; move past it.
                    base_port = port.checked_add(1).ok_or(PortError::ResourceExhausted {
                        base: port,
                        tried: 1,
                    })?;
                }
                Err(error) => {
                    self.supervisor.stop().await;
                    return Err(error.into());
                }
            }
        }
    }

    fn drain_exit(&mut self, launch: u64) -> Option<i32> {
        let mut code = None;
        while let Ok(SupervisorEvent::Exited {
            launch: exited,
            code: exited_code,
            ..
        }) = self.supervisor_events.try_recv()
        {
            if exited == launch {
                code = exited_code;
            }
        }
        code
    }
}
