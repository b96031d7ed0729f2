//! Backend process lifecycle.
//!
//! One launch at a time: the spawned child is moved into a monitor task that is
//! the only code able to signal, kill, or reap it. Both `stop()` and a natural
//! exit end in that task, so the handle is released exactly once.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::endpoint::{EndpointState, ServiceEndpoint};
use crate::port::{self, PortError};
use crate::progress::{ProgressFeed, ProgressStream};

const STALE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to spawn backend '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The backend process is gone. `expected` is false when it died on its own.
    Exited {
        launch: u64,
        port: u16,
        code: Option<i32>,
        expected: bool,
    },
}

struct Launch {
    id: u64,
    endpoint: Arc<ServiceEndpoint>,
    terminate: Option<oneshot::Sender<Duration>>,
    monitor: JoinHandle<()>,
    exited: CancellationToken,
    progress: Option<ProgressFeed>,
}

pub struct ServiceSupervisor {
    config: BackendConfig,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    current: Option<Launch>,
    launches: u64,
}

impl ServiceSupervisor {
    pub fn new(config: BackendConfig) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                events,
                current: None,
                launches: 0,
            },
            rx,
        )
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn endpoint(&self) -> Option<Arc<ServiceEndpoint>> {
        self.current.as_ref().map(|launch| launch.endpoint.clone())
    }

    /// Identifies the current launch; exit events carry the same id.
    pub fn launch_id(&self) -> Option<u64> {
        self.current.as_ref().map(|launch| launch.id)
    }

    /// Cancelled once the current process has exited, for whatever reason.
    pub fn exit_token(&self) -> Option<CancellationToken> {
        self.current.as_ref().map(|launch| launch.exited.clone())
    }

    /// Progress records from the backend's stdout. Available once per launch.
    pub fn take_progress(&mut self) -> Option<ProgressFeed> {
        self.current.as_mut().and_then(|launch| launch.progress.take())
    }

    /// Replaces any running backend of this role with a fresh one on a free port
    /// at or above `base_port`. The returned endpoint is `Starting`.
    pub async fn start(&mut self, base_port: u16) -> Result<Arc<ServiceEndpoint>, SupervisorError> {
        self.stop().await;

        let reaped = reap_stale(&self.config.role_marker, self.config.stop_grace()).await;
        if reaped > 0 {
            tracing::info!(reaped, marker = %self.config.role_marker, "terminated stale backend processes");
        }

        let port = port::allocate(base_port, self.config.port_retries)?;
        let endpoint = Arc::new(ServiceEndpoint::new(self.config.host.clone(), port));
        endpoint.transition(EndpointState::Starting);

        let args = render_args(&self.config.args, port, &self.config.role_marker);
        tracing::info!(program = %self.config.program, ?args, port, "spawning backend");

        let mut child = match Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                endpoint.transition(EndpointState::Failed);
                tracing::error!(program = %self.config.program, %error, "backend spawn failed");
                return Err(SupervisorError::SpawnFailed {
                    program: self.config.program.clone(),
                    reason: error.to_string(),
                });
            }
        };

        let progress = child.stdout.take().map(|stdout| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                // Reads until EOF; closing stdout early would kill the backend on its next write.
                let mut records = ProgressStream::new(stdout);
                loop {
                    while let Some(event) = records.next().await {
                        tracing::info!(?event, "indexing progress");
                        if tx.send(event).is_err() {
                            tracing::trace!("progress receiver dropped");
                        }
                    }
                    if !records.next_pass() {
                        break;
                    }
                }
            });
            ProgressFeed::new(rx)
        });
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, port));
        }

        self.launches += 1;
        let id = self.launches;
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let exited = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            id,
            child,
            terminate_rx,
            endpoint.clone(),
            exited.clone(),
            self.events.clone(),
            self.config.stop_grace(),
        ));

        self.current = Some(Launch {
            id,
            endpoint: endpoint.clone(),
            terminate: Some(terminate_tx),
            monitor,
            exited,
            progress,
        });
        Ok(endpoint)
    }

    /// Graceful signal, bounded wait, then force kill. Idempotent.
    pub async fn stop(&mut self) {
        let Some(mut launch) = self.current.take() else {
            return;
        };

        let endpoint = launch.endpoint.clone();
        endpoint.transition(EndpointState::Stopping);
        if let Some(terminate) = launch.terminate.take() {
            let _ = terminate.send(self.config.stop_grace());
        }
        if let Err(error) = (&mut launch.monitor).await {
            tracing::error!(%error, "backend monitor task failed");
        }
        endpoint.transition_from(EndpointState::Stopping, EndpointState::Stopped);
        tracing::info!(port = endpoint.port(), state = %endpoint.state(), "backend stopped");
    }
}

impl Drop for ServiceSupervisor {
    fn drop(&mut self) {
        if let Some(launch) = self.current.as_mut() {
            if let Some(terminate) = launch.terminate.take() {
                let _ = terminate.send(self.config.stop_grace());
            }
        }
    }
}

async fn monitor(
    launch: u64,
    mut child: Child,
    terminate: oneshot::Receiver<Duration>,
    endpoint: Arc<ServiceEndpoint>,
    exited: CancellationToken,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    default_grace: Duration,
) {
    let (status, expected) = tokio::select! {
        status = child.wait() => (status, false),
        grace = terminate => {
            let grace = grace.unwrap_or(default_grace);
            (terminate_child(&mut child, grace).await, true)
        }
    };
    drop(child);
    let expected = expected || endpoint.state() == EndpointState::Stopping;

    let code = status.as_ref().ok().and_then(ExitStatus::code);
    if expected {
        endpoint.transition(EndpointState::Stopped);
    } else {
        match &status {
            Ok(status) => tracing::warn!(port = endpoint.port(), %status, "backend exited unexpectedly"),
            Err(error) => tracing::error!(port = endpoint.port(), %error, "failed to wait on backend"),
        }
        endpoint.transition(EndpointState::Failed);
    }

    let _ = events.send(SupervisorEvent::Exited {
        launch,
        port: endpoint.port(),
        code,
        expected,
    });
    // Sent before cancelling so a woken waiter can always find the event.
    exited.cancel();
}

async fn terminate_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    send_graceful(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "backend ignored termination, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_graceful(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as UnixPid;

    if let Some(pid) = child.id() {
        if let Err(error) = kill(UnixPid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid, %error, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn send_graceful(child: &mut Child) {
    let _ = child.start_kill();
}

async fn forward_stderr(stderr: ChildStderr, port: u16) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "searchy_core::backend", port, "{line}");
    }
}

pub(crate) fn render_args(template: &[String], port: u16, marker: &str) -> Vec<String> {
    let port = port.to_string();
    let mut args: Vec<String> = template
        .iter()
        .map(|arg| arg.replace("{port}", &port).replace("{marker}", marker))
        .collect();
    if !template.iter().any(|arg| arg.contains("{marker}")) {
        args.push(format!("--instance-marker={marker}"));
    }
    args
}

fn command_has_marker(cmd: &[std::ffi::OsString], marker: &str) -> bool {
    cmd.iter().any(|arg| arg.to_string_lossy().contains(marker))
}

/// Terminates leftover processes whose command line carries `marker`.
pub(crate) async fn reap_stale(marker: &str, grace: Duration) -> usize {
    let own = sysinfo::get_current_pid().ok();
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let stale: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, process)| Some(**pid) != own && command_has_marker(process.cmd(), marker))
        .map(|(pid, _)| *pid)
        .collect();
    if stale.is_empty() {
        return 0;
    }

    for pid in &stale {
        if let Some(process) = system.process(*pid) {
            tracing::info!(pid = pid.as_u32(), "terminating stale backend");
            if process.kill_with(sysinfo::Signal::Term).is_none() {
                process.kill();
            }
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        tokio::time::sleep(STALE_POLL_INTERVAL).await;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&stale),
            true,
            ProcessRefreshKind::nothing(),
        );
        let alive: Vec<Pid> = stale
            .iter()
            .copied()
            .filter(|pid| system.process(*pid).is_some())
            .collect();
        if alive.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            for pid in alive {
                if let Some(process) = system.process(pid) {
                    tracing::warn!(pid = pid.as_u32(), "force killing stale backend");
                    process.kill();
                }
            }
            break;
        }
    }
    stale.len()
}
