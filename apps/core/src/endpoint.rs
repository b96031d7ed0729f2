use std::fmt;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl EndpointState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Address and lifecycle state of the backend for one launch.
///
/// Host and port never change after construction. Only the supervisor and the
/// health monitor move the state.
#[derive(Debug)]
pub struct ServiceEndpoint {
    host: String,
    port: u16,
    state: watch::Sender<EndpointState>,
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (state, _) = watch::channel(EndpointState::Idle);
        Self {
            host: host.into(),
            port,
            state,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    /// Moves to `next` unless the endpoint already reached a terminal state.
    pub(crate) fn transition(&self, next: EndpointState) -> bool {
        let mut previous = EndpointState::Idle;
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            tracing::info!(port = self.port, from = %previous, to = %next, "endpoint state changed");
        }
        changed
    }

    /// Like [`transition`](Self::transition) but only from `expected`.
    pub(crate) fn transition_from(&self, expected: EndpointState, next: EndpointState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current != expected {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(port = self.port, from = %expected, to = %next, "endpoint state changed");
        }
        changed
    }
}
