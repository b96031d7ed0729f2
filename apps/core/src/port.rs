use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("no free port in {base}..{base}+{tried}")]
    ResourceExhausted { base: u16, tried: u16 },
}

/// Returns the first loopback port in `base..base + max_retries` with no live listener.
///
/// The probe binds and immediately releases each candidate, so the answer can go
/// stale before the backend binds it; callers retry on a lost race.
pub fn allocate(base: u16, max_retries: u16) -> Result<u16, PortError> {
    let mut tried = 0_u16;
    for offset in 0..max_retries {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        tried += 1;
        if is_free(port) {
            tracing::debug!(port, "port probe succeeded");
            return Ok(port);
        }
        tracing::debug!(port, "port busy");
    }

    Err(PortError::ResourceExhausted { base, tried })
}

pub fn is_free(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::{allocate, is_free, PortError};

    #[test]
    fn skips_ports_with_live_listener() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();

        assert!(!is_free(busy));
        if let Ok(port) = allocate(busy, 2) {
            assert_ne!(port, busy);
            assert_eq!(port, busy + 1);
        }
    }

    #[test]
    fn exhausts_when_every_candidate_is_taken() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();

        assert_eq!(
            allocate(busy, 1),
            Err(PortError::ResourceExhausted {
                base: busy,
                tried: 1
            })
        );
    }

    #[test]
    fn probe_releases_the_port() {
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let first = allocate(port, 1);
        let second = allocate(port, 1);
        assert_eq!(first, second);
    }
}
