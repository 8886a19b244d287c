use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

use crate::error::ProbeError;

/// Outcome of a single TCP connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Handshake completed within the timeout.
    Open,
    /// The host answered with a refusal or reset.
    Closed,
    /// No answer in time, or no route to the host.
    Unreachable,
}

impl PortState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

/// Attempt a TCP handshake with `addr`, giving up after `timeout`.
///
/// The connection is dropped before returning. Refusals, timeouts and routing
/// failures are reported as states; only local resource exhaustion and bad
/// arguments come back as errors.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> Result<PortState, ProbeError> {
    if timeout.is_zero() {
        return Err(ProbeError::Config("probe timeout must be non-zero".into()));
    }
    if addr.port() == 0 {
        return Err(ProbeError::Config(format!("cannot probe port 0 on {}", addr.ip())));
    }

    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(PortState::Open)
        }
        Ok(Err(e)) => classify_connect_error(e),
        Err(_elapsed) => Ok(PortState::Unreachable),
    }
}

fn classify_connect_error(e: io::Error) -> Result<PortState, ProbeError> {
    if is_resource_exhaustion(&e) {
        return Err(ProbeError::ResourceExhausted(e));
    }
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => Ok(PortState::Closed),
        io::ErrorKind::InvalidInput => Err(ProbeError::Config(e.to_string())),
        _ => Ok(PortState::Unreachable),
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE || code == libc::ENOBUFS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn listener_is_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = probe(addr, Duration::from_millis(500)).await.unwrap();
        assert_eq!(state, PortState::Open);
    }

    #[tokio::test]
    async fn closed_port_is_not_open() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let state = probe(addr, Duration::from_millis(500)).await.unwrap();
        assert!(!state.is_open());
    }

    #[tokio::test]
    async fn zero_timeout_is_a_config_error() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert!(matches!(
            probe(addr, Duration::ZERO).await,
            Err(ProbeError::Config(_))
        ));
    }

    #[test]
    fn refused_and_reset_map_to_closed() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_connect_error(refused).unwrap(), PortState::Closed);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_connect_error(reset).unwrap(), PortState::Closed);
    }

    #[test]
    fn fd_exhaustion_propagates() {
        let e = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(matches!(
            classify_connect_error(e),
            Err(ProbeError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn timeouts_are_unreachable() {
        let e = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_connect_error(e).unwrap(), PortState::Unreachable);
    }
}
