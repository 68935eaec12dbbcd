//! TCP socket tuning for the receiver connection.
//!
//! Receivers sit on home networks and are often power-cycled; keepalive lets
//! the OS notice a vanished peer even when the probe is disabled.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::debug;

/// Keepalive timing for an idle receiver link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the OS sends its first keepalive.
    pub idle: Duration,
    /// Gap between unanswered keepalives.
    pub interval: Duration,
    /// Unanswered keepalives before the OS drops the link. Ignored on macOS.
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            retries: 3,
        }
    }
}

impl Keepalive {
    /// Worst-case time from the last received byte until the OS gives up.
    pub fn detection_time(&self) -> Duration {
        self.idle + self.interval * self.retries
    }

    fn to_socket2(self) -> TcpKeepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(self.idle)
            .with_interval(self.interval);
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(self.retries);
        keepalive
    }
}

/// Socket options applied to every receiver connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Send small commands immediately instead of coalescing them.
    pub nodelay: bool,
    /// OS keepalive, or `None` to rely on the latency check alone.
    pub keepalive: Option<Keepalive>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Keepalive::default()),
        }
    }
}

/// Apply `config` to a freshly connected receiver socket.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(config.nodelay)?;

    match config.keepalive {
        Some(keepalive) => {
            socket.set_tcp_keepalive(&keepalive.to_socket2())?;
            debug!(
                nodelay = config.nodelay,
                detection = ?keepalive.detection_time(),
                "receiver socket configured"
            );
        }
        None => {
            socket.set_keepalive(false)?;
            debug!(nodelay = config.nodelay, "receiver socket configured without keepalive");
        }
    }
    Ok(())
}
