//! TCP reachability probes.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Timeout for one connection attempt.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connects to `127.0.0.1:port` and closes the connection.
///
/// # Errors
///
/// Returns an IO error if the connection is refused or times out.
pub async fn check_port(port: u16) -> Result<()> {
    let stream = timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to port {port} timed out"),
            ))
        })??;
    stream.set_nodelay(true)?;
    drop(stream);
    Ok(())
}

/// Best-effort liveness probe; never fails.
pub async fn is_port_open(port: u16) -> bool {
    check_port(port).await.is_ok()
}
