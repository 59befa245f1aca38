use std::net::Ipv4Addr;

use tokio::net::TcpListener;

#[derive(Debug, thiserror::Error)]
#[error("no free local port: {0}")]
pub struct PortError(#[from] std::io::Error);

/// Find a free TCP port on the loopback interface
///
/// The port is bound and released immediately, so another process may grab it
/// before the caller does. A context handler whose process never listens on
/// the port forgets it and allocates a new one on the next start.
pub async fn allocate_port() -> Result<u16, PortError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
