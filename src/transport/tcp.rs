//! TCP listener and stream helpers.
//!
//! # Example
//!
//! ```
//! use peerwire::transport;
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_io().build().unwrap();
//! # rt.block_on(async {
//! let listener = transport::bind("127.0.0.1", None).await.unwrap();
//! let addr = listener.local_addr().unwrap();
//! let (stream, _) = tokio::join!(listener.accept(), transport::connect(addr));
//! assert!(stream.is_ok());
//! # });
//! ```

use std::net::SocketAddr;

pub use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Bind a listener on `host`, on `port` if given, otherwise on an ephemeral
/// port.
pub async fn bind(host: &str, port: Option<u16>) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port.unwrap_or(0))).await?;
    tracing::debug!(addr = ?listener.local_addr().ok(), "listener bound");
    Ok(listener)
}

/// Open a connection to `addr`.
pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_stream(&stream);
    Ok(stream)
}

/// Apply per-connection socket options.
///
/// Frames are written segment by segment and flushed, so Nagle's algorithm
/// would only add latency.
pub fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "could not set TCP_NODELAY");
    }
}
