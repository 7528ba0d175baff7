//! Transport module - TCP listener and connection setup.
//!
//! Sessions only need an `AsyncRead + AsyncWrite` stream; this module is
//! where those streams come from in production.

mod tcp;

pub use tcp::{bind, connect, configure_stream, TcpListener, TcpStream};
