//! # peerwire
//!
//! Handshake-gated, length-framed message sessions over TCP.
//!
//! Two processes exchange discrete `(payload, metadata)` messages over one
//! connection. Before any message flows, the accepting side sends
//! `APPSERVICEV<version>` and the initiating side answers with
//! `APPCLIENTV<version>`; a mismatch ends the connection.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): `int16 metaLen | metadata | int32 payloadLen | payload`,
//!   little-endian, payload capped at 10,000,000 bytes
//! - **Pipeline** ([`pipeline`], [`writer`]): exact-length reads and ordered,
//!   acknowledged writes over a live stream
//! - **Session** ([`session`]): per-connection state machine, handshake, and
//!   receive loop
//! - **Endpoint service** ([`service`]) and **client** ([`client`]): own
//!   sessions and deliver their events from one task each
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::{Client, ClientConfig, Message, SessionHandle, SessionObserver};
//!
//! struct Print;
//!
//! impl SessionObserver for Print {
//!     fn message_received(&self, _session: &SessionHandle, message: Message) {
//!         println!("received {} bytes", message.payload().len());
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let config = ClientConfig::new("127.0.0.1:7070".parse::<std::net::SocketAddr>().unwrap().into());
//!     let mut client = Client::new(config, Arc::new(Print));
//!     client.connect()?;
//!     client.wait_connected().await?;
//!     client.send_message(&Message::new(&b"hello"[..], &b""[..])).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod writer;

pub use client::{Client, ClientConfig, Target};
pub use error::{PeerwireError, Result};
pub use protocol::Message;
pub use service::{EndpointService, ServiceConfig, ServiceObserver};
pub use session::{SessionHandle, SessionId, SessionObserver, SessionState, TransportSignal};
