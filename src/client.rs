//! Client - one outbound session at a time.
//!
//! The [`Client`] connects to a literal address or to a name found through a
//! [`ServiceResolver`], runs the initiating side of the handshake, and
//! delivers the session's events to its [`SessionObserver`] from a single
//! dispatch task.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::client::{Client, ClientConfig, Target};
//! use peerwire::protocol::Message;
//! use peerwire::session::{SessionHandle, SessionObserver};
//!
//! struct Print;
//!
//! impl SessionObserver for Print {
//!     fn message_received(&self, _session: &SessionHandle, message: Message) {
//!         println!("{:?}", message);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let config = ClientConfig::new(Target::address("127.0.0.1", 7070));
//!     let mut client = Client::new(config, Arc::new(Print));
//!
//!     client.connect()?;
//!     client.wait_connected().await?;
//!     client.send_message(&Message::from_payload(&b"hello"[..])).await?;
//!     Ok(())
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::Instrument;

use crate::discovery::ServiceResolver;
use crate::error::{PeerwireError, Result};
use crate::protocol::{HandshakeTokens, Message, DEFAULT_PROTOCOL_VERSION};
use crate::session::{
    self, EventSender, Role, SessionEvent, SessionEventKind, SessionHandle, SessionId,
    SessionObserver, SessionSetup, SessionState,
};
use crate::transport;
use crate::writer::WriterConfig;

/// Default span label for clients.
pub const DEFAULT_CLIENT_LABEL: &str = "peerwire-client";

/// Messages a slow `receive_message` caller may fall behind by before it
/// skips ahead.
const INBOX_CAPACITY: usize = 64;

/// Copy of each delivered message, or `None` once the session has ended,
/// in dispatch order.
type Inbox = broadcast::Sender<(SessionId, Option<Message>)>;

/// Where a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// Literal host and port; the host may be a name for DNS.
    Address { host: String, port: u16 },
    /// A discoverable service, resolved through the client's resolver.
    Service { name: String, service_type: String },
}

impl Target {
    pub fn address(host: impl Into<String>, port: u16) -> Self {
        Target::Address {
            host: host.into(),
            port,
        }
    }

    pub fn service(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Target::Service {
            name: name.into(),
            service_type: service_type.into(),
        }
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::address(addr.ip().to_string(), addr.port())
    }
}

fn default_protocol_version() -> u32 {
    DEFAULT_PROTOCOL_VERSION
}

fn default_label() -> String {
    DEFAULT_CLIENT_LABEL.to_string()
}

/// Client configuration.
///
/// ```
/// use peerwire::client::{ClientConfig, Target};
///
/// let config = ClientConfig::from_json_str(
///     r#"{ "target": { "kind": "service", "name": "chat", "service_type": "_chat._tcp" } }"#,
/// ).unwrap();
/// assert_eq!(config.target, Target::service("chat", "_chat._tcp"));
/// assert_eq!(config.protocol_version, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub target: Target,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default)]
    pub writer: WriterConfig,
    /// Name of the tracing span every task of this client runs in.
    #[serde(default = "default_label")]
    pub label: String,
}

impl ClientConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            writer: WriterConfig::default(),
            label: default_label(),
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Holds at most one initiating session.
pub struct Client {
    config: ClientConfig,
    observer: Arc<dyn SessionObserver>,
    resolver: Option<Arc<dyn ServiceResolver>>,
    span: tracing::Span,
    session: Option<SessionHandle>,
    /// Feeds the dispatch task; spawned on first connect.
    events: Option<EventSender>,
    inbox: Inbox,
}

impl Client {
    pub fn new(config: ClientConfig, observer: Arc<dyn SessionObserver>) -> Self {
        let span = tracing::info_span!("client", label = %config.label);
        Self {
            config,
            observer,
            resolver: None,
            span,
            session: None,
            events: None,
            inbox: broadcast::channel(INBOX_CAPACITY).0,
        }
    }

    /// Resolve `Target::Service` through `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run every task of this client in `span`.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a new session towards the configured target.
    ///
    /// Ignored, with a warning, while the previous session has not reached
    /// `Cancelled`. Connection progress is reported through the observer and
    /// the session state.
    ///
    /// # Errors
    ///
    /// `Unknown` if the target is a service name and no resolver is set.
    pub fn connect(&mut self) -> Result<()> {
        if let Some(current) = &self.session {
            let state = current.state();
            if state != SessionState::Cancelled {
                tracing::warn!(parent: &self.span, session = %current.id(), %state, "connect ignored, session still active");
                return Ok(());
            }
        }

        let resolver = match (&self.config.target, &self.resolver) {
            (Target::Service { name, .. }, None) => {
                return Err(PeerwireError::Unknown(format!(
                    "cannot resolve service {:?} without a resolver",
                    name
                )));
            }
            (_, resolver) => resolver.clone(),
        };

        let (session, control) = SessionHandle::new(Role::Initiating, None);
        session.set_observer(self.observer.clone());

        let target = self.config.target.clone();
        let connecting = async move {
            let addr = resolve_target(&target, resolver.as_deref()).await?;
            let stream = transport::connect(addr).await?;
            Ok::<_, PeerwireError>((stream, Some(addr)))
        };
        let setup = SessionSetup {
            tokens: HandshakeTokens::new(self.config.protocol_version),
            writer: self.config.writer.clone(),
            events: self.dispatcher(),
        };
        tracing::debug!(parent: &self.span, session = %session.id(), target = ?self.config.target, "connecting");
        session::spawn_driver(session.clone(), control, connecting, setup, &self.span);

        self.session = Some(session);
        Ok(())
    }

    /// Wait until the current session is established.
    ///
    /// # Errors
    ///
    /// `NoConnection` if there is no session or it ends first.
    pub async fn wait_connected(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(PeerwireError::NoConnection)?;
        let state = session
            .wait_for_state(|s| s == SessionState::Established || s.is_finished())
            .await;
        if state == SessionState::Established {
            Ok(())
        } else {
            Err(PeerwireError::NoConnection)
        }
    }

    /// Send one message on the current session.
    ///
    /// # Errors
    ///
    /// `NoConnection` without a session (the transport is not touched), or
    /// whatever the session reports.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let session = self.session.as_ref().ok_or(PeerwireError::NoConnection)?;
        session.send_message(message).await
    }

    /// Wait for the next message on the current session.
    ///
    /// Only messages dispatched after the call starts are returned; every
    /// message still goes to the observer as well. A caller more than
    /// 64 messages behind skips the ones it missed.
    ///
    /// # Errors
    ///
    /// `NoConnection` without a live session, or if the session ends
    /// before a message arrives.
    pub async fn receive_message(&self) -> Result<Message> {
        let session = self.session.as_ref().ok_or(PeerwireError::NoConnection)?;
        let id = session.id();
        let mut inbox = self.inbox.subscribe();
        if session.state().is_finished() {
            return Err(PeerwireError::NoConnection);
        }

        loop {
            match inbox.recv().await {
                Ok((from, Some(message))) if from == id => return Ok(message),
                Ok((from, None)) if from == id => return Err(PeerwireError::NoConnection),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(parent: &self.span, skipped, "receiver fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(PeerwireError::NoConnection),
            }
        }
    }

    /// Cancel the current session and wait for it to end.
    pub async fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            session.cancel();
            session.closed().await;
        }
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_established())
    }

    fn dispatcher(&mut self) -> EventSender {
        if let Some(events) = &self.events {
            if !events.is_closed() {
                return events.clone();
            }
        }
        let (events, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let inbox = self.inbox.clone();
        let dispatch = async move {
            while let Some(event) = events_rx.recv().await {
                let copy = match &event.kind {
                    SessionEventKind::Message(message) => Some(Some(message.clone())),
                    SessionEventKind::Ended => Some(None),
                    _ => None,
                };
                if let Some(copy) = copy {
                    // No subscribers is fine
                    let _ = inbox.send((event.session.id(), copy));
                }
                event.deliver();
            }
        };
        tokio::spawn(dispatch.instrument(self.span.clone()));
        self.events = Some(events.clone());
        events
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel();
        }
    }
}

async fn resolve_target(target: &Target, resolver: Option<&dyn ServiceResolver>) -> Result<SocketAddr> {
    match target {
        Target::Address { host, port } => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| {
                PeerwireError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}:{} did not resolve", host, port),
                ))
            }),
        Target::Service { name, service_type } => match resolver {
            Some(resolver) => resolver.resolve(name, service_type).await,
            None => Err(PeerwireError::Unknown(format!(
                "cannot resolve service {:?} without a resolver",
                name
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{LocalDirectory, ServiceAdvertiser};
    use crate::protocol::encode_message;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct Ignore;

    impl SessionObserver for Ignore {
        fn message_received(&self, _session: &SessionHandle, _message: Message) {}
    }

    #[test]
    fn test_target_json_forms() {
        let address: Target = serde_json::from_str(r#"{ "kind": "address", "host": "localhost", "port": 80 }"#).unwrap();
        assert_eq!(address, Target::address("localhost", 80));

        let config = ClientConfig::from_json_str(
            r#"{ "target": { "kind": "address", "host": "::1", "port": 9 }, "label": "chat-client" }"#,
        )
        .unwrap();
        assert_eq!(config.label, "chat-client");
        assert_eq!(config.writer, WriterConfig::default());
    }

    #[test]
    fn test_target_from_socket_addr() {
        let target = Target::from("127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(target, Target::address("127.0.0.1", 9000));
    }

    #[tokio::test]
    async fn test_no_session_is_no_connection() {
        let client = Client::new(ClientConfig::new(Target::address("127.0.0.1", 1)), Arc::new(Ignore));

        assert!(matches!(
            client.send_message(&Message::default()).await,
            Err(PeerwireError::NoConnection)
        ));
        assert!(matches!(client.receive_message().await, Err(PeerwireError::NoConnection)));
        assert!(matches!(client.wait_connected().await, Err(PeerwireError::NoConnection)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_service_target_needs_resolver() {
        let mut client = Client::new(ClientConfig::new(Target::service("chat", "_chat._tcp")), Arc::new(Ignore));
        assert!(matches!(client.connect(), Err(PeerwireError::Unknown(_))));
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_connect_is_noop_while_session_live() {
        // Accepts but never speaks, so the session stays in the handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = Client::new(ClientConfig::new(addr.into()), Arc::new(Ignore));
        client.connect().unwrap();
        let first = client.session().unwrap().id();
        let (_silent, _) = listener.accept().await.unwrap();

        client.connect().unwrap();
        assert_eq!(client.session().unwrap().id(), first);

        client.disconnect().await;
        assert_eq!(client.session().unwrap().state(), SessionState::Cancelled);

        client.connect().unwrap();
        assert_ne!(client.session().unwrap().id(), first);
    }

    #[tokio::test]
    async fn test_connect_through_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let directory = LocalDirectory::new();
        directory.advertise("chat", "_chat._tcp", port).await.unwrap();

        let mut client = Client::new(ClientConfig::new(Target::service("chat", "_chat._tcp")), Arc::new(Ignore))
            .with_resolver(Arc::new(directory));
        client.connect().unwrap();

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"APPSERVICEV1").await.unwrap();
        let mut token = [0u8; 11];
        peer.read_exact(&mut token).await.unwrap();
        assert_eq!(&token, b"APPCLIENTV1");

        timeout(Duration::from_secs(5), client.wait_connected())
            .await
            .unwrap()
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(client.session().unwrap().peer_addr().map(|a| a.port()), Some(port));
    }

    #[tokio::test]
    async fn test_unresolvable_name_fails_session() {
        let mut client = Client::new(ClientConfig::new(Target::service("missing", "_chat._tcp")), Arc::new(Ignore))
            .with_resolver(Arc::new(LocalDirectory::new()));
        client.connect().unwrap();

        assert!(matches!(client.wait_connected().await, Err(PeerwireError::NoConnection)));
        client.session().unwrap().closed().await;
        assert!(matches!(client.receive_message().await, Err(PeerwireError::NoConnection)));
    }

    #[tokio::test]
    async fn test_receive_message_yields_next_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = Client::new(ClientConfig::new(addr.into()), Arc::new(Ignore));
        client.connect().unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"APPSERVICEV1").await.unwrap();
        let mut token = [0u8; 11];
        peer.read_exact(&mut token).await.unwrap();
        client.wait_connected().await.unwrap();

        // join! polls in order, so the receiver is subscribed before the write
        let frame = encode_message(&Message::new(&b"pushed"[..], &b"m"[..])).unwrap();
        let (received, written) = tokio::join!(client.receive_message(), peer.write_all(&frame));
        written.unwrap();
        let received = received.unwrap();
        assert_eq!(received.payload(), b"pushed");
        assert_eq!(received.metadata(), b"m");

        let (ended, _) = tokio::join!(client.receive_message(), async move { drop(peer) });
        assert!(matches!(ended, Err(PeerwireError::NoConnection)));
    }
}
