//! Endpoint service - accepts connections and tracks live sessions.
//!
//! The service binds a TCP listener, optionally advertises it through a
//! [`ServiceAdvertiser`], and wraps every accepted connection in an
//! accepting-role session. One context task owns the listener, the registry
//! of live sessions, and the dispatch of every session event, so observer
//! callbacks for one service never run concurrently.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::protocol::Message;
//! use peerwire::service::{EndpointService, ServiceConfig, ServiceObserver};
//! use peerwire::session::{SessionHandle, SessionObserver};
//!
//! struct Echo;
//!
//! impl SessionObserver for Echo {
//!     fn message_received(&self, session: &SessionHandle, message: Message) {
//!         let session = session.clone();
//!         tokio::spawn(async move { session.send_message(&message).await });
//!     }
//! }
//!
//! impl ServiceObserver for Echo {
//!     fn client_connected(&self, session: &SessionHandle) {
//!         session.set_observer(Arc::new(Echo));
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> peerwire::Result<()> {
//!     let mut service = EndpointService::new(ServiceConfig::default(), Arc::new(Echo));
//!     let addr = service.start().await?;
//!     println!("listening on {}", addr);
//!     tokio::signal::ctrl_c().await?;
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::discovery::ServiceAdvertiser;
use crate::error::{PeerwireError, Result};
use crate::lifecycle::LifecycleEvent;
use crate::protocol::{HandshakeTokens, Message, DEFAULT_PROTOCOL_VERSION};
use crate::session::{
    self, EventSender, Role, SessionEvent, SessionEventKind, SessionHandle, SessionId,
    SessionSetup,
};
use crate::transport::{self, TcpListener, TcpStream};
use crate::writer::WriterConfig;

/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default span label for services.
pub const DEFAULT_SERVICE_LABEL: &str = "peerwire-service";

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Name under which the service is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub name: String,
    /// Discovery service type, e.g. `_chat._tcp`.
    pub service_type: String,
}

/// Service configuration.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```
/// use peerwire::service::ServiceConfig;
///
/// let config = ServiceConfig::from_json_str(
///     r#"{ "port": 7070, "advertise": { "name": "chat", "service_type": "_chat._tcp" } }"#,
/// ).unwrap();
/// assert_eq!(config.port, Some(7070));
/// assert_eq!(config.host, "127.0.0.1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    /// Listening port; `None` picks an ephemeral one.
    pub port: Option<u16>,
    pub advertise: Option<Advertisement>,
    pub protocol_version: u32,
    pub writer: WriterConfig,
    /// Name of the tracing span every task of this service runs in.
    pub label: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            advertise: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            writer: WriterConfig::default(),
            label: DEFAULT_SERVICE_LABEL.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_advertisement(mut self, name: impl Into<String>, service_type: impl Into<String>) -> Self {
        self.advertise = Some(Advertisement {
            name: name.into(),
            service_type: service_type.into(),
        });
        self
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

/// Service-level callbacks.
///
/// Delivered on the service's context task.
pub trait ServiceObserver: Send + Sync + 'static {
    fn service_advertised(&self, _name: &str) {}

    fn service_unadvertised(&self, _name: &str) {}

    /// A connection was accepted. Runs before any handshake byte is
    /// exchanged; attach the session's observer here.
    fn client_connected(&self, session: &SessionHandle);
}

enum Command {
    Sessions(oneshot::Sender<Vec<SessionHandle>>),
    Stop(oneshot::Sender<()>),
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: watch::Receiver<Option<SocketAddr>>,
    task: JoinHandle<()>,
}

/// A listening endpoint and the registry of its sessions.
pub struct EndpointService {
    config: ServiceConfig,
    observer: Arc<dyn ServiceObserver>,
    advertiser: Option<Arc<dyn ServiceAdvertiser>>,
    lifecycle: Option<mpsc::Receiver<LifecycleEvent>>,
    span: tracing::Span,
    running: Option<Running>,
}

impl EndpointService {
    pub fn new(config: ServiceConfig, observer: Arc<dyn ServiceObserver>) -> Self {
        let span = tracing::info_span!("service", label = %config.label);
        Self {
            config,
            observer,
            advertiser: None,
            lifecycle: None,
            span,
            running: None,
        }
    }

    /// Publish the service through `advertiser` when it starts.
    pub fn with_advertiser(mut self, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        self.advertiser = Some(advertiser);
        self
    }

    /// Follow host lifecycle events from `events`.
    ///
    /// The receiver is consumed by the next `start` and dropped at `stop`.
    pub fn with_lifecycle(mut self, events: mpsc::Receiver<LifecycleEvent>) -> Self {
        self.lifecycle = Some(events);
        self
    }

    /// Run every task of this service in `span` instead of the span built
    /// from the configured label.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind the listener, advertise, and start accepting.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// `Io` if the listener cannot be bound; `Unknown` if already running.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(PeerwireError::Unknown("service already running".to_string()));
        }

        let listener = transport::bind(&self.config.host, self.config.port).await?;
        let addr = listener.local_addr()?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (local_addr_tx, local_addr) = watch::channel(Some(addr));

        let context = ServiceContext {
            config: self.config.clone(),
            observer: self.observer.clone(),
            advertiser: self.advertiser.clone(),
            lifecycle: self.lifecycle.take(),
            span: self.span.clone(),
            listener: Some(listener),
            bound_port: Some(addr.port()),
            advertised: None,
            resume_on_active: false,
            accept_backoff: AcceptBackoff::default(),
            registry: HashMap::new(),
            events,
            events_rx,
            commands,
            local_addr: local_addr_tx,
        };
        let task = tokio::spawn(context.run().instrument(self.span.clone()));

        tracing::info!(parent: &self.span, %addr, "service listening");
        self.running = Some(Running {
            commands: commands_tx,
            local_addr,
            task,
        });
        Ok(addr)
    }

    /// Cancel every live session, withdraw the advertisement, and release
    /// the listener. Waits until every session has ended.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let (done, done_rx) = oneshot::channel();
        if running.commands.send(Command::Stop(done)).is_ok() {
            let _ = done_rx.await;
        }
        let _ = running.task.await;
    }

    /// Address the listener is bound to; `None` while stopped or released
    /// for the background.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .and_then(|running| *running.local_addr.borrow())
    }

    /// Snapshot of the registry.
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        let Some(running) = &self.running else {
            return Vec::new();
        };
        let (reply, reply_rx) = oneshot::channel();
        if running.commands.send(Command::Sessions(reply)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions().await.len()
    }

    pub async fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions().await.into_iter().find(|s| s.id() == id)
    }

    /// Send `message` to every established session.
    ///
    /// Returns how many sessions accepted it. Per-session failures are
    /// logged and skipped.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for session in self.sessions().await {
            if !session.is_established() {
                continue;
            }
            match session.send_message(message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(parent: &self.span, session = %session.id(), error = %e, "broadcast skipped session")
                }
            }
        }
        delivered
    }
}

/// State owned by the service's context task.
struct ServiceContext {
    config: ServiceConfig,
    observer: Arc<dyn ServiceObserver>,
    advertiser: Option<Arc<dyn ServiceAdvertiser>>,
    lifecycle: Option<mpsc::Receiver<LifecycleEvent>>,
    span: tracing::Span,
    listener: Option<TcpListener>,
    /// Last port bound, reused when rebinding after the background.
    bound_port: Option<u16>,
    /// Public name returned by the advertiser.
    advertised: Option<String>,
    resume_on_active: bool,
    accept_backoff: AcceptBackoff,
    registry: HashMap<SessionId, SessionHandle>,
    events: EventSender,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl ServiceContext {
    async fn run(mut self) {
        self.advertise().await;

        loop {
            tokio::select! {
                accepted = accept(self.listener.as_ref()), if !self.accept_backoff.is_waiting() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        self.accept_backoff.trip();
                    }
                },
                _ = self.accept_backoff.elapsed() => self.accept_backoff.clear(),
                Some(event) = self.events_rx.recv() => self.on_session_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Sessions(reply)) => {
                        let _ = reply.send(self.registry.values().cloned().collect());
                    }
                    Some(Command::Stop(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                event = next_lifecycle(&mut self.lifecycle) => match event {
                    Some(event) => self.on_lifecycle(event).await,
                    None => self.lifecycle = None,
                },
            }
        }
    }

    /// Register, announce, then start the session. The observer sees the
    /// session before its driver exists.
    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        transport::configure_stream(&stream);
        let (session, control) = SessionHandle::new(Role::Accepting, Some(peer));
        self.registry.insert(session.id(), session.clone());
        tracing::debug!(session = %session.id(), %peer, live = self.registry.len(), "client connected");

        self.observer.client_connected(&session);

        let setup = SessionSetup {
            tokens: HandshakeTokens::new(self.config.protocol_version),
            writer: self.config.writer.clone(),
            events: self.events.clone(),
        };
        let connected = async move { Ok::<_, PeerwireError>((stream, Some(peer))) };
        session::spawn_driver(session, control, connected, setup, &self.span);
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        if matches!(event.kind, SessionEventKind::Ended) {
            let id = event.session.id();
            if self.registry.remove(&id).is_some() {
                tracing::debug!(session = %id, live = self.registry.len(), "session removed");
            }
        }
        event.deliver();
    }

    async fn on_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::EnteringBackground => {
                if self.listener.take().is_none() {
                    return;
                }
                tracing::debug!("entering background, listener released");
                self.local_addr.send_replace(None);
                self.withdraw().await;
                self.resume_on_active = true;
            }
            LifecycleEvent::BecameActive => {
                if !self.resume_on_active {
                    return;
                }
                let port = self.config.port.or(self.bound_port);
                match transport::bind(&self.config.host, port).await {
                    Ok(listener) => {
                        let addr = listener.local_addr().ok();
                        tracing::debug!(?addr, "active again, listener rebound");
                        self.bound_port = addr.map(|a| a.port());
                        self.local_addr.send_replace(addr);
                        self.listener = Some(listener);
                        self.resume_on_active = false;
                        self.advertise().await;
                    }
                    Err(e) => tracing::error!(error = %e, "could not rebind listener"),
                }
            }
        }
    }

    async fn advertise(&mut self) {
        let Some(advertisement) = self.config.advertise.clone() else {
            return;
        };
        let Some(advertiser) = self.advertiser.clone() else {
            tracing::warn!(name = %advertisement.name, "advertisement configured without an advertiser");
            return;
        };
        let Some(port) = self.bound_port else {
            return;
        };

        match advertiser
            .advertise(&advertisement.name, &advertisement.service_type, port)
            .await
        {
            Ok(name) => {
                tracing::debug!(%name, port, "service advertised");
                self.observer.service_advertised(&name);
                self.advertised = Some(name);
            }
            Err(e) => tracing::warn!(error = %e, name = %advertisement.name, "advertisement failed"),
        }
    }

    async fn withdraw(&mut self) {
        let Some(name) = self.advertised.take() else {
            return;
        };
        if let Some(advertiser) = &self.advertiser {
            if let Err(e) = advertiser.withdraw(&name).await {
                tracing::warn!(error = %e, %name, "withdrawing advertisement failed");
            }
        }
        self.observer.service_unadvertised(&name);
    }

    async fn shutdown(&mut self) {
        self.listener = None;
        self.resume_on_active = false;
        self.local_addr.send_replace(None);
        self.withdraw().await;

        for session in self.registry.values() {
            session.cancel();
        }
        while !self.registry.is_empty() {
            match self.events_rx.recv().await {
                Some(event) => self.on_session_event(event),
                None => break,
            }
        }
        // Deliver whatever is still queued for sessions already removed.
        while let Ok(event) = self.events_rx.try_recv() {
            event.deliver();
        }
        tracing::debug!("service stopped");
    }
}

/// Keeps the accept branch off for a while after a failed accept while the
/// rest of the context task carries on.
#[derive(Debug, Default)]
struct AcceptBackoff {
    until: Option<Instant>,
}

impl AcceptBackoff {
    fn trip(&mut self) {
        self.until = Some(Instant::now() + ACCEPT_BACKOFF);
    }

    fn clear(&mut self) {
        self.until = None;
    }

    fn is_waiting(&self) -> bool {
        self.until.is_some()
    }

    /// Resolves when the back-off has passed; never while idle.
    async fn elapsed(&self) {
        match self.until {
            Some(until) => tokio::time::sleep_until(until).await,
            None => std::future::pending().await,
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn next_lifecycle(events: &mut Option<mpsc::Receiver<LifecycleEvent>>) -> Option<LifecycleEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
