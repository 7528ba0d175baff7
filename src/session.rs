//! Session - one connection, from transport setup to teardown.
//!
//! Both roles share the same state machine:
//!
//! ```text
//! Setup ─► Preparing ─► Ready ─► HandshakeInFlight ─► Established
//!                         ▲                              │
//!                         └──────── Paused ◄─────────────┘
//!
//! any non-terminal ─► Failed ─► Cancelled
//! any non-terminal ─────────► Cancelled
//! ```
//!
//! `Preparing` and `HandshakeInFlight` can pause as well. The work in
//! flight is kept, and on resume the session goes back to where it was.
//!
//! [`SessionState::can_transition_to`] is the only authority on which moves
//! are legal. Each session runs one driver task that owns the state, performs
//! the version handshake exactly once, then receives messages until the
//! connection ends. Every state change worth telling the owner about is sent
//! as a [`SessionEvent`] to the owner's dispatch task, which calls the
//! session's [`SessionObserver`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{PeerwireError, Result};
use crate::pipeline::MessageReader;
use crate::protocol::{HandshakeTokens, Message};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the connection a session is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a listener; speaks first during the handshake.
    Accepting,
    /// Opened by a client; answers during the handshake.
    Initiating,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Setup,
    /// Transport is being established (the initiating role connects here).
    Preparing,
    /// Transport is usable.
    Ready,
    HandshakeInFlight,
    /// Handshake done; messages flow.
    Established,
    /// Transport reported a recoverable loss of connectivity.
    Paused,
    /// Fatal error; always followed by `Cancelled`.
    Failed,
    /// Terminal.
    Cancelled,
}

impl SessionState {
    /// Whether moving from `self` to `next` is legal.
    ///
    /// `Ready -> Established` without a handshake is the resume path after a
    /// pause; the driver only takes it once the handshake has completed.
    /// A pause before the handshake resumes through `Paused -> Preparing` or
    /// `Paused -> Ready -> HandshakeInFlight`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Cancelled, _) => false,
            (Failed, Cancelled) => true,
            (Failed, _) => false,
            (_, Failed) | (_, Cancelled) => true,
            (Setup, Preparing)
            | (Preparing, Ready)
            | (Ready, HandshakeInFlight)
            | (HandshakeInFlight, Established)
            | (Preparing, Paused)
            | (Ready, Paused)
            | (HandshakeInFlight, Paused)
            | (Established, Paused)
            | (Paused, Preparing)
            | (Paused, Ready)
            | (Ready, Established) => true,
            _ => false,
        }
    }

    /// True for `Failed` and `Cancelled`.
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Cancelled)
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionState::Setup => "setup",
            SessionState::Preparing => "preparing",
            SessionState::Ready => "ready",
            SessionState::HandshakeInFlight => "handshake",
            SessionState::Established => "established",
            SessionState::Paused => "paused",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connectivity report from whatever watches the network path.
#[derive(Debug)]
pub enum TransportSignal {
    /// Connectivity lost, but the transport expects it to come back.
    Waiting(io::Error),
    /// Connectivity is back.
    Viable,
}

/// Callbacks for one session.
///
/// Called from the owner's dispatch task, one at a time, in the order the
/// events happened. Implementations must not block.
pub trait SessionObserver: Send + Sync + 'static {
    /// Handshake completed.
    fn session_started(&self, _session: &SessionHandle) {}

    fn session_paused(&self, _session: &SessionHandle, _reason: &io::Error) {}

    /// Fatal error; `session_ended` follows.
    fn session_failed(&self, _session: &SessionHandle, _error: &PeerwireError) {}

    /// Called exactly once. The session drops its observer afterwards.
    fn session_ended(&self, _session: &SessionHandle) {}

    fn message_received(&self, session: &SessionHandle, message: Message);
}

#[derive(Debug)]
pub(crate) enum Control {
    Cancel,
    Transport(TransportSignal),
}

struct SessionInner {
    id: SessionId,
    role: Role,
    peer_addr: OnceLock<SocketAddr>,
    state: watch::Sender<SessionState>,
    handshake_complete: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
    writer: OnceLock<WriterHandle>,
    observer: Mutex<Option<Arc<dyn SessionObserver>>>,
}

/// Cheap, cloneable handle to a session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    /// Create a session in `Setup` along with its control receiver, which
    /// belongs to the driver.
    pub(crate) fn new(
        role: Role,
        peer_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<Control>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Setup);
        let addr = OnceLock::new();
        if let Some(peer) = peer_addr {
            let _ = addr.set(peer);
        }
        let inner = SessionInner {
            id: SessionId::next(),
            role,
            peer_addr: addr,
            state,
            handshake_complete: AtomicBool::new(false),
            control,
            writer: OnceLock::new(),
            observer: Mutex::new(None),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            control_rx,
        )
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Remote address, once the transport knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr.get().copied()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.inner.handshake_complete.load(Ordering::Acquire)
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Send one message and wait until it has been written.
    ///
    /// # Errors
    ///
    /// `NoConnection` before the handshake completes or after the session
    /// has finished; otherwise whatever the writer reports.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if self.state().is_finished() {
            return Err(PeerwireError::NoConnection);
        }
        let writer = self
            .inner
            .writer
            .get()
            .cloned()
            .ok_or(PeerwireError::NoConnection)?;
        writer.send(message).await
    }

    /// Ask the driver to tear the session down. Idempotent.
    pub fn cancel(&self) {
        let _ = self.inner.control.send(Control::Cancel);
    }

    /// Report a connectivity change from the transport.
    pub fn signal_transport(&self, signal: TransportSignal) {
        let _ = self.inner.control.send(Control::Transport(signal));
    }

    /// Attach the observer that receives this session's events.
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.lock_observer() = Some(observer);
    }

    pub fn clear_observer(&self) {
        self.lock_observer().take();
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.lock_observer().clone()
    }

    fn lock_observer(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn SessionObserver>>> {
        self.inner
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the state satisfies `predicate` and return that state.
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> SessionState
    where
        F: FnMut(SessionState) -> bool,
    {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|state| predicate(*state)).await.map(|s| *s);
        result.unwrap_or_else(|_| self.state())
    }

    /// Wait until the session reaches `Cancelled`.
    pub async fn closed(&self) {
        self.wait_for_state(|s| s == SessionState::Cancelled).await;
    }

    /// Apply a transition if the table allows it.
    fn transition(&self, next: SessionState) -> bool {
        let mut from = next;
        let changed = self.inner.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(%from, to = %next, "state change");
        } else {
            tracing::warn!(%from, to = %next, "illegal state transition rejected");
        }
        changed
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

/// What happened to a session.
#[derive(Debug)]
pub(crate) enum SessionEventKind {
    Started,
    Paused(io::Error),
    Failed(PeerwireError),
    Message(Message),
    Ended,
}

/// Event sent from a session driver to its owner's dispatch task.
#[derive(Debug)]
pub(crate) struct SessionEvent {
    pub(crate) session: SessionHandle,
    pub(crate) kind: SessionEventKind,
}

pub(crate) type EventSender = mpsc::UnboundedSender<SessionEvent>;

impl SessionEvent {
    /// Call the session's observer, if it still has one.
    pub(crate) fn deliver(self) {
        let Some(observer) = self.session.observer() else {
            return;
        };
        let session = &self.session;
        match self.kind {
            SessionEventKind::Started => observer.session_started(session),
            SessionEventKind::Paused(reason) => observer.session_paused(session, &reason),
            SessionEventKind::Failed(error) => observer.session_failed(session, &error),
            SessionEventKind::Message(message) => observer.message_received(session, message),
            SessionEventKind::Ended => {
                observer.session_ended(session);
                session.clear_observer();
            }
        }
    }
}

/// Everything a driver needs besides the transport.
pub(crate) struct SessionSetup {
    pub(crate) tokens: HandshakeTokens,
    pub(crate) writer: WriterConfig,
    pub(crate) events: EventSender,
}

/// Spawn the driver task for `handle`.
///
/// `transport` resolves to the connected stream; the session sits in
/// `Preparing` until it does.
pub(crate) fn spawn_driver<S, F>(
    handle: SessionHandle,
    control: mpsc::UnboundedReceiver<Control>,
    transport: F,
    setup: SessionSetup,
    parent: &tracing::Span,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = Result<(S, Option<SocketAddr>)>> + Send + 'static,
{
    let span = tracing::debug_span!(
        parent: parent,
        "session",
        id = %handle.id(),
        role = ?handle.role()
    );
    let driver = Driver {
        handle,
        control,
        tokens: setup.tokens,
        writer_config: setup.writer,
        events: setup.events,
        paused_from: None,
    };
    tokio::spawn(driver.run(transport).instrument(span))
}

/// How the driver stopped.
enum End {
    /// Peer closed the stream between frames.
    Closed,
    Cancelled,
    Failed(PeerwireError),
}

struct Driver {
    handle: SessionHandle,
    control: mpsc::UnboundedReceiver<Control>,
    tokens: HandshakeTokens,
    writer_config: WriterConfig,
    events: EventSender,
    /// State to return to when the transport is viable again.
    paused_from: Option<SessionState>,
}

impl Driver {
    async fn run<S, F>(mut self, transport: F)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = Result<(S, Option<SocketAddr>)>>,
    {
        let end = self.drive(transport).await;
        self.finish(end);
    }

    async fn drive<S, F>(&mut self, transport: F) -> End
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: Future<Output = Result<(S, Option<SocketAddr>)>>,
    {
        self.handle.transition(SessionState::Preparing);
        let mut stream = match self.until_done(transport).await {
            Some(Ok((stream, peer))) => {
                if let Some(peer) = peer {
                    let _ = self.handle.inner.peer_addr.set(peer);
                }
                stream
            }
            Some(Err(e)) => return End::Failed(e),
            None => return End::Cancelled,
        };
        if !self.until_resumed().await {
            return End::Cancelled;
        }

        self.handle.transition(SessionState::Ready);
        self.handle.transition(SessionState::HandshakeInFlight);
        let role = self.handle.role();
        let tokens = self.tokens.clone();
        match self
            .until_done(perform_handshake(&mut stream, role, &tokens))
            .await
        {
            Some(Ok(())) => {}
            Some(Err(e)) => return End::Failed(e),
            None => return End::Cancelled,
        }
        if !self.until_resumed().await {
            return End::Cancelled;
        }
        self.handle
            .inner
            .handshake_complete
            .store(true, Ordering::Release);

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, mut writer_task) = spawn_writer_task(write_half, self.writer_config.clone());
        let _ = self.handle.inner.writer.set(writer);

        self.handle.transition(SessionState::Established);
        self.emit(SessionEventKind::Started);

        let end = self
            .receive_loop(MessageReader::new(read_half), &mut writer_task)
            .await;
        writer_task.abort();
        end
    }

    /// One message in, one event out, until something ends the session.
    ///
    /// The in-flight receive survives control events, so a pause never
    /// loses a partially read frame.
    async fn receive_loop<R>(
        &mut self,
        mut reader: MessageReader<R>,
        writer_task: &mut JoinHandle<Result<()>>,
    ) -> End
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let receive = reader.receive_message();
            tokio::pin!(receive);

            let result = loop {
                tokio::select! {
                    result = &mut receive => break result,
                    control = self.control.recv() => match control {
                        Some(Control::Transport(signal)) => self.on_transport_signal(signal),
                        Some(Control::Cancel) | None => return End::Cancelled,
                    },
                    joined = &mut *writer_task => {
                        return match joined {
                            Ok(Ok(())) => End::Closed,
                            Ok(Err(e)) => End::Failed(e),
                            Err(e) => End::Failed(PeerwireError::Unknown(format!("writer task: {}", e))),
                        };
                    }
                }
            };

            match result {
                Ok(message) => self.emit(SessionEventKind::Message(message)),
                Err(PeerwireError::ConnectionClosed) => return End::Closed,
                Err(e) => return End::Failed(e),
            }
        }
    }

    /// Drive `work` to completion while serving control events. A pause
    /// leaves `work` running. `None` if the session was cancelled first.
    async fn until_done<T>(&mut self, work: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                control = self.control.recv() => match control {
                    Some(Control::Transport(signal)) => self.on_transport_signal(signal),
                    Some(Control::Cancel) | None => return None,
                },
            }
        }
    }

    /// Hold a paused session until the transport is viable again. `false`
    /// if it was cancelled instead.
    async fn until_resumed(&mut self) -> bool {
        while self.handle.state() == SessionState::Paused {
            match self.control.recv().await {
                Some(Control::Transport(signal)) => self.on_transport_signal(signal),
                Some(Control::Cancel) | None => return false,
            }
        }
        true
    }

    fn on_transport_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Waiting(reason) => {
                let state = self.handle.state();
                if state == SessionState::Paused {
                    return;
                }
                if self.handle.transition(SessionState::Paused) {
                    tracing::debug!(reason = %reason, from = %state, "transport waiting");
                    self.paused_from = Some(state);
                    self.emit(SessionEventKind::Paused(reason));
                }
            }
            TransportSignal::Viable => {
                if self.handle.state() != SessionState::Paused {
                    return;
                }
                let resume_to = self.paused_from.take().unwrap_or(SessionState::Established);
                tracing::debug!(to = %resume_to, "transport viable");
                match resume_to {
                    SessionState::Preparing => {
                        self.handle.transition(SessionState::Preparing);
                    }
                    SessionState::Ready => {
                        self.handle.transition(SessionState::Ready);
                    }
                    SessionState::HandshakeInFlight => {
                        if self.handle.transition(SessionState::Ready) {
                            self.handle.transition(SessionState::HandshakeInFlight);
                        }
                    }
                    // No second handshake: straight back to Established.
                    _ => {
                        if self.handle.transition(SessionState::Ready)
                            && self.handle.is_handshake_complete()
                        {
                            self.handle.transition(SessionState::Established);
                        }
                    }
                }
            }
        }
    }

    fn finish(self, end: End) {
        match end {
            End::Closed => tracing::debug!("peer closed the connection"),
            End::Cancelled => tracing::debug!("session cancelled"),
            End::Failed(error) => {
                match &error {
                    PeerwireError::HandshakeFailed(_) => tracing::warn!(%error, "handshake failed"),
                    e if e.is_disconnect() => tracing::debug!(%error, "connection lost"),
                    _ => tracing::warn!(%error, "session failed"),
                }
                self.handle.transition(SessionState::Failed);
                self.emit(SessionEventKind::Failed(error));
            }
        }
        self.handle.transition(SessionState::Cancelled);
        self.emit(SessionEventKind::Ended);
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            session: self.handle.clone(),
            kind,
        });
    }
}

/// Exchange version tokens. The accepting side speaks first.
///
/// # Errors
///
/// `HandshakeFailed` on a token mismatch or any I/O error while exchanging
/// tokens.
pub(crate) async fn perform_handshake<S>(
    stream: &mut S,
    role: Role,
    tokens: &HandshakeTokens,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match role {
        Role::Accepting => {
            send_token(stream, tokens.service_token()).await?;
            expect_token(stream, tokens.client_token()).await
        }
        Role::Initiating => {
            expect_token(stream, tokens.service_token()).await?;
            send_token(stream, tokens.client_token()).await
        }
    }
}

async fn send_token<S>(stream: &mut S, token: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let sent = async {
        stream.write_all(token).await?;
        stream.flush().await
    };
    sent.await
        .map_err(|e| PeerwireError::HandshakeFailed(format!("sending token: {}", e)))
}

async fn expect_token<S>(stream: &mut S, expected: &[u8]) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut received = vec![0u8; expected.len()];
    stream
        .read_exact(&mut received)
        .await
        .map_err(|e| PeerwireError::HandshakeFailed(format!("reading token: {}", e)))?;
    if received != expected {
        return Err(PeerwireError::HandshakeFailed(format!(
            "expected {:?}, received {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&received)
        )));
    }
    Ok(())
}
