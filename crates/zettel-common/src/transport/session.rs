//! CollabSession - per-document session for real-time collaboration.
//!
//! The session handle is cheap and synchronous: every call enqueues a command
//! for a driver task that owns the channel. The driver runs the connection
//! state machine
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> Connecting -> ...
//! ```
//!
//! and any state moves to the terminal `Closed` on [`CollabSession::close`].
//! Updates are numbered and kept until the server acknowledges them, so a
//! reconnect resends exactly what may have been lost.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::{Backoff, Channel, CollabMessage, Connector, TransportError};
use crate::error::SerDeError;

/// Error type for session operations
#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum SessionError {
    #[error("session closed")]
    #[diagnostic(code(zettel::session::closed))]
    Closed,

    #[error("session did not reach {expected} in time")]
    #[diagnostic(code(zettel::session::timeout))]
    StatusTimeout { expected: ConnectionStatus },
}

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Created, no attempt made yet.
    Idle,
    Connecting,
    Connected,
    Disconnected,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Who we are and what we connect to.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub url: String,
    pub document: SmolStr,
    pub token: SmolStr,
    pub replica: u64,
    pub display_name: SmolStr,
    pub color: u32,
}

/// Timing knobs for the session driver.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Max time from opening a channel to receiving `AuthOk`.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

/// Events emitted by a collaboration session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),

    /// CRDT update bytes from a peer (relayed update or sync answer).
    RemoteUpdate { data: Vec<u8> },

    /// A peer asked for what it is missing; answer with
    /// [`CollabSession::respond_sync`].
    SyncRequested { replica: u64, version: Vec<u8> },

    PeerJoined {
        replica: u64,
        display_name: SmolStr,
        color: u32,
    },

    PeerLeft { replica: u64 },

    Presence {
        replica: u64,
        display_name: SmolStr,
        color: u32,
        position: usize,
        selection: Option<(usize, usize)>,
    },

    /// The server refused our credential. The session stays disconnected
    /// until [`CollabSession::reauthenticate`] is called.
    AuthRejected { reason: SmolStr },
}

enum Command {
    Send {
        data: Vec<u8>,
    },
    Presence {
        position: usize,
        selection: Option<(usize, usize)>,
    },
    Leave,
    RespondSync {
        to: u64,
        data: Vec<u8>,
    },
    Version(Vec<u8>),
    Reauthenticate {
        token: SmolStr,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// A collaboration session for one document.
///
/// Create via [`CollabSession::connect`]; must be called inside a tokio runtime.
pub struct CollabSession {
    document: SmolStr,
    replica: u64,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    unacked: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl CollabSession {
    /// Spawn the session driver.
    ///
    /// Returns the session handle and a receiver for session events.
    pub fn connect<C: Connector>(
        connector: C,
        params: SessionParams,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Idle);
        let unacked = Arc::new(AtomicUsize::new(0));

        let session = Self {
            document: params.document.clone(),
            replica: params.replica,
            commands: command_tx,
            status: status_rx,
            unacked: unacked.clone(),
            closed: AtomicBool::new(false),
        };

        let driver = Driver {
            connector,
            config,
            commands: command_rx,
            events: event_tx,
            status: status_tx,
            state: DriverState {
                params,
                outbound: Outbound {
                    queue: VecDeque::new(),
                    next_seq: 0,
                    unacked,
                },
                version: Vec::new(),
                auth_blocked: false,
            },
        };
        tokio::spawn(driver.run());

        (session, event_rx)
    }

    pub fn document(&self) -> &SmolStr {
        &self.document
    }

    pub fn replica(&self) -> u64 {
        self.replica
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Number of updates sent but not yet acknowledged by the server.
    pub fn unacked(&self) -> usize {
        self.unacked.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn command(&self, command: Command) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    /// Queue a local CRDT update. Delivered in call order; kept and resent
    /// across reconnects until acknowledged.
    pub fn send(&self, update: Vec<u8>) -> Result<(), SessionError> {
        self.command(Command::Send { data: update })
    }

    /// Broadcast our cursor. Dropped while disconnected.
    pub fn send_presence(
        &self,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> Result<(), SessionError> {
        self.command(Command::Presence {
            position,
            selection,
        })
    }

    /// Tell peers we are leaving (cursor hidden) without closing the session.
    pub fn leave(&self) -> Result<(), SessionError> {
        self.command(Command::Leave)
    }

    /// Answer a [`SessionEvent::SyncRequested`].
    pub fn respond_sync(&self, to: u64, data: Vec<u8>) -> Result<(), SessionError> {
        self.command(Command::RespondSync { to, data })
    }

    /// Record the local document version announced in the next sync handshake.
    pub fn update_version(&self, version: Vec<u8>) -> Result<(), SessionError> {
        self.command(Command::Version(version))
    }

    /// Replace the credential and, if authentication was rejected, retry now.
    pub fn reauthenticate(&self, token: impl Into<SmolStr>) -> Result<(), SessionError> {
        self.command(Command::Reauthenticate {
            token: token.into(),
        })
    }

    /// Wait until the session reaches `expected`.
    pub async fn wait_for_status(
        &self,
        expected: ConnectionStatus,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let mut status = self.status.clone();
        let reached = tokio::time::timeout(timeout, async move {
            status.wait_for(|s| *s == expected).await.map(|_| ())
        })
        .await;
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::StatusTimeout { expected }),
        }
    }

    /// Close the session and release the channel.
    ///
    /// Later calls on this handle fail with [`SessionError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Outbound {
    queue: VecDeque<(u64, Vec<u8>)>,
    next_seq: u64,
    unacked: Arc<AtomicUsize>,
}

impl Outbound {
    fn push(&mut self, data: Vec<u8>) -> u64 {
        self.next_seq += 1;
        self.queue.push_back((self.next_seq, data));
        self.unacked.store(self.queue.len(), Ordering::Release);
        self.next_seq
    }

    /// Acks are cumulative.
    fn ack(&mut self, seq: u64) {
        while self.queue.front().is_some_and(|(s, _)| *s <= seq) {
            self.queue.pop_front();
        }
        self.unacked.store(self.queue.len(), Ordering::Release);
    }
}

struct DriverState {
    params: SessionParams,
    outbound: Outbound,
    /// Encoded local version for the sync handshake.
    version: Vec<u8>,
    auth_blocked: bool,
}

enum Flow {
    Continue,
    /// Credential replaced; connect again without waiting.
    Reconnect,
    Close(Option<oneshot::Sender<()>>),
}

enum Establish<T> {
    Connected(T),
    Rejected(SmolStr),
    Failed(TransportError),
    Close(Option<oneshot::Sender<()>>),
}

enum AuthOutcome<T> {
    Accepted(T),
    Rejected(SmolStr),
}

impl DriverState {
    fn auth_frame(&self) -> Result<Vec<u8>, SerDeError> {
        CollabMessage::Auth {
            document: self.params.document.clone(),
            token: self.params.token.clone(),
            replica: self.params.replica,
            display_name: self.params.display_name.clone(),
            color: self.params.color,
        }
        .to_bytes()
    }

    /// Handle a command while no channel is up.
    fn offline(&mut self, command: Option<Command>) -> Flow {
        match command {
            None => Flow::Close(None),
            Some(Command::Send { data }) => {
                let seq = self.outbound.push(data);
                trace!(seq, "update queued while offline");
                Flow::Continue
            }
            Some(Command::Presence { .. } | Command::Leave | Command::RespondSync { .. }) => {
                trace!("presence/sync frame dropped while offline");
                Flow::Continue
            }
            Some(Command::Version(version)) => {
                self.version = version;
                Flow::Continue
            }
            Some(Command::Reauthenticate { token }) => {
                self.params.token = token;
                self.auth_blocked = false;
                Flow::Reconnect
            }
            Some(Command::Close { done }) => Flow::Close(Some(done)),
        }
    }
}

struct Driver<C: Connector> {
    connector: C,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Sender<ConnectionStatus>,
    state: DriverState,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if self.state.auth_blocked {
                if let Flow::Close(done) = self.wait_for_reauth().await {
                    return self.finish(done);
                }
            }

            self.set_status(ConnectionStatus::Connecting);
            match self.establish().await {
                Establish::Connected(channel) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    if let Flow::Close(done) = self.serve(channel).await {
                        return self.finish(done);
                    }
                }
                Establish::Rejected(reason) => {
                    warn!(document = %self.state.params.document, %reason, "authentication rejected");
                    self.state.auth_blocked = true;
                    self.set_status(ConnectionStatus::Disconnected);
                    self.emit(SessionEvent::AuthRejected { reason });
                    continue;
                }
                Establish::Failed(e) => {
                    warn!(document = %self.state.params.document, error = %e, attempt, "connect attempt failed");
                }
                Establish::Close(done) => return self.finish(done),
            }

            self.set_status(ConnectionStatus::Disconnected);
            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(document = %self.state.params.document, ?delay, attempt, "reconnecting");
            if let Flow::Close(done) = self.idle(delay).await {
                return self.finish(done);
            }
        }
    }

    fn finish(&mut self, done: Option<oneshot::Sender<()>>) {
        self.set_status(ConnectionStatus::Closed);
        debug!(document = %self.state.params.document, "session driver stopped");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn set_status(&mut self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(document = %self.state.params.document, status = %next, "session status");
            self.emit(SessionEvent::Status(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The receiver may be gone; the session keeps running for its sends.
        let _ = self.events.send(event);
    }

    async fn wait_for_reauth(&mut self) -> Flow {
        loop {
            let command = self.commands.recv().await;
            match self.state.offline(command) {
                Flow::Continue => {}
                Flow::Reconnect => return Flow::Continue,
                close @ Flow::Close(_) => return close,
            }
        }
    }

    async fn idle(&mut self, delay: Duration) -> Flow {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                command = self.commands.recv() => match self.state.offline(command) {
                    Flow::Continue => {}
                    Flow::Reconnect => return Flow::Continue,
                    close @ Flow::Close(_) => return close,
                },
            }
        }
    }

    async fn establish(&mut self) -> Establish<C::Channel> {
        let url = self.state.params.url.clone();
        let auth = match self.state.auth_frame() {
            Ok(frame) => frame,
            Err(e) => return Establish::Failed(e.into()),
        };
        let timeout = self.config.connect_timeout;
        let attempt = tokio::time::timeout(timeout, open_and_authenticate(&self.connector, url, auth));
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Err(_) => Establish::Failed(TransportError::Timeout(timeout)),
                        Ok(Ok(AuthOutcome::Accepted(channel))) => Establish::Connected(channel),
                        Ok(Ok(AuthOutcome::Rejected(reason))) => Establish::Rejected(reason),
                        Ok(Err(e)) => Establish::Failed(e),
                    };
                }
                command = self.commands.recv() => {
                    if let Flow::Close(done) = self.state.offline(command) {
                        return Establish::Close(done);
                    }
                }
            }
        }
    }

    /// Run one connected channel until it drops or the session closes.
    async fn serve(&mut self, mut channel: C::Channel) -> Flow {
        let replica = self.state.params.replica;
        let sync = CollabMessage::SyncRequest {
            replica,
            version: self.state.version.clone(),
        };
        if let Err(e) = send_message(&mut channel, &sync).await {
            warn!(error = %e, "sync handshake failed");
            return Flow::Continue;
        }
        for (seq, data) in &self.state.outbound.queue {
            let update = CollabMessage::Update {
                seq: *seq,
                data: data.clone(),
            };
            if let Err(e) = send_message(&mut channel, &update).await {
                warn!(error = %e, seq, "resend failed");
                return Flow::Continue;
            }
        }
        if !self.state.outbound.queue.is_empty() {
            debug!(count = self.state.outbound.queue.len(), "resent unacknowledged updates");
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let message = match command {
                        None => {
                            channel.close().await;
                            return Flow::Close(None);
                        }
                        Some(Command::Close { done }) => {
                            let _ = send_message(&mut channel, &CollabMessage::Leave { replica }).await;
                            channel.close().await;
                            return Flow::Close(Some(done));
                        }
                        Some(Command::Send { data }) => {
                            let seq = self.state.outbound.push(data.clone());
                            CollabMessage::Update { seq, data }
                        }
                        Some(Command::Presence { position, selection }) => CollabMessage::Presence {
                            replica,
                            display_name: self.state.params.display_name.clone(),
                            color: self.state.params.color,
                            position,
                            selection,
                        },
                        Some(Command::Leave) => CollabMessage::Leave { replica },
                        Some(Command::RespondSync { to, data }) => CollabMessage::SyncResponse { to, data },
                        Some(Command::Version(version)) => {
                            self.state.version = version;
                            continue;
                        }
                        Some(Command::Reauthenticate { token }) => {
                            self.state.params.token = token;
                            continue;
                        }
                    };
                    if let Err(e) = send_message(&mut channel, &message).await {
                        warn!(error = %e, kind = message.kind(), "send failed, connection lost");
                        return Flow::Continue;
                    }
                }
                frame = channel.recv() => match frame {
                    None => {
                        info!(document = %self.state.params.document, "connection closed by server");
                        return Flow::Continue;
                    }
                    Some(Err(e)) => {
                        warn!(document = %self.state.params.document, error = %e, "connection lost");
                        return Flow::Continue;
                    }
                    Some(Ok(bytes)) => self.handle_frame(&bytes),
                },
            }
        }
    }

    fn handle_frame(&mut self, bytes: &[u8]) {
        let message = match CollabMessage::from_bytes(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "malformed frame skipped");
                return;
            }
        };
        trace!(kind = message.kind(), "frame received");
        let own = self.state.params.replica;
        match message {
            CollabMessage::Ack { seq } => self.state.outbound.ack(seq),
            CollabMessage::Update { data, .. } | CollabMessage::SyncResponse { data, .. } => {
                self.emit(SessionEvent::RemoteUpdate { data })
            }
            CollabMessage::SyncRequest { replica, version } if replica != own => {
                self.emit(SessionEvent::SyncRequested { replica, version })
            }
            CollabMessage::Presence {
                replica,
                display_name,
                color,
                position,
                selection,
            } if replica != own => self.emit(SessionEvent::Presence {
                replica,
                display_name,
                color,
                position,
                selection,
            }),
            CollabMessage::Join {
                replica,
                display_name,
                color,
            } if replica != own => self.emit(SessionEvent::PeerJoined {
                replica,
                display_name,
                color,
            }),
            CollabMessage::Leave { replica } if replica != own => {
                self.emit(SessionEvent::PeerLeft { replica })
            }
            other => debug!(kind = other.kind(), "frame ignored"),
        }
    }
}

async fn send_message<T: Channel>(
    channel: &mut T,
    message: &CollabMessage,
) -> Result<(), TransportError> {
    channel.send(message.to_bytes()?).await
}

async fn open_and_authenticate<C: Connector>(
    connector: &C,
    url: String,
    auth: Vec<u8>,
) -> Result<AuthOutcome<C::Channel>, TransportError> {
    let mut channel = connector.connect(&url).await?;
    channel.send(auth).await?;
    loop {
        let frame = match channel.recv().await {
            Some(frame) => frame?,
            None => return Err(TransportError::Closed),
        };
        match CollabMessage::from_bytes(&frame) {
            Ok(CollabMessage::AuthOk) => return Ok(AuthOutcome::Accepted(channel)),
            Ok(CollabMessage::AuthRejected { reason }) => {
                channel.close().await;
                return Ok(AuthOutcome::Rejected(reason));
            }
            Ok(other) => debug!(kind = other.kind(), "frame before auth ack ignored"),
            Err(e) => warn!(error = %e, "malformed frame during handshake"),
        }
    }
}
