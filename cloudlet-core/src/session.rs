//! Synthesis session: owns the socket, the sender/receiver pair, and the
//! state machine of one overlay transfer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::manifest::OverlayManifest;
use crate::protocol::{self, ProtocolError, ServerMessage, SessionId, SynthesisOptions};
use crate::queue::{command_queue, Command, CommandQueue, FilePayload};
use crate::receiver::{run_receiver, ReceiverEvent};
use crate::sender::{run_sender, SenderNotice};
use crate::value::{Fields, Value};
use crate::wire::{self, FrameDecodeError};

/// Default bound on connect, the session-create exchange, and the close
/// reply wait.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs for one synthesis attempt.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub options: SynthesisOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            options: SynthesisOptions::default(),
        }
    }
}

/// Coordinator states, observable through `SynthesisSession::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Establishing,
    SendingMetadata,
    AwaitingServer,
    OnDemand,
    DoneSuccess,
    DoneFailed,
}

/// Progress and outcome events delivered to the caller. Exactly one
/// terminal event is emitted per session, none if it is closed first.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Human-readable status line.
    Status(String),
    /// Overall transfer percentage, 0 through 100, emitted on change.
    Progress(u8),
    Succeeded { app_name: String },
    Failed { reason: String },
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Succeeded { .. } | SessionEvent::Failed { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("cannot connect to {addr}: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server reported failure: {0}")]
    ServerFailure(String),
    #[error("unexpected server reply: {0}")]
    UnexpectedReply(String),
    #[error("connection closed before synthesis completed")]
    UnexpectedTermination,
}

enum Control {
    Close,
}

/// Handle to a running session. Dropping it without `close` lets the driver
/// tear down silently in the background.
pub struct SynthesisSession {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<SessionState>,
    driver: Option<JoinHandle<()>>,
}

impl SynthesisSession {
    /// Start a synthesis attempt. Must be called within a Tokio runtime.
    /// Events, the terminal outcome included, arrive on the returned
    /// channel; connection failures are reported there rather than here.
    pub fn start(
        addr: SocketAddr,
        manifest: Arc<OverlayManifest>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let driver = Driver {
            addr,
            manifest,
            config,
            attempt: Uuid::new_v4(),
            events: event_tx,
            control: control_rx,
            state: state_tx,
            session_id: None,
            terminal: false,
            last_percent: None,
            bytes_sent: 0,
            started: Instant::now(),
        };
        let handle = tokio::spawn(driver.run());
        (
            Self {
                control: control_tx,
                state: state_rx,
                driver: Some(handle),
            },
            events,
        )
    }

    /// Current coordinator state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Close the session: best-effort finish exchange, then teardown in
    /// order (sender, receiver, socket). Safe in any state, repeated calls
    /// included. Never emits a terminal event by itself.
    pub async fn close(&mut self) {
        let _ = self.control.send(Control::Close);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

/// Query a server's resource info over a short-lived connection.
pub async fn fetch_resource_info(
    addr: SocketAddr,
    wait: Duration,
) -> Result<Value, SynthesisError> {
    let mut stream = match time::timeout(wait, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(SynthesisError::Connection { addr, source }),
        Err(_) => {
            return Err(SynthesisError::Connection {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };
    let reply = exchange(&mut stream, &protocol::get_resource_info(), wait).await?;
    match ServerMessage::from_fields(&reply)? {
        ServerMessage::Success {
            payload: Some(payload),
            ..
        } => Ok(payload),
        ServerMessage::Success { payload: None, .. } => Ok(Value::Null),
        ServerMessage::Failed { reasons } => Err(SynthesisError::ServerFailure(reasons)),
        other => Err(SynthesisError::UnexpectedReply(format!("{other:?}"))),
    }
}

/// Write one request frame and wait for one reply frame, both bounded.
async fn exchange(
    stream: &mut TcpStream,
    request: &Fields,
    wait: Duration,
) -> Result<Fields, SynthesisError> {
    let frame =
        wire::encode_frame(request).map_err(|err| SynthesisError::Transport(err.to_string()))?;
    match time::timeout(wait, async {
        stream.write_all(&frame).await?;
        stream.flush().await
    })
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(SynthesisError::Transport(err.to_string())),
        Err(_) => return Err(SynthesisError::Transport("timed out writing request".into())),
    }
    match time::timeout(wait, wire::read_frame(stream)).await {
        Ok(Ok(Some(fields))) => Ok(fields),
        Ok(Ok(None)) => Err(SynthesisError::UnexpectedTermination),
        Ok(Err(err)) => Err(map_decode(err)),
        Err(_) => Err(SynthesisError::Transport("timed out waiting for reply".into())),
    }
}

fn map_decode(err: FrameDecodeError) -> SynthesisError {
    match err {
        FrameDecodeError::Io(err) => SynthesisError::Transport(err.to_string()),
        other => SynthesisError::Decode(other),
    }
}

/// Live socket tasks plus their shutdown signal.
struct Link {
    queue: CommandQueue,
    shutdown: watch::Sender<bool>,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// Stop both socket tasks. The sender goes first so nothing is written to a
/// half-closed socket; the halves drop with their tasks.
async fn teardown(link: Link) {
    let _ = link.shutdown.send(true);
    let _ = link.sender.await;
    let _ = link.receiver.await;
}

enum Step {
    Control(Option<Control>),
    Notice(Option<SenderNotice>),
    Inbound(Option<ReceiverEvent>),
}

struct Driver {
    addr: SocketAddr,
    manifest: Arc<OverlayManifest>,
    config: SessionConfig,
    attempt: Uuid,
    events: mpsc::UnboundedSender<SessionEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<SessionState>,
    session_id: Option<SessionId>,
    terminal: bool,
    last_percent: Option<u8>,
    bytes_sent: u64,
    started: Instant,
}

impl Driver {
    async fn run(mut self) {
        let Some(mut stream) = self.connect().await else {
            return;
        };
        let Some(session_id) = self.establish(&mut stream).await else {
            return;
        };
        self.session_id = Some(session_id);
        self.status(format!("session {session_id} established"));

        let (link, mut notices, mut inbound) = self.spawn_io(stream);
        let mut link = Some(link);
        if let Some(l) = &link {
            self.push_metadata(&l.queue, session_id);
        }

        loop {
            let step = match &mut link {
                Some(_) => tokio::select! {
                    control = self.control.recv() => Step::Control(control),
                    notice = notices.recv() => Step::Notice(notice),
                    event = inbound.recv() => Step::Inbound(event),
                },
                None => Step::Control(self.control.recv().await),
            };
            match step {
                Step::Control(Some(Control::Close)) => {
                    if let Some(l) = link.take() {
                        self.finish_exchange(&l.queue, &mut inbound).await;
                        teardown(l).await;
                    }
                    debug!("session closed");
                    return;
                }
                Step::Control(None) => {
                    if let Some(l) = link.take() {
                        teardown(l).await;
                    }
                    debug!("session handle dropped, torn down");
                    return;
                }
                Step::Notice(Some(notice)) => {
                    if self.on_notice(notice) {
                        if let Some(l) = link.take() {
                            teardown(l).await;
                        }
                    }
                }
                Step::Inbound(Some(event)) => {
                    // Completion bookkeeping must be current before an EOF
                    // or failure verdict.
                    if matches!(event, ReceiverEvent::Closed | ReceiverEvent::Failed(_)) {
                        while let Ok(notice) = notices.try_recv() {
                            self.on_notice(notice);
                        }
                    }
                    let io_dead = match &link {
                        Some(l) => self.on_inbound(event, &l.queue),
                        None => false,
                    };
                    if io_dead {
                        if let Some(l) = link.take() {
                            teardown(l).await;
                        }
                    }
                }
                Step::Notice(None) | Step::Inbound(None) => {
                    if let Some(l) = link.take() {
                        teardown(l).await;
                    }
                }
            }
        }
    }

    async fn connect(&mut self) -> Option<TcpStream> {
        self.set_state(SessionState::Connecting);
        self.status(format!("connecting to {}", self.addr));
        let connect = time::timeout(self.config.connect_timeout, TcpStream::connect(self.addr));
        let result = tokio::select! {
            _ = self.control.recv() => return None,
            result = connect => result,
        };
        match result {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(source)) => {
                self.fail(SynthesisError::Connection { addr: self.addr, source }.to_string());
                None
            }
            Err(_) => {
                self.fail(
                    SynthesisError::Connection {
                        addr: self.addr,
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    }
                    .to_string(),
                );
                None
            }
        }
    }

    /// Session-create exchange. `None` when the attempt ended here, either
    /// failed (terminal event already sent) or cancelled by close.
    async fn establish(&mut self, stream: &mut TcpStream) -> Option<SessionId> {
        self.set_state(SessionState::Establishing);
        let request = protocol::session_create();
        let wait = self.config.connect_timeout;
        let reply = tokio::select! {
            _ = self.control.recv() => return None,
            reply = exchange(stream, &request, wait) => reply,
        };
        let reply = match reply {
            Ok(fields) => fields,
            Err(err) => {
                self.fail(err.to_string());
                return None;
            }
        };
        match ServerMessage::from_fields(&reply) {
            Ok(ServerMessage::Success {
                session_id: Some(id),
                ..
            }) => Some(id),
            Ok(ServerMessage::Success {
                session_id: None, ..
            }) => {
                self.fail("session create reply carried no session id");
                None
            }
            Ok(ServerMessage::Failed { reasons }) => {
                self.fail(SynthesisError::ServerFailure(reasons).to_string());
                None
            }
            Ok(other) => {
                self.fail(SynthesisError::UnexpectedReply(format!("{other:?}")).to_string());
                None
            }
            Err(err) => {
                self.fail(SynthesisError::Protocol(err).to_string());
                None
            }
        }
    }

    fn spawn_io(
        &self,
        stream: TcpStream,
    ) -> (
        Link,
        mpsc::UnboundedReceiver<SenderNotice>,
        mpsc::UnboundedReceiver<ReceiverEvent>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (queue, commands) = command_queue();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let (event_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sender = tokio::spawn(run_sender(write_half, commands, notice_tx, shutdown_rx.clone()));
        let receiver = tokio::spawn(run_receiver(read_half, event_tx, shutdown_rx));
        (
            Link {
                queue,
                shutdown,
                sender,
                receiver,
            },
            notices,
            inbound,
        )
    }

    fn push_metadata(&mut self, queue: &CommandQueue, session_id: SessionId) {
        self.set_state(SessionState::SendingMetadata);
        let meta_size = self.manifest.meta_size();
        queue.push(Command::with_body(
            protocol::send_meta(session_id, meta_size, self.config.options),
            FilePayload {
                path: self.manifest.meta_path().to_owned(),
                size: meta_size,
                segment: None,
            },
        ));
        self.status(format!("sending overlay metadata ({meta_size} bytes)"));
    }

    /// Returns true when the socket tasks are dead and must be torn down.
    fn on_notice(&mut self, notice: SenderNotice) -> bool {
        match notice {
            SenderNotice::MetadataSent { bytes } => {
                debug!(bytes, "overlay metadata sent");
                if !self.terminal {
                    self.set_state(SessionState::AwaitingServer);
                    self.status("overlay metadata sent, awaiting server");
                }
                false
            }
            SenderNotice::SegmentSent { name, bytes } => {
                debug!(%name, bytes, "segment sent");
                self.manifest.record_sent(&name);
                if !self.terminal {
                    self.status(format!(
                        "sent segment {} ({}/{})",
                        name,
                        self.manifest.sent_count(),
                        self.manifest.expected_segments()
                    ));
                    if self.manifest.is_complete() {
                        info!(app = %self.manifest.app_name(), "all declared segments transferred");
                    }
                }
                false
            }
            SenderNotice::Progress { total_sent } => {
                self.bytes_sent = total_sent;
                if !self.terminal {
                    self.emit_percent();
                }
                false
            }
            SenderNotice::FileUnavailable { name, error } => {
                if !self.terminal {
                    self.status(format!("segment `{name}` not available: {error}"));
                }
                false
            }
            SenderNotice::Stopped { error } => {
                if let Some(err) = error {
                    self.fail(SynthesisError::Transport(err.to_string()).to_string());
                }
                true
            }
        }
    }

    /// Returns true when the connection is unusable afterwards.
    fn on_inbound(&mut self, event: ReceiverEvent, queue: &CommandQueue) -> bool {
        match event {
            ReceiverEvent::Frame(fields) => self.on_frame(fields, queue),
            ReceiverEvent::Closed => {
                if !self.terminal {
                    if self.manifest.is_complete() {
                        info!("stream closed with every segment delivered, treating as success");
                        self.succeed();
                    } else {
                        self.fail(SynthesisError::UnexpectedTermination.to_string());
                    }
                }
                true
            }
            ReceiverEvent::Failed(err) => {
                self.fail(map_decode(err).to_string());
                true
            }
        }
    }

    fn on_frame(&mut self, fields: Fields, queue: &CommandQueue) -> bool {
        let message = match ServerMessage::from_fields(&fields) {
            Ok(message) => message,
            Err(ProtocolError::UnknownCommand(code)) => {
                warn!("ignoring unknown command {code:#x}");
                return false;
            }
            Err(err @ ProtocolError::Field(_)) => {
                // Header shape is broken; the stream can no longer be trusted.
                self.fail(SynthesisError::Protocol(err).to_string());
                return true;
            }
        };
        if self.terminal {
            debug!(?message, "message after terminal state ignored");
            return false;
        }
        match message {
            ServerMessage::OnDemandSegment { name, size } => {
                let Some(session_id) = self.session_id else {
                    return false;
                };
                self.set_state(SessionState::OnDemand);
                debug!(%name, size, "server requested segment");
                match self.manifest.lookup_segment(&name) {
                    Ok(segment) => {
                        self.status(format!("sending segment {name}"));
                        queue.push(Command::with_body(
                            protocol::send_segment(session_id, &segment.name, segment.size),
                            FilePayload {
                                path: segment.path,
                                size: segment.size,
                                segment: Some(segment.name),
                            },
                        ));
                    }
                    Err(err) => {
                        warn!(%name, "segment request not servable");
                        self.status(err.to_string());
                    }
                }
                false
            }
            ServerMessage::SynthesisDone => {
                self.succeed();
                false
            }
            ServerMessage::Failed { reasons } => {
                self.fail(SynthesisError::ServerFailure(reasons).to_string());
                false
            }
            ServerMessage::Success { .. } => {
                debug!("server acknowledged");
                false
            }
        }
    }

    /// Push the finish message and wait, bounded, for one reply. Close must
    /// not hang on a dead or silent server.
    async fn finish_exchange(
        &mut self,
        queue: &CommandQueue,
        inbound: &mut mpsc::UnboundedReceiver<ReceiverEvent>,
    ) {
        let Some(session_id) = self.session_id else {
            return;
        };
        let measurement = self.measurement();
        queue.push(Command::bare(protocol::finish(
            session_id,
            Some(&measurement),
        )));
        let _ = time::timeout(self.config.connect_timeout, inbound.recv()).await;
    }

    fn measurement(&self) -> String {
        serde_json::json!({
            "attempt": self.attempt.to_string(),
            "app": self.manifest.app_name(),
            "elapsed_ms": self.started.elapsed().as_millis() as u64,
            "bytes_sent": self.bytes_sent,
            "segments_sent": self.manifest.sent_count(),
        })
        .to_string()
    }

    fn emit_percent(&mut self) {
        let total = self.manifest.total_bytes().max(1);
        let percent = (self.bytes_sent.saturating_mul(100) / total).min(100) as u8;
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            let _ = self.events.send(SessionEvent::Progress(percent));
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(?state, "state change");
        let _ = self.state.send(state);
    }

    fn status(&self, text: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Status(text.into()));
    }

    fn succeed(&mut self) {
        if self.terminal {
            return;
        }
        self.terminal = true;
        self.set_state(SessionState::DoneSuccess);
        if self.last_percent != Some(100) {
            self.last_percent = Some(100);
            let _ = self.events.send(SessionEvent::Progress(100));
        }
        info!(
            app = %self.manifest.app_name(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "synthesis complete"
        );
        let _ = self.events.send(SessionEvent::Succeeded {
            app_name: self.manifest.app_name().to_owned(),
        });
    }

    fn fail(&mut self, reason: impl Into<String>) {
        if self.terminal {
            return;
        }
        self.terminal = true;
        self.set_state(SessionState::DoneFailed);
        let reason = reason.into();
        warn!(%reason, "synthesis failed");
        let _ = self.events.send(SessionEvent::Failed { reason });
    }
}
