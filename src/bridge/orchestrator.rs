use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::container::{default_exec_env, ContainerExec, ExecError};
use crate::limits::RateLimiter;

use super::decode::Utf8Stream;
use super::protocol::{dims_in_bounds, ClientFrame, ServerFrame};
use super::registry::{PtySession, SessionRegistry};

/// WebSocket close code for a server-side failure
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Depth of the outbound frame channel shared by all senders
const OUTBOUND_CAPACITY: usize = 256;

/// The client channel as the orchestrator sees it. Satisfied by axum's
/// `WebSocket` and by in-memory test sockets.
pub trait ClientSocket:
    Stream<Item = Result<Message, axum::Error>>
    + Sink<Message, Error = axum::Error>
    + Send
    + Unpin
    + 'static
{
}

impl<T> ClientSocket for T where
    T: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + Unpin
        + 'static
{
}

/// Service-wide bridge state: the adapters and settings every client
/// connection shares.
pub struct Bridge {
    runtime: Arc<dyn ContainerExec>,
    limiter: Arc<dyn RateLimiter>,
    settings: Arc<Settings>,
}

impl Bridge {
    pub fn new(
        runtime: Arc<dyn ContainerExec>,
        limiter: Arc<dyn RateLimiter>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            runtime,
            limiter,
            settings,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerExec> {
        &self.runtime
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    /// Drive one client connection to completion. On return every
    /// session is closed, the connection is untracked, and no reader or
    /// sweeper task remains.
    pub async fn handle_socket<S: ClientSocket>(
        &self,
        socket: S,
        client_ip: String,
        user_agent: String,
    ) {
        let connection_id = Uuid::new_v4().to_string();
        tracing::info!(
            connection = %connection_id,
            ip = %client_ip,
            user_agent = %user_agent,
            "Client connected"
        );

        self.limiter
            .track(&connection_id, &client_ip, &user_agent)
            .await;

        let (sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(run_outbound(sink, rx));

        let conn = Connection {
            connection_id: connection_id.clone(),
            registry: Arc::new(SessionRegistry::new()),
            outbound: Outbound { tx },
            runtime: self.runtime.clone(),
            limiter: self.limiter.clone(),
            settings: self.settings.clone(),
            shutdown: CancellationToken::new(),
        };

        let idle_timeout = Duration::from_secs(self.settings.limits.session_idle_timeout_sec);
        let sweeper = tokio::spawn(run_sweeper(
            conn.registry.clone(),
            conn.outbound.clone(),
            conn.shutdown.clone(),
            idle_timeout,
        ));

        let exit = conn.dispatch(&mut stream).await;

        conn.teardown().await;
        let _ = sweeper.await;

        self.limiter.untrack(&connection_id).await;

        // All senders are gone once the connection state drops; the
        // writer hands the sink back for the close frame.
        drop(conn);
        if let Ok(mut sink) = writer.await {
            if !exit.client_closed {
                let reason = exit
                    .reason
                    .unwrap_or_else(|| "connection closed".to_string());
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: reason.into(),
                    })))
                    .await;
            }
            let _ = sink.close().await;
        }

        tracing::info!(connection = %connection_id, "Client connection cleaned up");
    }
}

/// Handle cloned by every task that emits frames. The mpsc channel is
/// the single-writer funnel: only `run_outbound` touches the sink.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::Sender<ServerFrame>,
}

impl Outbound {
    async fn send(&self, frame: ServerFrame) {
        if self.tx.send(frame).await.is_err() {
            tracing::debug!("Outbound channel closed, dropping frame");
        }
    }
}

/// Drain outbound frames onto the client sink. A send failure is fatal:
/// stop writing and let the dispatch loop observe the dead socket.
async fn run_outbound<W>(mut sink: W, mut rx: mpsc::Receiver<ServerFrame>) -> W
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode outbound frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!(error = %e, "Client send failed");
            break;
        }
    }
    rx.close();
    sink
}

/// How the dispatch loop ended
struct ExitState {
    client_closed: bool,
    reason: Option<String>,
}

/// Per-connection state: the registry plus the shared adapters.
struct Connection {
    connection_id: String,
    registry: Arc<SessionRegistry>,
    outbound: Outbound,
    runtime: Arc<dyn ContainerExec>,
    limiter: Arc<dyn RateLimiter>,
    settings: Arc<Settings>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn dispatch<R>(&self, stream: &mut R) -> ExitState
    where
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()).await,
                Some(Ok(Message::Close(_))) => {
                    tracing::info!(connection = %self.connection_id, "Client closed connection");
                    return ExitState {
                        client_closed: true,
                        reason: None,
                    };
                }
                Some(Ok(_)) => {
                    // Binary/ping/pong frames are not part of the protocol
                }
                Some(Err(e)) => {
                    tracing::debug!(connection = %self.connection_id, error = %e, "Client receive error");
                    return ExitState {
                        client_closed: false,
                        reason: Some(e.to_string()),
                    };
                }
                None => {
                    return ExitState {
                        client_closed: false,
                        reason: None,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let max = self.settings.limits.max_frame_bytes;
        if text.len() > max {
            tracing::warn!(
                connection = %self.connection_id,
                size = text.len(),
                "Rejecting oversize frame"
            );
            // The frame was never parsed, so no session id is known
            self.outbound
                .send(ServerFrame::error(
                    "",
                    format!("Frame exceeds {} byte limit", max),
                ))
                .await;
            return;
        }

        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection = %self.connection_id, error = %e, "Dropping invalid frame");
                return;
            }
        };

        match frame {
            ClientFrame::CreateSession { session_id } => self.create_session(session_id).await,
            ClientFrame::Input { session_id, data } => self.input(session_id, data).await,
            ClientFrame::Resize {
                session_id,
                cols,
                rows,
            } => self.resize(session_id, cols, rows).await,
            ClientFrame::CloseSession { session_id } => {
                // Unknown ids are acknowledged too: close is idempotent
                self.close_and_ack(&session_id).await;
            }
        }
    }

    async fn create_session(&self, session_id: String) {
        if session_id.is_empty() {
            tracing::warn!(connection = %self.connection_id, "create_session frame missing sessionId");
            return;
        }

        if self.registry.contains(&session_id).await {
            tracing::warn!(session = %session_id, "Session already exists");
            self.outbound.send(ServerFrame::created(&session_id)).await;
            return;
        }

        if let Err(e) = self.open_session(&session_id).await {
            tracing::error!(session = %session_id, error = %e, "Failed to create session");
            self.outbound
                .send(ServerFrame::error(&session_id, e.to_string()))
                .await;
        }
    }

    async fn open_session(&self, session_id: &str) -> Result<(), ExecError> {
        let container = self.runtime.ensure_running().await?;
        let argv = vec![self.settings.container.shell.clone()];
        let exec = self
            .runtime
            .create_exec(
                &container,
                &argv,
                &self.settings.container.user,
                &default_exec_env(),
            )
            .await?;

        let session = Arc::new(PtySession::new(session_id, &exec.exec_id, exec.stream.input));
        self.registry.insert(session.clone()).await;

        tracing::info!(
            connection = %self.connection_id,
            session = %session_id,
            exec = %exec.exec_id,
            "Created session"
        );

        // Acknowledge before the reader starts so session_created always
        // precedes the first output frame
        self.outbound.send(ServerFrame::created(session_id)).await;

        let reader = spawn_reader(
            session_id.to_string(),
            exec.stream.output,
            self.registry.clone(),
            self.outbound.clone(),
            self.shutdown.clone(),
            self.settings.limits.pty_chunk_bytes,
        );
        session.set_reader(reader);

        Ok(())
    }

    async fn input(&self, session_id: String, data: String) {
        let Some(session) = self.registry.get(&session_id).await else {
            self.outbound
                .send(ServerFrame::error(&session_id, "Session not found"))
                .await;
            return;
        };

        if !self.limiter.check_command(&self.connection_id).await {
            self.outbound
                .send(ServerFrame::error(
                    &session_id,
                    "Rate limit exceeded. Please wait.",
                ))
                .await;
            return;
        }

        let bytes = data.as_bytes();
        if bytes.len() > self.settings.limits.max_frame_bytes {
            self.outbound
                .send(ServerFrame::error(&session_id, "Input too large"))
                .await;
            return;
        }

        let cap = self.settings.limits.max_input_per_session_bytes;
        if !session.try_charge_input(bytes.len() as u64, cap) {
            tracing::warn!(
                session = %session_id,
                total = session.input_total(),
                "Session input limit exceeded"
            );
            self.outbound
                .send(ServerFrame::error(&session_id, "Session input limit exceeded"))
                .await;
            self.close_and_ack(&session_id).await;
            return;
        }

        session.touch();

        if let Err(e) = session.write(bytes).await {
            tracing::error!(session = %session_id, error = %e, "Failed to write to session");
            self.outbound
                .send(ServerFrame::error(
                    &session_id,
                    format!("Failed to write to session: {}", e),
                ))
                .await;
            self.close_and_ack(&session_id).await;
        }
    }

    async fn resize(&self, session_id: String, cols: i64, rows: i64) {
        if !dims_in_bounds(cols, rows) {
            self.outbound
                .send(ServerFrame::error(
                    &session_id,
                    format!("Invalid dimensions: {}x{}", cols, rows),
                ))
                .await;
            return;
        }

        let Some(session) = self.registry.get(&session_id).await else {
            self.outbound
                .send(ServerFrame::error(&session_id, "Session not found"))
                .await;
            return;
        };

        if let Err(e) = self
            .runtime
            .resize_exec(session.exec_id(), cols as u16, rows as u16)
            .await
        {
            tracing::warn!(session = %session_id, error = %e, "Failed to resize session");
            self.outbound
                .send(ServerFrame::error(
                    &session_id,
                    format!("Failed to resize session: {}", e),
                ))
                .await;
        } else {
            tracing::info!(session = %session_id, cols = cols, rows = rows, "Resized session");
        }
    }

    /// Remove the session if present, stop its reader, close its stream,
    /// and acknowledge with `session_closed`.
    async fn close_and_ack(&self, session_id: &str) {
        if let Some(session) = self.registry.remove(session_id).await {
            if let Some(handle) = session.abort_reader() {
                let _ = handle.await;
            }
            session.close_input().await;
            tracing::info!(connection = %self.connection_id, session = %session_id, "Closed session");
        }
        self.outbound.send(ServerFrame::closed(session_id)).await;
    }

    /// Tear the connection down: stop the sweeper and readers, close
    /// every PTY stream, and clear the registry. Runs after the dispatch
    /// loop exits.
    async fn teardown(&self) {
        self.shutdown.cancel();

        let sessions = self.registry.drain().await;
        for session in sessions {
            if let Some(handle) = session.abort_reader() {
                let _ = handle.await;
            }
            session.close_input().await;
            self.outbound
                .send(ServerFrame::closed(session.session_id()))
                .await;
            tracing::info!(
                connection = %self.connection_id,
                session = %session.session_id(),
                "Closed session during teardown"
            );
        }
    }
}

/// One reader per session: drain the PTY byte stream into `output`
/// frames. Never writes to the client directly; all frames go through
/// the outbound channel.
fn spawn_reader(
    session_id: String,
    mut output: Box<dyn AsyncRead + Send + Unpin>,
    registry: Arc<SessionRegistry>,
    outbound: Outbound,
    shutdown: CancellationToken,
    chunk_bytes: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; chunk_bytes];
        let mut decoder = Utf8Stream::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Teardown owns cleanup; just stop reading
                    return;
                }
                read = output.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        if !text.is_empty() {
                            outbound.send(ServerFrame::output(&session_id, text)).await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session = %session_id, error = %e, "PTY read error");
                        break;
                    }
                },
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            outbound.send(ServerFrame::output(&session_id, tail)).await;
        }

        // The PTY went away; reap our own session unless teardown or an
        // explicit close already did
        if let Some(session) = registry.remove(&session_id).await {
            session.close_input().await;
            outbound.send(ServerFrame::closed(&session_id)).await;
            tracing::info!(session = %session_id, "PTY stream closed");
        }
    })
}

/// Reap sessions with no inbound activity for longer than the idle
/// timeout. Never touches the client channel itself.
async fn run_sweeper(
    registry: Arc<SessionRegistry>,
    outbound: Outbound,
    shutdown: CancellationToken,
    idle_timeout: Duration,
) {
    let period = sweep_period(idle_timeout);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of an interval completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                for session in registry.idle_sessions(idle_timeout).await {
                    let session_id = session.session_id().to_string();
                    // remove() claims the session; a racing reader or
                    // close gets None and skips its own emit
                    let Some(session) = registry.remove(&session_id).await else {
                        continue;
                    };

                    tracing::info!(session = %session_id, "Reaping idle session");
                    outbound
                        .send(ServerFrame::error(&session_id, idle_message(idle_timeout)))
                        .await;

                    if let Some(handle) = session.abort_reader() {
                        let _ = handle.await;
                    }
                    session.close_input().await;
                    outbound.send(ServerFrame::closed(&session_id)).await;
                }
            }
        }
    }
}

fn sweep_period(idle_timeout: Duration) -> Duration {
    idle_timeout
        .min(Duration::from_secs(60))
        .max(Duration::from_secs(1))
}

fn idle_message(idle_timeout: Duration) -> String {
    format!(
        "Session idle timeout ({} minutes).",
        idle_timeout.as_secs() / 60
    )
}
