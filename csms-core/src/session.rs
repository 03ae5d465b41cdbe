//! Charge point session
//!
//! One session per connected charge point. The session owns the WebSocket:
//! a writer task drains the outbound queue into the sink while the inbound
//! loop reads frames in arrival order, routes CALLs and resolves pending
//! outbound calls.
//!
//! Lifecycle: `Connected -> Running -> Closed`. On close the session leaves
//! the registry and fails whatever outbound calls are still waiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::correlation::PendingCalls;
use crate::error::CommandError;
use crate::ocpp::{BootNotificationRequest, OcppMessage, Request};
use crate::registry::SessionRegistry;
use crate::router::Router;

/// How long the writer gets to send queued frames and a close frame
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake done, inbound loop not started yet
    Connected,
    /// Inbound loop running
    Running,
    /// Transport gone, session deregistered
    Closed,
}

/// Why the inbound loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame received from the charge point
    ClosedByPeer,
    /// Stream ended without a close frame
    StreamEnded,
    /// Transport-level error
    Transport(String),
    /// Too many consecutive undecodable frames
    DecodeFailures(u32),
    /// Closed locally (replacement or server shutdown)
    Shutdown,
}

/// Charge point details reported in BootNotification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub booted_at: DateTime<Utc>,
}

impl BootInfo {
    pub fn from_request(request: &BootNotificationRequest, booted_at: DateTime<Utc>) -> Self {
        Self {
            vendor: request.charge_point_vendor.clone(),
            model: request.charge_point_model.clone(),
            serial_number: request.charge_point_serial_number.clone(),
            firmware_version: request.firmware_version.clone(),
            booted_at,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SessionState>,
    boot: Mutex<Option<BootInfo>>,
}

/// Cloneable handle to a live session
///
/// Used by the registry, the router and the command sender.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    connection_id: Uuid,
    identity: Arc<str>,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<OcppMessage>,
    pending: PendingCalls,
    shutdown: Arc<Notify>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Charge point identity (registry key)
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Unique id of this particular connection
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn boot_info(&self) -> Option<BootInfo> {
        self.shared.boot.lock().clone()
    }

    /// Outstanding outbound calls
    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Send a typed CALL to the charge point and wait for its response
    pub async fn call<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, CommandError> {
        self.pending.call(&self.outbound, request, timeout).await
    }

    /// Ask the session to close; the inbound loop does the cleanup
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub(crate) fn record_boot(&self, info: BootInfo) {
        *self.shared.boot.lock() = Some(info);
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.lock() = state;
    }
}

/// The inbound side of a session, consumed by [`Session::run`]
pub struct Session {
    handle: SessionHandle,
    outbound_rx: mpsc::Receiver<OcppMessage>,
    router: Arc<Router>,
    registry: SessionRegistry,
    max_decode_failures: u32,
}

impl Session {
    /// Create a session and its handle; nothing runs until [`Session::run`]
    pub fn new(
        identity: impl Into<String>,
        outbound_queue: usize,
        router: Arc<Router>,
        registry: SessionRegistry,
        max_decode_failures: u32,
    ) -> (Self, SessionHandle) {
        let (outbound, outbound_rx) = mpsc::channel(outbound_queue.max(1));
        let identity: String = identity.into();

        let handle = SessionHandle {
            connection_id: Uuid::new_v4(),
            identity: Arc::from(identity),
            connected_at: Utc::now(),
            outbound,
            pending: PendingCalls::new(),
            shutdown: Arc::new(Notify::new()),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::Connected),
                boot: Mutex::new(None),
            }),
        };

        let session = Self {
            handle: handle.clone(),
            outbound_rx,
            router,
            registry,
            max_decode_failures: max_decode_failures.max(1),
        };

        (session, handle)
    }

    /// Drive the session until the transport closes or shutdown is requested
    pub async fn run<S>(self, ws: WebSocketStream<S>) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            handle,
            outbound_rx,
            router,
            registry,
            max_decode_failures,
        } = self;

        let (ws_tx, mut ws_rx) = ws.split();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let writer = spawn_writer(handle.identity.clone(), ws_tx, outbound_rx, stop_rx);
        let writer_abort = writer.abort_handle();

        handle.set_state(SessionState::Running);
        info!(
            "[{}] Session running (connection {})",
            handle.identity(),
            handle.connection_id()
        );

        let mut decode_failures = 0u32;
        let reason = loop {
            tokio::select! {
                _ = handle.shutdown.notified() => break CloseReason::Shutdown,

                frame = ws_rx.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(_))) => {
                            decode_failures += 1;
                            warn!("[{}] Ignoring binary frame", handle.identity());
                            if decode_failures >= max_decode_failures {
                                break CloseReason::DecodeFailures(decode_failures);
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => break CloseReason::ClosedByPeer,
                        // ping/pong are answered by tungstenite
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                        None => break CloseReason::StreamEnded,
                    };

                    debug!("[{}] Received: {}", handle.identity(), text.as_str());

                    match OcppMessage::parse(text.as_bytes()) {
                        Ok(msg) => {
                            decode_failures = 0;
                            handle_message(&handle, &router, msg).await;
                        }
                        Err(e) => {
                            decode_failures += 1;
                            warn!(
                                "[{}] Discarding undecodable frame ({}/{}): {}",
                                handle.identity(),
                                decode_failures,
                                max_decode_failures,
                                e
                            );
                            if decode_failures >= max_decode_failures {
                                break CloseReason::DecodeFailures(decode_failures);
                            }
                        }
                    }
                }
            }
        };

        // Closed: deregister, fail pending calls, stop the writer
        handle.set_state(SessionState::Closed);
        let removed = registry
            .remove_if_current(handle.identity(), handle.connection_id())
            .await;
        let failed = handle.pending.close();

        let _ = stop_tx.send(());
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            writer_abort.abort();
        }

        match &reason {
            CloseReason::ClosedByPeer | CloseReason::StreamEnded | CloseReason::Shutdown => info!(
                "[{}] Session closed: {:?} (deregistered: {}, failed calls: {})",
                handle.identity(),
                reason,
                removed,
                failed
            ),
            _ => warn!(
                "[{}] Session closed: {:?} (deregistered: {}, failed calls: {})",
                handle.identity(),
                reason,
                removed,
                failed
            ),
        }

        reason
    }
}

/// Writer task: outbound queue -> websocket
///
/// On `stop` the queue is closed and whatever is already in it is sent
/// before the close frame.
pub(crate) fn spawn_writer<S>(
    identity: Arc<str>,
    mut ws_tx: SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<OcppMessage>,
    mut stop: oneshot::Receiver<()>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if !write_frame(&identity, &mut ws_tx, msg).await {
                        break;
                    }
                }
                _ = &mut stop => {
                    outbound_rx.close();
                    while let Some(msg) = outbound_rx.recv().await {
                        if !write_frame(&identity, &mut ws_tx, msg).await {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    })
}

async fn write_frame<S>(
    identity: &str,
    ws_tx: &mut SplitSink<WebSocketStream<S>, Message>,
    msg: OcppMessage,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = match msg.to_text() {
        Ok(text) => text,
        Err(e) => {
            error!("[{}] Failed to serialize message: {}", identity, e);
            return true;
        }
    };

    debug!("[{}] Sending: {}", identity, text);

    match ws_tx.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            error!("[{}] Failed to send WebSocket message: {}", identity, e);
            false
        }
    }
}

async fn handle_message(handle: &SessionHandle, router: &Router, msg: OcppMessage) {
    match msg {
        OcppMessage::Call(call) => {
            let reply = router.dispatch(handle, call);
            if handle.outbound.send(reply).await.is_err() {
                warn!("[{}] Outbound queue closed, reply dropped", handle.identity());
            }
        }
        OcppMessage::CallResult(result) => {
            handle.pending.resolve_result(result);
        }
        OcppMessage::CallError(error) => {
            warn!(
                "[{}] CALLERROR for {}: {:?} - {}",
                handle.identity(),
                error.message_id,
                error.error_code,
                error.error_description
            );
            handle.pending.resolve_error(error);
        }
    }
}
