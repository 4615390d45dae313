use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use burrow_proto::{
    read_envelope, write_envelope, CommandRequest, CommandResponse, Envelope, WireError,
    DEFAULT_MAX_FRAME_BYTES,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Notify};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no response within {after:?}")]
    Timeout { after: Duration },
    #[error("connection closed while waiting for a response")]
    ConnectionClosed,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// What the inbound-request handler wants done with the connection after a
/// command has been processed.
pub enum Dispatch {
    Reply(CommandResponse),
    /// Tear the connection down without replying (explicit exit command).
    Stop,
}

#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle(&self, request: CommandRequest) -> Dispatch;
}

/// Handler for peers that never expect inbound requests.
pub struct RejectAllHandler;

#[async_trait]
impl InboundHandler for RejectAllHandler {
    async fn handle(&self, request: CommandRequest) -> Dispatch {
        tracing::warn!(command = request.command.as_str(), "unexpected inbound command");
        Dispatch::Reply(CommandResponse::error(
            burrow_proto::STATUS_INTERNAL_ERROR,
            format!("unsupported command {}", request.command.as_str()),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Prepended to generated request ids so both directions stay
    /// distinguishable in logs ("CLIENT-<uuid>" / "SERVER-<uuid>").
    pub id_prefix: &'static str,
    pub default_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbound_capacity: usize,
    pub label: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id_prefix: "PEER",
            default_timeout: Duration::from_secs(600),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_capacity: 64,
            label: "channel".to_string(),
        }
    }
}

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResponse>>>,
    running: AtomicBool,
    closed: Notify,
    label: String,
}

impl Shared {
    /// Mark the channel stopped and wake every caller still blocked on a
    /// correlated response. Idempotent.
    fn teardown(&self, shutdown: &watch::Sender<bool>) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = shutdown.send(true);
            let drained: Vec<_> = {
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                pending.drain().collect()
            };
            if !drained.is_empty() {
                tracing::debug!(
                    label = %self.label,
                    waiters = drained.len(),
                    "waking pending callers on teardown"
                );
            }
            drop(drained);
            self.closed.notify_waiters();
        }
    }
}

/// Correlated request/response layer over one duplex byte stream.
///
/// A writer task drains the outbound queue; a reader task routes inbound
/// REQUEST frames into spawned handler invocations and RESPONSE frames to
/// the caller registered under the matching id. Frames stay strictly
/// ordered on the wire, but logically independent requests complete in
/// whatever order the peer answers them.
pub struct Channel {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Envelope>,
    shutdown: watch::Sender<bool>,
    config: ChannelConfig,
}

impl Channel {
    pub fn spawn<S, H>(stream: S, handler: Arc<H>, config: ChannelConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: InboundHandler,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            closed: Notify::new(),
            label: config.label.clone(),
        });

        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            shutdown_rx.clone(),
            Arc::clone(&shared),
            shutdown_tx.clone(),
        ));
        tokio::spawn(read_loop(
            read_half,
            handler,
            outbound_tx.clone(),
            shutdown_rx,
            Arc::clone(&shared),
            shutdown_tx.clone(),
            config.max_frame_bytes,
        ));

        Arc::new(Self {
            shared,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            config,
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Sends a command and blocks the caller until the peer answers with a
    /// RESPONSE carrying the same id, the timeout elapses, or the
    /// connection goes away.
    pub async fn request(
        &self,
        request: CommandRequest,
        timeout: Duration,
    ) -> Result<CommandResponse, ChannelError> {
        if !self.is_running() {
            return Err(ChannelError::ConnectionClosed);
        }

        let id = Envelope::fresh_id(self.config.id_prefix);
        let (response_tx, response_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.clone(), response_tx);

        let envelope = Envelope::request(id.clone(), request);
        if self.outbound.send(envelope).await.is_err() {
            self.evict_pending(&id);
            return Err(ChannelError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
            Err(_) => {
                // A response that still arrives later is discarded by the
                // dispatcher; the entry must not outlive the caller.
                self.evict_pending(&id);
                Err(ChannelError::Timeout { after: timeout })
            }
        }
    }

    /// Fire-and-forget: used for responses to peer-initiated requests.
    pub async fn respond(
        &self,
        id: impl Into<String>,
        response: CommandResponse,
    ) -> Result<(), ChannelError> {
        let envelope = Envelope::response(id, response);
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Initiates teardown and resolves once both IO tasks observed it.
    pub async fn shutdown(&self) {
        self.shared.teardown(&self.shutdown);
        self.closed().await;
    }

    /// Resolves when the channel has fully stopped (peer hangup, wire
    /// error, or local shutdown).
    pub async fn closed(&self) {
        let mut notified = std::pin::pin!(self.shared.closed.notified());
        // Register before re-checking the flag, otherwise a teardown
        // between the check and the await would never wake this caller.
        notified.as_mut().enable();
        if !self.is_running() {
            return;
        }
        notified.await;
    }

    fn evict_pending(&self, id: &str) {
        self.shared
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.lock().expect("pending lock poisoned").len()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(envelope) = message else { break };
                if !envelope.is_heart_beat() {
                    tracing::debug!(
                        label = %shared.label,
                        id = %envelope.id,
                        command = ?envelope.command(),
                        "sending frame"
                    );
                }
                if let Err(error) = write_envelope(&mut writer, &envelope).await {
                    tracing::debug!(label = %shared.label, %error, "write failed");
                    break;
                }
            }
            _ = shutdown.changed() => {
                // Flush whatever responses were already queued, then stop.
                while let Ok(envelope) = outbound.try_recv() {
                    if write_envelope(&mut writer, &envelope).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    shared.teardown(&shutdown_tx);
}

async fn read_loop<R, H>(
    mut reader: R,
    handler: Arc<H>,
    outbound: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    max_frame_bytes: usize,
) where
    R: AsyncRead + Unpin,
    H: InboundHandler,
{
    loop {
        let envelope = tokio::select! {
            result = read_envelope(&mut reader, max_frame_bytes) => result,
            _ = shutdown.changed() => break,
        };

        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(WireError::Eof) => break,
            Err(error) => {
                tracing::debug!(label = %shared.label, %error, "read failed");
                break;
            }
        };

        if !envelope.is_heart_beat() {
            tracing::debug!(
                label = %shared.label,
                id = %envelope.id,
                command = ?envelope.command(),
                "received frame"
            );
        }

        match (envelope.kind, envelope.request, envelope.response) {
            (burrow_proto::MessageKind::Request, Some(request), _) => {
                let id = envelope.id;
                let handler = Arc::clone(&handler);
                let outbound = outbound.clone();
                let shared = Arc::clone(&shared);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    match handler.handle(request).await {
                        Dispatch::Reply(response) => {
                            let reply = Envelope::response(id, response);
                            if outbound.send(reply).await.is_err() {
                                tracing::debug!(
                                    label = %shared.label,
                                    "dropping reply, channel already closed"
                                );
                            }
                        }
                        Dispatch::Stop => shared.teardown(&shutdown_tx),
                    }
                });
            }
            (burrow_proto::MessageKind::Response, _, Some(response)) => {
                let waiter = shared
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&envelope.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => {
                        // Late reply after its caller timed out.
                        tracing::debug!(
                            label = %shared.label,
                            id = %envelope.id,
                            "discarding response with no pending caller"
                        );
                    }
                }
            }
            _ => unreachable!("envelope validation enforces kind/body pairing"),
        }
    }
    shared.teardown(&shutdown_tx);
}
