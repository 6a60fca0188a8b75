//! # Inbound Router and Reply Pump
//!
//! One listening socket owns all inbound traffic. Each accepted connection
//! first announces a routing identity in its preamble frame group; the
//! router registers `identity -> connection` and a reconnect with the same
//! identity replaces the registration, so replies always flow to the newest
//! connection.
//!
//! Per inbound frame group the router prepends the connection's identity,
//! decodes, and hands the envelope to every subscribed handler in its own
//! task so a slow handler cannot stall the socket. A version-gate rejection
//! queues a `DifferentVersion` reply to the offending identity; invalid
//! timestamps and malformed messages are logged and dropped.
//!
//! The reply pump drains the reply queue, encodes, routes through the
//! identity registry with a short bounded send, and resolves the caller's
//! completion handle whether or not the send went through. A reply lost
//! here is observed by the remote as a request timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{FrameCodec, FrameGroup, LastMessage, WireContext};
use crate::error::TransportError;
use crate::messages::{Envelope, Message};

/// Bounded send budget for one reply on the listening socket.
pub(crate) const REPLY_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a fresh connection may take to announce its identity.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outgoing frame groups queued per connection.
const CONNECTION_QUEUE_DEPTH: usize = 16;

// ============================================================================
// Handler surface
// ============================================================================

/// An application message handler. Handlers are invoked concurrently, each
/// isolated in its own task; one handler's latency or panic does not affect
/// the others or the router.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

/// Ordered list of subscribed handlers.
pub(crate) type Handlers = Arc<StdRwLock<Vec<Arc<dyn MessageHandler>>>>;

// ============================================================================
// Connection registry
// ============================================================================

/// Live inbound connections keyed by routing identity hex. The newest
/// registration for an identity wins.
pub(crate) struct ConnectionRegistry {
    inner: StdMutex<HashMap<String, mpsc::Sender<FrameGroup>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
        }
    }

    fn register(&self, identity_hex: String, sink: mpsc::Sender<FrameGroup>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.insert(identity_hex.clone(), sink).is_some() {
            debug!(
                identity = &identity_hex[..identity_hex.len().min(16)],
                "identity re-registered, handing traffic to the new connection"
            );
        }
    }

    fn sink(&self, identity_hex: &str) -> Option<mpsc::Sender<FrameGroup>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(identity_hex)
            .cloned()
    }

    /// Unregister on connection exit, but only when the registration still
    /// belongs to that connection; a newer connection's entry stays.
    fn remove_if_same(&self, identity_hex: &str, sink: &mpsc::Sender<FrameGroup>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(current) = inner.get(identity_hex) {
            if current.same_channel(sink) {
                inner.remove(identity_hex);
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().expect("registry lock poisoned").clear();
    }
}

// ============================================================================
// Router
// ============================================================================

/// Shared state every connection task needs.
pub(crate) struct RouterShared {
    pub ctx: Arc<WireContext>,
    pub handlers: Handlers,
    pub last_message: LastMessage,
    pub reply_tx: mpsc::Sender<ReplyCommand>,
    pub registry: Arc<ConnectionRegistry>,
    pub processor: CancellationToken,
}

/// Spawn the accept loop on the bound listener.
pub(crate) fn spawn_router(
    listener: TcpListener,
    shared: Arc<RouterShared>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let shared = shared.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, remote_addr, shared, token).await;
                        });
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                },
            }
        }
        debug!("router stopped");
    })
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<RouterShared>,
    token: CancellationToken,
) {
    let mut framed = Framed::new(stream, FrameCodec);

    // The preamble is a single-frame group carrying the routing identity.
    let preamble = tokio::time::timeout(PREAMBLE_TIMEOUT, framed.next()).await;
    let identity = match preamble {
        Ok(Some(Ok(group))) if group.len() == 1 && !group[0].is_empty() => group[0].clone(),
        _ => {
            debug!(peer = %remote_addr, "connection sent no identity preamble, dropping");
            return;
        }
    };
    let identity_hex = hex::encode(&identity);
    trace!(peer = %remote_addr, identity = &identity_hex[..16.min(identity_hex.len())], "connection registered");

    let (conn_tx, mut conn_rx) = mpsc::channel::<FrameGroup>(CONNECTION_QUEUE_DEPTH);
    shared.registry.register(identity_hex.clone(), conn_tx.clone());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            outgoing = conn_rx.recv() => match outgoing {
                Some(group) => {
                    if let Err(error) = framed.send(group).await {
                        warn!(peer = %remote_addr, %error, "reply write failed, closing connection");
                        break;
                    }
                }
                None => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(group)) => handle_inbound(&identity, group, &shared),
                Some(Err(error)) => {
                    warn!(peer = %remote_addr, %error, "inbound framing error, closing connection");
                    break;
                }
                None => break,
            },
        }
    }

    shared.registry.remove_if_same(&identity_hex, &conn_tx);
    trace!(peer = %remote_addr, "connection closed");
}

fn handle_inbound(identity: &Bytes, group: FrameGroup, shared: &RouterShared) {
    if shared.processor.is_cancelled() {
        return;
    }

    let mut frames = Vec::with_capacity(1 + group.len());
    frames.push(identity.clone());
    frames.extend(group);

    match shared.ctx.decode(&frames, true) {
        Ok(envelope) => {
            if let Ok(mut guard) = shared.last_message.write() {
                *guard = Some(Utc::now());
            }
            trace!(
                kind = envelope.message.kind_name(),
                from = %envelope.remote,
                "inbound message"
            );
            dispatch(envelope, shared);
        }
        Err(TransportError::DifferentAppProtocolVersion {
            identity: Some(reply_to),
            remote,
            ..
        }) => {
            warn!(
                remote_version = remote.version,
                signer = remote.signer.short(),
                "peer speaks an incompatible protocol version"
            );
            let command = ReplyCommand {
                identity: reply_to,
                message: Message::DifferentVersion,
            };
            if shared.reply_tx.try_send(command).is_err() {
                warn!("reply queue full, dropping DifferentVersion notice");
            }
        }
        Err(error) => {
            warn!(error = %error, tag = error.tag(), "dropping invalid inbound message");
        }
    }
}

/// Hand an envelope to every subscribed handler, each in its own task under
/// the processor token.
fn dispatch(envelope: Envelope, shared: &RouterShared) {
    let handlers = shared
        .handlers
        .read()
        .expect("handlers lock poisoned")
        .clone();
    for handler in handlers {
        let envelope = envelope.clone();
        let processor = shared.processor.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = processor.cancelled() => {}
                _ = handler.handle(envelope) => {}
            }
        });
    }
}

// ============================================================================
// Reply pump
// ============================================================================

/// A reply waiting to be emitted on the listening socket.
pub(crate) struct ReplyCommand {
    pub identity: Vec<u8>,
    pub message: Message,
}

/// Completion handles for in-flight `reply` calls, keyed by identity hex.
pub(crate) type ReplyCompletions = Arc<StdMutex<HashMap<String, oneshot::Sender<()>>>>;

/// Spawn the reply pump. Every dequeued reply resolves its completion
/// handle, even when the send fails or times out.
pub(crate) fn spawn_reply_pump(
    mut rx: mpsc::Receiver<ReplyCommand>,
    registry: Arc<ConnectionRegistry>,
    completions: ReplyCompletions,
    ctx: Arc<WireContext>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                _ = token.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            let identity_hex = hex::encode(&command.identity);
            emit_reply(&identity_hex, command, &registry, &ctx).await;

            // The application already produced the reply; the handle
            // resolves whether or not the wire accepted it.
            let done = completions
                .lock()
                .expect("completions lock poisoned")
                .remove(&identity_hex);
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        debug!("reply pump stopped");
    })
}

async fn emit_reply(
    identity_hex: &str,
    command: ReplyCommand,
    registry: &ConnectionRegistry,
    ctx: &WireContext,
) {
    match ctx.encode(&command.message) {
        Ok(frames) => match registry.sink(identity_hex) {
            Some(sink) => {
                match tokio::time::timeout(REPLY_SEND_TIMEOUT, sink.send(frames)).await {
                    Ok(Ok(())) => {
                        trace!(
                            kind = command.message.kind_name(),
                            identity = &identity_hex[..16.min(identity_hex.len())],
                            "reply emitted"
                        );
                    }
                    Ok(Err(_)) => {
                        warn!("reply connection gone, dropping reply");
                    }
                    Err(_) => {
                        warn!("reply send timed out, dropping reply");
                    }
                }
            }
            None => {
                warn!(
                    identity = &identity_hex[..16.min(identity_hex.len())],
                    "no live connection for reply identity"
                );
            }
        },
        Err(error) => {
            warn!(%error, "failed to encode reply");
        }
    }
}
