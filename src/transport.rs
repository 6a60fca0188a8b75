//! # Transport Facade and Lifecycle
//!
//! [`Transport`] is the public entry point: it owns the listening socket,
//! the request worker pool, the reply and broadcast pumps, the outbound
//! socket cache, and the NAT resolution outcome.
//!
//! ## Lifecycle
//!
//! `New -> Starting -> Running -> Stopping -> Stopped -> Disposed`
//!
//! `start` binds the listener, resolves the advertised endpoint, spawns the
//! background tasks, and flips to `Running` (observable via
//! [`Transport::wait_for_running`]). `stop` drains for a grace period and
//! tears everything down; `dispose` is the idempotent final teardown.
//!
//! ## Cancellation
//!
//! Three linked tokens: `runtime` is the root; `turn` (allocation refresh)
//! and `processor` (handler dispatch) are children, and every outbound call
//! gets its own child linked with the caller-provided token. Cancelling the
//! runtime cascades to everything.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{LastMessage, WireContext};
use crate::error::TransportError;
use crate::identity::{BoundPeer, Identity, Keypair, Peer};
use crate::messages::{Envelope, Message};
use crate::nat::{resolve_public_endpoint, spawn_refresh_task, IceServer};
use crate::outbound::{
    spawn_broadcast_pump, spawn_sweeper, OutboundCache, DEFAULT_SOCKET_LIFETIME,
    DEFAULT_SWEEP_PERIOD,
};
use crate::requests::{spawn_workers, MessageRequest, DEFAULT_WORKERS, FIRE_AND_FORGET_TIMEOUT};
use crate::router::{
    spawn_reply_pump, spawn_router, ConnectionRegistry, Handlers, MessageHandler, ReplyCommand,
    ReplyCompletions, RouterShared,
};
use crate::version::{AppProtocolVersion, DifferentVersionCallback, VersionGate};

const REPLY_QUEUE_DEPTH: usize = 128;
const BROADCAST_QUEUE_DEPTH: usize = 128;

/// Transport lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Disposed,
}

// ============================================================================
// Configuration
// ============================================================================

/// Transport configuration. `host` and `ice_servers` must not both be
/// empty; everything else has a default via [`TransportConfig::new`].
pub struct TransportConfig {
    /// The node's signing keypair; its public key is the node identity.
    pub keypair: Keypair,
    /// The local protocol version attached to every outbound message.
    pub app_protocol_version: AppProtocolVersion,
    /// Signers whose versions are acceptable; `None` trusts any signer.
    pub trusted_version_signers: Option<HashSet<Identity>>,
    /// Request worker count.
    pub workers: usize,
    /// Publicly reachable host to advertise. Skips ICE when set.
    pub host: Option<String>,
    /// Listening port; 0 picks any free port.
    pub listen_port: u16,
    /// ICE servers tried in order when no host is configured.
    pub ice_servers: Vec<IceServer>,
    /// Decides whether to accept a peer with a different trusted version.
    pub different_version_callback: Option<DifferentVersionCallback>,
    /// Maximum age (and future skew) of inbound message timestamps.
    pub message_lifespan: Option<Duration>,
    /// Idle lifetime of cached outbound sockets.
    pub outbound_socket_lifetime: Duration,
    /// Wake period of the idle-socket sweeper.
    pub sweep_period: Duration,
}

impl TransportConfig {
    pub fn new(keypair: Keypair, app_protocol_version: AppProtocolVersion) -> Self {
        Self {
            keypair,
            app_protocol_version,
            trusted_version_signers: None,
            workers: DEFAULT_WORKERS,
            host: None,
            listen_port: 0,
            ice_servers: Vec::new(),
            different_version_callback: None,
            message_lifespan: None,
            outbound_socket_lifetime: DEFAULT_SOCKET_LIFETIME,
            sweep_period: DEFAULT_SWEEP_PERIOD,
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Everything created by `start` and torn down by `stop`.
struct Active {
    runtime: CancellationToken,
    request_tx: mpsc::UnboundedSender<MessageRequest>,
    reply_tx: mpsc::Sender<ReplyCommand>,
    broadcast_tx: mpsc::Sender<(Vec<BoundPeer>, Message)>,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<OutboundCache>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// Peer-to-peer message transport: typed, signed, timestamped messages with
/// request/reply, broadcast, and reply routing over one listening socket.
pub struct Transport {
    config: TransportConfig,
    keypair: Arc<Keypair>,
    state_tx: watch::Sender<TransportState>,
    handlers: Handlers,
    last_message: LastMessage,
    reply_completions: ReplyCompletions,
    as_peer: StdRwLock<Peer>,
    active: StdRwLock<Option<Active>>,
    lifecycle: AsyncMutex<()>,
    request_ids: AtomicU64,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let keypair = Arc::new(config.keypair.clone());
        let as_peer = Peer::new(keypair.identity());
        let (state_tx, _) = watch::channel(TransportState::New);
        Self {
            config,
            keypair,
            state_tx,
            handlers: Handlers::default(),
            last_message: LastMessage::default(),
            reply_completions: ReplyCompletions::default(),
            as_peer: StdRwLock::new(as_peer),
            active: StdRwLock::new(None),
            lifecycle: AsyncMutex::new(()),
            request_ids: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bind the listening socket, resolve the public endpoint, launch the
    /// background tasks, and enter `Running`.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            TransportState::Disposed => return Err(TransportError::Disposed),
            TransportState::Starting | TransportState::Running | TransportState::Stopping => {
                return Err(TransportError::AlreadyRunning)
            }
            TransportState::New | TransportState::Stopped => {}
        }

        let previous = self.state();
        self.set_state(TransportState::Starting);
        match self.do_start(cancel).await {
            Ok(()) => {
                self.set_state(TransportState::Running);
                Ok(())
            }
            Err(error) => {
                self.set_state(previous);
                Err(error)
            }
        }
    }

    async fn do_start(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if self.config.host.is_none() && self.config.ice_servers.is_empty() {
            return Err(TransportError::NoPublicEndpoint);
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        info!(%local_addr, "listening socket bound");

        let nat = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            outcome = resolve_public_endpoint(
                self.config.host.as_deref(),
                &self.config.ice_servers,
                local_addr.port(),
            ) => outcome?,
        };

        let mut local_peer = Peer::new(self.keypair.identity());
        local_peer.endpoint = nat.endpoint;
        local_peer.public_ip = nat.public_ip;
        info!(peer = %local_peer, "advertising peer identity");
        *self.as_peer.write().expect("as_peer lock poisoned") = local_peer.clone();

        let runtime = CancellationToken::new();
        let turn = runtime.child_token();
        let processor = runtime.child_token();

        let ctx = Arc::new(WireContext {
            keypair: self.keypair.clone(),
            local_peer,
            version: self.config.app_protocol_version.clone(),
            gate: VersionGate::new(
                self.config.app_protocol_version.clone(),
                self.config.trusted_version_signers.clone(),
                self.config.different_version_callback.clone(),
            ),
            lifespan: self.config.message_lifespan,
        });

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_DEPTH);
        let registry = Arc::new(ConnectionRegistry::new());
        let cache = Arc::new(OutboundCache::new(self.config.outbound_socket_lifetime));

        let mut tasks = Vec::new();
        tasks.push(spawn_router(
            listener,
            Arc::new(RouterShared {
                ctx: ctx.clone(),
                handlers: self.handlers.clone(),
                last_message: self.last_message.clone(),
                reply_tx: reply_tx.clone(),
                registry: registry.clone(),
                processor,
            }),
            runtime.clone(),
        ));
        tasks.push(spawn_reply_pump(
            reply_rx,
            registry.clone(),
            self.reply_completions.clone(),
            ctx.clone(),
            runtime.clone(),
        ));
        tasks.push(spawn_broadcast_pump(
            broadcast_rx,
            cache.clone(),
            ctx.clone(),
            runtime.clone(),
        ));
        tasks.extend(spawn_workers(
            self.config.workers.max(1),
            Arc::new(AsyncMutex::new(request_rx)),
            ctx,
            self.last_message.clone(),
            runtime.clone(),
        ));
        tasks.push(spawn_sweeper(
            cache.clone(),
            self.config.sweep_period,
            runtime.clone(),
        ));
        if let Some((client, allocation)) = nat.ice {
            tasks.push(spawn_refresh_task(client, allocation, turn));
        }

        *self.active.write().expect("active lock poisoned") = Some(Active {
            runtime,
            request_tx,
            reply_tx,
            broadcast_tx,
            registry,
            cache,
            tasks,
            local_addr,
        });
        Ok(())
    }

    /// Drain for `grace`, then tear down the listener, pumps, queues, TURN
    /// client, and every cached outbound socket. Idempotent when not
    /// running.
    pub async fn stop(
        &self,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != TransportState::Running {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(grace) => {}
        }

        self.set_state(TransportState::Stopping);
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .clear();

        let active = self.active.write().expect("active lock poisoned").take();
        if let Some(active) = active {
            active.runtime.cancel();
            for task in &active.tasks {
                task.abort();
            }
            active.cache.dispose_all().await;
            active.registry.clear();
        }
        self.reply_completions
            .lock()
            .expect("completions lock poisoned")
            .clear();

        self.set_state(TransportState::Stopped);
        info!("transport stopped");
        Ok(())
    }

    /// Final teardown: close the request channel, cancel every token, drop
    /// all background tasks. Idempotent.
    pub fn dispose(&self) {
        if self.state() == TransportState::Disposed {
            return;
        }
        let active = self.active.write().expect("active lock poisoned").take();
        if let Some(active) = active {
            active.runtime.cancel();
            for task in &active.tasks {
                task.abort();
            }
        }
        self.set_state(TransportState::Disposed);
        debug!("transport disposed");
    }

    /// Resolves once the transport enters `Running`. Errors if it is
    /// disposed first.
    pub async fn wait_for_running(&self) -> Result<(), TransportError> {
        let mut state_rx = self.state_tx.subscribe();
        let state = state_rx
            .wait_for(|state| {
                matches!(state, TransportState::Running | TransportState::Disposed)
            })
            .await
            .map_err(|_| TransportError::Disposed)?;
        match *state {
            TransportState::Running => Ok(()),
            _ => Err(TransportError::Disposed),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    pub fn running(&self) -> bool {
        self.state() == TransportState::Running
    }

    fn set_state(&self, state: TransportState) {
        self.state_tx.send_replace(state);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The advertised peer record: identity plus the endpoint chosen by NAT
    /// resolution at start.
    pub fn as_peer(&self) -> Peer {
        self.as_peer.read().expect("as_peer lock poisoned").clone()
    }

    /// Instant of the last successfully decoded inbound message.
    pub fn last_message_timestamp(&self) -> Option<DateTime<Utc>> {
        *self
            .last_message
            .read()
            .expect("last_message lock poisoned")
    }

    /// The bound listener address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .read()
            .expect("active lock poisoned")
            .as_ref()
            .map(|active| active.local_addr)
    }

    /// Subscribe a handler to decoded inbound messages. Handlers run
    /// concurrently and are cleared by `stop`.
    pub fn add_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .expect("handlers lock poisoned")
            .push(handler);
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Fire-and-forget send with the standard wire timeout. Completes when
    /// the message has been handed to the wire.
    pub async fn send(
        &self,
        peer: &BoundPeer,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.request(peer, message, Some(FIRE_AND_FORGET_TIMEOUT), 0, false, cancel)
            .await
            .map(|_| ())
    }

    /// Request expecting exactly one reply.
    pub async fn send_with_reply(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Envelope, TransportError> {
        let mut replies = self.request(peer, message, timeout, 1, false, cancel).await?;
        replies.pop().ok_or(TransportError::Timeout)
    }

    /// Request expecting up to `expected_replies` replies. With
    /// `return_on_timeout`, a receive timeout yields the partial (possibly
    /// empty) list instead of an error.
    pub async fn send_with_replies(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Option<Duration>,
        expected_replies: usize,
        return_on_timeout: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, TransportError> {
        self.request(
            peer,
            message,
            timeout,
            expected_replies,
            return_on_timeout,
            cancel,
        )
        .await
    }

    /// Fire-and-forget fan-out of one message to a peer set.
    pub async fn broadcast(
        &self,
        peers: Vec<BoundPeer>,
        message: Message,
    ) -> Result<(), TransportError> {
        let broadcast_tx = {
            let guard = self.active.read().expect("active lock poisoned");
            match (self.state(), guard.as_ref()) {
                (TransportState::Disposed, _) => return Err(TransportError::Disposed),
                (TransportState::Running, Some(active)) => active.broadcast_tx.clone(),
                _ => return Err(TransportError::NotRunning),
            }
        };
        broadcast_tx
            .send((peers, message))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Send a reply addressed to the routing identity of an inbound
    /// message (see [`Envelope::identity`]). Resolves when the reply has
    /// been emitted, or dropped after the bounded send budget.
    pub async fn reply(
        &self,
        identity: &[u8],
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let reply_tx = {
            let guard = self.active.read().expect("active lock poisoned");
            match (self.state(), guard.as_ref()) {
                (TransportState::Disposed, _) => return Err(TransportError::Disposed),
                (TransportState::Running, Some(active)) => active.reply_tx.clone(),
                _ => return Err(TransportError::NotRunning),
            }
        };

        let identity_hex = hex::encode(identity);
        let (done_tx, done_rx) = oneshot::channel();
        self.reply_completions
            .lock()
            .expect("completions lock poisoned")
            .insert(identity_hex, done_tx);

        reply_tx
            .send(ReplyCommand {
                identity: identity.to_vec(),
                message,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = done_rx => result.map_err(|_| TransportError::Cancelled),
        }
    }

    /// Shared path of the three request operations: allocate an id, link
    /// cancellation, enqueue, await the completion handle.
    async fn request(
        &self,
        peer: &BoundPeer,
        message: Message,
        timeout: Option<Duration>,
        expected_replies: usize,
        return_on_timeout: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Envelope>, TransportError> {
        let (request_tx, runtime) = {
            let guard = self.active.read().expect("active lock poisoned");
            match (self.state(), guard.as_ref()) {
                (TransportState::Disposed, _) => return Err(TransportError::Disposed),
                (TransportState::Running, Some(active)) => {
                    (active.request_tx.clone(), active.runtime.clone())
                }
                _ => return Err(TransportError::NotRunning),
            }
        };

        let call_token = runtime.child_token();
        let (completion, done) = oneshot::channel();
        let request = MessageRequest {
            id: self.request_ids.fetch_add(1, Ordering::Relaxed),
            message,
            peer: peer.clone(),
            enqueued_at: Instant::now(),
            timeout,
            expected_replies,
            return_on_timeout,
            cancel: call_token.clone(),
            completion,
        };
        request_tx
            .send(request)
            .map_err(|_| TransportError::ChannelClosed)?;

        tokio::select! {
            _ = cancel.cancelled() => {
                call_token.cancel();
                Err(TransportError::Cancelled)
            }
            result = done => result.map_err(|_| TransportError::Cancelled)?,
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().expect("active lock poisoned").take() {
            active.runtime.cancel();
            for task in &active.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransportConfig {
        let keypair = Keypair::generate();
        let version = AppProtocolVersion::sign(&keypair, 1, vec![]);
        let mut config = TransportConfig::new(keypair, version);
        config.host = Some("127.0.0.1".to_string());
        config
    }

    #[tokio::test]
    async fn start_requires_host_or_ice_servers() {
        let mut config = config();
        config.host = None;
        let transport = Transport::new(config);

        let err = transport
            .start(&CancellationToken::new())
            .await
            .expect_err("no host and no ICE servers must fail");
        assert!(matches!(err, TransportError::NoPublicEndpoint));
        assert_eq!(transport.state(), TransportState::New);
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let transport = Transport::new(config());
        let cancel = CancellationToken::new();

        transport.start(&cancel).await.expect("first start");
        let err = transport
            .start(&cancel)
            .await
            .expect_err("second start must fail");
        assert!(matches!(err, TransportError::AlreadyRunning));

        transport
            .stop(Duration::ZERO, &cancel)
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_not_running() {
        let transport = Transport::new(config());
        transport
            .stop(Duration::ZERO, &CancellationToken::new())
            .await
            .expect("stop before start is a no-op");
        assert_eq!(transport.state(), TransportState::New);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_final() {
        let transport = Transport::new(config());
        transport.dispose();
        transport.dispose();
        assert_eq!(transport.state(), TransportState::Disposed);

        let err = transport
            .start(&CancellationToken::new())
            .await
            .expect_err("start after dispose must fail");
        assert!(matches!(err, TransportError::Disposed));
    }

    #[tokio::test]
    async fn operations_require_running_transport() {
        let transport = Transport::new(config());
        let peer = Peer::bound(
            Keypair::generate().identity(),
            crate::identity::HostEndpoint::new("127.0.0.1", 1),
        )
        .try_into_bound()
        .expect("bound");

        let err = transport
            .send(&peer, Message::Ping, &CancellationToken::new())
            .await
            .expect_err("send before start must fail");
        assert!(matches!(err, TransportError::NotRunning));

        let err = transport
            .broadcast(vec![peer], Message::Ping)
            .await
            .expect_err("broadcast before start must fail");
        assert!(matches!(err, TransportError::NotRunning));
    }

    #[tokio::test]
    async fn port_zero_records_bound_port() {
        let transport = Transport::new(config());
        transport
            .start(&CancellationToken::new())
            .await
            .expect("start");

        let addr = transport.local_addr().expect("running transport has addr");
        assert_ne!(addr.port(), 0);

        let peer = transport.as_peer();
        let endpoint = peer.endpoint.expect("host-configured peer is bound");
        assert_eq!(endpoint.port, addr.port());

        transport
            .stop(Duration::ZERO, &CancellationToken::new())
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn wait_for_running_resolves_on_start() {
        let transport = Arc::new(Transport::new(config()));

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.wait_for_running().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport
            .start(&CancellationToken::new())
            .await
            .expect("start");

        waiter
            .await
            .expect("waiter task")
            .expect("wait_for_running resolves");

        transport
            .stop(Duration::ZERO, &CancellationToken::new())
            .await
            .expect("stop");
    }
}
