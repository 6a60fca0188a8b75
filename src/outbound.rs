//! # Outbound Socket Cache and Broadcast Pump
//!
//! Broadcast and fire-and-forget fan-out reuse long-lived outbound sockets
//! from a cache keyed by peer identity. Request/reply traffic never touches
//! this cache; each request opens its own socket (see `requests`).
//!
//! ## Cache policy
//!
//! One mutex guards every mutation. Per target:
//!
//! - no entry: connect to the peer's wire endpoint, store with
//!   `last_use = now`
//! - live entry with an unchanged endpoint: touch `last_use` and reuse
//! - dead or endpoint-changed entry: dispose the old socket, connect fresh
//!
//! A sweeper task wakes every `sweep_period` and disposes entries idle
//! longer than the configured socket lifetime. Send failures evict the
//! target's entry so the next broadcast reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{generate_wire_identity, preamble_group, FrameCodec, FrameGroup, WireContext};
use crate::error::TransportError;
use crate::identity::{BoundPeer, HostEndpoint, Identity};
use crate::messages::Message;

/// Per-peer send timeout for broadcast fan-out, which also bounds the
/// connect when a fresh socket is needed.
pub(crate) const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Default idle lifetime of a cached outbound socket.
pub(crate) const DEFAULT_SOCKET_LIFETIME: Duration = Duration::from_secs(600);

/// Default sweeper wake period.
pub(crate) const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10);

type SharedSink = Arc<Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>>;

struct OutboundEntry {
    sink: SharedSink,
    endpoint: HostEndpoint,
    last_use: Instant,
    drain: JoinHandle<()>,
}

impl Drop for OutboundEntry {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

/// Mapping from peer identity to a reusable outbound socket.
pub(crate) struct OutboundCache {
    entries: Mutex<HashMap<Identity, OutboundEntry>>,
    lifetime: Duration,
}

impl OutboundCache {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lifetime,
        }
    }

    /// Get a live socket for the peer, creating or replacing per the cache
    /// policy. At most one live entry exists per peer; a replacement drops
    /// the old socket.
    pub async fn acquire(&self, peer: &BoundPeer) -> Result<SharedSink, TransportError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&peer.identity()) {
            if entry.endpoint == *peer.endpoint() && !entry.drain.is_finished() {
                entry.last_use = Instant::now();
                return Ok(entry.sink.clone());
            }
            trace!(peer = %peer, "replacing dead or re-homed outbound socket");
            entries.remove(&peer.identity());
        }

        let entry = Self::open(peer).await?;
        let sink = entry.sink.clone();
        entries.insert(peer.identity(), entry);
        debug!(peer = %peer, "opened outbound socket");
        Ok(sink)
    }

    async fn open(peer: &BoundPeer) -> Result<OutboundEntry, TransportError> {
        let endpoint = peer.endpoint().clone();
        let addr = endpoint.resolve().await?;
        let stream = tokio::time::timeout(BROADCAST_SEND_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (read_half, write_half) = stream.into_split();

        // The remote may route replies at this socket; nothing awaits them
        // here, so drain and discard until the peer closes.
        let drain = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec);
            while let Some(item) = frames.next().await {
                if item.is_err() {
                    break;
                }
            }
        });

        let mut sink = FramedWrite::new(write_half, FrameCodec);
        sink.send(preamble_group(&generate_wire_identity())).await?;

        Ok(OutboundEntry {
            sink: Arc::new(Mutex::new(sink)),
            endpoint,
            last_use: Instant::now(),
            drain,
        })
    }

    /// Drop the entry for a peer, if any.
    pub async fn evict(&self, identity: &Identity) {
        if self.entries.lock().await.remove(identity).is_some() {
            trace!(peer = identity.short(), "evicted outbound socket");
        }
    }

    /// Dispose every entry idle longer than the configured lifetime.
    pub async fn sweep(&self) {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.last_use.elapsed() <= self.lifetime);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "swept idle outbound sockets");
        }
    }

    /// Drop every entry. Called during teardown under the same lock as all
    /// other mutations.
    pub async fn dispose_all(&self) {
        self.entries.lock().await.clear();
    }
}

/// Spawn the idle-socket sweeper under the runtime token.
pub(crate) fn spawn_sweeper(
    cache: Arc<OutboundCache>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await; // skip the immediate tick
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticks.tick() => cache.sweep().await,
            }
        }
    })
}

/// Spawn the broadcast pump: dequeue `(peer set, message)` pairs, encode
/// once, fan out to every peer in parallel through the cache.
pub(crate) fn spawn_broadcast_pump(
    mut rx: mpsc::Receiver<(Vec<BoundPeer>, Message)>,
    cache: Arc<OutboundCache>,
    ctx: Arc<WireContext>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = rx.recv() => {
                    let Some((peers, message)) = item else { break };
                    broadcast_one(&cache, &ctx, peers, message).await;
                }
            }
        }
        debug!("broadcast pump stopped");
    })
}

async fn broadcast_one(
    cache: &OutboundCache,
    ctx: &WireContext,
    peers: Vec<BoundPeer>,
    message: Message,
) {
    let frames = match ctx.encode(&message) {
        Ok(frames) => frames,
        Err(error) => {
            warn!(%error, kind = message.kind_name(), "failed to encode broadcast");
            return;
        }
    };

    let local = ctx.local_peer.identity;
    let sends = peers
        .into_iter()
        .filter(|peer| {
            let is_self = peer.identity() == local;
            if is_self {
                trace!("skipping self in broadcast target set");
            }
            !is_self
        })
        .map(|peer| {
            let frames = frames.clone();
            async move {
                let result = tokio::time::timeout(
                    BROADCAST_SEND_TIMEOUT,
                    send_cached(cache, &peer, frames),
                )
                .await;
                match result {
                    Ok(Ok(())) => {
                        trace!(peer = %peer, "broadcast frame sent");
                    }
                    Ok(Err(error)) => {
                        warn!(peer = %peer, %error, "broadcast send failed, evicting socket");
                        cache.evict(&peer.identity()).await;
                    }
                    Err(_) => {
                        warn!(peer = %peer, "broadcast send timed out, evicting socket");
                        cache.evict(&peer.identity()).await;
                    }
                }
            }
        });

    join_all(sends).await;
}

async fn send_cached(
    cache: &OutboundCache,
    peer: &BoundPeer,
    frames: FrameGroup,
) -> Result<(), TransportError> {
    let sink = cache.acquire(peer).await?;
    let mut sink = sink.lock().await;
    sink.send(frames).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn bound_peer(identity: Identity, port: u16) -> BoundPeer {
        crate::identity::Peer::bound(identity, HostEndpoint::new("127.0.0.1", port))
            .try_into_bound()
            .expect("endpoint present")
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    #[tokio::test]
    async fn acquire_reuses_live_socket() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let cache = OutboundCache::new(Duration::from_secs(60));
        let identity = crate::identity::Keypair::generate().identity();
        let peer = bound_peer(identity, port);

        let first = cache.acquire(&peer).await.expect("first connect");
        let second = cache.acquire(&peer).await.expect("reuse");
        assert!(Arc::ptr_eq(&first, &second), "live socket must be reused");
    }

    #[tokio::test]
    async fn endpoint_change_replaces_socket() {
        let (listener_a, port_a) = listener().await;
        let (listener_b, port_b) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener_a.accept().await;
            }
        });
        tokio::spawn(async move {
            loop {
                let _ = listener_b.accept().await;
            }
        });

        let cache = OutboundCache::new(Duration::from_secs(60));
        let identity = crate::identity::Keypair::generate().identity();

        let first = cache.acquire(&bound_peer(identity, port_a)).await.expect("a");
        let second = cache.acquire(&bound_peer(identity, port_b)).await.expect("b");
        assert!(
            !Arc::ptr_eq(&first, &second),
            "endpoint change must open a fresh socket"
        );
    }

    #[tokio::test]
    async fn sweep_evicts_idle_entries_only() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let cache = OutboundCache::new(Duration::from_millis(100));
        let identity = crate::identity::Keypair::generate().identity();
        let peer = bound_peer(identity, port);

        cache.acquire(&peer).await.expect("connect");
        cache.sweep().await;
        assert_eq!(cache.entries.lock().await.len(), 1, "fresh entry survives");

        tokio::time::sleep(Duration::from_millis(300)).await;
        cache.sweep().await;
        assert!(
            cache.entries.lock().await.is_empty(),
            "idle entry must be swept"
        );
    }
}
