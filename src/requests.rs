//! # Request Queue and Workers
//!
//! Outbound request/reply machinery. Public calls enqueue a
//! [`MessageRequest`] on an unbounded FIFO; N workers consume it, each
//! processing one request at a time:
//!
//! 1. open a fresh ephemeral socket to the target peer
//! 2. announce a fresh routing identity and send the encoded message, with
//!    the request timeout applied to the whole send phase
//! 3. receive the expected number of replies, the timeout applied to each
//!    receive independently
//! 4. complete the request's oneshot exactly once: replies, a typed error,
//!    or cancellation
//!
//! The dedicated socket per request keeps concurrent requests to the same
//! peer from interleaving replies. Cancellation (caller token or transport
//! teardown) drops the in-flight socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{Future, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::{
    generate_wire_identity, preamble_group, FrameCodec, LastMessage, WireContext,
};
use crate::error::TransportError;
use crate::identity::BoundPeer;
use crate::messages::{Envelope, Message};

/// Wire timeout for fire-and-forget sends.
pub(crate) const FIRE_AND_FORGET_TIMEOUT: Duration = Duration::from_secs(3);

/// Default worker count.
pub(crate) const DEFAULT_WORKERS: usize = 5;

/// An outbound request descriptor consumed by the worker pool.
pub(crate) struct MessageRequest {
    pub id: u64,
    pub message: Message,
    pub peer: BoundPeer,
    pub enqueued_at: Instant,
    pub timeout: Option<Duration>,
    pub expected_replies: usize,
    pub return_on_timeout: bool,
    /// Linked caller + runtime cancellation for this call.
    pub cancel: CancellationToken,
    pub completion: oneshot::Sender<Result<Vec<Envelope>, TransportError>>,
}

pub(crate) type RequestReceiver = Arc<Mutex<mpsc::UnboundedReceiver<MessageRequest>>>;

/// Spawn `count` workers consuming the shared request channel. Workers have
/// no priority among themselves; the channel is FIFO.
pub(crate) fn spawn_workers(
    count: usize,
    rx: RequestReceiver,
    ctx: Arc<WireContext>,
    last_message: LastMessage,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let last_message = last_message.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            _ = token.cancelled() => None,
                            request = guard.recv() => request,
                        }
                    };
                    let Some(request) = request else { break };
                    trace!(
                        worker,
                        id = request.id,
                        peer = %request.peer,
                        kind = request.message.kind_name(),
                        "processing request"
                    );
                    process_request(request, &ctx, &last_message).await;
                }
                debug!(worker, "request worker stopped");
            })
        })
        .collect()
}

/// Run one request to completion. The completion handle fires exactly once;
/// cancellation mid-flight drops the socket and completes `Cancelled`.
async fn process_request(request: MessageRequest, ctx: &WireContext, last_message: &LastMessage) {
    let MessageRequest {
        id,
        message,
        peer,
        enqueued_at,
        timeout,
        expected_replies,
        return_on_timeout,
        cancel,
        completion,
    } = request;

    let work = perform(
        &message,
        &peer,
        timeout,
        expected_replies,
        return_on_timeout,
        ctx,
        last_message,
    );

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = work => result,
    };

    trace!(
        id,
        elapsed_ms = enqueued_at.elapsed().as_millis() as u64,
        outcome = match &result {
            Ok(replies) => format!("{} replies", replies.len()),
            Err(error) => error.tag().to_string(),
        },
        "request completed"
    );
    let _ = completion.send(result);
}

async fn perform(
    message: &Message,
    peer: &BoundPeer,
    timeout: Option<Duration>,
    expected_replies: usize,
    return_on_timeout: bool,
    ctx: &WireContext,
    last_message: &LastMessage,
) -> Result<Vec<Envelope>, TransportError> {
    let encoded = ctx.encode(message)?;

    // Send phase: connect, announce identity, emit the message.
    let mut framed = maybe_timeout(timeout, async {
        let addr = peer.endpoint().resolve().await?;
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, FrameCodec);
        framed.send(preamble_group(&generate_wire_identity())).await?;
        framed.send(encoded).await?;
        Ok::<_, TransportError>(framed)
    })
    .await??;

    let mut replies = Vec::with_capacity(expected_replies);
    for _ in 0..expected_replies {
        let group = match maybe_timeout(timeout, framed.next()).await {
            Err(TransportError::Timeout) if return_on_timeout => {
                debug!(
                    collected = replies.len(),
                    expected = expected_replies,
                    "receive timed out, returning partial replies"
                );
                return Ok(replies);
            }
            Err(timed_out) => return Err(timed_out),
            Ok(None) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the request socket",
                )))
            }
            Ok(Some(Err(io_error))) => return Err(TransportError::Io(io_error)),
            Ok(Some(Ok(group))) => group,
        };

        let envelope = ctx.decode(&group, false)?;
        if let Ok(mut guard) = last_message.write() {
            *guard = Some(Utc::now());
        }
        replies.push(envelope);
    }
    Ok(replies)
}

/// Apply the request timeout to one suspension point, or await freely when
/// no timeout is configured.
async fn maybe_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout),
        None => Ok(fut.await),
    }
}
