//! # Transport Error Taxonomy
//!
//! Every failure a caller can observe maps to one [`TransportError`] variant.
//! Request-path failures (codec, I/O, timeout) propagate to the completion
//! handle of the request that hit them; router and broadcast failures are
//! logged and isolated so the background loops keep running.

use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::version::AppProtocolVersion;

/// Errors produced by the transport and surfaced through its public API.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote protocol version failed validation. Carries the routing
    /// identity of the offending message (when received through the
    /// listening socket) plus both versions.
    #[error("remote app protocol version {} is incompatible with local {}", remote.version, local.version)]
    DifferentAppProtocolVersion {
        identity: Option<Vec<u8>>,
        local: AppProtocolVersion,
        remote: AppProtocolVersion,
    },

    /// The message timestamp is outside the configured lifespan window.
    #[error("message timestamp {timestamp} outside lifespan {lifespan:?}")]
    InvalidTimestamp {
        timestamp: DateTime<Utc>,
        lifespan: Duration,
    },

    /// Framing, type dispatch, or signature verification failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A send or receive exceeded the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// The caller token or the transport runtime token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// `start` was called while the transport is already running.
    #[error("transport is already running")]
    AlreadyRunning,

    /// An operation that requires a running transport was called before
    /// `start` or after `stop`.
    #[error("transport is not running")]
    NotRunning,

    /// The transport has been disposed.
    #[error("transport is disposed")]
    Disposed,

    /// Neither a configured host nor any ICE server yielded a usable
    /// public endpoint.
    #[error("no public endpoint: no host configured and no ICE server usable")]
    NoPublicEndpoint,

    /// Binding the listening socket failed.
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),

    /// Socket I/O failed outside the bind path.
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    /// An internal queue was closed while the operation was in flight,
    /// which happens when the transport is torn down concurrently.
    #[error("transport channel closed")]
    ChannelClosed,
}

impl TransportError {
    /// Short tag used in log fields.
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            TransportError::DifferentAppProtocolVersion { .. } => "different_version",
            TransportError::InvalidTimestamp { .. } => "invalid_timestamp",
            TransportError::InvalidMessage(_) => "invalid_message",
            TransportError::Timeout => "timeout",
            TransportError::Cancelled => "cancelled",
            TransportError::AlreadyRunning => "already_running",
            TransportError::NotRunning => "not_running",
            TransportError::Disposed => "disposed",
            TransportError::NoPublicEndpoint => "no_public_endpoint",
            TransportError::Bind(_) => "bind",
            TransportError::Io(_) => "io",
            TransportError::ChannelClosed => "channel_closed",
        }
    }
}
