//! # Public Endpoint Resolution
//!
//! Resolves the node's advertised public endpoint at startup:
//!
//! - A configured `host` wins outright and is advertised with the listen
//!   port; no ICE traffic happens.
//! - Otherwise each configured ICE server is tried in order. The first
//!   server whose TURN allocation succeeds decides the outcome: when the
//!   STUN-mapped address equals the local address the node is not behind
//!   NAT and advertises `mapped_ip:listen_port`; otherwise it advertises
//!   the TURN relay endpoint. The mapped IP is recorded as the observed
//!   public IP either way.
//! - If neither a host nor any ICE server is usable, startup fails.
//!
//! The client speaks the STUN/TURN subset this contract needs: Binding,
//! Allocate, and Refresh over UDP, with XOR-mapped and XOR-relayed address
//! attributes. Allocation refresh runs as a background task under its own
//! cancellation token at half the granted lifetime.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::identity::HostEndpoint;

// ============================================================================
// Constants
// ============================================================================

/// STUN magic cookie, fixed by the protocol.
const MAGIC_COOKIE: u32 = 0x2112_A442;

const METHOD_BINDING: u16 = 0x0001;
const METHOD_ALLOCATE: u16 = 0x0003;
const METHOD_REFRESH: u16 = 0x0004;

const CLASS_SUCCESS: u16 = 0x0100;
const CLASS_ERROR: u16 = 0x0110;

const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000d;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// UDP transport protocol number carried in REQUESTED-TRANSPORT.
const TRANSPORT_UDP: u8 = 17;

/// Timeout for one request/response exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Retransmissions before a server is declared unusable.
const REQUEST_RETRIES: usize = 3;

/// Lifetime requested for new allocations.
const REQUESTED_LIFETIME: Duration = Duration::from_secs(600);

// ============================================================================
// Configuration
// ============================================================================

/// One ICE (TURN/STUN) server candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub host: String,
    pub port: u16,
}

impl IceServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for IceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// STUN message codec
// ============================================================================

struct StunMessage {
    message_type: u16,
    transaction_id: [u8; 12],
    attributes: Vec<(u16, Vec<u8>)>,
}

impl StunMessage {
    fn request(method: u16) -> Self {
        Self {
            message_type: method,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    fn with_attribute(mut self, attr_type: u16, value: Vec<u8>) -> Self {
        self.attributes.push((attr_type, value));
        self
    }

    fn is_success_for(&self, method: u16) -> bool {
        self.message_type == method | CLASS_SUCCESS
    }

    fn is_error_for(&self, method: u16) -> bool {
        self.message_type == method | CLASS_ERROR
    }

    fn encode(&self) -> Vec<u8> {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|(_, v)| 4 + padded(v.len()))
            .sum();

        let mut buf = Vec::with_capacity(20 + body_len);
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);
        for (attr_type, value) in &self.attributes {
            buf.extend_from_slice(&attr_type.to_be_bytes());
            buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
            buf.extend_from_slice(value);
            buf.resize(buf.len() + padded(value.len()) - value.len(), 0);
        }
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 20 {
            return None;
        }
        let message_type = u16::from_be_bytes([buf[0], buf[1]]);
        let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE || buf.len() < 20 + body_len {
            return None;
        }
        let transaction_id: [u8; 12] = buf[8..20].try_into().ok()?;

        let mut attributes = Vec::new();
        let mut offset = 20;
        let end = 20 + body_len;
        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_len > end {
                return None;
            }
            attributes.push((attr_type, buf[offset..offset + attr_len].to_vec()));
            offset += padded(attr_len);
        }

        Some(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    fn attribute(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }

    /// Decode an XOR-encoded address attribute.
    fn xor_address(&self, attr_type: u16) -> Option<SocketAddr> {
        let value = self.attribute(attr_type)?;
        if value.len() < 8 {
            return None;
        }
        let family = value[1];
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        match family {
            0x01 => {
                let raw: [u8; 4] = value[4..8].try_into().ok()?;
                let ip = u32::from_be_bytes(raw) ^ MAGIC_COOKIE;
                Some(SocketAddr::new(IpAddr::V4(ip.to_be_bytes().into()), port))
            }
            0x02 if value.len() >= 20 => {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(&self.transaction_id);
                let mut octets = [0u8; 16];
                for (i, octet) in octets.iter_mut().enumerate() {
                    *octet = value[4 + i] ^ key[i];
                }
                Some(SocketAddr::new(IpAddr::V6(octets.into()), port))
            }
            _ => None,
        }
    }

    fn error_code(&self) -> Option<(u16, String)> {
        let value = self.attribute(ATTR_ERROR_CODE)?;
        if value.len() < 4 {
            return None;
        }
        let code = (value[2] & 0x07) as u16 * 100 + value[3] as u16;
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Some((code, reason))
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

// ============================================================================
// ICE client
// ============================================================================

/// A live TURN allocation.
#[derive(Clone, Debug)]
pub struct Allocation {
    /// The server-reflexive (STUN mapped) address of this node.
    pub mapped: SocketAddr,
    /// The relay endpoint allocated on the TURN server.
    pub relayed: SocketAddr,
    /// Granted allocation lifetime.
    pub lifetime: Duration,
}

/// UDP client for one ICE server, speaking the Binding/Allocate/Refresh
/// subset of STUN/TURN.
pub struct IceClient {
    socket: UdpSocket,
    server_name: String,
}

impl IceClient {
    /// Resolve the server and bind a local UDP socket for the exchange.
    pub async fn connect(server: &IceServer) -> Result<Self, TransportError> {
        let addr = lookup_host((server.host.as_str(), server.port))
            .await?
            .next()
            .ok_or_else(|| ice_error(server, "server name did not resolve"))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        debug!(server = %addr, "ICE client socket bound");
        Ok(Self {
            socket,
            server_name: server.to_string(),
        })
    }

    /// The local address of the client socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// STUN Binding: learn this node's server-reflexive address.
    pub async fn binding(&self) -> Result<SocketAddr, TransportError> {
        let response = self.exchange(StunMessage::request(METHOD_BINDING)).await?;
        response
            .xor_address(ATTR_XOR_MAPPED_ADDRESS)
            .ok_or_else(|| self.protocol_error("binding response lacks XOR-MAPPED-ADDRESS"))
    }

    /// TURN Allocate: create a relay allocation for this node.
    pub async fn allocate(&self) -> Result<Allocation, TransportError> {
        let request = StunMessage::request(METHOD_ALLOCATE)
            .with_attribute(ATTR_REQUESTED_TRANSPORT, vec![TRANSPORT_UDP, 0, 0, 0])
            .with_attribute(
                ATTR_LIFETIME,
                (REQUESTED_LIFETIME.as_secs() as u32).to_be_bytes().to_vec(),
            );
        let response = self.exchange(request).await?;

        let mapped = response
            .xor_address(ATTR_XOR_MAPPED_ADDRESS)
            .ok_or_else(|| self.protocol_error("allocate response lacks XOR-MAPPED-ADDRESS"))?;
        let relayed = response
            .xor_address(ATTR_XOR_RELAYED_ADDRESS)
            .ok_or_else(|| self.protocol_error("allocate response lacks XOR-RELAYED-ADDRESS"))?;
        let lifetime = response
            .attribute(ATTR_LIFETIME)
            .and_then(|v| v.try_into().ok().map(u32::from_be_bytes))
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(REQUESTED_LIFETIME);

        debug!(
            server = %self.server_name,
            %mapped,
            %relayed,
            lifetime_secs = lifetime.as_secs(),
            "TURN allocation established"
        );
        Ok(Allocation {
            mapped,
            relayed,
            lifetime,
        })
    }

    /// TURN Refresh: extend the allocation. Returns the granted lifetime.
    pub async fn refresh(&self, lifetime: Duration) -> Result<Duration, TransportError> {
        let request = StunMessage::request(METHOD_REFRESH).with_attribute(
            ATTR_LIFETIME,
            (lifetime.as_secs() as u32).to_be_bytes().to_vec(),
        );
        let response = self.exchange(request).await?;
        Ok(response
            .attribute(ATTR_LIFETIME)
            .and_then(|v| v.try_into().ok().map(u32::from_be_bytes))
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(lifetime))
    }

    /// Send a request and wait for the matching response, retransmitting on
    /// timeout. Responses with a foreign transaction id are discarded.
    async fn exchange(&self, request: StunMessage) -> Result<StunMessage, TransportError> {
        let method = request.message_type;
        let encoded = request.encode();
        let mut buf = vec![0u8; 1500];

        for attempt in 0..REQUEST_RETRIES {
            self.socket.send(&encoded).await?;

            let received =
                match tokio::time::timeout(REQUEST_TIMEOUT, self.socket.recv(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        debug!(
                            server = %self.server_name,
                            attempt,
                            "ICE request timed out, retransmitting"
                        );
                        continue;
                    }
                };

            let Some(response) = StunMessage::decode(&buf[..received]) else {
                continue;
            };
            if response.transaction_id != request.transaction_id {
                continue;
            }
            if response.is_error_for(method) {
                let (code, reason) = response
                    .error_code()
                    .unwrap_or((0, "unknown error".to_string()));
                return Err(self.protocol_error(&format!("server rejected request: {code} {reason}")));
            }
            if response.is_success_for(method) {
                return Ok(response);
            }
        }

        Err(TransportError::Timeout)
    }

    fn protocol_error(&self, detail: &str) -> TransportError {
        TransportError::Io(io::Error::other(format!(
            "ICE server {}: {detail}",
            self.server_name
        )))
    }
}

fn ice_error(server: &IceServer, detail: &str) -> TransportError {
    TransportError::Io(io::Error::other(format!("ICE server {server}: {detail}")))
}

// ============================================================================
// Resolution
// ============================================================================

/// The outcome of public endpoint resolution at startup.
pub(crate) struct NatOutcome {
    /// The endpoint to advertise, when one is usable.
    pub endpoint: Option<HostEndpoint>,
    /// The public IP observed via STUN, when ICE ran.
    pub public_ip: Option<IpAddr>,
    /// The live client and allocation, kept for the refresh task.
    pub ice: Option<(IceClient, Allocation)>,
}

/// Resolve the advertised endpoint per the startup contract. See the module
/// docs for the decision order.
pub(crate) async fn resolve_public_endpoint(
    host: Option<&str>,
    ice_servers: &[IceServer],
    listen_port: u16,
) -> Result<NatOutcome, TransportError> {
    if let Some(host) = host {
        info!(host, listen_port, "advertising configured host");
        return Ok(NatOutcome {
            endpoint: Some(HostEndpoint::new(host, listen_port)),
            public_ip: None,
            ice: None,
        });
    }

    for server in ice_servers {
        let client = match IceClient::connect(server).await {
            Ok(client) => client,
            Err(error) => {
                warn!(server = %server, %error, "ICE server unreachable, trying next");
                continue;
            }
        };
        let allocation = match client.allocate().await {
            Ok(allocation) => allocation,
            Err(error) => {
                warn!(server = %server, %error, "TURN allocation failed, trying next");
                continue;
            }
        };

        let public_ip = allocation.mapped.ip();
        let behind_nat = local_ip().map_or(true, |local| local != public_ip);
        let endpoint = if behind_nat {
            info!(relay = %allocation.relayed, %public_ip, "behind NAT, advertising relay endpoint");
            HostEndpoint::from(allocation.relayed)
        } else {
            info!(%public_ip, listen_port, "not behind NAT, advertising public address");
            HostEndpoint::new(public_ip.to_string(), listen_port)
        };

        return Ok(NatOutcome {
            endpoint: Some(endpoint),
            public_ip: Some(public_ip),
            ice: Some((client, allocation)),
        });
    }

    Err(TransportError::NoPublicEndpoint)
}

/// Spawn the allocation refresh loop under the TURN cancellation token.
/// Refreshes at half the granted lifetime; a failed refresh keeps the
/// previous cadence and is retried next period.
pub(crate) fn spawn_refresh_task(
    client: IceClient,
    allocation: Allocation,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lifetime = allocation.lifetime;
        loop {
            let period = lifetime / 2;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    match client.refresh(lifetime).await {
                        Ok(granted) => {
                            debug!(granted_secs = granted.as_secs(), "TURN allocation refreshed");
                            lifetime = granted;
                        }
                        Err(error) => {
                            warn!(%error, "TURN refresh failed");
                        }
                    }
                }
            }
        }
    })
}

/// Best-effort local IP discovery: route lookup via a connected UDP socket,
/// no packets are sent.
fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip())
}
