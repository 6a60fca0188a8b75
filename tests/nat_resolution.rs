//! Integration tests for public endpoint resolution.
//!
//! An in-process UDP server speaks the STUN/TURN subset the transport
//! consumes (Binding, Allocate, Refresh), hand-rolling the wire format so
//! the client is tested against the protocol rather than against itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use blockwire::{
    AppProtocolVersion, CancellationToken, IceClient, IceServer, Keypair, Transport,
    TransportConfig, TransportError,
};
use tokio::net::UdpSocket;

const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ALLOCATE_REQUEST: u16 = 0x0003;
const ALLOCATE_SUCCESS: u16 = 0x0103;
const ALLOCATE_ERROR: u16 = 0x0113;
const REFRESH_REQUEST: u16 = 0x0004;
const REFRESH_SUCCESS: u16 = 0x0104;

const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_LIFETIME: u16 = 0x000d;
const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

// ============================================================================
// Mock ICE server
// ============================================================================

#[derive(Clone, Copy, PartialEq)]
enum MockBehavior {
    /// Answer Binding/Allocate/Refresh normally.
    Accept,
    /// Reject Allocate with a 401.
    RejectAllocations,
}

struct MockIce {
    server: IceServer,
    relayed: SocketAddr,
}

/// Spawn a mock server; its relay endpoint is derived from the bound port
/// so concurrent tests never collide.
async fn spawn_mock_ice(behavior: MockBehavior) -> MockIce {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock");
    let addr = socket.local_addr().expect("mock addr");
    let relayed: SocketAddr = format!("127.0.0.1:{}", addr.port().wrapping_add(1000).max(1024))
        .parse()
        .expect("relay addr");

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((received, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            if received < 20 {
                continue;
            }
            let message_type = u16::from_be_bytes([buf[0], buf[1]]);
            let transaction: [u8; 12] = buf[8..20].try_into().expect("transaction id");

            let response = match message_type {
                BINDING_REQUEST => stun_message(
                    BINDING_SUCCESS,
                    transaction,
                    &[(ATTR_XOR_MAPPED_ADDRESS, xor_v4(from))],
                ),
                ALLOCATE_REQUEST if behavior == MockBehavior::RejectAllocations => stun_message(
                    ALLOCATE_ERROR,
                    transaction,
                    &[(ATTR_ERROR_CODE, error_code(4, 1, "Unauthorized"))],
                ),
                ALLOCATE_REQUEST => stun_message(
                    ALLOCATE_SUCCESS,
                    transaction,
                    &[
                        (ATTR_XOR_MAPPED_ADDRESS, xor_v4(from)),
                        (ATTR_XOR_RELAYED_ADDRESS, xor_v4(relayed)),
                        (ATTR_LIFETIME, 600u32.to_be_bytes().to_vec()),
                    ],
                ),
                REFRESH_REQUEST => stun_message(
                    REFRESH_SUCCESS,
                    transaction,
                    &[(ATTR_LIFETIME, 600u32.to_be_bytes().to_vec())],
                ),
                _ => continue,
            };
            let _ = socket.send_to(&response, from).await;
        }
    });

    MockIce {
        server: IceServer::new("127.0.0.1", addr.port()),
        relayed,
    }
}

fn stun_message(message_type: u16, transaction: [u8; 12], attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let body_len: usize = attrs.iter().map(|(_, v)| 4 + ((v.len() + 3) & !3)).sum();
    let mut buf = Vec::with_capacity(20 + body_len);
    buf.extend_from_slice(&message_type.to_be_bytes());
    buf.extend_from_slice(&(body_len as u16).to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(&transaction);
    for (attr_type, value) in attrs {
        buf.extend_from_slice(&attr_type.to_be_bytes());
        buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        buf.extend_from_slice(value);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }
    buf
}

fn xor_v4(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("mock serves v4 only")
    };
    let mut value = vec![0u8, 0x01];
    value.extend_from_slice(&(v4.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    let xored = u32::from_be_bytes(v4.ip().octets()) ^ MAGIC_COOKIE;
    value.extend_from_slice(&xored.to_be_bytes());
    value
}

fn error_code(class: u8, number: u8, reason: &str) -> Vec<u8> {
    let mut value = vec![0, 0, class, number];
    value.extend_from_slice(reason.as_bytes());
    value
}

// ============================================================================
// ICE client
// ============================================================================

#[tokio::test]
async fn binding_reports_observed_address() {
    let mock = spawn_mock_ice(MockBehavior::Accept).await;
    let client = IceClient::connect(&mock.server).await.expect("connect");

    let mapped = client.binding().await.expect("binding");
    assert_eq!(
        mapped.port(),
        client.local_addr().expect("local").port(),
        "the mock reflects the client's own source address"
    );
    assert!(mapped.ip().is_loopback());
}

#[tokio::test]
async fn allocate_returns_mapped_and_relayed_endpoints() {
    let mock = spawn_mock_ice(MockBehavior::Accept).await;
    let client = IceClient::connect(&mock.server).await.expect("connect");

    let allocation = client.allocate().await.expect("allocate");
    assert_eq!(allocation.relayed, mock.relayed);
    assert_eq!(allocation.lifetime, Duration::from_secs(600));
    assert_eq!(
        allocation.mapped.port(),
        client.local_addr().expect("local").port()
    );

    let granted = client
        .refresh(allocation.lifetime)
        .await
        .expect("refresh extends the allocation");
    assert_eq!(granted, Duration::from_secs(600));
}

#[tokio::test]
async fn rejected_allocation_is_an_error() {
    let mock = spawn_mock_ice(MockBehavior::RejectAllocations).await;
    let client = IceClient::connect(&mock.server).await.expect("connect");

    let err = client.allocate().await.expect_err("401 must fail");
    assert!(matches!(err, TransportError::Io(_)));
}

// ============================================================================
// Transport startup resolution
// ============================================================================

fn ice_config(servers: Vec<IceServer>) -> TransportConfig {
    let keypair = Keypair::generate();
    let version = AppProtocolVersion::sign(&keypair, 1, vec![]);
    let mut config = TransportConfig::new(keypair, version);
    config.ice_servers = servers;
    config
}

#[tokio::test]
async fn transport_advertises_relay_endpoint_when_behind_nat() {
    let mock = spawn_mock_ice(MockBehavior::Accept).await;
    let transport = Arc::new(Transport::new(ice_config(vec![mock.server.clone()])));

    transport
        .start(&CancellationToken::new())
        .await
        .expect("start via ICE");

    let peer = transport.as_peer();
    let endpoint = peer.endpoint.expect("relay endpoint advertised");
    assert_eq!(endpoint.host, mock.relayed.ip().to_string());
    assert_eq!(endpoint.port, mock.relayed.port());
    assert_eq!(peer.public_ip, Some(mock.relayed.ip()));

    transport
        .stop(Duration::ZERO, &CancellationToken::new())
        .await
        .expect("stop");
}

#[tokio::test]
async fn first_usable_ice_server_wins() {
    let rejecting = spawn_mock_ice(MockBehavior::RejectAllocations).await;
    let accepting = spawn_mock_ice(MockBehavior::Accept).await;
    let transport = Arc::new(Transport::new(ice_config(vec![
        rejecting.server.clone(),
        accepting.server.clone(),
    ])));

    transport
        .start(&CancellationToken::new())
        .await
        .expect("second server must be used after the first rejects");

    let endpoint = transport.as_peer().endpoint.expect("endpoint");
    assert_eq!(endpoint.port, accepting.relayed.port());

    transport
        .stop(Duration::ZERO, &CancellationToken::new())
        .await
        .expect("stop");
}

#[tokio::test]
async fn start_fails_when_no_ice_server_is_usable() {
    let rejecting = spawn_mock_ice(MockBehavior::RejectAllocations).await;
    let transport = Transport::new(ice_config(vec![rejecting.server.clone()]));

    let err = transport
        .start(&CancellationToken::new())
        .await
        .expect_err("a rejecting pool yields no endpoint");
    assert!(matches!(err, TransportError::NoPublicEndpoint));
}
