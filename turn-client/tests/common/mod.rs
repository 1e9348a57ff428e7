#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stun_rs::attributes::stun::{
    ErrorCode, MessageIntegrity, Nonce, Realm, UserName, XorMappedAddress,
};
use stun_rs::attributes::turn::{Data, LifeTime, XorPeerAddress, XorRelayedAddress};
use stun_rs::methods::{ALLOCATE, BINDING, CHANNEL_BIND, CREATE_PERMMISSION, DATA, REFRESH, SEND};
use stun_rs::{
    Algorithm, AlgorithmId, DecoderContextBuilder, HMACKey, MessageClass, MessageDecoder,
    MessageDecoderBuilder, MessageEncoderBuilder, MessageMethod, StunAttribute, StunMessage,
    StunMessageBuilder, TransactionId,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use turn_client::{Client, ClientBuilder, StunTcpTransport, Transport};

pub const USERNAME: &str = "test-username";
pub const PASSWORD: &str = "test-password";
pub const REALM: &str = "test-realm";
pub const NONCE: &str = "test-nonce";
const CAPACITY: usize = 65536;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("Failed to parse address")
}

/// Client bound to the loopback interface and already listening.
pub async fn start_client(builder: ClientBuilder) -> Client {
    let client = Client::bind("127.0.0.1:0", builder)
        .await
        .expect("Failed to create client");
    client.listen().expect("Failed to listen");
    client
}

pub fn turn_builder(server: &TestServer) -> ClientBuilder {
    ClientBuilder::default()
        .with_turn_server(server.addr())
        .with_credentials(USERNAME, PASSWORD)
}

/// Polls `condition` for up to a second.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Behaviour of the [`TestServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Require long-term credentials on TURN requests.
    pub authenticate: bool,
    /// Number of CreatePermission requests answered with 438 before one is
    /// accepted. The nonce changes on every rejection.
    pub stale_nonces: usize,
    /// When false, requests are counted but never answered.
    pub respond: bool,
    pub lifetime: u32,
    pub relayed_addr: SocketAddr,
    /// Number of CreatePermission requests answered with 403 before they
    /// are accepted again.
    pub rejected_permissions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            authenticate: true,
            stale_nonces: 0,
            respond: true,
            lifetime: 600,
            relayed_addr: addr("192.0.2.15:50000"),
            rejected_permissions: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub binding: AtomicUsize,
    pub allocate: AtomicUsize,
    pub refresh: AtomicUsize,
    pub create_permission: AtomicUsize,
    pub channel_bind: AtomicUsize,
    pub send: AtomicUsize,
    pub channel_data: AtomicUsize,
}

/// Current value of one of the [`ServerStats`] counters.
pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Debug)]
struct Session {
    config: ServerConfig,
    nonce: String,
    rotations: usize,
    last_lifetime: Option<u32>,
}

#[derive(Debug)]
struct ServerState {
    session: Mutex<Session>,
    stats: ServerStats,
}

/// STUN/TURN responder on the loopback interface, scripted by a
/// [`ServerConfig`].
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn udp(config: ServerConfig) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind server socket");
        let addr = socket.local_addr().expect("Failed to get server address");
        let state = new_state(config);

        let server = state.clone();
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; CAPACITY];
            while let Ok((size, from)) = socket.recv_from(&mut buffer).await {
                for response in handle(&server, &buffer[..size], from) {
                    let _ = socket.send_to(&response, from).await;
                }
            }
        });

        Self { addr, state, task }
    }

    /// Serves a single TCP control connection.
    pub async fn tcp(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind server listener");
        let addr = listener.local_addr().expect("Failed to get server address");
        let state = new_state(config);

        let server = state.clone();
        let task = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let connection =
                StunTcpTransport::from_stream(stream).expect("Failed to frame connection");
            let mut buffer = vec![0u8; CAPACITY];
            while let Ok((size, from)) = connection.recv(&mut buffer).await {
                for response in handle(&server, &buffer[..size], from) {
                    if connection.send(&response, from).await.is_err() {
                        return;
                    }
                }
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> &ServerStats {
        &self.state.stats
    }

    pub fn set_config(&self, config: ServerConfig) {
        self.state.session.lock().expect("Poisoned").config = config;
    }

    pub fn nonce_rotations(&self) -> usize {
        self.state.session.lock().expect("Poisoned").rotations
    }

    /// LIFETIME of the last Refresh request received.
    pub fn last_refresh_lifetime(&self) -> Option<u32> {
        self.state.session.lock().expect("Poisoned").last_lifetime
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn new_state(config: ServerConfig) -> Arc<ServerState> {
    Arc::new(ServerState {
        session: Mutex::new(Session {
            config,
            nonce: NONCE.to_string(),
            rotations: 0,
            last_lifetime: None,
        }),
        stats: ServerStats::default(),
    })
}

pub fn long_term_key() -> HMACKey {
    HMACKey::new_long_term(
        USERNAME,
        REALM,
        PASSWORD,
        Algorithm::from(AlgorithmId::MD5),
    )
    .expect("Failed to create HMACKey")
}

fn create_decoder(key: Option<HMACKey>) -> MessageDecoder {
    let mut builder = DecoderContextBuilder::default();
    if let Some(key) = key {
        builder = builder.with_key(key).with_validation();
    }
    let ctx = builder.build();
    MessageDecoderBuilder::default().with_context(ctx).build()
}

fn encode(msg: &StunMessage) -> Vec<u8> {
    let mut buffer = vec![0u8; CAPACITY];
    let size = MessageEncoderBuilder::default()
        .build()
        .encode(&mut buffer, msg)
        .expect("Failed to encode message");
    buffer.truncate(size);
    buffer
}

fn create_message(
    method: MessageMethod,
    class: MessageClass,
    transaction_id: TransactionId,
    attributes: Vec<StunAttribute>,
) -> StunMessage {
    attributes
        .into_iter()
        .fold(
            StunMessageBuilder::new(method, class).with_transaction_id(transaction_id),
            |builder, attr| builder.with_attribute(attr),
        )
        .build()
}

fn success(msg: &StunMessage, attributes: Vec<StunAttribute>) -> Vec<u8> {
    encode(&create_message(
        msg.method(),
        MessageClass::SuccessResponse,
        *msg.transaction_id(),
        attributes,
    ))
}

fn error(msg: &StunMessage, code: u16, reason: &str, nonce: Option<&str>) -> Vec<u8> {
    let error = stun_rs::ErrorCode::new(code, reason).expect("Failed to create error code");
    let mut attributes: Vec<StunAttribute> = vec![ErrorCode::from(error).into()];
    if let Some(nonce) = nonce {
        attributes.push(Realm::new(REALM).expect("Failed to create Realm").into());
        attributes.push(Nonce::new(nonce).expect("Failed to create Nonce").into());
    }
    encode(&create_message(
        msg.method(),
        MessageClass::ErrorResponse,
        *msg.transaction_id(),
        attributes,
    ))
}

fn request_nonce(msg: &StunMessage) -> Option<String> {
    msg.get::<Nonce>()
        .and_then(|attr| attr.as_nonce().ok())
        .map(|nonce| nonce.as_str().to_string())
}

// Returns the error response to send when `msg` is not correctly
// authenticated.
fn check_credentials(session: &Session, msg: &StunMessage) -> Option<Vec<u8>> {
    if !session.config.authenticate {
        return None;
    }
    let signed = msg.get::<MessageIntegrity>().is_some()
        && msg
            .get::<UserName>()
            .and_then(|attr| attr.as_user_name().ok())
            .is_some_and(|user_name| user_name.as_str() == USERNAME);
    if !signed {
        return Some(error(msg, 401, "Unauthenticated", Some(&session.nonce)));
    }
    if request_nonce(msg).as_deref() != Some(session.nonce.as_str()) {
        return Some(error(msg, 438, "Stale Nonce", Some(&session.nonce)));
    }
    None
}

fn counter(stats: &ServerStats, method: MessageMethod) -> Option<&AtomicUsize> {
    if method == BINDING {
        Some(&stats.binding)
    } else if method == ALLOCATE {
        Some(&stats.allocate)
    } else if method == REFRESH {
        Some(&stats.refresh)
    } else if method == CREATE_PERMMISSION {
        Some(&stats.create_permission)
    } else if method == CHANNEL_BIND {
        Some(&stats.channel_bind)
    } else if method == SEND {
        Some(&stats.send)
    } else {
        None
    }
}

fn handle(state: &ServerState, buffer: &[u8], from: SocketAddr) -> Vec<Vec<u8>> {
    // ChannelData is echoed back on the same channel
    if buffer.len() >= 4 && buffer[0] & 0xC0 == 0x40 {
        state.stats.channel_data.fetch_add(1, Ordering::SeqCst);
        return vec![buffer.to_vec()];
    }

    let decoder = create_decoder(Some(long_term_key()));
    let Ok((msg, _)) = decoder.decode(buffer) else {
        return Vec::new();
    };
    if let Some(counter) = counter(&state.stats, msg.method()) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    let mut session = state.session.lock().expect("Poisoned");
    if !session.config.respond {
        return Vec::new();
    }

    let method = msg.method();
    match msg.class() {
        MessageClass::Indication if method == SEND => send_indication(&msg).into_iter().collect(),
        MessageClass::Request if method == BINDING => {
            vec![success(&msg, vec![XorMappedAddress::from(from).into()])]
        }
        MessageClass::Request => {
            if let Some(response) = check_credentials(&session, &msg) {
                return vec![response];
            }
            vec![turn_request(&mut session, &msg, from)]
        }
        _ => Vec::new(),
    }
}

fn turn_request(session: &mut Session, msg: &StunMessage, from: SocketAddr) -> Vec<u8> {
    let method = msg.method();
    if method == ALLOCATE {
        success(
            msg,
            vec![
                XorRelayedAddress::from(session.config.relayed_addr).into(),
                XorMappedAddress::from(from).into(),
                LifeTime::new(session.config.lifetime).into(),
            ],
        )
    } else if method == REFRESH {
        let requested = msg
            .get::<LifeTime>()
            .and_then(|attr| attr.as_life_time().ok())
            .map(|lifetime| lifetime.as_u32())
            .unwrap_or(session.config.lifetime);
        session.last_lifetime = Some(requested);
        let granted = requested.min(session.config.lifetime);
        success(msg, vec![LifeTime::new(granted).into()])
    } else if method == CREATE_PERMMISSION {
        if session.config.rejected_permissions > 0 {
            session.config.rejected_permissions -= 1;
            return error(msg, 403, "Forbidden", None);
        }
        if session.config.stale_nonces > 0 {
            session.config.stale_nonces -= 1;
            session.rotations += 1;
            session.nonce = format!("{}-{}", NONCE, session.rotations);
            return error(msg, 438, "Stale Nonce", Some(&session.nonce));
        }
        success(msg, Vec::new())
    } else if method == CHANNEL_BIND {
        success(msg, Vec::new())
    } else {
        error(msg, 400, "Bad Request", None)
    }
}

// The peer answers every Send indication with the same data.
fn send_indication(msg: &StunMessage) -> Option<Vec<u8>> {
    let peer = *msg
        .get::<XorPeerAddress>()?
        .as_xor_peer_address()
        .ok()?
        .socket_address();
    let data = msg.get::<Data>()?.as_data().ok()?.as_bytes().to_vec();
    let indication = create_message(
        DATA,
        MessageClass::Indication,
        TransactionId::default(),
        vec![XorPeerAddress::from(peer).into(), Data::new(data).into()],
    );
    Some(encode(&indication))
}

/// Encoded Data indication from `peer`, as a TURN server relays it.
pub fn data_indication(peer: SocketAddr, data: &[u8]) -> Vec<u8> {
    encode(&create_message(
        DATA,
        MessageClass::Indication,
        TransactionId::default(),
        vec![XorPeerAddress::from(peer).into(), Data::new(data).into()],
    ))
}
