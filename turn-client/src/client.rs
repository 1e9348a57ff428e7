use crate::allocation::{Allocation, Relay};
use crate::auth::{AuthContext, Credentials, ERROR_CODE_STALE_NONCE, ERROR_CODE_UNAUTHENTICATED};
use crate::error::{Result, TurnError};
use crate::message::{
    create_stun_message, decode_message, encode_message, error_code, is_channel_data,
    is_stun_message, peek_transaction_id, ChannelData, RelayProtocol, StunAttributes,
};
use crate::state::{AllocationState, StateCell};
use crate::timeout::{RtoSchedule, DEFAULT_RC, DEFAULT_RM, DEFAULT_RTO};
use crate::transaction::{Transaction, TransactionMap, TransactionResponse, TransactionResult};
use crate::transport::{Transport, UdpTransport};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stun_rs::attributes::stun::{Software, XorMappedAddress};
use stun_rs::attributes::turn::{Data, LifeTime, XorPeerAddress, XorRelayedAddress};
use stun_rs::methods::{ALLOCATE, BINDING, DATA};
use stun_rs::{MessageClass, MessageMethod, StunMessage, TransactionId};
use tokio::net::ToSocketAddrs;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// Large enough for any UDP datagram.
const RECV_BUFFER_SIZE: usize = 65536;

const ERROR_CODE_ALLOCATION_MISMATCH: u16 = 437;
const ERROR_CODE_UNSUPPORTED_TRANSPORT: u16 = 442;

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
pub const DEFAULT_PERMISSION_REFRESH: Duration = Duration::from_secs(120);
pub const DEFAULT_CHANNEL_REFRESH: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct ClientParameters {
    stun_server: Option<SocketAddr>,
    turn_server: Option<SocketAddr>,
    credentials: Option<(String, String)>,
    software: Option<String>,
    rto: Duration,
    rc: u16,
    rm: u32,
    lifetime: Duration,
    permission_refresh: Duration,
    channel_refresh: Duration,
}

impl Default for ClientParameters {
    fn default() -> Self {
        Self {
            stun_server: None,
            turn_server: None,
            credentials: None,
            software: None,
            rto: DEFAULT_RTO,
            rc: DEFAULT_RC,
            rm: DEFAULT_RM,
            lifetime: DEFAULT_LIFETIME,
            permission_refresh: DEFAULT_PERMISSION_REFRESH,
            channel_refresh: DEFAULT_CHANNEL_REFRESH,
        }
    }
}

/// Configures and creates a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    params: ClientParameters,
}

impl ClientBuilder {
    /// Uses a transport owned by the caller. The client never closes it.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::default().with_transport(transport)
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_stun_server(mut self, addr: SocketAddr) -> Self {
        self.params.stun_server = Some(addr);
        self
    }

    pub fn with_turn_server(mut self, addr: SocketAddr) -> Self {
        self.params.turn_server = Some(addr);
        self
    }

    pub fn with_credentials<U, P>(mut self, user_name: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.params.credentials = Some((user_name.into(), password.into()));
        self
    }

    pub fn with_software<S: Into<String>>(mut self, software: S) -> Self {
        self.params.software = Some(software.into());
        self
    }

    /// Initial retransmission timeout.
    pub fn with_rto(mut self, rto: Duration) -> Self {
        self.params.rto = rto;
        self
    }

    /// Number of transmissions of a request over unreliable transports (Rc).
    pub fn with_retransmissions(mut self, rc: u16) -> Self {
        self.params.rc = rc.max(1);
        self
    }

    /// Lifetime requested for allocations.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.params.lifetime = lifetime;
        self
    }

    pub fn with_permission_refresh(mut self, interval: Duration) -> Self {
        self.params.permission_refresh = interval;
        self
    }

    pub fn with_channel_refresh(mut self, interval: Duration) -> Self {
        self.params.channel_refresh = interval;
        self
    }

    pub fn build(self) -> Result<Client> {
        self.build_client(false)
    }

    fn build_client(self, owns_transport: bool) -> Result<Client> {
        let transport = self.transport.ok_or(TurnError::NoTransport)?;
        let params = self.params;

        let credentials = params
            .credentials
            .map(|(user_name, password)| Credentials::new(user_name, password))
            .transpose()?;
        if let Some(software) = &params.software {
            Software::new(software)?;
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                owns_transport,
                transactions: TransactionMap::new(),
                auth: AuthContext::new(credentials),
                state: Arc::new(StateCell::default()),
                relay: Mutex::new(None),
                rto: Mutex::new(params.rto),
                write_lock: tokio::sync::Mutex::new(()),
                dispatch: Mutex::new(None),
                listening: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                transport_failed: AtomicBool::new(false),
                discarded: AtomicU64::new(0),
                stun_server: params.stun_server,
                turn_server: params.turn_server,
                software: params.software,
                rc: params.rc,
                rm: params.rm,
                lifetime: params.lifetime,
                permission_refresh: params.permission_refresh,
                channel_refresh: params.channel_refresh,
            }),
        })
    }
}

/// STUN/TURN client.
///
/// All requests go through one transport. After [`Client::listen`] a single
/// dispatch task reads every inbound message and hands responses to the
/// waiting requests, and relayed data to the allocation.
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    transport: Arc<dyn Transport>,
    owns_transport: bool,
    transactions: TransactionMap,
    auth: AuthContext,
    state: Arc<StateCell>,
    relay: Mutex<Option<Arc<Relay>>>,
    rto: Mutex<Duration>,
    // Transports are written by one task at a time.
    write_lock: tokio::sync::Mutex<()>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    listening: AtomicBool,
    closed: AtomicBool,
    transport_failed: AtomicBool,
    discarded: AtomicU64,
    stun_server: Option<SocketAddr>,
    turn_server: Option<SocketAddr>,
    software: Option<String>,
    rc: u16,
    rm: u32,
    pub(crate) lifetime: Duration,
    pub(crate) permission_refresh: Duration,
    pub(crate) channel_refresh: Duration,
}

impl Client {
    /// Creates a client on a UDP transport bound to `local_addr`. The client
    /// owns that transport and closes it on [`Client::close`].
    pub async fn bind<A: ToSocketAddrs>(local_addr: A, builder: ClientBuilder) -> Result<Self> {
        let transport = UdpTransport::bind(local_addr).await?;
        builder
            .with_transport(Arc::new(transport))
            .build_client(true)
    }

    /// Starts the dispatch task.
    pub fn listen(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TurnError::Cancelled);
        }
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(TurnError::AlreadyListening);
        }

        let handle = tokio::spawn(dispatch(self.inner.clone()));
        *lock(&self.inner.dispatch) = Some(handle);
        info!("Client listening on {:?}", self.inner.transport.local_addr());
        Ok(())
    }

    /// Stops the dispatch task and fails outstanding requests with
    /// [`TurnError::Cancelled`]. The transport is closed only when the client
    /// created it. Calling `close` again does nothing.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.shutdown() {
            return Ok(());
        }
        if self.inner.owns_transport {
            self.inner.transport.close().await?;
        }
        Ok(())
    }

    /// Sends a Binding request to the configured STUN server and returns the
    /// server reflexive address.
    pub async fn send_binding_request(&self) -> Result<SocketAddr> {
        let server = self.inner.stun_server.ok_or(TurnError::NoServer("STUN"))?;
        self.send_binding_request_to(server).await
    }

    pub async fn send_binding_request_to(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let attributes = self.inner.attributes()?;
        let response = self.inner.perform(BINDING, attributes, addr).await?;
        let msg = success(response.message)?;

        let mapped = msg
            .get::<XorMappedAddress>()
            .ok_or_else(|| TurnError::Protocol("missing XOR-MAPPED-ADDRESS".to_string()))?
            .as_xor_mapped_address()?;
        Ok(*mapped.socket_address())
    }

    /// Creates a UDP relay allocation on the configured TURN server.
    pub async fn allocate(&self) -> Result<Allocation> {
        self.inner.allocate(RelayProtocol::Udp).await
    }

    /// Creates a TCP relay allocation. The control connection must be a
    /// stream transport.
    pub async fn allocate_tcp(&self) -> Result<Allocation> {
        self.inner.allocate(RelayProtocol::Tcp).await
    }

    pub fn set_rto(&self, rto: Duration) {
        *lock(&self.inner.rto) = rto;
    }

    pub fn rto(&self) -> Duration {
        *lock(&self.inner.rto)
    }

    /// Number of requests waiting for a response.
    pub fn pending_transactions(&self) -> usize {
        self.inner.transactions.size()
    }

    /// Number of inbound messages that matched neither a transaction nor
    /// the allocation.
    pub fn discarded(&self) -> u64 {
        self.inner.discarded.load(Ordering::Relaxed)
    }

    pub fn allocation_state(&self) -> AllocationState {
        self.inner.state.get()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.inner.transport.local_addr().ok())
            .field("stun_server", &self.inner.stun_server)
            .field("turn_server", &self.inner.turn_server)
            .field("allocation_state", &self.inner.state.get())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns `msg` if it is a success response.
fn success(msg: StunMessage) -> Result<StunMessage> {
    match msg.class() {
        MessageClass::SuccessResponse => Ok(msg),
        MessageClass::ErrorResponse => {
            let (code, reason) = error_code(&msg).ok_or_else(|| {
                TurnError::Protocol("error response without ERROR-CODE".to_string())
            })?;
            Err(TurnError::ErrorResponse { code, reason })
        }
        class => Err(TurnError::Protocol(format!(
            "unexpected message class {:?}",
            class
        ))),
    }
}

// Deregisters the transaction however the request ends, including when the
// caller drops the future.
struct TransactionGuard<'a> {
    transactions: &'a TransactionMap,
    id: TransactionId,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.transactions.remove(&self.id);
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails once the client is closed or its transport is gone.
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(TurnError::Cancelled);
        }
        if self.transport_failed.load(Ordering::SeqCst) {
            return Err(TurnError::TransportClosed);
        }
        Ok(())
    }

    fn ensure_listening(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.listening.load(Ordering::SeqCst) {
            return Err(TurnError::NotListening);
        }
        Ok(())
    }

    /// Marks the client closed, stops dispatching and cancels everything in
    /// flight. Returns false if the client was already closed.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(handle) = lock(&self.dispatch).take() {
            handle.abort();
        }
        let cancelled = self.transactions.close_and_fail_all(|| TurnError::Cancelled);
        if let Some(relay) = lock(&self.relay).take() {
            relay.shutdown();
        }
        debug!("Client closed, {} outstanding transactions cancelled", cancelled);
        true
    }

    /// Base attributes of every outgoing request.
    fn attributes(&self) -> Result<StunAttributes> {
        let mut attributes = StunAttributes::default();
        if let Some(software) = &self.software {
            attributes.add(Software::new(software)?);
        }
        Ok(attributes)
    }

    fn schedule(&self) -> RtoSchedule {
        let rto = *lock(&self.rto);
        if self.transport.is_reliable() {
            RtoSchedule::reliable(rto, self.rc, self.rm)
        } else {
            RtoSchedule::new(rto, self.rc, self.rm)
        }
    }

    pub(crate) fn is_reliable(&self) -> bool {
        self.transport.is_reliable()
    }

    pub(crate) async fn send_raw(&self, data: &[u8], to: SocketAddr) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.transport
            .send(data, to)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotConnected => TurnError::TransportClosed,
                _ => TurnError::Io(e),
            })
    }

    pub(crate) async fn send_indication(
        &self,
        method: MessageMethod,
        attributes: StunAttributes,
        to: SocketAddr,
        payload: usize,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(TurnError::Cancelled);
        }
        let id = TransactionId::from(rand::random::<[u8; 12]>());
        let msg = create_stun_message(method, MessageClass::Indication, id, attributes);
        let raw = encode_message(&msg, payload)?;
        self.send_raw(&raw, to).await
    }

    /// Sends a request and waits for its response, retransmitting it on
    /// unreliable transports.
    pub(crate) async fn perform(
        &self,
        method: MessageMethod,
        attributes: StunAttributes,
        to: SocketAddr,
    ) -> Result<TransactionResponse> {
        self.ensure_listening()?;

        let id = self.transactions.next_id();
        let msg = create_stun_message(method, MessageClass::Request, id, attributes);
        let raw = encode_message(&msg, 0)?;
        let (transaction, rx) = self.transactions.register(id, to, raw)?;
        let _guard = TransactionGuard {
            transactions: &self.transactions,
            id,
        };

        // close() or a transport failure may have drained the map before
        // the registration
        self.ensure_open()?;

        self.run_transaction(&transaction, rx).await
    }

    async fn run_transaction(
        &self,
        transaction: &Transaction,
        mut rx: oneshot::Receiver<TransactionResult>,
    ) -> TransactionResult {
        let mut schedule = self.schedule();
        while let Some(wait) = schedule.next_rto() {
            self.send_raw(transaction.raw(), transaction.to()).await?;
            let transmissions = transaction.transmitted();
            if transmissions > 1 {
                debug!(
                    "[{:?}] Retransmission {} to {}",
                    transaction.id(),
                    transmissions - 1,
                    transaction.to()
                );
            } else {
                trace!(
                    "[{:?}] Request sent to {}",
                    transaction.id(),
                    transaction.to()
                );
            }

            tokio::select! {
                result = &mut rx => {
                    return result.unwrap_or_else(|_| Err(TurnError::Cancelled));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        // A response may have raced with the last timer
        if let Ok(result) = rx.try_recv() {
            return result;
        }
        debug!(
            "[{:?}] Transaction timed out after {} transmissions",
            transaction.id(),
            transaction.transmissions()
        );
        Err(TurnError::Timeout)
    }

    /// Sends a request with long-term credentials.
    ///
    /// A 401 response initialises the credentials and a 438 response
    /// refreshes the nonce; each causes at most one retry with a new
    /// transaction. `state`, when given, reflects the reauthentication.
    pub(crate) async fn authenticated_request<F>(
        &self,
        method: MessageMethod,
        to: SocketAddr,
        state: Option<&StateCell>,
        build: F,
    ) -> Result<StunMessage>
    where
        F: Fn(&mut StunAttributes) -> Result<()>,
    {
        let mut unauthenticated = false;
        let mut stale_nonce = false;

        loop {
            let mut attributes = self.attributes()?;
            build(&mut attributes)?;
            let generation = self.auth.prepare_request(&mut attributes);

            let msg = self.perform(method, attributes, to).await?.message;
            match msg.class() {
                MessageClass::SuccessResponse => return Ok(msg),
                MessageClass::ErrorResponse => {}
                class => {
                    return Err(TurnError::Protocol(format!(
                        "unexpected message class {:?}",
                        class
                    )))
                }
            }

            let (code, reason) = error_code(&msg).ok_or_else(|| {
                TurnError::Protocol("error response without ERROR-CODE".to_string())
            })?;
            match code {
                ERROR_CODE_UNAUTHENTICATED if !unauthenticated => {
                    unauthenticated = true;
                    self.auth.unauthenticated(generation, &msg)?;
                }
                ERROR_CODE_STALE_NONCE if !stale_nonce => {
                    stale_nonce = true;
                    if let Some(state) = state {
                        state.transition(
                            AllocationState::Allocated,
                            AllocationState::Reauthenticating,
                        );
                    }
                    let refreshed = self.auth.stale_nonce(generation, &msg);
                    if let Some(state) = state {
                        state.transition(
                            AllocationState::Reauthenticating,
                            AllocationState::Allocated,
                        );
                    }
                    refreshed?;
                }
                ERROR_CODE_STALE_NONCE => {
                    debug!(
                        "[{:?}] Stale nonce after refreshing credentials",
                        msg.transaction_id()
                    );
                    return Err(TurnError::StaleCredentialsExhausted);
                }
                _ => return Err(TurnError::ErrorResponse { code, reason }),
            }
            debug!(
                "[{:?}] Retrying {:?} request with new credentials",
                msg.transaction_id(),
                method
            );
        }
    }

    async fn allocate(self: &Arc<Self>, protocol: RelayProtocol) -> Result<Allocation> {
        let server = self.turn_server.ok_or(TurnError::NoServer("TURN"))?;
        self.ensure_listening()?;
        if protocol == RelayProtocol::Tcp && !self.transport.is_reliable() {
            return Err(TurnError::AllocationMismatch(
                "TCP relay requires a stream control connection".to_string(),
            ));
        }
        if !self.state.begin_allocation() {
            return Err(TurnError::AlreadyAllocated);
        }

        let (relayed_addr, lifetime) = match self.request_allocation(server, protocol).await {
            Ok(granted) => granted,
            Err(e) => {
                self.state
                    .transition(AllocationState::Allocating, AllocationState::Unallocated);
                return Err(e);
            }
        };

        let (relay, inbound) = Relay::new(
            protocol,
            server,
            relayed_addr,
            lifetime,
            self.state.clone(),
        );
        self.install_relay(&relay)?;

        info!(
            "{:?} allocation {} on {} with lifetime {:?}",
            protocol, relayed_addr, server, lifetime
        );
        Ok(Allocation::start(self.clone(), relay, inbound))
    }

    async fn request_allocation(
        &self,
        server: SocketAddr,
        protocol: RelayProtocol,
    ) -> Result<(SocketAddr, Duration)> {
        let requested = self.lifetime;
        let msg = self
            .authenticated_request(ALLOCATE, server, None, |attributes| {
                attributes.add(protocol.requested_transport()?);
                attributes.add(LifeTime::new(lifetime_secs(requested)));
                Ok(())
            })
            .await
            .map_err(|e| match e {
                TurnError::ErrorResponse { code, reason }
                    if code == ERROR_CODE_UNSUPPORTED_TRANSPORT
                        || code == ERROR_CODE_ALLOCATION_MISMATCH =>
                {
                    TurnError::AllocationMismatch(format!("{}: {}", code, reason))
                }
                e => e,
            })?;

        let relayed = msg
            .get::<XorRelayedAddress>()
            .ok_or_else(|| TurnError::Protocol("missing XOR-RELAYED-ADDRESS".to_string()))?
            .as_xor_relayed_address()?;
        Ok((*relayed.socket_address(), granted_lifetime(&msg, requested)))
    }

    /// Makes `relay` the client's live allocation.
    ///
    /// `shutdown` and a failing dispatch loop raise their flag before they
    /// empty the relay slot, so a relay stored here is either taken down by
    /// them or sees the flag. Either way it never outlives the client.
    fn install_relay(&self, relay: &Arc<Relay>) -> Result<()> {
        *lock(&self.relay) = Some(relay.clone());
        if let Err(e) = self.ensure_open() {
            debug!("Client stopped while allocating, releasing relay");
            self.release_relay(relay);
            return Err(e);
        }
        if !self
            .state
            .transition(AllocationState::Allocating, AllocationState::Allocated)
        {
            self.release_relay(relay);
            return Err(TurnError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn release_relay(&self, relay: &Arc<Relay>) {
        let mut slot = lock(&self.relay);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, relay)) {
            slot.take();
        }
        drop(slot);
        relay.shutdown();
    }

    fn current_relay(&self) -> Option<Arc<Relay>> {
        lock(&self.relay).clone()
    }

    fn discard(&self, from: SocketAddr, reason: &str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!("Discarding inbound message from {}: {}", from, reason);
    }

    fn handle_inbound(&self, buffer: &[u8], from: SocketAddr) {
        if is_channel_data(buffer) {
            self.handle_channel_data(buffer, from);
            return;
        }
        if !is_stun_message(buffer) {
            self.discard(from, "neither STUN nor ChannelData");
            return;
        }

        match decode_message(buffer) {
            Ok(msg) => self.handle_message(msg, from),
            Err(e) => {
                let transaction =
                    peek_transaction_id(buffer).and_then(|id| self.transactions.find(&id));
                match transaction {
                    Some(transaction) => {
                        debug!(
                            "[{:?}] Failed to decode response: {}",
                            transaction.id(),
                            e
                        );
                        transaction.write_result(Err(TurnError::Protocol(e.to_string())));
                    }
                    None => self.discard(from, "undecodable STUN message"),
                }
            }
        }
    }

    fn handle_message(&self, msg: StunMessage, from: SocketAddr) {
        match msg.class() {
            MessageClass::SuccessResponse | MessageClass::ErrorResponse => {
                let id = *msg.transaction_id();
                match self.transactions.find(&id) {
                    Some(transaction) => {
                        let response = TransactionResponse { message: msg, from };
                        if !transaction.write_result(Ok(response)) {
                            trace!("[{:?}] Transaction already completed", id);
                        }
                    }
                    None => self.discard(from, "response to unknown transaction"),
                }
            }
            MessageClass::Indication if msg.method() == DATA => {
                self.handle_data_indication(&msg, from)
            }
            _ => self.discard(from, "unexpected STUN message"),
        }
    }

    fn handle_data_indication(&self, msg: &StunMessage, from: SocketAddr) {
        let Some(relay) = self.current_relay().filter(|relay| relay.server() == from) else {
            self.discard(from, "Data indication without allocation");
            return;
        };

        let peer = msg
            .get::<XorPeerAddress>()
            .and_then(|attr| attr.as_xor_peer_address().ok())
            .map(|attr| *attr.socket_address());
        let data = msg
            .get::<Data>()
            .and_then(|attr| attr.as_data().ok())
            .map(|attr| Bytes::copy_from_slice(attr.as_bytes()));

        match (peer, data) {
            (Some(peer), Some(data)) => {
                if !relay.deliver(data, peer) {
                    self.discard(from, "allocation receive queue full");
                }
            }
            _ => self.discard(from, "malformed Data indication"),
        }
    }

    fn handle_channel_data(&self, buffer: &[u8], from: SocketAddr) {
        let Some(relay) = self.current_relay().filter(|relay| relay.server() == from) else {
            self.discard(from, "ChannelData without allocation");
            return;
        };
        let channel = match ChannelData::decode(buffer) {
            Ok(channel) => channel,
            Err(e) => {
                self.discard(from, &e.to_string());
                return;
            }
        };
        match relay.bindings().find_by_number(channel.number) {
            Some(binding) => {
                if !relay.deliver(channel.data, binding.peer()) {
                    self.discard(from, "allocation receive queue full");
                }
            }
            None => self.discard(from, "ChannelData on unbound channel"),
        }
    }
}

pub(crate) fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}

/// LIFETIME granted in a response, or `requested` if the server omitted it.
pub(crate) fn granted_lifetime(msg: &StunMessage, requested: Duration) -> Duration {
    msg.get::<LifeTime>()
        .and_then(|attr| attr.as_life_time().ok())
        .map(|lifetime| Duration::from_secs(u64::from(lifetime.as_u32())))
        .unwrap_or(requested)
}

/// Reads the transport until it fails, routing every inbound message.
async fn dispatch(inner: Arc<ClientInner>) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match inner.transport.recv(&mut buffer).await {
            Ok((size, from)) => inner.handle_inbound(&buffer[..size], from),
            Err(e) => {
                if inner.is_closed() {
                    debug!("Dispatch stopped: {}", e);
                } else {
                    warn!("Transport receive failed: {}", e);
                }
                inner.transport_failed.store(true, Ordering::SeqCst);
                let failed = inner
                    .transactions
                    .close_and_fail_all(|| TurnError::TransportClosed);
                if let Some(relay) = lock(&inner.relay).take() {
                    relay.shutdown();
                }
                debug!("{} outstanding transactions failed", failed);
                break;
            }
        }
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use stun_rs::attributes::stun::ErrorCode;
    use stun_rs::StunMessageBuilder;

    fn builder() -> ClientBuilder {
        ClientBuilder::default()
            .with_stun_server("127.0.0.1:3478".parse().expect("Failed to parse address"))
    }

    #[test]
    fn test_build_without_transport() {
        let result = builder().build();
        assert!(matches!(result, Err(TurnError::NoTransport)));
    }

    #[tokio::test]
    async fn test_build_with_invalid_software() {
        let transport = UdpTransport::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind transport");
        let result = builder()
            .with_transport(Arc::new(transport))
            .with_software("x".repeat(1024))
            .build();
        assert!(matches!(result, Err(TurnError::Codec(_))));
    }

    #[tokio::test]
    async fn test_request_before_listen() {
        let client = Client::bind("127.0.0.1:0", builder())
            .await
            .expect("Failed to create client");
        let error = client
            .send_binding_request()
            .await
            .expect_err("Request must fail");
        assert!(matches!(error, TurnError::NotListening));

        client.listen().expect("Failed to listen");
        assert!(matches!(client.listen(), Err(TurnError::AlreadyListening)));
        client.close().await.expect("Failed to close");
        client.close().await.expect("Close must be idempotent");
    }

    #[tokio::test]
    async fn test_missing_servers() {
        let transport = UdpTransport::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind transport");
        let client = ClientBuilder::new(Arc::new(transport))
            .build()
            .expect("Failed to create client");
        client.listen().expect("Failed to listen");

        let error = client
            .send_binding_request()
            .await
            .expect_err("Request must fail");
        assert!(matches!(error, TurnError::NoServer("STUN")));

        let error = client.allocate().await.expect_err("Allocate must fail");
        assert!(matches!(error, TurnError::NoServer("TURN")));
        assert_eq!(client.allocation_state(), AllocationState::Unallocated);
    }

    #[tokio::test]
    async fn test_tcp_allocation_over_udp() {
        let client = Client::bind(
            "127.0.0.1:0",
            builder().with_turn_server("127.0.0.1:3478".parse().expect("Failed to parse")),
        )
        .await
        .expect("Failed to create client");
        client.listen().expect("Failed to listen");

        let error = client.allocate_tcp().await.expect_err("Allocate must fail");
        assert!(matches!(error, TurnError::AllocationMismatch(_)));
        assert_eq!(client.allocation_state(), AllocationState::Unallocated);
        assert_eq!(client.pending_transactions(), 0);
    }

    async fn allocating_client() -> (Client, Arc<Relay>) {
        let client = Client::bind("127.0.0.1:0", builder())
            .await
            .expect("Failed to create client");
        client.listen().expect("Failed to listen");
        assert!(client.inner.state.begin_allocation());
        let (relay, _) = Relay::new(
            RelayProtocol::Udp,
            "127.0.0.1:3478".parse().expect("Failed to parse address"),
            "127.0.0.1:50000".parse().expect("Failed to parse address"),
            DEFAULT_LIFETIME,
            client.inner.state.clone(),
        );
        (client, relay)
    }

    #[tokio::test]
    async fn test_close_while_allocating() {
        let (client, relay) = allocating_client().await;

        // close() lands after the server granted the allocation
        assert!(client.inner.shutdown());
        let error = client
            .inner
            .install_relay(&relay)
            .expect_err("Install must fail");
        assert!(matches!(error, TurnError::Cancelled));
        assert!(relay.is_closed());
        assert!(client.inner.current_relay().is_none());
        assert_eq!(client.allocation_state(), AllocationState::Closed);
    }

    #[tokio::test]
    async fn test_transport_failure_while_allocating() {
        let (client, relay) = allocating_client().await;

        client.inner.transport_failed.store(true, Ordering::SeqCst);
        let error = client
            .inner
            .install_relay(&relay)
            .expect_err("Install must fail");
        assert!(matches!(error, TurnError::TransportClosed));
        assert!(relay.is_closed());
        assert!(client.inner.current_relay().is_none());
        assert_eq!(client.allocation_state(), AllocationState::Closed);
        client.close().await.expect("Failed to close");
    }

    #[tokio::test]
    async fn test_install_relay() {
        let (client, relay) = allocating_client().await;

        client.inner.install_relay(&relay).expect("Failed to install");
        assert!(!relay.is_closed());
        assert_eq!(client.allocation_state(), AllocationState::Allocated);
        let current = client.inner.current_relay().expect("Relay not installed");
        assert!(Arc::ptr_eq(&current, &relay));

        // Closing the client takes the installed relay down
        client.close().await.expect("Failed to close");
        assert!(relay.is_closed());
        assert_eq!(client.allocation_state(), AllocationState::Closed);
    }

    #[tokio::test]
    async fn test_request_after_transport_failure() {
        let client = Client::bind("127.0.0.1:0", builder())
            .await
            .expect("Failed to create client");
        client.listen().expect("Failed to listen");
        client.inner.transport_failed.store(true, Ordering::SeqCst);

        let error = client
            .send_binding_request()
            .await
            .expect_err("Request must fail");
        assert!(matches!(error, TurnError::TransportClosed));
        assert_eq!(client.pending_transactions(), 0);
        client.close().await.expect("Failed to close");
    }

    #[test]
    fn test_success() {
        let msg = StunMessageBuilder::new(BINDING, MessageClass::SuccessResponse).build();
        assert!(success(msg).is_ok());

        let error = stun_rs::ErrorCode::new(420, "Unknown Attribute")
            .expect("Failed to create error code");
        let msg = StunMessageBuilder::new(BINDING, MessageClass::ErrorResponse)
            .with_attribute(ErrorCode::new(error))
            .build();
        let error = success(msg).expect_err("Expected an error response");
        assert!(matches!(error, TurnError::ErrorResponse { code: 420, .. }));

        let msg = StunMessageBuilder::new(BINDING, MessageClass::ErrorResponse).build();
        assert!(matches!(success(msg), Err(TurnError::Protocol(_))));
    }

    #[test]
    fn test_lifetime() {
        assert_eq!(lifetime_secs(Duration::from_secs(600)), 600);
        assert_eq!(lifetime_secs(Duration::from_secs(u64::MAX)), u32::MAX);

        let msg = StunMessageBuilder::new(ALLOCATE, MessageClass::SuccessResponse)
            .with_attribute(LifeTime::new(300))
            .build();
        assert_eq!(
            granted_lifetime(&msg, DEFAULT_LIFETIME),
            Duration::from_secs(300)
        );

        let msg = StunMessageBuilder::new(ALLOCATE, MessageClass::SuccessResponse).build();
        assert_eq!(granted_lifetime(&msg, DEFAULT_LIFETIME), DEFAULT_LIFETIME);
    }
}
