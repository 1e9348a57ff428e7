use crate::binding::{BindingMap, BindingState, ChannelBinding};
use crate::client::{granted_lifetime, lifetime_secs, ClientInner};
use crate::error::{Result, TurnError};
use crate::message::{ChannelData, RelayProtocol, StunAttributes};
use crate::permission::{PermissionMap, PermissionState};
use crate::state::{AllocationState, StateCell};
use bytes::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stun_rs::attributes::turn::{ChannelNumber, Data, LifeTime, XorPeerAddress};
use stun_rs::methods::{CHANNEL_BIND, CREATE_PERMMISSION, REFRESH, SEND};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

// Relayed datagrams queued for `read_from` before new ones are dropped.
const INBOUND_QUEUE_SIZE: usize = 1024;
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
// tokio intervals must not have a zero period
const MIN_TICK: Duration = Duration::from_millis(1);

type Inbound = (Bytes, SocketAddr);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of an allocation shared by the [`Allocation`] handle, the client's
/// dispatch task and the refresh task.
#[derive(Debug)]
pub(crate) struct Relay {
    protocol: RelayProtocol,
    server: SocketAddr,
    relayed_addr: SocketAddr,
    lifetime: Mutex<Duration>,
    state: Arc<StateCell>,
    permissions: PermissionMap,
    bindings: BindingMap,
    inbound: mpsc::Sender<Inbound>,
    closed: watch::Sender<bool>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(
        protocol: RelayProtocol,
        server: SocketAddr,
        relayed_addr: SocketAddr,
        lifetime: Duration,
        state: Arc<StateCell>,
    ) -> (Arc<Self>, mpsc::Receiver<Inbound>) {
        let (inbound, rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (closed, _) = watch::channel(false);
        let relay = Arc::new(Self {
            protocol,
            server,
            relayed_addr,
            lifetime: Mutex::new(lifetime),
            state,
            permissions: PermissionMap::new(),
            bindings: BindingMap::new(),
            inbound,
            closed,
            refresh: Mutex::new(None),
        });
        (relay, rx)
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn bindings(&self) -> &BindingMap {
        &self.bindings
    }

    fn lifetime(&self) -> Duration {
        *lock(&self.lifetime)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Queues relayed data for `read_from`. Never waits; returns false if the
    /// data had to be dropped.
    pub fn deliver(&self, data: Bytes, peer: SocketAddr) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inbound.try_send((data, peer)).is_ok()
    }

    fn stop_refresh(&self) {
        if let Some(handle) = lock(&self.refresh).take() {
            handle.abort();
        }
    }

    /// Releases every local resource of the allocation and wakes its readers.
    pub fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.stop_refresh();
        self.permissions.clear();
        self.bindings.clear();
        self.state.set(AllocationState::Closed);
        info!("Allocation {} closed", self.relayed_addr);
    }

    async fn create_permissions(&self, client: &ClientInner, peers: &[SocketAddr]) -> Result<()> {
        client
            .authenticated_request(
                CREATE_PERMMISSION,
                self.server,
                Some(&self.state),
                |attributes| {
                    for peer in peers {
                        attributes.push(XorPeerAddress::from(*peer));
                    }
                    Ok(())
                },
            )
            .await?;
        Ok(())
    }

    /// Sends a Refresh request and returns the granted lifetime. A zero
    /// lifetime deletes the allocation.
    async fn refresh(&self, client: &ClientInner, lifetime: Duration) -> Result<Duration> {
        let msg = client
            .authenticated_request(REFRESH, self.server, Some(&self.state), |attributes| {
                attributes.add(LifeTime::new(lifetime_secs(lifetime)));
                Ok(())
            })
            .await?;
        Ok(granted_lifetime(&msg, lifetime))
    }

    async fn channel_bind(&self, client: &ClientInner, binding: &ChannelBinding) -> Result<()> {
        client
            .authenticated_request(CHANNEL_BIND, self.server, Some(&self.state), |attributes| {
                attributes.add(ChannelNumber::new(binding.number()));
                attributes.add(XorPeerAddress::from(binding.peer()));
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn refresh_allocation(&self, client: &ClientInner) {
        match self.refresh(client, client.lifetime).await {
            Ok(lifetime) => {
                debug!("Allocation {} refreshed for {:?}", self.relayed_addr, lifetime);
                *lock(&self.lifetime) = lifetime;
            }
            Err(e) => warn!("Failed to refresh allocation {}: {}", self.relayed_addr, e),
        }
    }

    async fn refresh_permissions(&self, client: &ClientInner) {
        let peers = self.permissions.addrs();
        if peers.is_empty() {
            return;
        }
        if let Err(e) = self.create_permissions(client, &peers).await {
            warn!("Failed to refresh permissions of {}: {}", self.relayed_addr, e);
            for peer in &peers {
                if let Some(permission) = self.permissions.find(peer) {
                    permission.set_state(PermissionState::Idle);
                }
            }
            return;
        }
        debug!(
            "Refreshed {} permissions of {}",
            peers.len(),
            self.relayed_addr
        );
    }

    async fn refresh_channels(&self, client: &ClientInner) {
        for binding in self.bindings.bindings() {
            if !binding.is_ready() {
                continue;
            }
            if let Err(e) = self.channel_bind(client, &binding).await {
                warn!(
                    "Failed to refresh channel 0x{:04x} to {}: {}",
                    binding.number(),
                    binding.peer(),
                    e
                );
                binding.set_state(BindingState::Failed);
                self.bindings.delete(&binding.peer());
            }
        }
    }
}

fn refresh_interval(lifetime: Duration) -> Duration {
    (lifetime / 2).max(MIN_REFRESH_INTERVAL)
}

/// Keeps the allocation, its permissions and its channel bindings alive
/// until aborted.
async fn maintain(client: Arc<ClientInner>, relay: Arc<Relay>) {
    let now = Instant::now();
    let permission_period = client.permission_refresh.max(MIN_TICK);
    let mut permissions = interval_at(now + permission_period, permission_period);
    permissions.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let channel_period = client.channel_refresh.max(MIN_TICK);
    let mut channels = interval_at(now + channel_period, channel_period);
    channels.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let allocation = sleep(refresh_interval(relay.lifetime()));
    tokio::pin!(allocation);

    loop {
        tokio::select! {
            _ = &mut allocation => {
                relay.refresh_allocation(&client).await;
                allocation
                    .as_mut()
                    .reset(Instant::now() + refresh_interval(relay.lifetime()));
            }
            _ = permissions.tick() => relay.refresh_permissions(&client).await,
            _ = channels.tick() => relay.refresh_channels(&client).await,
        }
    }
}

/// A relay allocation on a TURN server.
///
/// Data written with [`Allocation::write_to`] is relayed to the peer from
/// the relayed address; data peers send to the relayed address is returned
/// by [`Allocation::read_from`]. The allocation is refreshed in the
/// background until it is closed.
pub struct Allocation {
    client: Arc<ClientInner>,
    relay: Arc<Relay>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
}

impl Allocation {
    pub(crate) fn start(
        client: Arc<ClientInner>,
        relay: Arc<Relay>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> Self {
        let handle = tokio::spawn(maintain(client.clone(), relay.clone()));
        *lock(&relay.refresh) = Some(handle);
        Self {
            client,
            relay,
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    pub fn relayed_addr(&self) -> SocketAddr {
        self.relay.relayed_addr
    }

    pub fn protocol(&self) -> RelayProtocol {
        self.relay.protocol
    }

    /// Lifetime granted by the server on the last Allocate or Refresh.
    pub fn lifetime(&self) -> Duration {
        self.relay.lifetime()
    }

    pub fn state(&self) -> AllocationState {
        self.relay.state.get()
    }

    pub fn permissions(&self) -> &PermissionMap {
        &self.relay.permissions
    }

    pub fn bindings(&self) -> &BindingMap {
        &self.relay.bindings
    }

    fn ensure_open(&self) -> Result<()> {
        if self.relay.is_closed() {
            return Err(TurnError::AllocationClosed);
        }
        Ok(())
    }

    fn ensure_datagram_relay(&self) -> Result<()> {
        match self.relay.protocol {
            RelayProtocol::Udp => Ok(()),
            RelayProtocol::Tcp => Err(TurnError::AllocationMismatch(
                "TCP allocations relay data over peer connections".to_string(),
            )),
        }
    }

    /// Creates permissions for `peers` in a single request.
    pub async fn create_permissions(&self, peers: &[SocketAddr]) -> Result<()> {
        self.ensure_open()?;
        self.relay.create_permissions(&self.client, peers).await?;
        for peer in peers {
            self.relay
                .permissions
                .find_or_insert(*peer)
                .set_state(PermissionState::Permitted);
        }
        Ok(())
    }

    // Concurrent writers to the same peer wait on the permission's creation
    // lock, so a single CreatePermission is sent for them. A writer that
    // wakes up to find its entry dropped by a failed attempt starts over
    // on whatever entry the map holds now.
    async fn ensure_permission(&self, peer: SocketAddr) -> Result<()> {
        loop {
            self.ensure_open()?;
            let permission = self.relay.permissions.find_or_insert(peer);
            if permission.is_permitted() {
                return Ok(());
            }

            let _creating = permission.lock_creation().await;
            if permission.is_permitted() {
                return Ok(());
            }
            if !self.relay.permissions.holds(&peer, &permission) {
                continue;
            }
            return match self.relay.create_permissions(&self.client, &[peer]).await {
                Ok(()) => {
                    permission.set_state(PermissionState::Permitted);
                    debug!("Permission for {} created", peer.ip());
                    Ok(())
                }
                Err(e) => {
                    self.relay.permissions.delete_entry(&peer, &permission);
                    Err(e)
                }
            };
        }
    }

    /// Relays `data` to `peer`, creating the permission first if needed.
    /// Returns the number of bytes written.
    pub async fn write_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        self.ensure_open()?;
        self.ensure_datagram_relay()?;
        self.ensure_permission(peer).await?;

        if let Some(binding) = self
            .relay
            .bindings
            .find_by_peer(&peer)
            .filter(|binding| binding.is_ready())
        {
            let frame = ChannelData {
                number: binding.number(),
                data: Bytes::copy_from_slice(data),
            }
            .encode(self.client.is_reliable())?;
            self.client.send_raw(&frame, self.relay.server).await?;
            return Ok(data.len());
        }

        let mut attributes = StunAttributes::default();
        attributes.add(XorPeerAddress::from(peer));
        attributes.add(Data::new(data));
        self.client
            .send_indication(SEND, attributes, self.relay.server, data.len())
            .await?;
        Ok(data.len())
    }

    /// Waits for data relayed from a peer. Data larger than `buffer` is
    /// truncated. Fails with [`TurnError::AllocationClosed`] once the
    /// allocation is closed.
    pub async fn read_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.ensure_datagram_relay()?;
        let mut closed = self.relay.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        tokio::select! {
            received = inbound.recv() => {
                let (data, peer) = received.ok_or(TurnError::AllocationClosed)?;
                let size = data.len().min(buffer.len());
                buffer[..size].copy_from_slice(&data[..size]);
                Ok((size, peer))
            }
            _ = closed.wait_for(|closed| *closed) => Err(TurnError::AllocationClosed),
        }
    }

    /// Binds a channel to `peer` and returns its number. Subsequent writes to
    /// `peer` use ChannelData messages.
    pub async fn bind_channel(&self, peer: SocketAddr) -> Result<u16> {
        self.ensure_open()?;
        self.ensure_datagram_relay()?;
        self.ensure_permission(peer).await?;

        let binding = self.relay.bindings.create(peer)?;
        if binding.is_ready() {
            return Ok(binding.number());
        }

        binding.set_state(BindingState::Requested);
        match self.relay.channel_bind(&self.client, &binding).await {
            Ok(()) => {
                binding.set_state(BindingState::Ready);
                debug!("Channel 0x{:04x} bound to {}", binding.number(), peer);
                Ok(binding.number())
            }
            Err(e) => {
                binding.set_state(BindingState::Failed);
                self.relay.bindings.delete(&peer);
                Err(e)
            }
        }
    }

    /// Refreshes the allocation now, returning the granted lifetime.
    pub async fn refresh(&self) -> Result<Duration> {
        self.ensure_open()?;
        let lifetime = self.relay.refresh(&self.client, self.client.lifetime).await?;
        *lock(&self.relay.lifetime) = lifetime;
        Ok(lifetime)
    }

    /// Deletes the allocation. The Refresh request releasing it on the server
    /// is best effort; local state is released regardless and pending
    /// `read_from` calls fail with [`TurnError::AllocationClosed`].
    pub async fn close(&self) -> Result<()> {
        if self.relay.is_closed() {
            return Ok(());
        }
        self.relay.stop_refresh();
        if let Err(e) = self.relay.refresh(&self.client, Duration::ZERO).await {
            debug!(
                "Failed to release allocation {} on the server: {}",
                self.relay.relayed_addr, e
            );
        }
        self.client.release_relay(&self.relay);
        Ok(())
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("relayed_addr", &self.relay.relayed_addr)
            .field("protocol", &self.relay.protocol)
            .field("state", &self.relay.state.get())
            .finish()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if !self.relay.is_closed() {
            debug!("Allocation {} dropped without close", self.relay.relayed_addr);
            self.client.release_relay(&self.relay);
        }
    }
}
