use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PermissionState {
    Idle = 0,
    Permitted = 1,
}

impl From<u8> for PermissionState {
    fn from(value: u8) -> Self {
        match value {
            1 => PermissionState::Permitted,
            _ => PermissionState::Idle,
        }
    }
}

/// Authorisation for a peer IP. The state is read on every relayed write,
/// so it lives in an atomic rather than behind the map lock.
#[derive(Debug, Default)]
pub struct Permission {
    state: AtomicU8,
    // Serialises CreatePermission exchanges for the same peer.
    creating: Mutex<()>,
}

impl Permission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PermissionState {
        PermissionState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PermissionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_permitted(&self) -> bool {
        self.state() == PermissionState::Permitted
    }

    pub(crate) async fn lock_creation(&self) -> MutexGuard<'_, ()> {
        self.creating.lock().await
    }
}

/// Permissions are IP scoped, the port of the peer is ignored.
pub fn ip_fingerprint(addr: &SocketAddr) -> IpAddr {
    addr.ip().to_canonical()
}

#[derive(Debug)]
struct PermissionEntry {
    addr: SocketAddr,
    permission: Arc<Permission>,
}

/// Permissions of an allocation keyed by peer IP. At most one permission
/// exists per IP; inserting for an IP already present replaces the entry.
#[derive(Debug, Default)]
pub struct PermissionMap {
    permissions: RwLock<HashMap<IpAddr, PermissionEntry>>,
}

impl PermissionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, addr: SocketAddr, permission: Arc<Permission>) {
        self.write()
            .insert(ip_fingerprint(&addr), PermissionEntry { addr, permission });
    }

    pub fn find(&self, addr: &SocketAddr) -> Option<Arc<Permission>> {
        self.read()
            .get(&ip_fingerprint(addr))
            .map(|entry| entry.permission.clone())
    }

    /// Returns the permission for `addr`, inserting an idle one when missing.
    pub fn find_or_insert(&self, addr: SocketAddr) -> Arc<Permission> {
        if let Some(permission) = self.find(&addr) {
            return permission;
        }
        self.write()
            .entry(ip_fingerprint(&addr))
            .or_insert_with(|| PermissionEntry {
                addr,
                permission: Arc::new(Permission::new()),
            })
            .permission
            .clone()
    }

    pub fn delete(&self, addr: &SocketAddr) {
        self.write().remove(&ip_fingerprint(addr));
    }

    /// True if `permission` is the entry tracked for the IP of `addr`.
    pub fn holds(&self, addr: &SocketAddr, permission: &Arc<Permission>) -> bool {
        self.read()
            .get(&ip_fingerprint(addr))
            .is_some_and(|entry| Arc::ptr_eq(&entry.permission, permission))
    }

    /// Deletes the entry for `addr` only if it is still `permission`.
    /// Returns false if the entry was already replaced or removed.
    pub fn delete_entry(&self, addr: &SocketAddr, permission: &Arc<Permission>) -> bool {
        let mut permissions = self.write();
        let key = ip_fingerprint(addr);
        match permissions.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.permission, permission) => {
                permissions.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Peer addresses currently tracked, one per IP.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.read().values().map(|entry| entry.addr).collect()
    }

    pub fn clear(&self) {
        let mut permissions = self.write();
        for entry in permissions.values() {
            entry.permission.set_state(PermissionState::Idle);
        }
        permissions.clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<IpAddr, PermissionEntry>> {
        self.permissions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<IpAddr, PermissionEntry>> {
        self.permissions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
