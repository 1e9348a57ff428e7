use crate::error::{Result, TurnError};
use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Channel numbers a client may bind
/// ([RFC8656 section 12](https://datatracker.ietf.org/doc/html/rfc8656#section-12)).
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BindingState {
    Idle = 0,
    Requested = 1,
    Ready = 2,
    Failed = 3,
}

impl From<u8> for BindingState {
    fn from(value: u8) -> Self {
        match value {
            1 => BindingState::Requested,
            2 => BindingState::Ready,
            3 => BindingState::Failed,
            _ => BindingState::Idle,
        }
    }
}

/// A channel number bound to a peer transport address.
#[derive(Debug)]
pub struct ChannelBinding {
    number: u16,
    peer: SocketAddr,
    state: AtomicU8,
}

impl ChannelBinding {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> BindingState {
        BindingState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: BindingState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BindingState::Ready
    }
}

#[derive(Debug)]
struct Bindings {
    by_peer: HashMap<SocketAddr, Arc<ChannelBinding>>,
    by_number: HashMap<u16, Arc<ChannelBinding>>,
    next_number: u16,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            by_peer: HashMap::new(),
            by_number: HashMap::new(),
            next_number: MIN_CHANNEL_NUMBER,
        }
    }
}

impl Bindings {
    fn assign_number(&mut self) -> Option<u16> {
        let range = usize::from(MAX_CHANNEL_NUMBER - MIN_CHANNEL_NUMBER) + 1;
        for _ in 0..range {
            let number = self.next_number;
            self.next_number = if number == MAX_CHANNEL_NUMBER {
                MIN_CHANNEL_NUMBER
            } else {
                number + 1
            };
            if !self.by_number.contains_key(&number) {
                return Some(number);
            }
        }
        None
    }
}

/// Channel bindings of an allocation. A peer has at most one number and a
/// number at most one peer.
#[derive(Debug, Default)]
pub struct BindingMap {
    bindings: Mutex<Bindings>,
}

impl BindingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binding of `peer`, assigning a free channel number if the
    /// peer is not bound yet.
    pub fn create(&self, peer: SocketAddr) -> Result<Arc<ChannelBinding>> {
        let mut bindings = self.lock();
        if let Some(binding) = bindings.by_peer.get(&peer) {
            return Ok(binding.clone());
        }

        let number = bindings
            .assign_number()
            .ok_or_else(|| TurnError::Protocol("no channel number available".to_string()))?;
        let binding = Arc::new(ChannelBinding {
            number,
            peer,
            state: AtomicU8::new(BindingState::Idle as u8),
        });
        bindings.by_peer.insert(peer, binding.clone());
        bindings.by_number.insert(number, binding.clone());
        debug!("Channel 0x{:04x} assigned to {}", number, peer);
        Ok(binding)
    }

    pub fn find_by_peer(&self, peer: &SocketAddr) -> Option<Arc<ChannelBinding>> {
        self.lock().by_peer.get(peer).cloned()
    }

    pub fn find_by_number(&self, number: u16) -> Option<Arc<ChannelBinding>> {
        self.lock().by_number.get(&number).cloned()
    }

    pub fn delete(&self, peer: &SocketAddr) -> Option<Arc<ChannelBinding>> {
        let mut bindings = self.lock();
        let binding = bindings.by_peer.remove(peer)?;
        bindings.by_number.remove(&binding.number);
        Some(binding)
    }

    /// Snapshot of every binding.
    pub fn bindings(&self) -> Vec<Arc<ChannelBinding>> {
        self.lock().by_number.values().cloned().collect()
    }

    pub fn clear(&self) {
        let mut bindings = self.lock();
        for binding in bindings.by_number.values() {
            binding.set_state(BindingState::Idle);
        }
        bindings.by_peer.clear();
        bindings.by_number.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Bindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
