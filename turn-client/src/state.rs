use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of the client's relay allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocationState {
    Unallocated = 0,
    Allocating = 1,
    Allocated = 2,
    Reauthenticating = 3,
    Closed = 4,
}

impl AllocationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AllocationState::Allocating,
            2 => AllocationState::Allocated,
            3 => AllocationState::Reauthenticating,
            4 => AllocationState::Closed,
            _ => AllocationState::Unallocated,
        }
    }

    /// True while the allocation holds, or is about to hold, a relayed address.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            AllocationState::Allocating
                | AllocationState::Allocated
                | AllocationState::Reauthenticating
        )
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Atomic holder of an [`AllocationState`] shared by the client and its allocation.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(AllocationState::Unallocated as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> AllocationState {
        AllocationState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, new_state: AllocationState) {
        let old = AllocationState::from_u8(self.0.swap(new_state as u8, Ordering::AcqRel));
        if old != new_state {
            debug!("Changing allocation state from {} to {}", old, new_state);
        }
    }

    /// Moves to `new_state` only when the current state is `current`.
    pub fn transition(&self, current: AllocationState, new_state: AllocationState) -> bool {
        let changed = self
            .0
            .compare_exchange(
                current as u8,
                new_state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if changed {
            debug!("Changing allocation state from {} to {}", current, new_state);
        }
        changed
    }

    /// Claims the cell for a new allocation. Fails if one is already live.
    pub fn begin_allocation(&self) -> bool {
        [AllocationState::Unallocated, AllocationState::Closed]
            .into_iter()
            .any(|from| self.transition(from, AllocationState::Allocating))
    }
}

#[cfg(test)]
mod allocation_state_tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), AllocationState::Unallocated);
        assert!(!cell.get().is_live());

        assert!(cell.begin_allocation());
        assert_eq!(cell.get(), AllocationState::Allocating);
        assert!(!cell.begin_allocation());

        assert!(cell.transition(AllocationState::Allocating, AllocationState::Allocated));
        assert!(!cell.transition(AllocationState::Allocating, AllocationState::Allocated));

        assert!(cell.transition(
            AllocationState::Allocated,
            AllocationState::Reauthenticating
        ));
        assert!(cell.get().is_live());
        assert!(!cell.begin_allocation());
        assert!(cell.transition(
            AllocationState::Reauthenticating,
            AllocationState::Allocated
        ));

        cell.set(AllocationState::Closed);
        assert!(!cell.get().is_live());
        assert!(cell.begin_allocation());
    }
}
