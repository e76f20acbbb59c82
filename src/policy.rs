//! Connection policy storage
//!
//! The policy decides whether a device may connect for a profile. The manager reads it
//! before admitting a session and the hand-off arbitrator rewrites it when the active
//! device changes. Where it is persisted belongs to the embedding platform, which plugs
//! in through [`PolicyStore`].

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::RawMutex};
use heapless::FnvIndexMap;

use crate::{BluetoothAddress, Profile};

/// Per-device, per-profile connection preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionPolicy {
    /// Connections are permitted and preferred
    Allowed,
    /// Connections are refused
    Forbidden,
    /// No preference recorded
    #[default]
    Unknown,
}

/// Failure to persist a policy value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PolicyError {
    /// No room left for another entry
    StorageFull,
    /// The backing store could not be reached
    Unavailable,
}

/// Persistent policy storage
///
/// Implementations must be cheap to call and must never call back into the manager.
/// The manager calls them with its own lock released.
pub trait PolicyStore {
    /// Stored policy, `Unknown` when nothing is recorded
    fn policy(&self, profile: Profile, addr: BluetoothAddress) -> ConnectionPolicy;

    /// Persist a policy value
    ///
    /// # Errors
    /// Returns a [`PolicyError`] when the value could not be stored.
    fn set_policy(
        &self,
        profile: Profile,
        addr: BluetoothAddress,
        policy: ConnectionPolicy,
    ) -> Result<(), PolicyError>;
}

impl<T: PolicyStore + ?Sized> PolicyStore for &T {
    fn policy(&self, profile: Profile, addr: BluetoothAddress) -> ConnectionPolicy {
        (**self).policy(profile, addr)
    }

    fn set_policy(
        &self,
        profile: Profile,
        addr: BluetoothAddress,
        policy: ConnectionPolicy,
    ) -> Result<(), PolicyError> {
        (**self).set_policy(profile, addr, policy)
    }
}

/// In-memory policy store holding up to `N` entries
///
/// Useful on targets without persistent storage and as a cache in front of one.
/// `N` must be a power of two.
pub struct MemoryPolicyStore<M: RawMutex, const N: usize> {
    entries: Mutex<M, RefCell<FnvIndexMap<(Profile, BluetoothAddress), ConnectionPolicy, N>>>,
}

impl<M: RawMutex, const N: usize> MemoryPolicyStore<M, N> {
    /// Create an empty store
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(RefCell::new(FnvIndexMap::new())),
        }
    }

    /// Number of recorded (non-`Unknown`) entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock(|entries| entries.borrow().len())
    }

    /// No entries are recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: RawMutex, const N: usize> Default for MemoryPolicyStore<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize> PolicyStore for MemoryPolicyStore<M, N> {
    fn policy(&self, profile: Profile, addr: BluetoothAddress) -> ConnectionPolicy {
        self.entries.lock(|entries| {
            entries
                .borrow()
                .get(&(profile, addr))
                .copied()
                .unwrap_or_default()
        })
    }

    fn set_policy(
        &self,
        profile: Profile,
        addr: BluetoothAddress,
        policy: ConnectionPolicy,
    ) -> Result<(), PolicyError> {
        self.entries.lock(|entries| {
            let mut entries = entries.borrow_mut();
            if policy == ConnectionPolicy::Unknown {
                entries.remove(&(profile, addr));
                return Ok(());
            }
            entries
                .insert((profile, addr), policy)
                .map(|_| ())
                .map_err(|_| PolicyError::StorageFull)
        })
    }
}
