#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

mod fmt;

mod address;
pub mod arbitrator;
pub mod companion;
pub mod constants;
#[cfg(feature = "hci")]
pub mod hci;
pub mod manager;
pub mod policy;
pub mod processor;
pub mod session;
#[cfg(test)]
mod testing;
pub mod transport;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_MAX_CONNECTED_DEVICES,
    MAX_SESSIONS,
};

pub use address::{AddressParseError, BluetoothAddress};
pub use arbitrator::{Directive, HandoffArbitrator};
pub use companion::CompanionProfile;
pub use manager::{Command, SessionManager};
pub use policy::{ConnectionPolicy, MemoryPolicyStore, PolicyError, PolicyStore};
pub use session::{DeviceSession, SessionEvent, SessionState};
pub use transport::{TransportError, TransportEvent, TransportEventKind, TransportGateway};

/// Peripheral-side profile a manager serves
///
/// One [`SessionManager`] instance manages the sessions of exactly one profile. The
/// profile keys the policy store, so the same device may be allowed for one profile and
/// forbidden for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Profile {
    /// Audio sink (we render audio streamed by the peer)
    #[default]
    AudioSink,
    /// Hands-free client (call audio and control towards a phone)
    HandsfreeClient,
    /// Phonebook access client
    PhonebookClient,
    /// Message access client
    MessageClient,
}

/// Session manager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionError {
    /// The device's connection policy is `Forbidden`, or incoming connections are refused
    PolicyForbidden,
    /// Admitting the device would exceed the configured number of sessions
    CapacityExceeded,
    /// No session exists for the device
    UnknownDevice,
    /// The session is in a state that does not accept the request
    InvalidState,
    /// The transport refused an outbound command
    TransportCommandFailed,
    /// The policy store could not persist a value
    PolicyPersistenceFailed,
    /// The manager was stopped
    Stopped,
}

impl SessionError {
    /// The request was refused by admission control (policy or capacity)
    #[must_use]
    pub const fn is_admission_rejected(self) -> bool {
        matches!(self, Self::PolicyForbidden | Self::CapacityExceeded)
    }
}

impl From<TransportError> for SessionError {
    fn from(_: TransportError) -> Self {
        Self::TransportCommandFailed
    }
}

impl From<PolicyError> for SessionError {
    fn from(_: PolicyError) -> Self {
        Self::PolicyPersistenceFailed
    }
}

/// Options for configuring a [`SessionManager`]
///
/// # Examples
///
/// ```rust
/// use roostbird::{ManagerOptions, Profile};
///
/// // One hands-free device at a time, no peer-initiated connections
/// let options = ManagerOptions::default()
///     .with_profile(Profile::HandsfreeClient)
///     .with_accept_incoming(false);
///
/// // Two audio sources, 10 second connect timeout
/// let audio = ManagerOptions::default()
///     .with_max_connected_devices(2)
///     .with_connect_timeout_ms(10_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ManagerOptions {
    /// Profile served by the manager
    pub profile: Profile,
    /// Maximum number of sessions admitted at once
    ///
    /// Values above [`MAX_SESSIONS`] are clamped to it.
    pub max_connected_devices: usize,
    /// Time a session may stay `Connecting` before it is abandoned (0 = wait forever)
    pub connect_timeout_ms: u32,
    /// Time a session may stay `Disconnecting` before it is dropped (0 = wait forever)
    pub disconnect_timeout_ms: u32,
    /// Admit peer-initiated connections; `false` is quiet mode
    pub accept_incoming: bool,
}

impl ManagerOptions {
    /// Set the profile
    #[must_use]
    pub const fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the maximum number of concurrently admitted sessions
    #[must_use]
    pub const fn with_max_connected_devices(mut self, max: usize) -> Self {
        self.max_connected_devices = max;
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub const fn with_connect_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    /// Set the disconnect timeout
    #[must_use]
    pub const fn with_disconnect_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.disconnect_timeout_ms = timeout_ms;
        self
    }

    /// Admit or refuse peer-initiated connections
    #[must_use]
    pub const fn with_accept_incoming(mut self, accept: bool) -> Self {
        self.accept_incoming = accept;
        self
    }

    /// Effective session limit after clamping to the table capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        if self.max_connected_devices < MAX_SESSIONS {
            self.max_connected_devices
        } else {
            MAX_SESSIONS
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            profile: Profile::AudioSink,
            max_connected_devices: DEFAULT_MAX_CONNECTED_DEVICES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            accept_incoming: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_options_default() {
        let options = ManagerOptions::default();
        assert_eq!(options.profile, Profile::AudioSink);
        assert_eq!(options.max_connected_devices, DEFAULT_MAX_CONNECTED_DEVICES);
        assert_eq!(options.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(options.disconnect_timeout_ms, DEFAULT_DISCONNECT_TIMEOUT_MS);
        assert!(options.accept_incoming);
    }

    #[test]
    fn test_manager_options_builder() {
        let options = ManagerOptions::default()
            .with_profile(Profile::PhonebookClient)
            .with_max_connected_devices(3)
            .with_connect_timeout_ms(5_000)
            .with_disconnect_timeout_ms(0)
            .with_accept_incoming(false);

        assert_eq!(options.profile, Profile::PhonebookClient);
        assert_eq!(options.max_connected_devices, 3);
        assert_eq!(options.connect_timeout_ms, 5_000);
        assert_eq!(options.disconnect_timeout_ms, 0);
        assert!(!options.accept_incoming);
        assert_eq!(options.capacity(), 3);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let options = ManagerOptions::default().with_max_connected_devices(100);
        assert_eq!(options.capacity(), MAX_SESSIONS);
    }

    #[test]
    fn test_session_error_classes() {
        assert!(SessionError::PolicyForbidden.is_admission_rejected());
        assert!(SessionError::CapacityExceeded.is_admission_rejected());
        assert!(!SessionError::UnknownDevice.is_admission_rejected());
        assert!(!SessionError::Stopped.is_admission_rejected());

        assert_eq!(
            SessionError::from(TransportError::CommandFailed(0x0C)),
            SessionError::TransportCommandFailed
        );
        assert_eq!(
            SessionError::from(PolicyError::Unavailable),
            SessionError::PolicyPersistenceFailed
        );
    }
}
