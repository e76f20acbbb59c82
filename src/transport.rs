//! Transport gateway boundary
//!
//! The native profile engine (AVDTP/RFCOMM/OBEX stack, or an HCI controller) sits behind
//! [`TransportGateway`]. The manager never waits for a transport round-trip: outbound
//! commands are fire-and-forget and their outcome comes back later as a
//! [`TransportEvent`] posted to [`crate::manager::SessionManager::post_event`].

use crate::{BluetoothAddress, session::SessionEvent};

/// What happened on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEventKind {
    /// Peer started a connection towards us
    IncomingConnection,
    /// Profile connection is up
    Connected,
    /// Profile connection is gone (peer left or local disconnect confirmed)
    Disconnected,
    /// Connection attempt failed
    ConnectFailed,
    /// Audio/data started flowing
    StreamStarted,
    /// Audio/data stopped flowing
    StreamStopped,
    /// Unrecoverable error on this device's link
    Fatal,
    /// A timeout scheduled through [`TransportGateway::schedule_timeout`] fired
    Timeout {
        /// Epoch passed to `schedule_timeout`
        epoch: u16,
    },
}

impl TransportEventKind {
    /// The event can create a session for a device the manager does not know yet
    #[must_use]
    pub const fn is_inbound_connection(self) -> bool {
        matches!(self, Self::IncomingConnection | Self::Connected)
    }
}

impl From<TransportEventKind> for SessionEvent {
    fn from(kind: TransportEventKind) -> Self {
        match kind {
            TransportEventKind::IncomingConnection => SessionEvent::IncomingConnection,
            TransportEventKind::Connected => SessionEvent::Connected,
            TransportEventKind::Disconnected => SessionEvent::Disconnected,
            TransportEventKind::ConnectFailed => SessionEvent::ConnectFailed,
            TransportEventKind::StreamStarted => SessionEvent::StreamStarted,
            TransportEventKind::StreamStopped => SessionEvent::StreamStopped,
            TransportEventKind::Fatal => SessionEvent::Fatal,
            TransportEventKind::Timeout { epoch } => SessionEvent::Timeout { epoch },
        }
    }
}

/// One inbound event, delivered in order per device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransportEvent {
    /// Device the event is about
    pub addr: BluetoothAddress,
    /// What happened
    pub kind: TransportEventKind,
    /// Transport status or reason code (0 = success / unspecified)
    pub status: u8,
}

impl TransportEvent {
    /// Create an event with a zero status
    #[must_use]
    pub const fn new(addr: BluetoothAddress, kind: TransportEventKind) -> Self {
        Self {
            addr,
            kind,
            status: 0,
        }
    }

    /// Attach a transport status or reason code
    #[must_use]
    pub const fn with_status(mut self, status: u8) -> Self {
        self.status = status;
        self
    }
}

/// Outbound command failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The transport cannot perform this command
    Unsupported,
    /// No link exists for the device
    UnknownLink,
    /// The transport rejected the command with a status code
    CommandFailed(u8),
    /// The transport is temporarily unable to accept commands
    Busy,
}

/// Outbound side of the native profile engine
///
/// All methods are fire-and-forget from the manager's point of view: `Ok` means the
/// command was accepted, not that it completed.
#[allow(async_fn_in_trait)]
pub trait TransportGateway {
    /// Start connecting the profile to `addr`
    async fn send_connect(&self, addr: BluetoothAddress) -> Result<(), TransportError>;

    /// Tear down the profile connection to `addr` (also used to refuse inbound links)
    async fn send_disconnect(&self, addr: BluetoothAddress) -> Result<(), TransportError>;

    /// Ask `addr` to pause its audio/data stream
    async fn send_pause(&self, addr: BluetoothAddress) -> Result<(), TransportError>;

    /// Post `TransportEventKind::Timeout { epoch }` for `addr` after `after_ms`
    ///
    /// Gateways without a timer keep the default, and sessions then wait for the
    /// transport indefinitely.
    async fn schedule_timeout(
        &self,
        addr: BluetoothAddress,
        epoch: u16,
        after_ms: u32,
    ) -> Result<(), TransportError> {
        let _ = (addr, epoch, after_ms);
        Ok(())
    }
}

impl<G: TransportGateway + ?Sized> TransportGateway for &G {
    async fn send_connect(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        (**self).send_connect(addr).await
    }

    async fn send_disconnect(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        (**self).send_disconnect(addr).await
    }

    async fn send_pause(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        (**self).send_pause(addr).await
    }

    async fn schedule_timeout(
        &self,
        addr: BluetoothAddress,
        epoch: u16,
        after_ms: u32,
    ) -> Result<(), TransportError> {
        (**self).schedule_timeout(addr, epoch, after_ms).await
    }
}
