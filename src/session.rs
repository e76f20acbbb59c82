//! Per-device session state machine
//!
//! Every remote peer admitted by a [`crate::manager::SessionManager`] gets one
//! [`DeviceSession`]. The session's connection state only changes through
//! [`transition`], a pure function from `(state, event)` to the next state plus the
//! side effects the manager has to carry out (outbound commands, timers, streaming
//! notifications for the hand-off arbitrator).
//!
//! ## States
//!
//! ```text
//!                 Connect / IncomingConnection
//!   Disconnected ------------------------------> Connecting
//!        ^  ^                                      |   |
//!        |  |   ConnectFailed / Disconnect /       |   | Connected
//!        |  +---- Timeout / Disconnected ----------+   v
//!        |                                         Connected <--+
//!        |            Disconnected (peer left)         |        | Connected
//!        +---------------------------------------------+        | (peer refused)
//!        |                                             | Disconnect
//!        |   Disconnected / Timeout                    v        |
//!        +------------------------------------- Disconnecting --+
//! ```
//!
//! `Fatal` drives any state to `Disconnected`. Streaming events are only meaningful
//! while `Connected` and are ignored otherwise.

use heapless::{FnvIndexMap, Vec};

use crate::{
    BluetoothAddress,
    constants::{MAX_SESSIONS, MAX_TRANSITION_EFFECTS},
};

/// Sessions owned by one manager, keyed by device address
pub type SessionTable = FnvIndexMap<BluetoothAddress, DeviceSession, MAX_SESSIONS>;

/// Connection state of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// No connection; initial and terminal state
    #[default]
    Disconnected,
    /// Connection requested, waiting for the transport
    Connecting,
    /// Profile connection established
    Connected,
    /// Disconnection requested, waiting for the transport
    Disconnecting,
}

/// Inputs to the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEvent {
    /// Local request to connect
    Connect,
    /// Local request to disconnect
    Disconnect,
    /// Peer started connecting to us
    IncomingConnection,
    /// Transport reports the profile connection is up
    Connected,
    /// Transport reports the connection attempt failed
    ConnectFailed,
    /// Transport reports the connection is gone
    Disconnected,
    /// Audio/data started flowing
    StreamStarted,
    /// Audio/data stopped flowing
    StreamStopped,
    /// Unrecoverable transport error for this device
    Fatal,
    /// A scheduled timeout fired; `epoch` identifies the state it was armed in
    Timeout {
        /// Session epoch at the time the timer was armed
        epoch: u16,
    },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Effect {
    /// Issue an outbound connect command
    SendConnect,
    /// Issue an outbound disconnect command
    SendDisconnect,
    /// Schedule a timeout for the state just entered
    ArmTimeout,
    /// Ask the arbitrator to make this device the active streamer
    StreamStarted,
    /// Tell the arbitrator this device stopped streaming
    StreamStopped,
}

/// Result of feeding one event to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the event
    pub from: SessionState,
    /// State after the event
    pub next: SessionState,
    /// Side effects to carry out, in order
    pub effects: Vec<Effect, MAX_TRANSITION_EFFECTS>,
    /// The event had no meaning in `from` and was dropped
    pub ignored: bool,
}

impl Transition {
    fn stay(state: SessionState) -> Self {
        Self {
            from: state,
            next: state,
            effects: Vec::new(),
            ignored: true,
        }
    }

    fn go(from: SessionState, next: SessionState) -> Self {
        Self {
            from,
            next,
            effects: Vec::new(),
            ignored: false,
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect).ok();
        self
    }

    /// The state changed
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.next
    }

    /// The session just entered its terminal state
    #[must_use]
    pub fn entered_disconnected(&self) -> bool {
        self.changed() && self.next == SessionState::Disconnected
    }
}

/// Pure transition function of the session state machine
#[must_use]
pub fn transition(state: SessionState, event: SessionEvent) -> Transition {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Disconnected, E::Fatal) => Transition::stay(state),
        (_, E::Fatal) => Transition::go(state, S::Disconnected),

        (S::Disconnected, E::Connect) => Transition::go(state, S::Connecting)
            .with(Effect::SendConnect)
            .with(Effect::ArmTimeout),
        (S::Disconnected, E::IncomingConnection) => {
            Transition::go(state, S::Connecting).with(Effect::ArmTimeout)
        }
        (S::Disconnected, E::Connected) => Transition::go(state, S::Connected),

        (S::Connecting, E::Connected) => Transition::go(state, S::Connected),
        (S::Connecting, E::ConnectFailed | E::Disconnected) => {
            Transition::go(state, S::Disconnected)
        }
        (S::Connecting, E::Disconnect | E::Timeout { .. }) => {
            Transition::go(state, S::Disconnected).with(Effect::SendDisconnect)
        }

        (S::Connected, E::Disconnect) => Transition::go(state, S::Disconnecting)
            .with(Effect::SendDisconnect)
            .with(Effect::ArmTimeout),
        (S::Connected, E::Disconnected) => Transition::go(state, S::Disconnected),
        (S::Connected, E::StreamStarted) => Transition {
            ignored: false,
            ..Transition::stay(state)
        }
        .with(Effect::StreamStarted),
        (S::Connected, E::StreamStopped) => Transition {
            ignored: false,
            ..Transition::stay(state)
        }
        .with(Effect::StreamStopped),

        (S::Disconnecting, E::Disconnected | E::ConnectFailed | E::Timeout { .. }) => {
            Transition::go(state, S::Disconnected)
        }
        (S::Disconnecting, E::Connected) => Transition::go(state, S::Connected),

        _ => Transition::stay(state),
    }
}

/// One remote device's profile connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    addr: BluetoothAddress,
    state: SessionState,
    streaming: bool,
    epoch: u16,
    incoming: bool,
    connect_retry: bool,
}

impl DeviceSession {
    /// Create a session for a locally requested connection
    #[must_use]
    pub fn new(addr: BluetoothAddress) -> Self {
        Self {
            addr,
            state: SessionState::Disconnected,
            streaming: false,
            epoch: 0,
            incoming: false,
            connect_retry: false,
        }
    }

    /// Create a session for a peer-initiated connection
    #[must_use]
    pub fn new_incoming(addr: BluetoothAddress) -> Self {
        Self {
            incoming: true,
            ..Self::new(addr)
        }
    }

    /// Remote device address
    #[must_use]
    pub const fn address(&self) -> BluetoothAddress {
        self.addr
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Audio/data is flowing for this device
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Counter bumped on every state change, stamped on scheduled timeouts
    #[must_use]
    pub const fn epoch(&self) -> u16 {
        self.epoch
    }

    /// The peer initiated this session
    #[must_use]
    pub const fn is_incoming(&self) -> bool {
        self.incoming
    }

    #[must_use]
    pub(crate) const fn needs_connect_retry(&self) -> bool {
        self.connect_retry
    }

    pub(crate) fn set_connect_retry(&mut self, retry: bool) {
        self.connect_retry = retry;
    }

    /// Only the hand-off arbitrator calls this
    pub(crate) fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    /// Feed one event through the state machine and apply the resulting state
    pub fn handle(&mut self, event: SessionEvent) -> Transition {
        if let SessionEvent::Timeout { epoch } = event {
            if epoch != self.epoch {
                trace!(
                    "[SESSION] {} stale timeout (armed {}, now {})",
                    self.addr,
                    epoch,
                    self.epoch
                );
                return Transition::stay(self.state);
            }
        }

        let transition = transition(self.state, event);
        if transition.ignored {
            debug!(
                "[SESSION] {} ignored {:?} in {:?}",
                self.addr,
                event,
                self.state
            );
        } else if transition.changed() {
            debug!(
                "[SESSION] {} {:?} -> {:?} on {:?}",
                self.addr,
                transition.from,
                transition.next,
                event
            );
            self.state = transition.next;
            self.epoch = self.epoch.wrapping_add(1);
            self.connect_retry = false;
            if self.state == SessionState::Disconnected {
                self.streaming = false;
            }
        }
        transition
    }
}
