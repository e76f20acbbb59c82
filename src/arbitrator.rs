//! Active-device hand-off
//!
//! At most one session per manager may stream at a time. The [`HandoffArbitrator`]
//! owns that decision: it is the only place that flips a session's streaming flag and
//! it records which device is currently active.
//!
//! The arbitrator runs inside the manager's lock and never talks to the transport or
//! the policy store itself. Each step returns [`Directive`]s that the manager turns
//! into queued commands, so a hand-off is complete (flags, active device, in-memory
//! policy) before the next event is looked at.

use heapless::Vec;

use crate::{
    BluetoothAddress, constants::MAX_DIRECTIVES, policy::ConnectionPolicy,
    session::SessionState, session::SessionTable,
};

/// Work the manager has to carry out after an arbitration step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Directive {
    /// Ask the device to pause its stream
    Pause(BluetoothAddress),
    /// Record a new policy for the device
    SetPolicy(BluetoothAddress, ConnectionPolicy),
    /// The active device changed
    ActiveChanged(Option<BluetoothAddress>),
}

/// Directives produced by one arbitration step, in execution order
pub type Directives = Vec<Directive, MAX_DIRECTIVES>;

/// Tracks the single active streaming device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandoffArbitrator {
    active: Option<BluetoothAddress>,
}

impl HandoffArbitrator {
    /// Create an arbitrator with no active device
    #[must_use]
    pub const fn new() -> Self {
        Self { active: None }
    }

    /// Device currently holding the active streaming role
    #[must_use]
    pub const fn active_device(&self) -> Option<BluetoothAddress> {
        self.active
    }

    /// `addr` reported that it started streaming
    ///
    /// The caller has already checked that the session is `Connected`.
    pub fn on_stream_started(
        &mut self,
        sessions: &mut SessionTable,
        addr: BluetoothAddress,
    ) -> Directives {
        let mut directives = Directives::new();

        match self.active {
            Some(active) if active == addr => {
                trace!("[ARBITRATOR] {} already active", addr);
            }
            Some(previous) => {
                info!("[ARBITRATOR] hand-off {} -> {}", previous, addr);
                directives.push(Directive::Pause(previous)).ok();
                if let Some(session) = sessions.get_mut(&previous) {
                    session.set_streaming(false);
                }
                directives
                    .push(Directive::SetPolicy(previous, ConnectionPolicy::Unknown))
                    .ok();
                self.promote(sessions, addr, &mut directives);
            }
            None => {
                info!("[ARBITRATOR] {} becomes active", addr);
                self.promote(sessions, addr, &mut directives);
            }
        }

        directives
    }

    /// `addr` reported that it stopped streaming
    ///
    /// Policies are left alone: only a hand-off to another device rewrites them.
    pub fn on_stream_stopped(
        &mut self,
        sessions: &mut SessionTable,
        addr: BluetoothAddress,
    ) -> Directives {
        let mut directives = Directives::new();

        if let Some(session) = sessions.get_mut(&addr) {
            session.set_streaming(false);
        }
        if self.active == Some(addr) {
            info!("[ARBITRATOR] {} stopped streaming, no active device", addr);
            self.active = None;
            directives.push(Directive::ActiveChanged(None)).ok();
        }

        directives
    }

    /// `addr` reached `Disconnected` and has already been removed from `sessions`
    ///
    /// When the departing device was active and exactly one other device is still
    /// connected, that device becomes the preferred one. It is not made active: that
    /// waits for its own stream to start.
    pub fn on_session_terminated(
        &mut self,
        sessions: &SessionTable,
        addr: BluetoothAddress,
    ) -> Directives {
        let mut directives = Directives::new();
        if self.active != Some(addr) {
            return directives;
        }

        self.active = None;
        directives.push(Directive::ActiveChanged(None)).ok();

        let mut connected = sessions
            .values()
            .filter(|session| session.state() == SessionState::Connected);
        if let (Some(survivor), None) = (connected.next(), connected.next()) {
            info!(
                "[ARBITRATOR] active {} left, preferring {}",
                addr,
                survivor.address()
            );
            directives
                .push(Directive::SetPolicy(
                    survivor.address(),
                    ConnectionPolicy::Allowed,
                ))
                .ok();
        } else {
            info!("[ARBITRATOR] active {} left", addr);
        }

        directives
    }

    /// Drop the active device without touching policies (manager shutdown)
    pub fn reset(&mut self, sessions: &mut SessionTable) -> Directives {
        let mut directives = Directives::new();
        for session in sessions.values_mut() {
            session.set_streaming(false);
        }
        if self.active.take().is_some() {
            directives.push(Directive::ActiveChanged(None)).ok();
        }
        directives
    }

    fn promote(
        &mut self,
        sessions: &mut SessionTable,
        addr: BluetoothAddress,
        directives: &mut Directives,
    ) {
        if let Some(session) = sessions.get_mut(&addr) {
            session.set_streaming(true);
        }
        self.active = Some(addr);
        directives
            .push(Directive::SetPolicy(addr, ConnectionPolicy::Allowed))
            .ok();
        directives.push(Directive::ActiveChanged(Some(addr))).ok();
    }
}
