use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::{
    BluetoothAddress, SessionError,
    arbitrator::{Directive, Directives},
    manager::{Command, ManagerState, SessionManager},
    policy::{ConnectionPolicy, PolicyStore},
    session::{DeviceSession, Effect, SessionState, Transition},
    transport::{TransportEvent, TransportEventKind},
};

impl<M: RawMutex, P: PolicyStore> SessionManager<'_, M, P> {
    /// Handle one inbound transport event
    ///
    /// Events for a device without a session create one only when they announce a
    /// peer-initiated connection and admission allows it; a refused peer is
    /// disconnected. Anything else for an unknown device is dropped.
    pub async fn process_event(&self, event: TransportEvent) {
        let TransportEvent { addr, kind, status } = event;
        debug!("[MANAGER] {} event {:?} status {}", addr, kind, status);

        let stored = if kind.is_inbound_connection() {
            self.policies.policy(self.options.profile, addr)
        } else {
            ConnectionPolicy::Unknown
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.sessions.contains_key(&addr) {
            if state.abandoned.contains(&addr) && self.late_outcome(state, addr, kind) {
                return;
            }
            if !kind.is_inbound_connection() {
                debug!("[MANAGER] dropping {:?} for unknown {}", kind, addr);
                return;
            }
            if let Err(reason) = self.admit_inbound(state, addr, stored) {
                warn!("[MANAGER] refusing inbound {}: {:?}", addr, reason);
                self.queue(Command::Disconnect(addr));
                return;
            }
            if state
                .sessions
                .insert(addr, DeviceSession::new_incoming(addr))
                .is_err()
            {
                self.queue(Command::Disconnect(addr));
                return;
            }
            info!("[MANAGER] admitted inbound {}", addr);
        }

        let Some(session) = state.sessions.get_mut(&addr) else {
            return;
        };
        let transition = session.handle(kind.into());
        if let TransportEventKind::ConnectFailed | TransportEventKind::Disconnected = kind {
            if transition.entered_disconnected() {
                info!("[MANAGER] {} disconnected (status {})", addr, status);
            }
        }
        self.apply_transition(state, addr, &transition);
    }

    /// Outcome of a page that was cancelled while `Connecting`
    ///
    /// A late `Connected` is refused with a disconnect. A failure or disconnect closes
    /// the matter. A fresh `IncomingConnection` comes from the peer and goes through
    /// normal admission. Returns whether the event was consumed.
    fn late_outcome(
        &self,
        state: &mut ManagerState,
        addr: BluetoothAddress,
        kind: TransportEventKind,
    ) -> bool {
        match kind {
            TransportEventKind::Connected => {
                state.abandoned.remove(&addr);
                warn!("[MANAGER] {} connected after its connect was abandoned", addr);
                self.queue(Command::Disconnect(addr));
                true
            }
            TransportEventKind::ConnectFailed
            | TransportEventKind::Disconnected
            | TransportEventKind::IncomingConnection => {
                state.abandoned.remove(&addr);
                false
            }
            _ => false,
        }
    }

    /// Admission for a peer-initiated connection
    fn admit_inbound(
        &self,
        state: &ManagerState,
        addr: BluetoothAddress,
        stored: ConnectionPolicy,
    ) -> Result<(), SessionError> {
        if state.stopped {
            return Err(SessionError::Stopped);
        }
        if !self.options.accept_incoming {
            return Err(SessionError::PolicyForbidden);
        }
        if state.effective_policy(addr, stored) == ConnectionPolicy::Forbidden {
            return Err(SessionError::PolicyForbidden);
        }
        if state.sessions.len() >= self.options.capacity() {
            return Err(SessionError::CapacityExceeded);
        }
        Ok(())
    }

    /// Carry out the effects of a session transition
    ///
    /// A session that entered `Disconnected` is removed and the arbitrator is told.
    pub(crate) fn apply_transition(
        &self,
        state: &mut ManagerState,
        addr: BluetoothAddress,
        transition: &Transition,
    ) {
        for effect in &transition.effects {
            match effect {
                Effect::SendConnect => self.queue_connect(state, addr),
                Effect::SendDisconnect => {
                    self.queue(Command::Disconnect(addr));
                }
                Effect::ArmTimeout => self.arm_timeout(state, addr, transition.next),
                Effect::StreamStarted => {
                    let directives = state.arbitrator.on_stream_started(&mut state.sessions, addr);
                    self.apply_directives(state, &directives);
                }
                Effect::StreamStopped => {
                    let directives = state.arbitrator.on_stream_stopped(&mut state.sessions, addr);
                    self.apply_directives(state, &directives);
                }
            }
        }

        if transition.entered_disconnected() {
            if transition.from == SessionState::Connecting
                && transition.effects.contains(&Effect::SendDisconnect)
            {
                state.mark_abandoned(addr);
            }
            state.sessions.remove(&addr);
            debug!(
                "[MANAGER] removed {}, {} sessions left",
                addr,
                state.sessions.len()
            );
            let directives = state.arbitrator.on_session_terminated(&state.sessions, addr);
            self.apply_directives(state, &directives);
        }
    }

    /// Turn arbitrator directives into overlay updates and queued commands
    pub(crate) fn apply_directives(&self, state: &mut ManagerState, directives: &Directives) {
        for directive in directives {
            match *directive {
                Directive::Pause(addr) => {
                    self.queue(Command::Pause(addr));
                }
                Directive::SetPolicy(addr, policy) => {
                    if !state.remember_policy(addr, policy) {
                        warn!("[MANAGER] policy overlay full, {} not cached", addr);
                    }
                    self.queue(Command::PersistPolicy { addr, policy });
                }
                Directive::ActiveChanged(device) => {
                    if self.companion.is_some() {
                        self.queue(Command::NotifyActiveDevice(device));
                    }
                }
            }
        }
    }

    fn arm_timeout(&self, state: &ManagerState, addr: BluetoothAddress, entered: SessionState) {
        let after_ms = match entered {
            SessionState::Connecting => self.options.connect_timeout_ms,
            SessionState::Disconnecting => self.options.disconnect_timeout_ms,
            SessionState::Connected | SessionState::Disconnected => return,
        };
        if after_ms == 0 {
            return;
        }
        if let Some(session) = state.sessions.get(&addr) {
            self.queue(Command::ScheduleTimeout {
                addr,
                epoch: session.epoch(),
                after_ms,
            });
        }
    }
}
