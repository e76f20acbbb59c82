//! Session Manager
//!
//! [`SessionManager`] owns every [`DeviceSession`] of one profile, enforces admission
//! (connection policy, capacity, quiet mode) and routes transport events into the
//! session state machines and the hand-off arbitrator.
//!
//! ## Architecture
//!
//! All mutable state (session table, arbitrator, pending policy overlay) lives behind a
//! single async mutex. Nothing slow ever runs while it is held:
//!
//! 1. Public API calls and [`SessionManager::process_event`] take the lock, drive the
//!    state machines and queue [`Command`]s with `try_send`.
//! 2. The command processor (see [`crate::processor`]) executes the queued commands
//!    against the [`TransportGateway`](crate::TransportGateway), the [`PolicyStore`] and
//!    the optional [`CompanionProfile`] with the lock released.
//! 3. Transport outcomes come back as [`TransportEvent`]s through
//!    [`SessionManager::post_event`] and are processed one at a time by the event
//!    processor.
//!
//! ## Usage
//!
//! ```rust,ignore
//! static POLICIES: MemoryPolicyStore<CriticalSectionRawMutex, 16> = MemoryPolicyStore::new();
//!
//! let manager = SessionManager::<CriticalSectionRawMutex, _>::new(
//!     ManagerOptions::default().with_max_connected_devices(2),
//!     &POLICIES,
//!     None,
//! );
//!
//! // Spawned alongside the application
//! roostbird::processor::run(&manager, &gateway).await;
//!
//! // Anywhere else
//! manager.connect(addr).await?;
//! ```

mod command_processor;
mod event_processor;

use embassy_sync::{blocking_mutex::raw::RawMutex, channel::Channel, mutex::Mutex};
use heapless::{FnvIndexMap, FnvIndexSet, Vec};

use crate::{
    BluetoothAddress, ManagerOptions, SessionError,
    arbitrator::HandoffArbitrator,
    companion::CompanionProfile,
    constants::{COMMAND_QUEUE_DEPTH, EVENT_QUEUE_DEPTH, MAX_SESSIONS, POLICY_OVERLAY_CAPACITY},
    policy::{ConnectionPolicy, PolicyStore},
    session::{DeviceSession, SessionEvent, SessionState, SessionTable},
    transport::TransportEvent,
};

/// Outbound work queued by the manager, executed by the command processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Connect the profile to a device
    Connect(BluetoothAddress),
    /// Disconnect the profile from a device (or refuse its inbound connection)
    Disconnect(BluetoothAddress),
    /// Pause a device's stream
    Pause(BluetoothAddress),
    /// Ask the transport to post a timeout event later
    ScheduleTimeout {
        /// Device the timeout belongs to
        addr: BluetoothAddress,
        /// Session epoch the timeout was armed in
        epoch: u16,
        /// Delay in milliseconds
        after_ms: u32,
    },
    /// Persist a policy decided by the hand-off arbitrator
    PersistPolicy {
        /// Device the policy belongs to
        addr: BluetoothAddress,
        /// Policy value
        policy: ConnectionPolicy,
    },
    /// Tell the companion profile the active device changed
    NotifyActiveDevice(Option<BluetoothAddress>),
    /// Tell the companion profile a device was forgotten
    NotifyDeviceForgotten(BluetoothAddress),
}

/// State guarded by the manager lock
#[derive(Debug, Default)]
pub(crate) struct ManagerState {
    pub(crate) sessions: SessionTable,
    pub(crate) arbitrator: HandoffArbitrator,
    /// Policies decided in memory that are not persisted yet
    pub(crate) overlay: FnvIndexMap<BluetoothAddress, ConnectionPolicy, POLICY_OVERLAY_CAPACITY>,
    /// Devices whose page was cancelled while still `Connecting`
    pub(crate) abandoned: FnvIndexSet<BluetoothAddress, MAX_SESSIONS>,
    pub(crate) stopped: bool,
}

impl ManagerState {
    /// Policy as the manager sees it: pending in-memory value first, then the store
    fn effective_policy(&self, addr: BluetoothAddress, stored: ConnectionPolicy) -> ConnectionPolicy {
        self.overlay.get(&addr).copied().unwrap_or(stored)
    }

    /// Cache an unpersisted policy
    ///
    /// When the overlay is full, entries of devices without a session are evicted
    /// first. The overlay holds more entries than there can be sessions, so this
    /// always makes room.
    fn remember_policy(&mut self, addr: BluetoothAddress, policy: ConnectionPolicy) -> bool {
        if self.overlay.insert(addr, policy).is_ok() {
            return true;
        }
        let idle: Vec<BluetoothAddress, POLICY_OVERLAY_CAPACITY> = self
            .overlay
            .keys()
            .filter(|device| !self.sessions.contains_key(*device))
            .copied()
            .collect();
        for device in &idle {
            self.overlay.remove(device);
        }
        debug!("[MANAGER] evicted {} idle overlay entries", idle.len());
        self.overlay.insert(addr, policy).is_ok()
    }

    /// Remember that the page to `addr` was cancelled, so a late `Connected` is refused
    fn mark_abandoned(&mut self, addr: BluetoothAddress) {
        if self.abandoned.insert(addr).is_err() {
            self.abandoned.clear();
            self.abandoned.insert(addr).ok();
        }
    }
}

/// Multi-device profile session manager
///
/// `M` selects the raw mutex backing the lock and the queues:
/// `CriticalSectionRawMutex` when tasks run on several executors or threads,
/// `NoopRawMutex` when everything runs on one executor.
pub struct SessionManager<'a, M: RawMutex, P: PolicyStore> {
    options: ManagerOptions,
    policies: P,
    companion: Option<&'a (dyn CompanionProfile + Sync)>,
    state: Mutex<M, ManagerState>,
    events: Channel<M, TransportEvent, EVENT_QUEUE_DEPTH>,
    commands: Channel<M, Command, COMMAND_QUEUE_DEPTH>,
}

impl<'a, M: RawMutex, P: PolicyStore> SessionManager<'a, M, P> {
    /// Create a manager
    ///
    /// `companion` is notified about active-device changes and forgotten devices when
    /// present.
    #[must_use]
    pub fn new(
        options: ManagerOptions,
        policies: P,
        companion: Option<&'a (dyn CompanionProfile + Sync)>,
    ) -> Self {
        Self {
            options,
            policies,
            companion,
            state: Mutex::new(ManagerState::default()),
            events: Channel::new(),
            commands: Channel::new(),
        }
    }

    /// Options the manager was created with
    #[must_use]
    pub const fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Request a profile connection to `addr`
    ///
    /// Returns as soon as the connect command is queued; the outcome arrives later as a
    /// transport event. Repeated calls while the session is `Connecting` or `Connected`
    /// succeed without creating a second session.
    ///
    /// # Errors
    /// * `Stopped` - the manager was stopped
    /// * `PolicyForbidden` - the device's policy is `Forbidden`
    /// * `InvalidState` - the session is `Disconnecting`
    /// * `CapacityExceeded` - no room for another session
    pub async fn connect(&self, addr: BluetoothAddress) -> Result<(), SessionError> {
        let stored = self.policies.policy(self.options.profile, addr);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.stopped {
            return Err(SessionError::Stopped);
        }
        if state.effective_policy(addr, stored) == ConnectionPolicy::Forbidden {
            warn!("[MANAGER] connect {} refused: policy forbidden", addr);
            return Err(SessionError::PolicyForbidden);
        }

        if let Some(session) = state.sessions.get_mut(&addr) {
            return match session.state() {
                SessionState::Connecting => {
                    if session.needs_connect_retry() {
                        info!("[MANAGER] re-issuing connect to {}", addr);
                        session.set_connect_retry(false);
                        self.queue_connect(state, addr);
                    }
                    Ok(())
                }
                SessionState::Connected => Ok(()),
                SessionState::Disconnecting | SessionState::Disconnected => {
                    Err(SessionError::InvalidState)
                }
            };
        }

        if state.sessions.len() >= self.options.capacity() {
            warn!(
                "[MANAGER] connect {} refused: {} of {} sessions in use",
                addr,
                state.sessions.len(),
                self.options.capacity()
            );
            return Err(SessionError::CapacityExceeded);
        }

        state.abandoned.remove(&addr);
        let mut session = DeviceSession::new(addr);
        let transition = session.handle(SessionEvent::Connect);
        state
            .sessions
            .insert(addr, session)
            .map_err(|_| SessionError::CapacityExceeded)?;
        info!("[MANAGER] connecting {}", addr);
        self.apply_transition(state, addr, &transition);
        Ok(())
    }

    /// Request disconnection of `addr`
    ///
    /// A `Connected` session moves to `Disconnecting` and is removed once the transport
    /// confirms. A `Connecting` session is abandoned and removed immediately; a
    /// `Connected` report that still arrives for it afterwards is refused.
    ///
    /// # Errors
    /// * `UnknownDevice` - no session for the device
    /// * `InvalidState` - the session is already `Disconnecting`
    pub async fn disconnect(&self, addr: BluetoothAddress) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(session) = state.sessions.get_mut(&addr) else {
            debug!("[MANAGER] disconnect {}: no session", addr);
            return Err(SessionError::UnknownDevice);
        };
        if session.state() == SessionState::Disconnecting {
            return Err(SessionError::InvalidState);
        }

        info!("[MANAGER] disconnecting {}", addr);
        let transition = session.handle(SessionEvent::Disconnect);
        self.apply_transition(state, addr, &transition);
        Ok(())
    }

    /// Queue an inbound transport event, waiting while the queue is full
    pub async fn post_event(&self, event: TransportEvent) {
        self.events.send(event).await;
    }

    /// Queue an inbound transport event without waiting
    ///
    /// # Errors
    /// Gives the event back when the queue is full.
    pub fn try_post_event(&self, event: TransportEvent) -> Result<(), TransportEvent> {
        self.events.try_send(event).map_err(|e| match e {
            embassy_sync::channel::TrySendError::Full(event) => event,
        })
    }

    /// Wait for the next queued transport event
    pub async fn next_event(&self) -> TransportEvent {
        self.events.receive().await
    }

    /// Wait for the next queued command
    pub async fn next_command(&self) -> Command {
        self.commands.receive().await
    }

    /// Take the next queued command, if any
    pub fn try_next_command(&self) -> Option<Command> {
        self.commands.try_receive().ok()
    }

    /// Connection state of `addr`, `Disconnected` when there is no session
    pub async fn connection_state(&self, addr: BluetoothAddress) -> SessionState {
        self.state
            .lock()
            .await
            .sessions
            .get(&addr)
            .map_or(SessionState::Disconnected, DeviceSession::state)
    }

    /// Devices whose session is in any of `states`, in admission order
    ///
    /// `Disconnected` never matches: such sessions are not kept.
    pub async fn devices_matching_states(
        &self,
        states: &[SessionState],
    ) -> Vec<BluetoothAddress, MAX_SESSIONS> {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|session| states.contains(&session.state()))
            .map(DeviceSession::address)
            .collect()
    }

    /// Devices with a `Connected` session
    pub async fn connected_devices(&self) -> Vec<BluetoothAddress, MAX_SESSIONS> {
        self.devices_matching_states(&[SessionState::Connected])
            .await
    }

    /// Number of sessions currently held
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Device currently holding the active streaming role
    pub async fn active_device(&self) -> Option<BluetoothAddress> {
        self.state.lock().await.arbitrator.active_device()
    }

    /// `addr` is streaming audio/data
    pub async fn is_streaming(&self, addr: BluetoothAddress) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .get(&addr)
            .is_some_and(DeviceSession::is_streaming)
    }

    /// Effective connection policy of `addr`
    pub async fn connection_policy(&self, addr: BluetoothAddress) -> ConnectionPolicy {
        let pending = self.state.lock().await.overlay.get(&addr).copied();
        pending.unwrap_or_else(|| self.policies.policy(self.options.profile, addr))
    }

    /// Persist a connection policy and act on it
    ///
    /// `Allowed` connects the device and `Forbidden` disconnects it. The outcome of
    /// that follow-up is logged, not returned.
    ///
    /// # Errors
    /// Returns `PolicyPersistenceFailed` when the store rejects the value; nothing else
    /// happens in that case.
    pub async fn set_connection_policy(
        &self,
        addr: BluetoothAddress,
        policy: ConnectionPolicy,
    ) -> Result<(), SessionError> {
        self.policies
            .set_policy(self.options.profile, addr, policy)
            .map_err(|e| {
                warn!("[MANAGER] storing {:?} for {} failed: {:?}", policy, addr, e);
                SessionError::from(e)
            })?;
        self.state.lock().await.overlay.remove(&addr);
        info!("[MANAGER] policy of {} set to {:?}", addr, policy);

        let follow_up = match policy {
            ConnectionPolicy::Allowed => self.connect(addr).await,
            ConnectionPolicy::Forbidden => self.disconnect(addr).await,
            ConnectionPolicy::Unknown => Ok(()),
        };
        if let Err(e) = follow_up {
            debug!("[MANAGER] policy follow-up for {}: {:?}", addr, e);
        }
        Ok(())
    }

    /// Drop everything remembered about a device that is no longer bonded
    ///
    /// # Errors
    /// Returns `InvalidState` while the device still has a session; disconnect it first.
    pub async fn forget_device(&self, addr: BluetoothAddress) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        if guard.sessions.contains_key(&addr) {
            return Err(SessionError::InvalidState);
        }
        guard.overlay.remove(&addr);
        if self.companion.is_some() {
            self.queue(Command::NotifyDeviceForgotten(addr));
        }
        info!("[MANAGER] forgot {}", addr);
        Ok(())
    }

    /// Stop the manager
    ///
    /// Every live session is disconnected and removed, the active device is cleared and
    /// further `connect` calls and inbound connections are refused.
    pub async fn stop(&self) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.stopped {
            return;
        }
        state.stopped = true;

        let directives = state.arbitrator.reset(&mut state.sessions);
        self.apply_directives(state, &directives);

        for session in state.sessions.values() {
            if session.state() != SessionState::Disconnected {
                self.queue(Command::Disconnect(session.address()));
            }
        }
        info!("[MANAGER] stopped, dropped {} sessions", state.sessions.len());
        state.sessions.clear();
    }

    /// The manager was stopped
    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    /// Queue a command; the lock may be held, so this never waits
    fn queue(&self, command: Command) -> bool {
        if self.commands.try_send(command).is_err() {
            error!("[MANAGER] command queue full, dropped {:?}", command);
            return false;
        }
        true
    }

    /// Queue a connect, remembering to retry it when the queue is full
    fn queue_connect(&self, state: &mut ManagerState, addr: BluetoothAddress) {
        if !self.queue(Command::Connect(addr)) {
            if let Some(session) = state.sessions.get_mut(&addr) {
                session.set_connect_retry(true);
            }
        }
    }
}
