use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::{
    BluetoothAddress, SessionError,
    manager::{Command, SessionManager},
    policy::{ConnectionPolicy, PolicyStore},
    session::SessionState,
    transport::TransportGateway,
};

impl<M: RawMutex, P: PolicyStore> SessionManager<'_, M, P> {
    /// Execute one queued command with the manager lock released
    ///
    /// # Errors
    /// Returns the mapped transport or policy-store error. The manager has already
    /// recorded what it needs (connect retry, pending policy) when this returns.
    pub async fn execute_command<G: TransportGateway>(
        &self,
        command: Command,
        gateway: &G,
    ) -> Result<(), SessionError> {
        match command {
            Command::Connect(addr) => {
                if let Err(e) = gateway.send_connect(addr).await {
                    warn!("[MANAGER] connect command to {} failed: {:?}", addr, e);
                    self.connect_command_failed(addr).await;
                    return Err(e.into());
                }
                debug!("[MANAGER] connect command sent to {}", addr);
            }
            Command::Disconnect(addr) => {
                gateway.send_disconnect(addr).await.map_err(|e| {
                    warn!("[MANAGER] disconnect command to {} failed: {:?}", addr, e);
                    SessionError::from(e)
                })?;
                debug!("[MANAGER] disconnect command sent to {}", addr);
            }
            Command::Pause(addr) => {
                gateway.send_pause(addr).await.map_err(|e| {
                    warn!("[MANAGER] pause command to {} failed: {:?}", addr, e);
                    SessionError::from(e)
                })?;
                debug!("[MANAGER] pause command sent to {}", addr);
            }
            Command::ScheduleTimeout {
                addr,
                epoch,
                after_ms,
            } => {
                gateway
                    .schedule_timeout(addr, epoch, after_ms)
                    .await
                    .map_err(|e| {
                        warn!("[MANAGER] timeout for {} not scheduled: {:?}", addr, e);
                        SessionError::from(e)
                    })?;
            }
            Command::PersistPolicy { addr, policy } => {
                if !self.policy_pending(addr, policy).await {
                    debug!("[MANAGER] {:?} for {} superseded, not persisted", policy, addr);
                    return Ok(());
                }
                self.policies
                    .set_policy(self.options.profile, addr, policy)
                    .map_err(|e| {
                        warn!(
                            "[MANAGER] persisting {:?} for {} failed: {:?}, keeping it in memory",
                            policy,
                            addr,
                            e
                        );
                        SessionError::from(e)
                    })?;
                self.policy_persisted(addr, policy).await;
            }
            Command::NotifyActiveDevice(device) => {
                if let Some(companion) = self.companion {
                    companion.active_device_changed(self.options.profile, device);
                }
            }
            Command::NotifyDeviceForgotten(addr) => {
                if let Some(companion) = self.companion {
                    companion.device_forgotten(self.options.profile, addr);
                }
            }
        }
        Ok(())
    }

    /// The connect command never reached the transport; the next `connect()` retries it
    async fn connect_command_failed(&self, addr: BluetoothAddress) {
        if let Some(session) = self.state.lock().await.sessions.get_mut(&addr) {
            if session.state() == SessionState::Connecting {
                session.set_connect_retry(true);
            }
        }
    }

    /// `policy` is still the unpersisted value for `addr`
    ///
    /// A later hand-off, `set_connection_policy` or `forget_device` replaces or clears
    /// the overlay entry, and the queued write must not overwrite that.
    async fn policy_pending(&self, addr: BluetoothAddress, policy: ConnectionPolicy) -> bool {
        self.state.lock().await.overlay.get(&addr) == Some(&policy)
    }

    /// Drop the pending overlay entry unless a newer value replaced it meanwhile
    async fn policy_persisted(&self, addr: BluetoothAddress, policy: ConnectionPolicy) {
        let mut state = self.state.lock().await;
        if state.overlay.get(&addr) == Some(&policy) {
            state.overlay.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use crate::{
        ManagerOptions, Profile, SessionError,
        manager::{Command, SessionManager},
        policy::{ConnectionPolicy, MemoryPolicyStore, PolicyStore},
        session::SessionState,
        testing::{
            D1, D2, FailingPolicyStore, GatewayCall, RecordingCompanion, RecordingGateway, drain,
            event,
        },
        transport::{TransportError, TransportEventKind},
    };
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type Store = MemoryPolicyStore<NoopRawMutex, 16>;

    async fn execute_all<P: PolicyStore>(
        manager: &SessionManager<'_, NoopRawMutex, P>,
        gateway: &RecordingGateway,
    ) {
        for command in drain(manager) {
            manager.execute_command(command, gateway).await.ok();
        }
    }

    #[test]
    fn test_commands_reach_gateway() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            let manager: SessionManager<'_, NoopRawMutex, _> =
                SessionManager::new(ManagerOptions::default(), &store, None);

            manager.connect(D1).await.unwrap();
            execute_all(&manager, &gateway).await;
            assert_eq!(
                gateway.calls(),
                [
                    GatewayCall::Connect(D1),
                    GatewayCall::Timeout(D1, 1, crate::constants::DEFAULT_CONNECT_TIMEOUT_MS),
                ]
            );
        });
    }

    #[test]
    fn test_failed_connect_is_retried_by_next_connect() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            gateway.fail_with(TransportError::Busy);
            let manager: SessionManager<'_, NoopRawMutex, _> =
                SessionManager::new(ManagerOptions::default(), &store, None);

            manager.connect(D1).await.unwrap();
            let connect = drain(&manager)[0];
            assert_eq!(
                manager.execute_command(connect, &gateway).await,
                Err(SessionError::TransportCommandFailed)
            );
            // The session keeps waiting
            assert_eq!(manager.connection_state(D1).await, SessionState::Connecting);

            gateway.recover();
            manager.connect(D1).await.unwrap();
            assert_eq!(drain(&manager), [Command::Connect(D1)]);
            execute_all(&manager, &gateway).await;
            manager.connect(D1).await.unwrap();
            assert!(drain(&manager).is_empty());
        });
    }

    #[test]
    fn test_persisted_policy_leaves_overlay() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            let manager: SessionManager<'_, NoopRawMutex, _> = SessionManager::new(
                ManagerOptions::default().with_max_connected_devices(2),
                &store,
                None,
            );
            for addr in [D1, D2] {
                manager.connect(addr).await.unwrap();
                manager
                    .process_event(event(addr, TransportEventKind::Connected))
                    .await;
            }
            manager
                .process_event(event(D1, TransportEventKind::StreamStarted))
                .await;
            manager
                .process_event(event(D2, TransportEventKind::StreamStarted))
                .await;
            execute_all(&manager, &gateway).await;

            assert!(gateway.calls().contains(&GatewayCall::Pause(D1)));
            assert!(manager.state.lock().await.overlay.is_empty());
            assert_eq!(
                store.policy(Profile::AudioSink, D1),
                ConnectionPolicy::Unknown
            );
            assert_eq!(
                store.policy(Profile::AudioSink, D2),
                ConnectionPolicy::Allowed
            );
        });
    }

    #[test]
    fn test_persistence_failure_keeps_memory_value() {
        block_on(async {
            let store = FailingPolicyStore::new(ConnectionPolicy::Forbidden);
            let gateway = RecordingGateway::new();
            let manager: SessionManager<'_, NoopRawMutex, _> =
                SessionManager::new(ManagerOptions::default(), &store, None);

            // The stored policy refuses inbound links
            manager
                .process_event(event(D1, TransportEventKind::Connected))
                .await;
            assert_eq!(manager.session_count().await, 0);
            drain(&manager);

            // A hand-off decision made in memory wins over the store while unpersisted
            manager
                .state
                .lock()
                .await
                .overlay
                .insert(D1, ConnectionPolicy::Allowed)
                .unwrap();
            let persist = Command::PersistPolicy {
                addr: D1,
                policy: ConnectionPolicy::Allowed,
            };
            assert_eq!(
                manager.execute_command(persist, &gateway).await,
                Err(SessionError::PolicyPersistenceFailed)
            );
            assert_eq!(
                manager.connection_policy(D1).await,
                ConnectionPolicy::Allowed
            );
            assert_eq!(manager.connect(D1).await, Ok(()));
        });
    }

    #[test]
    fn test_explicit_policy_wins_over_queued_handoff_write() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            let manager: SessionManager<'_, NoopRawMutex, _> =
                SessionManager::new(ManagerOptions::default(), &store, None);

            manager.connect(D1).await.unwrap();
            manager
                .process_event(event(D1, TransportEventKind::Connected))
                .await;
            manager
                .process_event(event(D1, TransportEventKind::StreamStarted))
                .await;
            let queued = drain(&manager);
            assert!(queued.contains(&Command::PersistPolicy {
                addr: D1,
                policy: ConnectionPolicy::Allowed,
            }));

            // The user forbids the device before the hand-off write runs
            manager
                .set_connection_policy(D1, ConnectionPolicy::Forbidden)
                .await
                .unwrap();
            for command in queued {
                manager.execute_command(command, &gateway).await.ok();
            }
            execute_all(&manager, &gateway).await;

            assert_eq!(
                store.policy(Profile::AudioSink, D1),
                ConnectionPolicy::Forbidden
            );
            assert_eq!(
                manager.connection_policy(D1).await,
                ConnectionPolicy::Forbidden
            );

            manager
                .process_event(event(D1, TransportEventKind::Disconnected))
                .await;
            assert_eq!(
                manager.connect(D1).await,
                Err(SessionError::PolicyForbidden)
            );
        });
    }

    #[test]
    fn test_forgotten_device_policy_is_not_persisted() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            let manager: SessionManager<'_, NoopRawMutex, _> =
                SessionManager::new(ManagerOptions::default(), &store, None);

            manager.connect(D1).await.unwrap();
            manager
                .process_event(event(D1, TransportEventKind::Connected))
                .await;
            manager
                .process_event(event(D1, TransportEventKind::StreamStarted))
                .await;
            manager
                .process_event(event(D1, TransportEventKind::Disconnected))
                .await;
            manager.forget_device(D1).await.unwrap();
            execute_all(&manager, &gateway).await;

            assert_eq!(
                store.policy(Profile::AudioSink, D1),
                ConnectionPolicy::Unknown
            );
        });
    }

    #[test]
    fn test_companion_notifications() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            let companion = RecordingCompanion::new();
            let manager: SessionManager<'_, NoopRawMutex, _> = SessionManager::new(
                ManagerOptions::default().with_profile(Profile::HandsfreeClient),
                &store,
                Some(&companion),
            );

            manager.connect(D1).await.unwrap();
            manager
                .process_event(event(D1, TransportEventKind::Connected))
                .await;
            manager
                .process_event(event(D1, TransportEventKind::StreamStarted))
                .await;
            manager
                .process_event(event(D1, TransportEventKind::Disconnected))
                .await;
            manager.forget_device(D1).await.unwrap();
            execute_all(&manager, &gateway).await;

            assert_eq!(
                companion.active_changes(),
                [
                    (Profile::HandsfreeClient, Some(D1)),
                    (Profile::HandsfreeClient, None)
                ]
            );
            assert_eq!(
                companion.forgotten(),
                [(Profile::HandsfreeClient, D1)]
            );
        });
    }

    #[test]
    fn test_pause_unsupported_is_reported() {
        block_on(async {
            let store = Store::new();
            let gateway = RecordingGateway::new();
            gateway.fail_with(TransportError::Unsupported);
            let manager: SessionManager<'_, NoopRawMutex, _> =
                SessionManager::new(ManagerOptions::default(), &store, None);

            assert_eq!(
                manager.execute_command(Command::Pause(D1), &gateway).await,
                Err(SessionError::TransportCommandFailed)
            );
        });
    }
}
