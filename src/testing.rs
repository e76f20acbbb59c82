//! Test doubles shared by the unit tests

extern crate std;

use core::cell::{Cell, RefCell};
use std::{sync::Mutex, vec::Vec};

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::{
    BluetoothAddress, Profile,
    companion::CompanionProfile,
    manager::{Command, SessionManager},
    policy::{ConnectionPolicy, PolicyError, PolicyStore},
    transport::{TransportError, TransportEvent, TransportEventKind, TransportGateway},
};

pub(crate) const D1: BluetoothAddress = BluetoothAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x01]);
pub(crate) const D2: BluetoothAddress = BluetoothAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x02]);
pub(crate) const D3: BluetoothAddress = BluetoothAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x03]);

pub(crate) fn event(addr: BluetoothAddress, kind: TransportEventKind) -> TransportEvent {
    TransportEvent::new(addr, kind)
}

/// Take every queued command
pub(crate) fn drain<M: RawMutex, P: PolicyStore>(manager: &SessionManager<'_, M, P>) -> Vec<Command> {
    core::iter::from_fn(|| manager.try_next_command()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GatewayCall {
    Connect(BluetoothAddress),
    Disconnect(BluetoothAddress),
    Pause(BluetoothAddress),
    Timeout(BluetoothAddress, u16, u32),
}

/// Records every call; connect, disconnect and pause fail while a failure is set
pub(crate) struct RecordingGateway {
    calls: RefCell<Vec<GatewayCall>>,
    failure: Cell<Option<TransportError>>,
}

impl RecordingGateway {
    pub(crate) fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            failure: Cell::new(None),
        }
    }

    pub(crate) fn fail_with(&self, error: TransportError) {
        self.failure.set(Some(error));
    }

    pub(crate) fn recover(&self) {
        self.failure.set(None);
    }

    pub(crate) fn calls(&self) -> Vec<GatewayCall> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: GatewayCall) -> Result<(), TransportError> {
        self.calls.borrow_mut().push(call);
        match self.failure.get() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl TransportGateway for RecordingGateway {
    async fn send_connect(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        self.record(GatewayCall::Connect(addr))
    }

    async fn send_disconnect(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        self.record(GatewayCall::Disconnect(addr))
    }

    async fn send_pause(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        self.record(GatewayCall::Pause(addr))
    }

    async fn schedule_timeout(
        &self,
        addr: BluetoothAddress,
        epoch: u16,
        after_ms: u32,
    ) -> Result<(), TransportError> {
        self.calls
            .borrow_mut()
            .push(GatewayCall::Timeout(addr, epoch, after_ms));
        Ok(())
    }
}

/// Answers every read with a fixed policy and refuses every write
pub(crate) struct FailingPolicyStore {
    policy: ConnectionPolicy,
}

impl FailingPolicyStore {
    pub(crate) fn new(policy: ConnectionPolicy) -> Self {
        Self { policy }
    }
}

impl PolicyStore for FailingPolicyStore {
    fn policy(&self, _profile: Profile, _addr: BluetoothAddress) -> ConnectionPolicy {
        self.policy
    }

    fn set_policy(
        &self,
        _profile: Profile,
        _addr: BluetoothAddress,
        _policy: ConnectionPolicy,
    ) -> Result<(), PolicyError> {
        Err(PolicyError::Unavailable)
    }
}

#[derive(Default)]
pub(crate) struct RecordingCompanion {
    active: Mutex<Vec<(Profile, Option<BluetoothAddress>)>>,
    forgotten: Mutex<Vec<(Profile, BluetoothAddress)>>,
}

impl RecordingCompanion {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn active_changes(&self) -> Vec<(Profile, Option<BluetoothAddress>)> {
        self.active.lock().unwrap().clone()
    }

    pub(crate) fn forgotten(&self) -> Vec<(Profile, BluetoothAddress)> {
        self.forgotten.lock().unwrap().clone()
    }
}

impl CompanionProfile for RecordingCompanion {
    fn active_device_changed(&self, profile: Profile, device: Option<BluetoothAddress>) {
        self.active.lock().unwrap().push((profile, device));
    }

    fn device_forgotten(&self, profile: Profile, addr: BluetoothAddress) {
        self.forgotten.lock().unwrap().push((profile, addr));
    }
}
