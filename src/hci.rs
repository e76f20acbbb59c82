//! HCI transport bridge (feature `hci`)
//!
//! [`HciGateway`] lets a [`SessionManager`] drive a Bluetooth Classic controller directly:
//! connect and disconnect become HCI `Create_Connection` / `Disconnect` commands (or
//! `Create_Connection_Cancel` while the page is still running), and
//! `Connection_Complete` / `Disconnection_Complete` events come back as
//! [`TransportEvent`]s.
//!
//! The bridge only knows about ACL links. Streaming events and media pause belong to a
//! profile stack (AVDTP, RFCOMM) running on top of the link, which posts its own
//! events to the manager.
//!
//! ```rust,ignore
//! let gateway = HciGateway::<CriticalSectionRawMutex, _, 4>::new(controller);
//! embassy_futures::join::join(
//!     roostbird::processor::run(&manager, &gateway),
//!     gateway.hci_event_processor(&manager),
//! )
//! .await;
//! ```

use core::cell::RefCell;

use bt_hci::{
    ControllerToHostPacket, cmd,
    controller::{Controller, ControllerCmdAsync, ControllerCmdSync, ExternalController},
    event,
    param::{BdAddr, ConnHandle, DisconnectReason},
    transport::Transport,
};
use embassy_sync::blocking_mutex::{Mutex, raw::RawMutex};
use heapless::FnvIndexMap;

use crate::{
    BluetoothAddress, SessionManager,
    constants::{
        ALLOW_ROLE_SWITCH, DEFAULT_PACKET_TYPES, EVENT_BUFFER_SIZE, MAX_HCI_LINKS,
        NO_CLOCK_OFFSET, PAGE_SCAN_REPETITION_MODE_R1, RESERVED_FIELD,
    },
    policy::PolicyStore,
    transport::{TransportError, TransportEvent, TransportEventKind, TransportGateway},
};

/// HCI "Unspecified Error" status, reported when the controller rejects a command
const UNSPECIFIED_ERROR: u8 = 0x1F;

/// How to tear down the connection to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Disconnect the open link with this handle
    Disconnect(u16),
    /// No link yet, stop paging the device
    CancelPage,
}

/// ACL connection handles by device
#[derive(Debug, Default)]
pub struct LinkTable {
    links: FnvIndexMap<BluetoothAddress, u16, MAX_HCI_LINKS>,
}

impl LinkTable {
    /// Create an empty table
    #[must_use]
    pub const fn new() -> Self {
        Self {
            links: FnvIndexMap::new(),
        }
    }

    /// Record the handle of a new link, replacing a stale one for the same device
    ///
    /// # Errors
    /// Returns `Busy` when all link slots are taken.
    pub fn insert(&mut self, addr: BluetoothAddress, handle: u16) -> Result<(), TransportError> {
        self.links
            .insert(addr, handle)
            .map(|_| ())
            .map_err(|_| TransportError::Busy)
    }

    /// Handle of the link to `addr`
    #[must_use]
    pub fn handle(&self, addr: BluetoothAddress) -> Option<u16> {
        self.links.get(&addr).copied()
    }

    /// Forget the link with `handle`, returning the device it belonged to
    pub fn remove_handle(&mut self, handle: u16) -> Option<BluetoothAddress> {
        let addr = self
            .links
            .iter()
            .find_map(|(addr, h)| (*h == handle).then_some(*addr))?;
        self.links.remove(&addr);
        Some(addr)
    }

    /// Number of open links
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// No links are open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn teardown(&self, addr: BluetoothAddress) -> Teardown {
        self.handle(addr)
            .map_or(Teardown::CancelPage, Teardown::Disconnect)
    }

    /// Apply one HCI event to the table and translate it for the manager
    fn on_event(&mut self, event: &event::Event<'_>) -> Option<TransportEvent> {
        match *event {
            event::Event::ConnectionComplete(ref complete) => {
                let addr: BluetoothAddress = complete.bd_addr.try_into().ok()?;
                if complete.status.to_result().is_err() {
                    return Some(TransportEvent::new(addr, TransportEventKind::ConnectFailed));
                }
                let handle = complete.handle.raw();
                if self.insert(addr, handle).is_err() {
                    warn!("[HCI] link table full, {} untracked", addr);
                }
                debug!("[HCI] link {} up, handle {}", addr, handle);
                Some(TransportEvent::new(addr, TransportEventKind::Connected))
            }
            event::Event::DisconnectionComplete(ref complete) => {
                if complete.status.to_result().is_err() {
                    return None;
                }
                let handle = complete.handle.raw();
                let addr = self.remove_handle(handle)?;
                debug!("[HCI] link {} down, handle {}", addr, handle);
                Some(TransportEvent::new(addr, TransportEventKind::Disconnected))
            }
            _ => None,
        }
    }
}

/// [`TransportGateway`] over a bt-hci controller
pub struct HciGateway<'c, M: RawMutex, T: Transport, const SLOTS: usize> {
    controller: &'c ExternalController<T, SLOTS>,
    links: Mutex<M, RefCell<LinkTable>>,
}

impl<'c, M: RawMutex, T: Transport, const SLOTS: usize> HciGateway<'c, M, T, SLOTS> {
    /// Create a gateway for `controller`
    #[must_use]
    pub const fn new(controller: &'c ExternalController<T, SLOTS>) -> Self {
        Self {
            controller,
            links: Mutex::new(RefCell::new(LinkTable::new())),
        }
    }

    /// Handle of the link to `addr`, if one is open
    #[must_use]
    pub fn link_handle(&self, addr: BluetoothAddress) -> Option<u16> {
        self.links.lock(|links| links.borrow().handle(addr))
    }

    /// Read HCI events and post link changes to `manager`, forever
    pub async fn hci_event_processor<MM: RawMutex, P: PolicyStore>(
        &self,
        manager: &SessionManager<'_, MM, P>,
    ) -> ! {
        let mut read_buffer = [0u8; EVENT_BUFFER_SIZE];

        loop {
            let translated = match self.controller.read(&mut read_buffer).await {
                Ok(ControllerToHostPacket::Event(ref event)) => self
                    .links
                    .lock(|links| links.borrow_mut().on_event(event)),
                Ok(_) => None,
                Err(_) => {
                    error!("[HCI] read error");
                    None
                }
            };
            if let Some(event) = translated {
                manager.post_event(event).await;
            }
        }
    }
}

impl<M: RawMutex, T: Transport, const SLOTS: usize> TransportGateway
    for HciGateway<'_, M, T, SLOTS>
{
    async fn send_connect(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        let create_conn = cmd::link_control::CreateConnection::new(
            BdAddr::new(addr.0),
            DEFAULT_PACKET_TYPES,
            PAGE_SCAN_REPETITION_MODE_R1,
            RESERVED_FIELD,
            NO_CLOCK_OFFSET,
            ALLOW_ROLE_SWITCH,
        );

        ControllerCmdAsync::exec(self.controller, &create_conn)
            .await
            .map_err(|_| {
                warn!("[HCI] Create_Connection to {} rejected", addr);
                TransportError::CommandFailed(UNSPECIFIED_ERROR)
            })
    }

    async fn send_disconnect(&self, addr: BluetoothAddress) -> Result<(), TransportError> {
        let handle = match self.links.lock(|links| links.borrow().teardown(addr)) {
            Teardown::Disconnect(handle) => handle,
            Teardown::CancelPage => {
                debug!("[HCI] no link to {}, cancelling page", addr);
                let cancel = cmd::link_control::CreateConnectionCancel::new(BdAddr::new(addr.0));
                return ControllerCmdSync::exec(self.controller, &cancel)
                    .await
                    .map(|_| ())
                    .map_err(|_| {
                        warn!("[HCI] Create_Connection_Cancel to {} rejected", addr);
                        TransportError::CommandFailed(UNSPECIFIED_ERROR)
                    });
            }
        };

        let disconnect = cmd::link_control::Disconnect::new(
            ConnHandle::new(handle),
            DisconnectReason::RemoteUserTerminatedConn,
        );

        ControllerCmdAsync::exec(self.controller, &disconnect)
            .await
            .map_err(|_| {
                warn!("[HCI] Disconnect of handle {} rejected", handle);
                TransportError::CommandFailed(UNSPECIFIED_ERROR)
            })
    }

    async fn send_pause(&self, _addr: BluetoothAddress) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}
