//! Processor Tasks - transport event and command processing
//!
//! A [`SessionManager`] does no I/O of its own. Two long-running tasks move work in and
//! out of it:
//!
//! * **Event Processor**: takes [`TransportEvent`](crate::TransportEvent)s posted with
//!   [`SessionManager::post_event`] and feeds them to the state machines, strictly one
//!   at a time and in arrival order.
//! * **Command Processor**: executes the [`Command`](crate::Command)s the manager queued
//!   against the [`TransportGateway`], the policy store and the companion profile,
//!   without holding the manager lock.
//!
//! # Usage
//!
//! Run both with [`run`], or spawn them separately:
//!
//! ```rust,ignore
//! use roostbird::processor::{command_processor, event_processor};
//!
//! #[embassy_executor::task]
//! async fn events(manager: &'static Manager) -> ! {
//!     event_processor(manager).await
//! }
//!
//! #[embassy_executor::task]
//! async fn commands(manager: &'static Manager, gateway: &'static Gateway) -> ! {
//!     command_processor(manager, gateway).await
//! }
//! ```

use embassy_futures::select::select;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::{SessionManager, policy::PolicyStore, transport::TransportGateway};

/// Feed posted transport events to the manager, forever
pub async fn event_processor<M: RawMutex, P: PolicyStore>(
    manager: &SessionManager<'_, M, P>,
) -> ! {
    loop {
        let event = manager.next_event().await;
        trace!("[PROCESSOR] event {:?} for {}", event.kind, event.addr);
        manager.process_event(event).await;
    }
}

/// Execute queued commands through `gateway`, forever
///
/// Failures are logged and do not stop the loop.
pub async fn command_processor<M: RawMutex, P: PolicyStore, G: TransportGateway>(
    manager: &SessionManager<'_, M, P>,
    gateway: &G,
) -> ! {
    loop {
        let command = manager.next_command().await;
        trace!("[PROCESSOR] command {:?}", command);
        if let Err(e) = manager.execute_command(command, gateway).await {
            warn!("[PROCESSOR] {:?} failed: {:?}", command, e);
        }
    }
}

/// Run the event and command processors of `manager` concurrently
pub async fn run<M: RawMutex, P: PolicyStore, G: TransportGateway>(
    manager: &SessionManager<'_, M, P>,
    gateway: &G,
) {
    info!("[PROCESSOR] starting, profile {:?}", manager.options().profile);
    select(
        event_processor(manager),
        command_processor(manager, gateway),
    )
    .await;
}
