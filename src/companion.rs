//! Optional companion profile
//!
//! Some profiles keep per-device state that follows the active audio device, e.g. a
//! remote-control target remembering absolute volume. When such a service exists it is
//! handed to the manager at construction; when it does not, the manager skips the
//! notifications.

use crate::{BluetoothAddress, Profile};

/// Receiver for active-device and device-removal notifications
///
/// Called from the command processor with the manager lock released.
pub trait CompanionProfile {
    /// The active streaming device for `profile` changed (`None` = no active device)
    fn active_device_changed(&self, profile: Profile, device: Option<BluetoothAddress>);

    /// `addr` was forgotten (bond removed); drop any state kept for it
    fn device_forgotten(&self, profile: Profile, addr: BluetoothAddress);
}
