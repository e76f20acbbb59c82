//! `Roostbird` Constants
//!
//! Storage limits, queue depths and default timing values used throughout the crate.
//! Storage limits are compile-time capacities of the heapless containers; the runtime
//! admission limit lives in [`crate::ManagerOptions`] and is clamped to them.

/// Maximum number of sessions a manager can hold (table storage capacity)
///
/// Must be a power of two, it sizes a `heapless::FnvIndexMap`.
pub const MAX_SESSIONS: usize = 8;

/// Default number of concurrently admitted sessions per profile
pub const DEFAULT_MAX_CONNECTED_DEVICES: usize = 1;

/// Depth of the inbound transport event channel
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Depth of the outbound command channel
pub const COMMAND_QUEUE_DEPTH: usize = 32;

/// Number of policy values the manager keeps in memory while persistence is pending
///
/// Must be a power of two, it sizes a `heapless::FnvIndexMap`.
pub const POLICY_OVERLAY_CAPACITY: usize = 16;

/// Default time allowed for a connection attempt before it is abandoned
pub const DEFAULT_CONNECT_TIMEOUT_MS: u32 = 30_000;

/// Default time allowed for a disconnection to be confirmed
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u32 = 30_000;

/// Maximum number of side effects a single session transition can produce
pub const MAX_TRANSITION_EFFECTS: usize = 2;

/// Maximum number of directives a single arbitration step can produce
pub const MAX_DIRECTIVES: usize = 4;

/// Maximum number of active ACL links tracked by the HCI bridge
pub const MAX_HCI_LINKS: usize = 8;

/// Standard packet types for ACL connections (DM1, DM3, DM5, DH1, DH3, DH5)
pub const DEFAULT_PACKET_TYPES: u16 = 0xCC18;

/// Page scan repetition mode R1
pub const PAGE_SCAN_REPETITION_MODE_R1: u8 = 0x01;

/// Reserved field value
pub const RESERVED_FIELD: u8 = 0x00;

/// No clock offset specified
pub const NO_CLOCK_OFFSET: u16 = 0x0000;

/// Allow role switch during connection
pub const ALLOW_ROLE_SWITCH: u8 = 0x01;

/// Size of the buffer used for HCI event processing
pub const EVENT_BUFFER_SIZE: usize = 255;
