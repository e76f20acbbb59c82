use core::fmt;
use core::str::FromStr;

/// A Bluetooth Device Address (`BD_ADDR`) identifying one remote peer
///
/// Used as the session table key everywhere; never mutated once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BluetoothAddress(pub [u8; 6]);

/// Returned when a string is not a colon-separated six byte address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AddressParseError;

impl BluetoothAddress {
    /// Create a new Bluetooth address from bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Format the address as an upper-case, colon-separated hex string
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut result = heapless::String::new();
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(char::from(HEX[usize::from(byte >> 4)])).ok();
            result.push(char::from(HEX[usize::from(byte & 0x0F)])).ok();
        }
        result
    }

    /// Parse an address from `AA:BB:CC:DD:EE:FF` (either case)
    ///
    /// # Errors
    /// Returns [`AddressParseError`] if the string is not exactly six colon-separated
    /// two-digit hex groups.
    pub fn from_hex(hex: &str) -> Result<Self, AddressParseError> {
        if hex.len() != 17 {
            return Err(AddressParseError);
        }

        let mut bytes = [0u8; 6];
        let mut groups = hex.split(':');
        for slot in &mut bytes {
            let group = groups.next().ok_or(AddressParseError)?;
            if group.len() != 2 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AddressParseError);
            }
            *slot = u8::from_str_radix(group, 16).map_err(|_| AddressParseError)?;
        }
        if groups.next().is_some() {
            return Err(AddressParseError);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BluetoothAddress {
    fn format(&self, f: defmt::Formatter<'_>) {
        let [a, b, c, d, e, g] = self.0;
        defmt::write!(
            f,
            "{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}",
            a,
            b,
            c,
            d,
            e,
            g
        );
    }
}

impl FromStr for BluetoothAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

impl TryFrom<&str> for BluetoothAddress {
    type Error = AddressParseError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        Self::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for BluetoothAddress {
    type Error = AddressParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 6]>::try_from(bytes)
            .map(Self)
            .map_err(|_| AddressParseError)
    }
}

#[cfg(feature = "hci")]
impl From<BluetoothAddress> for bt_hci::param::BdAddr {
    fn from(addr: BluetoothAddress) -> Self {
        bt_hci::param::BdAddr::new(addr.0)
    }
}

#[cfg(feature = "hci")]
impl TryFrom<bt_hci::param::BdAddr> for BluetoothAddress {
    type Error = AddressParseError;

    fn try_from(bd_addr: bt_hci::param::BdAddr) -> Result<Self, Self::Error> {
        Self::try_from(&bd_addr.raw()[..])
    }
}
