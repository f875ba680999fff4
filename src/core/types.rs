//! Wire-level enumerations and bitmasks shared with the resource manager.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Longest reader name the native layer reports, without the terminator.
pub const MAX_READERNAME: usize = 255;
/// Largest ATR a card may send.
pub const MAX_ATR_SIZE: usize = 33;
/// Size of the ATR field in a reader-state record on the wire.
pub const ATR_BUFFER_SIZE: usize = 36;
/// Receive buffer for extended-length APDUs: header, Lc, data, Le, SW1/SW2.
pub const MAX_BUFFER_SIZE_EXTENDED: usize = 4 + 3 + (1 << 16) + 3 + 2;
/// Receive buffer for `Control`.
pub const MAX_CONTROL_BUFFER: usize = 0xFFFF;
/// Timeout value meaning "wait forever".
pub const INFINITE_TIMEOUT: u32 = 0xFFFF_FFFF;
/// Pseudo reader that reports reader attach/detach in `GetStatusChange`.
pub const PNP_NOTIFICATION: &str = r"\\?PnP?\Notification";

/// Context scope requested from the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    User,
    Terminal,
    System,
}

impl Scope {
    pub const fn to_native(self) -> u32 {
        match self {
            Self::User => 0,
            Self::Terminal => 1,
            Self::System => 2,
        }
    }
}

/// How a connection shares the reader with other sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    Exclusive,
    #[default]
    Shared,
    Direct,
}

impl ShareMode {
    pub const fn to_native(self) -> u32 {
        match self {
            Self::Exclusive => 1,
            Self::Shared => 2,
            Self::Direct => 3,
        }
    }
}

/// Action applied to the card when a session or transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    #[default]
    Leave,
    Reset,
    Unpower,
    Eject,
}

impl Disposition {
    pub const fn to_native(self) -> u32 {
        match self {
            Self::Leave => 0,
            Self::Reset => 1,
            Self::Unpower => 2,
            Self::Eject => 3,
        }
    }
}

const PROTOCOL_T0: u32 = 0x0001;
const PROTOCOL_T1: u32 = 0x0002;
#[cfg(windows)]
const PROTOCOL_RAW: u32 = 0x1_0000;
#[cfg(not(windows))]
const PROTOCOL_RAW: u32 = 0x0004;

/// Protocol negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Undefined,
    T0,
    T1,
    Raw,
}

impl Protocol {
    pub const fn to_native(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::T0 => PROTOCOL_T0,
            Self::T1 => PROTOCOL_T1,
            Self::Raw => PROTOCOL_RAW,
        }
    }

    /// Maps the active-protocol value reported by the native layer.
    /// Anything that is not exactly one known protocol is `Undefined`.
    pub const fn from_native(raw: u32) -> Self {
        match raw {
            PROTOCOL_T0 => Self::T0,
            PROTOCOL_T1 => Self::T1,
            PROTOCOL_RAW => Self::Raw,
            _ => Self::Undefined,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "undefined",
            Self::T0 => "T=0",
            Self::T1 => "T=1",
            Self::Raw => "raw",
        })
    }
}

/// Set of protocols a caller accepts when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Protocols(u32);

bitflags! {
    impl Protocols: u32 {
        const UNDEFINED = 0;
        const T0 = PROTOCOL_T0;
        const T1 = PROTOCOL_T1;
        const RAW = PROTOCOL_RAW;
        const ANY = PROTOCOL_T0 | PROTOCOL_T1;
    }
}

impl Default for Protocols {
    fn default() -> Self {
        Self::ANY
    }
}

impl From<Protocol> for Protocols {
    fn from(protocol: Protocol) -> Self {
        Self::from_bits_retain(protocol.to_native())
    }
}

/// Reader state bits used in `GetStatusChange` records.
///
/// The upper 16 bits carry the reader's event counter, so values coming
/// from the native layer are built with `from_bits_retain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateFlags(u32);

bitflags! {
    impl StateFlags: u32 {
        const UNAWARE = 0x0000;
        const IGNORE = 0x0001;
        const CHANGED = 0x0002;
        const UNKNOWN = 0x0004;
        const UNAVAILABLE = 0x0008;
        const EMPTY = 0x0010;
        const PRESENT = 0x0020;
        const ATRMATCH = 0x0040;
        const EXCLUSIVE = 0x0080;
        const INUSE = 0x0100;
        const MUTE = 0x0200;
        const UNPOWERED = 0x0400;
    }
}

impl StateFlags {
    const FLAG_MASK: u32 = 0x0000_FFFF;

    /// Flags without the event counter.
    pub const fn flags(self) -> Self {
        Self(self.0 & Self::FLAG_MASK)
    }

    pub const fn event_count(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn with_event_count(self, count: u16) -> Self {
        Self((self.0 & Self::FLAG_MASK) | ((count as u32) << 16))
    }

    /// Clears `other` while keeping the event counter.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl fmt::Display for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(StateFlags, &str); 11] = [
            (StateFlags::IGNORE, "IGNORE"),
            (StateFlags::CHANGED, "CHANGED"),
            (StateFlags::UNKNOWN, "UNKNOWN"),
            (StateFlags::UNAVAILABLE, "UNAVAILABLE"),
            (StateFlags::EMPTY, "EMPTY"),
            (StateFlags::PRESENT, "PRESENT"),
            (StateFlags::ATRMATCH, "ATRMATCH"),
            (StateFlags::EXCLUSIVE, "EXCLUSIVE"),
            (StateFlags::INUSE, "INUSE"),
            (StateFlags::MUTE, "MUTE"),
            (StateFlags::UNPOWERED, "UNPOWERED"),
        ];

        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("UNAWARE")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Card state reported by `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardState {
    Unknown,
    Absent,
    Present,
    Swallowed,
    Powered,
    Negotiable,
    Specific,
}

impl CardState {
    const ORDER: [CardState; 7] = [
        CardState::Unknown,
        CardState::Absent,
        CardState::Present,
        CardState::Swallowed,
        CardState::Powered,
        CardState::Negotiable,
        CardState::Specific,
    ];

    /// Winscard reports an enumeration value.
    #[cfg(windows)]
    pub fn from_native(raw: u32) -> Self {
        Self::ORDER
            .get(raw as usize)
            .copied()
            .unwrap_or(Self::Unknown)
    }

    #[cfg(windows)]
    pub fn to_native(self) -> u32 {
        self as u32
    }

    /// pcsc-lite reports a bitmask; the most advanced state wins.
    #[cfg(not(windows))]
    pub fn from_native(raw: u32) -> Self {
        Self::ORDER
            .iter()
            .rev()
            .find(|state| raw & state.to_native() != 0)
            .copied()
            .unwrap_or(Self::Unknown)
    }

    #[cfg(not(windows))]
    pub fn to_native(self) -> u32 {
        1 << (self as u32)
    }
}

/// Identifier of a card or reader attribute.
///
/// The value is passed through to the native layer untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attrib(pub u32);

impl Attrib {
    pub const VENDOR_NAME: Self = Self(0x0001_0100);
    pub const VENDOR_IFD_TYPE: Self = Self(0x0001_0101);
    pub const VENDOR_IFD_VERSION: Self = Self(0x0001_0102);
    pub const VENDOR_IFD_SERIAL_NO: Self = Self(0x0001_0103);
    pub const CHANNEL_ID: Self = Self(0x0002_0110);
    pub const PROTOCOL_TYPES: Self = Self(0x0003_0120);
    pub const DEFAULT_CLK: Self = Self(0x0003_0121);
    pub const MAX_CLK: Self = Self(0x0003_0122);
    pub const DEFAULT_DATA_RATE: Self = Self(0x0003_0123);
    pub const MAX_DATA_RATE: Self = Self(0x0003_0124);
    pub const MAX_IFSD: Self = Self(0x0003_0125);
    pub const POWER_MGMT_SUPPORT: Self = Self(0x0004_0131);
    pub const USER_TO_CARD_AUTH_DEVICE: Self = Self(0x0005_0140);
    pub const USER_AUTH_INPUT_DEVICE: Self = Self(0x0005_0142);
    pub const CHARACTERISTICS: Self = Self(0x0006_0150);
    pub const CURRENT_PROTOCOL_TYPE: Self = Self(0x0008_0201);
    pub const CURRENT_CLK: Self = Self(0x0008_0202);
    pub const CURRENT_F: Self = Self(0x0008_0203);
    pub const CURRENT_D: Self = Self(0x0008_0204);
    pub const CURRENT_N: Self = Self(0x0008_0205);
    pub const CURRENT_W: Self = Self(0x0008_0206);
    pub const CURRENT_IFSC: Self = Self(0x0008_0207);
    pub const CURRENT_IFSD: Self = Self(0x0008_0208);
    pub const CURRENT_BWT: Self = Self(0x0008_0209);
    pub const CURRENT_CWT: Self = Self(0x0008_020A);
    pub const CURRENT_EBC_ENCODING: Self = Self(0x0008_020B);
    pub const EXTENDED_BWT: Self = Self(0x0008_020C);
    pub const ICC_PRESENCE: Self = Self(0x0009_0300);
    pub const ICC_INTERFACE_STATUS: Self = Self(0x0009_0301);
    pub const CURRENT_IO_STATE: Self = Self(0x0009_0302);
    pub const ATR_STRING: Self = Self(0x0009_0303);
    pub const ICC_TYPE_PER_ATR: Self = Self(0x0009_0304);
    pub const ESC_RESET: Self = Self(0x0007_A000);
    pub const ESC_CANCEL: Self = Self(0x0007_A003);
    pub const ESC_AUTHREQUEST: Self = Self(0x0007_A005);
    pub const MAXINPUT: Self = Self(0x0007_A007);
    pub const DEVICE_UNIT: Self = Self(0x7FFF_0001);
    pub const DEVICE_IN_USE: Self = Self(0x7FFF_0002);
    pub const DEVICE_FRIENDLY_NAME: Self = Self(0x7FFF_0003);
    pub const DEVICE_SYSTEM_NAME: Self = Self(0x7FFF_0004);
    pub const SUPRESS_T1_IFS_REQUEST: Self = Self(0x7FFF_0007);
}

impl From<u32> for Attrib {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for Attrib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
