//! XenStore interface.
//!
//! XenStore is the hierarchical key/value service domains use for
//! out-of-band device discovery and handshaking. Frontends read their
//! device directory (`device/vbd/<id>`), write connection parameters into
//! it, and watch the backend's directory for state changes. The wire
//! protocol lives in platform code; drivers consume this trait.

use alloc::string::String;
use alloc::vec::Vec;

/// Error type for XenStore accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Path does not exist.
    NotFound,
    /// Value exists but did not parse as the requested type.
    Malformed,
    /// Transport failure talking to the store.
    Io,
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "path not found"),
            StoreError::Malformed => write!(f, "malformed value"),
            StoreError::Io => write!(f, "store I/O failure"),
        }
    }
}

/// Key/value access to XenStore. Paths are `/`-separated, relative to the
/// domain root (e.g. `device/vbd/0/backend-id`).
pub trait XenStore: Send + Sync {
    fn read(&self, path: &str) -> Result<String, StoreError>;

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Names of the immediate children of `path`.
    fn ls(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Read and parse a decimal integer value.
    fn read_u64(&self, path: &str) -> Result<u64, StoreError> {
        self.read(path)?
            .trim()
            .parse()
            .map_err(|_| StoreError::Malformed)
    }

    fn read_u32(&self, path: &str) -> Result<u32, StoreError> {
        self.read(path)?
            .trim()
            .parse()
            .map_err(|_| StoreError::Malformed)
    }

    fn read_u16(&self, path: &str) -> Result<u16, StoreError> {
        self.read(path)?
            .trim()
            .parse()
            .map_err(|_| StoreError::Malformed)
    }
}

/// State of a XenBus connection, as published under a device's `state` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum XenbusState {
    /// Initial state of the device, before either end has connected.
    Unknown = 0,
    /// Backend is in the process of initializing itself.
    Initialising = 1,
    /// Backend is waiting for information before completing initialization.
    InitWait = 2,
    /// Backend is ready for connection.
    Initialised = 3,
    /// Normal state of the bus.
    Connected = 4,
    /// Device has become unavailable.
    Closing = 5,
    /// Both halves of the driver have disconnected.
    Closed = 6,
    /// Device is being reconfigured.
    Reconfiguring = 7,
    /// Device reconfiguration has finished.
    Reconfigured = 8,
}

impl XenbusState {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Initialising,
            2 => Self::InitWait,
            3 => Self::Initialised,
            4 => Self::Connected,
            5 => Self::Closing,
            6 => Self::Closed,
            7 => Self::Reconfiguring,
            8 => Self::Reconfigured,
            _ => Self::Unknown,
        }
    }

    pub const fn raw(self) -> u32 {
        self as u32
    }
}
