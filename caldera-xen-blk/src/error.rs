//! Driver error type.

use caldera_storage::BlockError;
use caldera_xen::{StoreError, XenError};

/// Error type for block frontend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkError {
    /// A required XenStore field for this device is absent or malformed.
    MissingField(&'static str),
    /// Other XenStore failure.
    Store(StoreError),
    /// Hypercall-level failure during initialization.
    Xen(XenError),
    /// Backend never reached Connected within the retry budget.
    BackendNotReady,
    /// Request spans more pages than a pool slot carries.
    TooManySegments,
    /// Backend published a geometry this driver cannot serve.
    BadGeometry,
    /// A device with this name is already registered.
    AlreadyRegistered,
    /// Backend completed the request with a nonzero status.
    Io(i16),
}

impl BlkError {
    /// Negative errno-style code for the block-device boundary.
    pub const fn errno(&self) -> i32 {
        match self {
            BlkError::MissingField(_) => -2,   // ENOENT
            BlkError::Store(_) => -5,          // EIO
            BlkError::Xen(e) => e.errno(),
            BlkError::BackendNotReady => -110, // ETIMEDOUT
            BlkError::TooManySegments => -7,   // E2BIG
            BlkError::BadGeometry => -22,      // EINVAL
            BlkError::AlreadyRegistered => -17, // EEXIST
            BlkError::Io(status) => *status as i32,
        }
    }
}

impl From<XenError> for BlkError {
    fn from(e: XenError) -> Self {
        Self::Xen(e)
    }
}

impl From<StoreError> for BlkError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<BlkError> for BlockError {
    fn from(e: BlkError) -> Self {
        match e {
            BlkError::TooManySegments | BlkError::BadGeometry => BlockError::InvalidArgument,
            other => BlockError::Io(other.errno()),
        }
    }
}

impl core::fmt::Display for BlkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BlkError::MissingField(field) => write!(f, "missing XenStore field {field}"),
            BlkError::Store(e) => write!(f, "XenStore failure: {e}"),
            BlkError::Xen(e) => write!(f, "{e}"),
            BlkError::BackendNotReady => write!(f, "backend never connected"),
            BlkError::TooManySegments => write!(f, "request exceeds slot capacity"),
            BlkError::BadGeometry => write!(f, "unusable device geometry"),
            BlkError::AlreadyRegistered => write!(f, "device name already registered"),
            BlkError::Io(status) => write!(f, "backend I/O failure ({status})"),
        }
    }
}
