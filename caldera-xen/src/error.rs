//! Error types for the Xen platform layer.

/// Error type for hypercall-backed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XenError {
    /// The hypercall itself returned a negative status.
    Hypercall(i32),
    /// The hypercall succeeded but the operation's status side channel
    /// reported a grant-table failure.
    Grant(GrantStatus),
    /// Every entry of the mapped grant table has been handed out. Grants
    /// are issued once per device resource and never revoked, so this can
    /// only surface during device initialization.
    GrantTableExhausted,
}

impl XenError {
    /// Negative errno-style code for C-flavored callers.
    pub const fn errno(&self) -> i32 {
        match self {
            XenError::Hypercall(code) => *code,
            XenError::Grant(_) => -5,           // EIO
            XenError::GrantTableExhausted => -12, // ENOMEM
        }
    }
}

impl core::fmt::Display for XenError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            XenError::Hypercall(code) => write!(f, "hypercall failed ({code})"),
            XenError::Grant(status) => write!(f, "grant operation failed: {status}"),
            XenError::GrantTableExhausted => write!(f, "grant table exhausted"),
        }
    }
}

/// Status codes returned in the `status` field of grant-table operation
/// arguments (`GNTST_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
    /// General undefined error.
    GeneralError,
    /// Unrecognised domain id.
    BadDomain,
    /// Unrecognised or inappropriate grant reference.
    BadGntRef,
    /// Unrecognised or inappropriate handle.
    BadHandle,
    /// Inappropriate virtual address to map.
    BadVirtAddr,
    /// Inappropriate device address to unmap.
    BadDevAddr,
    /// Out of space in I/O MMU.
    NoDeviceSpace,
    /// Not enough privilege for operation.
    PermissionDenied,
    /// Specified page was invalid for the operation.
    BadPage,
    /// Copy arguments cross a page boundary.
    BadCopyArg,
    /// Transfer page address too large.
    AddressTooBig,
    /// Operation not done; try again.
    Eagain,
    /// Out of space (handles etc).
    NoSpace,
    /// Status value outside the known range.
    Unknown(i16),
}

impl From<i16> for GrantStatus {
    fn from(status: i16) -> Self {
        match status {
            -1 => Self::GeneralError,
            -2 => Self::BadDomain,
            -3 => Self::BadGntRef,
            -4 => Self::BadHandle,
            -5 => Self::BadVirtAddr,
            -6 => Self::BadDevAddr,
            -7 => Self::NoDeviceSpace,
            -8 => Self::PermissionDenied,
            -9 => Self::BadPage,
            -10 => Self::BadCopyArg,
            -11 => Self::AddressTooBig,
            -12 => Self::Eagain,
            -13 => Self::NoSpace,
            other => Self::Unknown(other),
        }
    }
}

impl core::fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::GeneralError => "general error",
            Self::BadDomain => "unrecognised domain id",
            Self::BadGntRef => "bad grant reference",
            Self::BadHandle => "bad handle",
            Self::BadVirtAddr => "bad virtual address",
            Self::BadDevAddr => "bad device address",
            Self::NoDeviceSpace => "out of I/O MMU space",
            Self::PermissionDenied => "permission denied",
            Self::BadPage => "bad page",
            Self::BadCopyArg => "copy crosses page boundary",
            Self::AddressTooBig => "address too big",
            Self::Eagain => "try again",
            Self::NoSpace => "out of space",
            Self::Unknown(code) => return write!(f, "unknown status {code}"),
        };
        f.write_str(msg)
    }
}
