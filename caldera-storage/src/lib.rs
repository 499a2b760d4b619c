//! # caldera-storage
//!
//! Generic block device abstraction for Caldera OS.
//!
//! This crate defines the trait boundary between block device drivers and
//! their consumers (filesystems, partition code). Drivers implement
//! [`BlockDevice`] and register themselves in a [`DeviceRegistry`];
//! everything above the driver addresses a device by name and block number.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Block device geometry as negotiated by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Addressable block size in bytes. Block numbers passed to
    /// [`BlockDevice::read`] and [`BlockDevice::write`] are in these units.
    pub block_size: u32,
    /// Total device size in bytes.
    pub size: u64,
}

impl Geometry {
    /// Number of addressable blocks on the device.
    pub const fn blocks(&self) -> u64 {
        self.size / self.block_size as u64
    }
}

/// Error type for block device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Operation is not implemented by this driver.
    Unsupported,
    /// Malformed request (zero block size, oversized transfer, ...).
    InvalidArgument,
    /// Device with this name is already registered.
    AlreadyExists,
    /// The device reported an I/O failure; payload is the negative
    /// driver-specific status.
    Io(i32),
}

impl BlockError {
    /// Negative errno-style code for the C-flavored syscall boundary.
    pub const fn errno(&self) -> i32 {
        match self {
            BlockError::Unsupported => -95,     // ENOTSUP
            BlockError::InvalidArgument => -22, // EINVAL
            BlockError::AlreadyExists => -17,   // EEXIST
            BlockError::Io(code) => *code,
        }
    }
}

impl core::fmt::Display for BlockError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockError::Unsupported => write!(f, "operation not supported"),
            BlockError::InvalidArgument => write!(f, "invalid argument"),
            BlockError::AlreadyExists => write!(f, "device already registered"),
            BlockError::Io(code) => write!(f, "I/O error ({code})"),
        }
    }
}

/// A block device exposed to the rest of the kernel.
///
/// `blkno` is in units of [`Geometry::block_size`]. Reads and writes may
/// span multiple blocks and need not cover whole blocks; drivers return the
/// number of bytes actually transferred.
pub trait BlockDevice: Send + Sync {
    /// Device geometry.
    fn geometry(&self) -> Geometry;

    /// Read `buf.len()` bytes starting at block `blkno`.
    fn read(&self, buf: &mut [u8], blkno: u64) -> Result<usize, BlockError>;

    /// Write `buf.len()` bytes starting at block `blkno`.
    fn write(&self, buf: &[u8], blkno: u64) -> Result<usize, BlockError>;

    /// Driver-specific control operation. Drivers without one inherit the
    /// default, which reports [`BlockError::Unsupported`].
    fn ioctl(&self, _cmd: u32, _arg: usize) -> Result<usize, BlockError> {
        Err(BlockError::Unsupported)
    }
}

/// Name-to-device table. Constructed once at boot and passed by reference
/// to every probe entry point.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: spin::Mutex<Vec<(String, Arc<dyn BlockDevice>)>>,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: spin::Mutex::new(Vec::new()),
        }
    }

    /// Register a device under `name`. Names are unique.
    pub fn register(&self, name: String, dev: Arc<dyn BlockDevice>) -> Result<(), BlockError> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|(n, _)| *n == name) {
            return Err(BlockError::AlreadyExists);
        }
        devices.push((name, dev));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn BlockDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.lock().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}
