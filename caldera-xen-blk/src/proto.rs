//! blkif wire protocol.
//!
//! Request and response layouts shared with the backend. These must match
//! the canonical `blkif.h` byte for byte: the backend reads them out of the
//! granted ring page. Padding is spelled out and the sizes are asserted at
//! compile time.

use caldera_xen::ring::ring_capacity;

/// Read sectors from the device.
pub const BLKIF_OP_READ: u8 = 0;
/// Write sectors to the device.
pub const BLKIF_OP_WRITE: u8 = 1;

/// Most segments one request descriptor can carry.
pub const BLKIF_MAX_SEGMENTS_PER_REQUEST: usize = 11;

/// Request completed successfully.
pub const BLKIF_RSP_OKAY: i16 = 0;
/// Request failed.
pub const BLKIF_RSP_ERROR: i16 = -1;
/// Operation not supported by the backend.
pub const BLKIF_RSP_EOPNOTSUPP: i16 = -2;

/// Entries in a one-page blkif ring.
pub const RING_SIZE: usize = ring_capacity::<BlkifEntry>();

/// One data segment: a granted page and the valid sector sub-range within
/// it. `first_sect`/`last_sect` are in units of the negotiated sector
/// size; a final partial page truncates `last_sect`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlkifSegment {
    pub gref: u32,
    pub first_sect: u8,
    pub last_sect: u8,
    pub _pad: [u8; 2],
}

/// Request descriptor.
///
/// `id` is round-tripped by the backend unmodified; this driver stores the
/// pool slot index in it to match completions back to callers, which makes
/// out-of-order completion safe.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BlkifRequest {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: u16,
    pub _pad: u32,
    pub id: u64,
    pub sector_number: u64,
    pub seg: [BlkifSegment; BLKIF_MAX_SEGMENTS_PER_REQUEST],
}

/// Response descriptor. `status` is zero on success, negative on failure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BlkifResponse {
    pub id: u64,
    pub operation: u8,
    pub _pad: u8,
    pub status: i16,
}

/// Ring entry: requests and responses occupy the same slots.
#[repr(C)]
#[derive(Clone, Copy)]
pub union BlkifEntry {
    pub req: BlkifRequest,
    pub rsp: BlkifResponse,
}

impl BlkifEntry {
    pub fn from_request(req: BlkifRequest) -> Self {
        Self { req }
    }

    pub fn from_response(rsp: BlkifResponse) -> Self {
        Self { rsp }
    }

    pub fn request(&self) -> BlkifRequest {
        // SAFETY: every field of both variants is a plain integer, so any
        // bit pattern is a valid value.
        unsafe { self.req }
    }

    pub fn response(&self) -> BlkifResponse {
        // SAFETY: as above.
        unsafe { self.rsp }
    }
}

const _: () = {
    assert!(core::mem::size_of::<BlkifSegment>() == 8);
    assert!(core::mem::size_of::<BlkifRequest>() == 112);
    assert!(core::mem::size_of::<BlkifResponse>() == 16);
    assert!(core::mem::size_of::<BlkifEntry>() == 112);
    // One 4 KiB page carries the 64-byte header plus 32 entries.
    assert!(RING_SIZE == 32);
};
