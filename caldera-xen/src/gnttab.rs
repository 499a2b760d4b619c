//! Grant table allocator.
//!
//! The grant table is an array of capability entries shared with the
//! hypervisor. Writing an entry gives one foreign domain access to one
//! guest frame; the entry index is the grant reference handed to the
//! remote end. References are claimed lock-free with a CAS retry loop and
//! are never reused: frontends grant their ring page and pool buffers once
//! at initialization and the grants live as long as the device.
//!
//! Entry publication order is a correctness requirement, not a nicety:
//! the backend may start using a grant the instant the flags word becomes
//! visible, so frame and domid must be globally visible first. A fence
//! between the two writes enforces that.

use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::error::XenError;
use crate::hal::{XenHal, PAGE_SIZE};
use crate::hypercall::{Hypercalls, PTE_FLAGS_RW};
use crate::DomId;

/// Entries below this index are reserved by the platform and never
/// allocated here.
pub const RESERVED_ENTRIES: u32 = 8;

/// Table size assumed when `GNTTABOP_query_size` is unavailable.
pub const LEGACY_MAX_FRAMES: u32 = 4;

bitflags! {
    /// Grant entry flags (`GTF_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrantFlags: u16 {
        /// The named domain may map/access the frame.
        const PERMIT_ACCESS = 1;
        /// Access is read-only.
        const READONLY = 4;
    }
}

/// One v1 grant table entry, shared with the hypervisor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrantEntryV1 {
    pub flags: u16,
    pub domid: u16,
    pub frame: u32,
}

/// Opaque handle naming one live grant table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GrantRef(pub u32);

impl core::fmt::Display for GrantRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The live grant table: mapped entry array plus the allocation cursor.
pub struct GrantTable {
    base: NonNull<GrantEntryV1>,
    entries: usize,
    next: AtomicU32,
}

// SAFETY: the entry array is shared memory written with volatile stores and
// the cursor is atomic; concurrent grant_access calls never touch the same
// entry because each index is claimed exactly once.
unsafe impl Send for GrantTable {}
unsafe impl Sync for GrantTable {}

impl GrantTable {
    /// Map the grant table and prepare the allocator.
    ///
    /// Queries the hypervisor for the number of frames it will back
    /// (falling back to [`LEGACY_MAX_FRAMES`] when the query fails), asks
    /// it to populate that many frames, then maps each machine frame into
    /// a fresh virtual range with read/write/present permissions. Any
    /// hypercall failure aborts setup and propagates.
    pub fn setup<H: XenHal>(hc: &dyn Hypercalls) -> Result<Self, XenError> {
        let frames_cnt = match hc.grant_query_size() {
            Ok(n) => n as usize,
            Err(_) => LEGACY_MAX_FRAMES as usize,
        };

        let mut frames = alloc::vec![0u64; frames_cnt];
        hc.grant_setup_table(&mut frames)?;

        let va = H::alloc_pages(frames_cnt);
        for (i, frame) in frames.iter().enumerate() {
            let pte = (*frame << 12) | PTE_FLAGS_RW;
            hc.update_va_mapping(va.as_ptr() as usize + i * PAGE_SIZE, pte)?;
        }

        let entries = frames_cnt * PAGE_SIZE / core::mem::size_of::<GrantEntryV1>();
        log::debug!("grant table mapped: {frames_cnt} frames, {entries} entries");

        Ok(Self {
            base: va.cast(),
            entries,
            next: AtomicU32::new(RESERVED_ENTRIES),
        })
    }

    /// Total number of entries in the mapped table.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Grant `domid` access to the frame `mfn`.
    ///
    /// Claims the next free index with a CAS retry loop (no locks; any
    /// number of callers may race, contention only costs retries), fills in
    /// frame and domid, fences, then publishes the flags word. Returns
    /// [`XenError::GrantTableExhausted`] once the table is consumed;
    /// references are never reused, so this allocator is only suited to
    /// lifetime-of-device grants.
    pub fn grant_access(
        &self,
        domid: DomId,
        mfn: u64,
        readonly: bool,
    ) -> Result<GrantRef, XenError> {
        let mut r = self.next.load(Ordering::Relaxed);
        loop {
            if r as usize >= self.entries {
                return Err(XenError::GrantTableExhausted);
            }
            match self
                .next
                .compare_exchange_weak(r, r + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => r = current,
            }
        }

        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }

        // The backend may act on the entry as soon as flags are visible,
        // so frame/domid must be visible first.
        let entry = unsafe { self.base.as_ptr().add(r as usize) };
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*entry).frame), mfn as u32);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*entry).domid), domid.0);
            fence(Ordering::SeqCst);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*entry).flags), flags.bits());
        }

        Ok(GrantRef(r))
    }

    /// Snapshot of one entry. Diagnostic surface for tests and in-process
    /// backend emulation; a real backend reads the table through its own
    /// mapping.
    pub fn read_entry(&self, gref: GrantRef) -> Option<GrantEntryV1> {
        if gref.0 as usize >= self.entries {
            return None;
        }
        let entry = unsafe { self.base.as_ptr().add(gref.0 as usize) };
        Some(unsafe { core::ptr::read_volatile(entry) })
    }
}
