//! Bounded pool of pre-granted request buffers.
//!
//! Grant traffic is kept off the I/O hot path by granting everything up
//! front: each slot owns a contiguous multi-page buffer whose pages are
//! granted read/write to the backend domain when the pool is built, and
//! the grants stay live for the life of the device. Callers acquire a slot
//! (blocking while none is free), run one request through it, and release
//! it on the way out; the IRQ handler only ever touches a slot's status
//! word and wait queue.
//!
//! A slot is always in exactly one of two states, free or in-flight, and
//! only acquire/release move it between them. Exhaustion is backpressure,
//! not an error: waits are unbounded and wakeups are wake-all, with every
//! woken thread re-checking the free list.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use caldera_xen::{DomId, GrantRef, GrantTable, WaitQueue, XenError, XenHal, PAGE_SIZE};

use crate::error::BlkError;
use crate::proto::BLKIF_MAX_SEGMENTS_PER_REQUEST;

/// Slot status while a request is in flight. Terminal statuses are the
/// backend's response codes, all of which are zero or negative.
const STATUS_PENDING: i32 = 1;

/// Pool sizing. The defaults give each slot the full protocol segment
/// budget; tests and small deployments shrink both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of slots (concurrent requests per backend).
    pub slots: usize,
    /// Pages per slot buffer, at most [`BLKIF_MAX_SEGMENTS_PER_REQUEST`].
    pub pages_per_slot: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: 32,
            pages_per_slot: BLKIF_MAX_SEGMENTS_PER_REQUEST,
        }
    }
}

struct Slot<H: XenHal> {
    buf: NonNull<u8>,
    grefs: Vec<GrantRef>,
    status: AtomicI32,
    done: H::WaitQueue,
}

// SAFETY: the buffer is only touched through the exclusive SlotGuard (and
// by the backend via its grants); status is atomic and the wait queue is
// Sync by its trait bounds.
unsafe impl<H: XenHal> Send for Slot<H> {}
unsafe impl<H: XenHal> Sync for Slot<H> {}

/// Fixed set of pre-granted request slots for one backend domain.
pub struct RequestPool<H: XenHal> {
    slots: Box<[Slot<H>]>,
    free: spin::Mutex<Vec<u16>>,
    avail: H::WaitQueue,
    pages_per_slot: usize,
}

impl<H: XenHal> RequestPool<H> {
    /// Allocate and grant every slot buffer to `domid`.
    ///
    /// `pages_per_slot` is clamped to the protocol segment budget. Grant
    /// exhaustion aborts pool construction and propagates.
    pub fn new(
        grants: &GrantTable,
        domid: DomId,
        config: PoolConfig,
    ) -> Result<Self, XenError> {
        let pages_per_slot = config
            .pages_per_slot
            .clamp(1, BLKIF_MAX_SEGMENTS_PER_REQUEST);
        let capacity = config.slots.max(1);

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let buf = H::alloc_pages(pages_per_slot);
            let mut grefs = Vec::with_capacity(pages_per_slot);
            for page in 0..pages_per_slot {
                let vaddr = buf.as_ptr() as usize + page * PAGE_SIZE;
                grefs.push(grants.grant_access(domid, H::virt_to_mfn(vaddr), false)?);
            }
            slots.push(Slot {
                buf,
                grefs,
                status: AtomicI32::new(0),
                done: H::WaitQueue::default(),
            });
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
            free: spin::Mutex::new((0..capacity as u16).rev().collect()),
            avail: H::WaitQueue::default(),
            pages_per_slot,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn pages_per_slot(&self) -> usize {
        self.pages_per_slot
    }

    /// Bytes each slot buffer carries.
    pub fn slot_bytes(&self) -> usize {
        self.pages_per_slot * PAGE_SIZE
    }

    /// Take a free slot, suspending until one is available.
    ///
    /// Fails only on a malformed request (`segments` outside the slot
    /// budget); exhaustion blocks. The wait predicate spans wake cycles:
    /// several woken threads may race for one released slot and the losers
    /// go back to sleep.
    pub fn acquire(&self, segments: usize) -> Result<SlotGuard<'_, H>, BlkError> {
        if segments == 0 || segments > self.pages_per_slot {
            return Err(BlkError::TooManySegments);
        }

        loop {
            let popped = self.free.lock().pop();
            if let Some(index) = popped {
                let slot = &self.slots[index as usize];
                #[cfg(debug_assertions)]
                // Stale-data tripwire, not a correctness requirement.
                unsafe {
                    core::ptr::write_bytes(slot.buf.as_ptr(), 0, self.slot_bytes());
                }
                slot.status.store(0, Ordering::Relaxed);
                return Ok(SlotGuard { pool: self, index });
            }
            self.avail.wait_while(|| self.free.lock().is_empty());
        }
    }

    /// Post a terminal status for the slot named by a response id and wake
    /// its owner. IRQ context; never blocks.
    pub fn complete(&self, id: u64, status: i16) {
        let Some(slot) = usize::try_from(id).ok().and_then(|i| self.slots.get(i)) else {
            log::warn!("blkfront: response names bogus slot {id}");
            return;
        };
        slot.status.store(status as i32, Ordering::Release);
        slot.done.wake_all();
    }

    fn release(&self, index: u16) {
        self.free.lock().push(index);
        self.avail.wake_all();
    }
}

/// Exclusive hold on one pool slot between acquire and release.
///
/// Dropping the guard returns the slot to the free list unconditionally,
/// error paths included, so the pool can never leak a slot.
pub struct SlotGuard<'a, H: XenHal> {
    pool: &'a RequestPool<H>,
    index: u16,
}

impl<'a, H: XenHal> SlotGuard<'a, H> {
    /// Slot index; doubles as the opaque request id on the wire.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Pre-issued grant references, one per buffer page.
    pub fn grefs(&self) -> &[GrantRef] {
        &self.pool.slots[self.index as usize].grefs
    }

    pub fn buffer(&self) -> &[u8] {
        let slot = &self.pool.slots[self.index as usize];
        unsafe { core::slice::from_raw_parts(slot.buf.as_ptr(), self.pool.slot_bytes()) }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        let slot = &self.pool.slots[self.index as usize];
        unsafe { core::slice::from_raw_parts_mut(slot.buf.as_ptr(), self.pool.slot_bytes()) }
    }

    /// Mark the slot in flight. Must precede ring submission: the IRQ
    /// handler may post the terminal status before submit returns.
    pub fn begin(&self) {
        self.pool.slots[self.index as usize]
            .status
            .store(STATUS_PENDING, Ordering::Release);
    }

    /// Block until the IRQ handler posts a terminal status and return it.
    pub fn wait_status(&self) -> i16 {
        let slot = &self.pool.slots[self.index as usize];
        slot.done
            .wait_while(|| slot.status.load(Ordering::Acquire) == STATUS_PENDING);
        slot.status.load(Ordering::Acquire) as i16
    }
}

impl<'a, H: XenHal> Drop for SlotGuard<'a, H> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
