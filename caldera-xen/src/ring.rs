//! Frontend half of a Xen shared ring.
//!
//! A shared ring is one granted page holding a fixed-capacity circular
//! array of request/response entries plus two pairs of indices: the
//! producer/consumer positions (`req_prod`/`rsp_prod`) and the event
//! thresholds (`req_event`/`rsp_event`) each side uses to ask the other
//! for a notification. The frontend mirrors its own positions privately
//! (`req_prod_pvt`, `rsp_cons`) so the hot path does not re-read shared
//! memory it already knows.
//!
//! Entries are a request/response union supplied by the protocol crate;
//! this module does not interpret them, including the 64-bit id a backend
//! round-trips unmodified. Responses may therefore complete out of
//! submission order.

use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::hal::PAGE_SIZE;

/// Bytes of index/event header at the start of the shared page.
pub const RING_HEADER_SIZE: usize = 64;

/// Largest power-of-two entry count that fits a page after the header,
/// matching the standard ring sizing.
pub const fn ring_capacity<U>() -> usize {
    let raw = (PAGE_SIZE - RING_HEADER_SIZE) / core::mem::size_of::<U>();
    let mut cap = 1;
    while cap * 2 <= raw {
        cap *= 2;
    }
    cap
}

/// Shared page layout. The backend maps the same page through the ring
/// grant and reads/writes the opposite halves.
#[repr(C)]
pub struct SharedRing<U: Copy, const N: usize> {
    pub req_prod: u32,
    pub req_event: u32,
    pub rsp_prod: u32,
    pub rsp_event: u32,
    _pad: [u8; RING_HEADER_SIZE - 16],
    pub ring: [U; N],
}

/// Error returned by [`FrontRing::submit`] when no entry is free. Callers
/// suspend on their ring waiter queue and retry after the IRQ handler
/// frees entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// Frontend ring state: the shared page plus private index mirrors.
///
/// One writer at a time: request submission serializes on the embedded
/// producer mutex. The response side is only touched from the IRQ handler,
/// which the platform serializes per device.
pub struct FrontRing<U: Copy, const N: usize> {
    sring: NonNull<SharedRing<U, N>>,
    req_prod_pvt: AtomicU32,
    rsp_cons: AtomicU32,
    producer: spin::Mutex<()>,
}

// SAFETY: all shared-page accesses are volatile, private indices are
// atomics, and the producer side is serialized by the embedded mutex.
unsafe impl<U: Copy + Send, const N: usize> Send for FrontRing<U, N> {}
unsafe impl<U: Copy + Send, const N: usize> Sync for FrontRing<U, N> {}

impl<U: Copy, const N: usize> FrontRing<U, N> {
    /// Wrap a shared page as the frontend ring and initialize the shared
    /// indices (producer/consumer zero, both event thresholds 1 so each
    /// side asks to be notified about the first message).
    ///
    /// # Safety
    ///
    /// `page` must be one zeroed page, exclusively owned by this ring for
    /// its whole lifetime apart from the backend's mapping.
    pub unsafe fn new(page: NonNull<u8>) -> Self {
        const {
            assert!(N.is_power_of_two());
            assert!(core::mem::size_of::<SharedRing<U, N>>() <= PAGE_SIZE);
        }

        let ring = Self {
            sring: page.cast(),
            req_prod_pvt: AtomicU32::new(0),
            rsp_cons: AtomicU32::new(0),
            producer: spin::Mutex::new(()),
        };
        unsafe {
            let s = ring.sring.as_ptr();
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).req_prod), 0);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).rsp_prod), 0);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).req_event), 1);
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).rsp_event), 1);
        }
        ring
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Entries currently free for new requests. Advisory outside the
    /// producer lock; [`FrontRing::submit`] re-checks under it.
    pub fn free_entries(&self) -> usize {
        let pvt = self.req_prod_pvt.load(Ordering::Relaxed);
        let cons = self.rsp_cons.load(Ordering::Acquire);
        N - pvt.wrapping_sub(cons) as usize
    }

    pub fn is_full(&self) -> bool {
        self.free_entries() == 0
    }

    fn slot_ptr(&self, idx: u32) -> *mut U {
        let ring = unsafe { core::ptr::addr_of_mut!((*self.sring.as_ptr()).ring) };
        unsafe { ring.cast::<U>().add(idx as usize & (N - 1)) }
    }

    /// Queue one request and publish it, reporting whether the backend
    /// asked to be notified.
    ///
    /// Performs the standard commit-and-check-notify sequence: write the
    /// entry, advance the private producer, publish the shared producer
    /// index between fences, then compare against the backend's
    /// `req_event` threshold. A `true` return means the caller must send
    /// the event channel notification; `false` means the backend is
    /// already polling.
    pub fn submit(&self, entry: U) -> Result<bool, RingFull> {
        let _guard = self.producer.lock();

        let pvt = self.req_prod_pvt.load(Ordering::Relaxed);
        let cons = self.rsp_cons.load(Ordering::Acquire);
        if pvt.wrapping_sub(cons) as usize >= N {
            return Err(RingFull);
        }

        unsafe {
            core::ptr::write_volatile(self.slot_ptr(pvt), entry);
        }
        let new = pvt.wrapping_add(1);
        self.req_prod_pvt.store(new, Ordering::Relaxed);

        let s = self.sring.as_ptr();
        let old = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*s).req_prod)) };
        // The entry must be globally visible before the index that
        // publishes it, and the index before the event-threshold read.
        fence(Ordering::SeqCst);
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!((*s).req_prod), new);
        }
        fence(Ordering::SeqCst);
        let event = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*s).req_event)) };

        Ok(new.wrapping_sub(event) < new.wrapping_sub(old))
    }

    /// Drain every published response, invoking `f` on each.
    ///
    /// IRQ context only. After consuming a batch this re-arms `rsp_event`
    /// and re-checks `rsp_prod`, because the backend may publish more
    /// responses between the last fetch and the re-arm; the loop only
    /// exits once no unconsumed response remains.
    pub fn pop_responses<F: FnMut(U)>(&self, mut f: F) {
        let s = self.sring.as_ptr();
        loop {
            let prod = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*s).rsp_prod)) };
            fence(Ordering::SeqCst);

            let mut cons = self.rsp_cons.load(Ordering::Relaxed);
            while cons != prod {
                let entry = unsafe { core::ptr::read_volatile(self.slot_ptr(cons)) };
                cons = cons.wrapping_add(1);
                f(entry);
            }
            self.rsp_cons.store(cons, Ordering::Release);

            unsafe {
                core::ptr::write_volatile(
                    core::ptr::addr_of_mut!((*s).rsp_event),
                    cons.wrapping_add(1),
                );
            }
            fence(Ordering::SeqCst);
            let prod = unsafe { core::ptr::read_volatile(core::ptr::addr_of!((*s).rsp_prod)) };
            if prod == cons {
                break;
            }
        }
    }
}
