//! Hardware abstraction layer for the Xen platform code.
//!
//! The kernel implements [`XenHal`] to provide page allocation, address
//! translation and thread blocking; the `std` feature provides
//! [`crate::mock::HostHal`] so the same driver code runs in host tests.

use core::ptr::NonNull;

/// Size of a guest page shared with the hypervisor.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed for `size` bytes.
pub const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Condition-variable style wait queue.
///
/// Waiters suspend until woken and re-evaluate their predicate on every
/// wakeup; wakers wake everyone. The kernel backs this with its scheduler
/// wait queues, the host backs it with `Mutex` + `Condvar`. No
/// implementation may busy-wait.
pub trait WaitQueue: Send + Sync + Default + 'static {
    /// Block the calling thread until `pred` returns false. The predicate
    /// is re-checked after every wakeup; returning with `pred` still true
    /// is not permitted. Waits are unbounded.
    fn wait_while<F: FnMut() -> bool>(&self, pred: F);

    /// Wake all current waiters.
    fn wake_all(&self);
}

/// Platform primitives for Xen frontends.
///
/// # Safety
///
/// Implementations must ensure:
/// - `alloc_pages` returns zeroed, page-aligned, physically contiguous
///   memory valid until `free_pages`
/// - `virt_to_mfn`/`mfn_to_virt` translations are correct and stable for
///   the lifetime of the mapping
pub unsafe trait XenHal: 'static {
    /// Wait queue type backing blocking waits in drivers.
    type WaitQueue: WaitQueue;

    /// Allocate `count` zeroed, page-aligned pages. Allocation failure is
    /// fatal to the kernel allocator and does not return.
    fn alloc_pages(count: usize) -> NonNull<u8>;

    /// Release pages obtained from [`XenHal::alloc_pages`].
    ///
    /// # Safety
    ///
    /// `ptr` and `count` must come from a matching `alloc_pages` call, and
    /// no grant issued on the pages may still be live.
    unsafe fn free_pages(ptr: NonNull<u8>, count: usize);

    /// Machine frame number backing a virtual address.
    fn virt_to_mfn(vaddr: usize) -> u64;

    /// Virtual address mapping a machine frame number.
    fn mfn_to_virt(mfn: u64) -> usize;

    /// Sleep the calling thread for at least `ms` milliseconds.
    fn delay_ms(ms: u64);
}
