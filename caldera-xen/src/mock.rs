//! Host-side implementations of the platform traits.
//!
//! Everything the driver stack needs from the kernel and the hypervisor,
//! backed by the host: heap pages with a fake machine-frame registry,
//! `Mutex`+`Condvar` wait queues, an in-process event-channel table and a
//! map-backed XenStore. Test code (and in-process backend emulators) talk
//! to the same trait surface the kernel implements, so the full driver
//! stack runs unmodified in `cargo test`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use std::alloc::Layout;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;

use crate::error::XenError;
use crate::evtchn::{EventChannelOps, IrqHandler};
use crate::hal::{WaitQueue, XenHal, PAGE_SIZE};
use crate::hypercall::Hypercalls;
use crate::store::{StoreError, XenStore};
use crate::{DomId, EvtchnPort};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `Mutex`+`Condvar` wait queue with a generation counter so wakeups
/// between the predicate check and the sleep are never lost.
#[derive(Default)]
pub struct StdWaitQueue {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl WaitQueue for StdWaitQueue {
    fn wait_while<F: FnMut() -> bool>(&self, mut pred: F) {
        let mut generation = lock(&self.generation);
        while pred() {
            let current = *generation;
            generation = self
                .cv
                .wait_while(generation, |g| *g == current)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wake_all(&self) {
        *lock(&self.generation) += 1;
        self.cv.notify_all();
    }
}

struct Region {
    mfn: u64,
    base: usize,
    pages: usize,
}

static REGIONS: Mutex<Vec<Region>> = Mutex::new(Vec::new());
static NEXT_MFN: AtomicU64 = AtomicU64::new(0x10_0000);

/// Host HAL: heap-backed pages, with each allocation registered under a
/// fake machine-frame range so virt/mfn translation works both ways (the
/// backend emulator follows grant entries back to guest memory through
/// it, the way a real backend follows the machine frame).
pub struct HostHal;

unsafe impl XenHal for HostHal {
    type WaitQueue = StdWaitQueue;

    fn alloc_pages(count: usize) -> NonNull<u8> {
        let count = count.max(1);
        let Ok(layout) = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE) else {
            unreachable!("page layout is always valid");
        };
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };

        let mfn = NEXT_MFN.fetch_add(count as u64, Ordering::Relaxed);
        lock(&REGIONS).push(Region {
            mfn,
            base: ptr.as_ptr() as usize,
            pages: count,
        });
        ptr
    }

    unsafe fn free_pages(ptr: NonNull<u8>, count: usize) {
        let count = count.max(1);
        lock(&REGIONS).retain(|r| r.base != ptr.as_ptr() as usize);
        let Ok(layout) = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE) else {
            unreachable!("page layout is always valid");
        };
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn virt_to_mfn(vaddr: usize) -> u64 {
        let regions = lock(&REGIONS);
        for r in regions.iter() {
            if vaddr >= r.base && vaddr < r.base + r.pages * PAGE_SIZE {
                return r.mfn + ((vaddr - r.base) / PAGE_SIZE) as u64;
            }
        }
        panic!("virt_to_mfn: {vaddr:#x} is not an allocated page");
    }

    fn mfn_to_virt(mfn: u64) -> usize {
        let regions = lock(&REGIONS);
        for r in regions.iter() {
            if mfn >= r.mfn && mfn < r.mfn + r.pages as u64 {
                return r.base + (mfn - r.mfn) as usize * PAGE_SIZE;
            }
        }
        panic!("mfn_to_virt: {mfn:#x} is not an allocated frame");
    }

    fn delay_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Mock grant-table/page-table hypercall surface.
pub struct MockHypervisor {
    frames: u32,
    fail_query: bool,
    next_frame: AtomicU64,
}

impl MockHypervisor {
    /// Hypervisor that backs `frames` grant-table frames.
    pub fn with_frames(frames: u32) -> Self {
        Self {
            frames,
            fail_query: false,
            next_frame: AtomicU64::new(0x8000),
        }
    }

    /// Hypervisor without `GNTTABOP_query_size` support, to exercise the
    /// legacy fallback.
    pub fn with_failing_query() -> Self {
        Self {
            frames: 0,
            fail_query: true,
            next_frame: AtomicU64::new(0x8000),
        }
    }
}

impl Hypercalls for MockHypervisor {
    fn grant_query_size(&self) -> Result<u32, XenError> {
        if self.fail_query {
            Err(XenError::Hypercall(-38)) // ENOSYS
        } else {
            Ok(self.frames)
        }
    }

    fn grant_setup_table(&self, frames: &mut [u64]) -> Result<(), XenError> {
        for frame in frames {
            *frame = self.next_frame.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn update_va_mapping(&self, _vaddr: usize, _pte: u64) -> Result<(), XenError> {
        // Host pages are already mapped; the table memory handed to
        // GrantTable::setup is directly usable.
        Ok(())
    }
}

struct PortState {
    port: EvtchnPort,
    #[allow(dead_code)]
    remote: DomId,
    guest_handler: Option<IrqHandler>,
    remote_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// In-process event channel table.
///
/// `notify` runs the remote-side hook a backend emulator registers with
/// [`MockEvents::set_remote_hook`]; the emulator delivers its completion
/// upcalls through [`MockEvents::raise_guest_irq`], which runs the handler
/// the frontend bound.
pub struct MockEvents {
    ports: Mutex<Vec<PortState>>,
    next_port: AtomicU32,
}

impl MockEvents {
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(Vec::new()),
            next_port: AtomicU32::new(1),
        }
    }

    /// Register the backend-side callback run when the guest notifies.
    pub fn set_remote_hook(&self, port: EvtchnPort, hook: Arc<dyn Fn() + Send + Sync>) {
        let mut ports = lock(&self.ports);
        if let Some(state) = ports.iter_mut().find(|p| p.port == port) {
            state.remote_hook = Some(hook);
        }
    }

    /// Deliver an upcall to the guest-side handler bound on `port`.
    pub fn raise_guest_irq(&self, port: EvtchnPort) {
        let handler = lock(&self.ports)
            .iter()
            .find(|p| p.port == port)
            .and_then(|p| p.guest_handler.clone());
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl EventChannelOps for MockEvents {
    fn alloc_unbound(&self, remote: DomId) -> Result<EvtchnPort, XenError> {
        let port = EvtchnPort(self.next_port.fetch_add(1, Ordering::Relaxed));
        lock(&self.ports).push(PortState {
            port,
            remote,
            guest_handler: None,
            remote_hook: None,
        });
        Ok(port)
    }

    fn notify(&self, port: EvtchnPort) -> Result<(), XenError> {
        let hook = lock(&self.ports)
            .iter()
            .find(|p| p.port == port)
            .map(|p| p.remote_hook.clone())
            .ok_or(XenError::Hypercall(-22))?; // EINVAL: no such port
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    fn bind_handler(&self, port: EvtchnPort, handler: IrqHandler) -> Result<(), XenError> {
        let mut ports = lock(&self.ports);
        let state = ports
            .iter_mut()
            .find(|p| p.port == port)
            .ok_or(XenError::Hypercall(-22))?;
        state.guest_handler = Some(handler);
        Ok(())
    }
}

/// Map-backed XenStore.
#[derive(Default)]
pub struct MockStore {
    map: Mutex<HashMap<String, String>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key, as the toolstack would before the frontend looks.
    pub fn insert(&self, path: &str, value: &str) {
        lock(&self.map).insert(path.to_string(), value.to_string());
    }

    pub fn remove(&self, path: &str) {
        lock(&self.map).remove(path);
    }
}

impl XenStore for MockStore {
    fn read(&self, path: &str) -> Result<String, StoreError> {
        lock(&self.map)
            .get(path)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.map).insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn ls(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let prefix = alloc::format!("{path}/");
        let map = lock(&self.map);
        let mut children: Vec<String> = map
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(end) => rest[..end].to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.sort_unstable();
        children.dedup();
        if children.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(children)
    }
}
