//! Shared test fixture: a mock Xen environment plus an in-process disk
//! backend serving the shared ring the way a real backend domain would -
//! following grant references to guest pages, honoring the req/rsp event
//! thresholds, and delivering completion upcalls over the event channel.

// Each test binary uses a different slice of this fixture.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use std::vec::Vec;

use caldera_storage::DeviceRegistry;
use caldera_xen::mock::{HostHal, MockEvents, MockHypervisor, MockStore};
use caldera_xen::{
    DomId, EvtchnPort, GrantFlags, GrantRef, GrantTable, XenContext, XenHal, XenStore, PAGE_SIZE,
};
use caldera_xen_blk::proto::{
    BlkifEntry, BlkifRequest, BlkifResponse, BLKIF_MAX_SEGMENTS_PER_REQUEST, BLKIF_OP_READ,
    BLKIF_OP_WRITE, BLKIF_RSP_EOPNOTSUPP, BLKIF_RSP_ERROR, BLKIF_RSP_OKAY, RING_SIZE,
};
use caldera_xen_blk::{Backends, PoolConfig};

use core::sync::atomic::fence;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TestEnv {
    pub ctx: XenContext,
    pub store: Arc<MockStore>,
    pub events: Arc<MockEvents>,
    pub grants: Arc<GrantTable>,
    pub backends: Backends<HostHal>,
    pub registry: DeviceRegistry,
}

pub fn env(pool: PoolConfig) -> TestEnv {
    let hypercalls = Arc::new(MockHypervisor::with_frames(8));
    let grants = match GrantTable::setup::<HostHal>(&*hypercalls) {
        Ok(t) => Arc::new(t),
        Err(e) => panic!("grant table setup failed: {e}"),
    };
    let events = Arc::new(MockEvents::new());
    let store = Arc::new(MockStore::new());
    let ctx = XenContext {
        hypercalls,
        events: events.clone(),
        store: store.clone(),
        grants: grants.clone(),
    };
    TestEnv {
        ctx,
        store,
        events,
        grants,
        backends: Backends::new(pool),
        registry: DeviceRegistry::new(),
    }
}

pub struct DeviceSeed<'a> {
    pub id: u16,
    pub backend_path: &'a str,
    pub sectors: u64,
    pub sector_size: Option<u32>,
    pub phys_sector_size: Option<u32>,
    pub dev_name: Option<&'a str>,
}

impl Default for DeviceSeed<'_> {
    fn default() -> Self {
        Self {
            id: 0,
            backend_path: "backend/vbd/1/0",
            sectors: 2048,
            sector_size: Some(512),
            phys_sector_size: Some(512),
            dev_name: Some("xvda"),
        }
    }
}

/// Populate the store the way the toolstack and a connected backend would.
pub fn seed_device(store: &MockStore, seed: &DeviceSeed<'_>) {
    let front = format!("device/vbd/{}", seed.id);
    store.insert(&format!("{front}/backend-id"), "0");
    store.insert(&format!("{front}/backend"), seed.backend_path);

    let backend = seed.backend_path;
    store.insert(&format!("{backend}/state"), "4");
    store.insert(&format!("{backend}/sectors"), &format!("{}", seed.sectors));
    if let Some(ss) = seed.sector_size {
        store.insert(&format!("{backend}/sector-size"), &format!("{ss}"));
    }
    if let Some(ps) = seed.phys_sector_size {
        store.insert(&format!("{backend}/physical-sector-size"), &format!("{ps}"));
    }
    if let Some(name) = seed.dev_name {
        store.insert(&format!("{backend}/dev"), name);
    }
}

pub struct BackendConfig {
    pub sector_size: u32,
    /// Respond only once this many requests are pending (the idle flush
    /// still drains stragglers after ~50ms).
    pub hold: usize,
    /// Complete each batch in reverse submission order.
    pub reverse: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sector_size: 512,
            hold: 1,
            reverse: false,
        }
    }
}

/// Handle on the emulated backend domain. Dropping it stops the thread.
pub struct DiskBackend {
    pub disk: Arc<Mutex<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    doorbell: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl DiskBackend {
    pub fn disk_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        lock(&self.disk)[offset..offset + len].to_vec()
    }
}

impl Drop for DiskBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let (flag, cv) = &*self.doorbell;
        *lock(flag) = true;
        cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start serving the ring a successfully attached device published.
pub fn start_backend(env: &TestEnv, device_id: u16, disk_len: usize, cfg: BackendConfig) -> DiskBackend {
    let front = format!("device/vbd/{device_id}");
    let ring_ref = match env.store.read_u32(&format!("{front}/ring-ref")) {
        Ok(r) => GrantRef(r),
        Err(e) => panic!("ring-ref not published: {e}"),
    };
    let port = match env.store.read_u32(&format!("{front}/event-channel")) {
        Ok(p) => EvtchnPort(p),
        Err(e) => panic!("event-channel not published: {e}"),
    };
    let domid = match env.store.read_u16(&format!("{front}/backend-id")) {
        Ok(d) => DomId(d),
        Err(e) => panic!("backend-id missing: {e}"),
    };

    let ring_entry = match env.grants.read_entry(ring_ref) {
        Some(e) => e,
        None => panic!("ring grant {ring_ref} out of range"),
    };
    assert!(
        GrantFlags::from_bits_truncate(ring_entry.flags).contains(GrantFlags::PERMIT_ACCESS),
        "ring grant not yet valid"
    );
    assert_eq!(ring_entry.domid, domid.0, "ring granted to wrong domain");
    let sring = HostHal::mfn_to_virt(u64::from(ring_entry.frame));

    let disk = Arc::new(Mutex::new(vec![0u8; disk_len]));
    let stop = Arc::new(AtomicBool::new(false));
    let doorbell = Arc::new((Mutex::new(false), Condvar::new()));

    {
        let doorbell = doorbell.clone();
        env.events.set_remote_hook(
            port,
            Arc::new(move || {
                let (flag, cv) = &*doorbell;
                *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
                cv.notify_all();
            }),
        );
    }

    let thread = {
        let disk = disk.clone();
        let stop = stop.clone();
        let doorbell = doorbell.clone();
        let events = env.events.clone();
        let grants = env.grants.clone();
        std::thread::spawn(move || {
            run_backend(sring, port, domid, cfg, events, grants, disk, stop, doorbell);
        })
    };

    DiskBackend {
        disk,
        stop,
        doorbell,
        thread: Some(thread),
    }
}

// Shared-page offsets, backend side.
const REQ_PROD: usize = 0;
const REQ_EVENT: usize = 4;
const RSP_PROD: usize = 8;
const RSP_EVENT: usize = 12;
const ENTRIES: usize = 64;

fn ring_read_u32(sring: usize, offset: usize) -> u32 {
    unsafe { core::ptr::read_volatile((sring + offset) as *const u32) }
}

fn ring_write_u32(sring: usize, offset: usize, value: u32) {
    unsafe { core::ptr::write_volatile((sring + offset) as *mut u32, value) }
}

fn entry_ptr(sring: usize, idx: u32) -> *mut BlkifEntry {
    let slot = (idx as usize) & (RING_SIZE - 1);
    (sring + ENTRIES + slot * core::mem::size_of::<BlkifEntry>()) as *mut BlkifEntry
}

#[allow(clippy::too_many_arguments)]
fn run_backend(
    sring: usize,
    port: EvtchnPort,
    domid: DomId,
    cfg: BackendConfig,
    events: Arc<MockEvents>,
    grants: Arc<GrantTable>,
    disk: Arc<Mutex<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    doorbell: Arc<(Mutex<bool>, Condvar)>,
) {
    let mut req_cons: u32 = 0;
    let mut rsp_prod_pvt: u32 = 0;
    let mut pending: Vec<BlkifRequest> = Vec::new();
    let mut idle_rounds = 0u32;

    while !stop.load(Ordering::Acquire) {
        let prod = ring_read_u32(sring, REQ_PROD);
        fence(Ordering::SeqCst);
        let mut new_work = false;
        while req_cons != prod {
            let entry = unsafe { core::ptr::read_volatile(entry_ptr(sring, req_cons)) };
            pending.push(entry.request());
            req_cons = req_cons.wrapping_add(1);
            new_work = true;
        }

        if new_work {
            idle_rounds = 0;
        }

        if !pending.is_empty() && (pending.len() >= cfg.hold || idle_rounds >= 25) {
            let mut batch = std::mem::take(&mut pending);
            if cfg.reverse {
                batch.reverse();
            }
            for req in batch {
                let status = process(&req, &grants, &disk, domid, cfg.sector_size);
                let rsp = BlkifResponse {
                    id: req.id,
                    operation: req.operation,
                    _pad: 0,
                    status,
                };
                unsafe {
                    core::ptr::write_volatile(
                        entry_ptr(sring, rsp_prod_pvt),
                        BlkifEntry::from_response(rsp),
                    );
                }
                rsp_prod_pvt = rsp_prod_pvt.wrapping_add(1);
            }

            // Publish and check whether the frontend wants an upcall.
            let old = ring_read_u32(sring, RSP_PROD);
            fence(Ordering::SeqCst);
            ring_write_u32(sring, RSP_PROD, rsp_prod_pvt);
            fence(Ordering::SeqCst);
            let event = ring_read_u32(sring, RSP_EVENT);
            if rsp_prod_pvt.wrapping_sub(event) < rsp_prod_pvt.wrapping_sub(old) {
                events.raise_guest_irq(port);
            }
            continue;
        }

        if new_work {
            continue;
        }
        idle_rounds += 1;

        // Going idle: ask for a notification, then re-check for requests
        // that raced in.
        ring_write_u32(sring, REQ_EVENT, req_cons.wrapping_add(1));
        fence(Ordering::SeqCst);
        if ring_read_u32(sring, REQ_PROD) != req_cons {
            continue;
        }

        let (flag, cv) = &*doorbell;
        let mut rung = lock(flag);
        if !*rung {
            let (guard, _) = cv
                .wait_timeout(rung, Duration::from_millis(2))
                .unwrap_or_else(PoisonError::into_inner);
            rung = guard;
        }
        *rung = false;
    }
}

/// Serve one request, enforcing the grant semantics a real backend relies
/// on: the entry must permit access, name this domain, and allow writes
/// where the operation needs them.
fn process(
    req: &BlkifRequest,
    grants: &GrantTable,
    disk: &Mutex<Vec<u8>>,
    domid: DomId,
    sector_size: u32,
) -> i16 {
    let nseg = req.nr_segments as usize;
    if nseg == 0 || nseg > BLKIF_MAX_SEGMENTS_PER_REQUEST {
        return BLKIF_RSP_ERROR;
    }
    if req.operation != BLKIF_OP_READ && req.operation != BLKIF_OP_WRITE {
        return BLKIF_RSP_EOPNOTSUPP;
    }

    let ss = sector_size as usize;
    let mut sector = req.sector_number as usize;
    let mut disk = lock(disk);

    for seg in &req.seg[..nseg] {
        let Some(entry) = grants.read_entry(GrantRef(seg.gref)) else {
            return BLKIF_RSP_ERROR;
        };
        let flags = GrantFlags::from_bits_truncate(entry.flags);
        if !flags.contains(GrantFlags::PERMIT_ACCESS) || entry.domid != domid.0 {
            return BLKIF_RSP_ERROR;
        }
        if req.operation == BLKIF_OP_READ && flags.contains(GrantFlags::READONLY) {
            // Reads write into the guest buffer.
            return BLKIF_RSP_ERROR;
        }
        if seg.last_sect < seg.first_sect {
            return BLKIF_RSP_ERROR;
        }

        let page = HostHal::mfn_to_virt(u64::from(entry.frame));
        let offset = seg.first_sect as usize * ss;
        let sectors = seg.last_sect as usize - seg.first_sect as usize + 1;
        let len = sectors * ss;
        if offset + len > PAGE_SIZE {
            return BLKIF_RSP_ERROR;
        }
        let disk_offset = sector * ss;
        if disk_offset + len > disk.len() {
            return BLKIF_RSP_ERROR;
        }

        unsafe {
            let guest = (page + offset) as *mut u8;
            if req.operation == BLKIF_OP_READ {
                core::ptr::copy_nonoverlapping(disk.as_ptr().add(disk_offset), guest, len);
            } else {
                core::ptr::copy_nonoverlapping(guest, disk.as_mut_ptr().add(disk_offset), len);
            }
        }
        sector += sectors;
    }

    BLKIF_RSP_OKAY
}
