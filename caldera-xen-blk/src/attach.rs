//! Device attach handshake and probe.
//!
//! Per device, attach walks a one-shot state machine over XenStore:
//! discover the backend domain, build the ring/grants/event channel,
//! publish the connection parameters, wait (bounded) for the backend to
//! report Connected, then read the geometry and register the device.
//! Failure at any step aborts that device's creation and surfaces the
//! error; resources already granted or allocated are not rolled back, they
//! share the device's forever lifetime.

use alloc::format;
use alloc::sync::Arc;

use caldera_storage::DeviceRegistry;
use caldera_xen::{DomId, FrontRing, XenContext, XenHal, XenbusState, PAGE_SIZE};

use log::{debug, error};

use crate::backend::Backends;
use crate::error::BlkError;
use crate::front::{BlockFront, IoChannel};

/// Poll attempts for the backend to reach Connected.
pub const BACKEND_WAIT_RETRIES: u32 = 10;
/// Sleep between backend state polls.
pub const BACKEND_WAIT_DELAY_MS: u64 = 10;

/// Default sector size when the backend does not publish one.
const DEFAULT_SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Discovering,
    Initializing,
    Publishing,
    AwaitingBackend,
    Ready,
}

/// Attach the virtual block device `id`, registering it on success.
pub fn attach<H: XenHal>(
    ctx: &XenContext,
    backends: &Backends<H>,
    registry: &DeviceRegistry,
    id: u16,
) -> Result<Arc<BlockFront<H>>, BlkError> {
    match attach_inner(ctx, backends, registry, id) {
        Ok(front) => Ok(front),
        Err(e) => {
            error!("vbd {id}: attach failed: {e}");
            Err(e)
        }
    }
}

fn attach_inner<H: XenHal>(
    ctx: &XenContext,
    backends: &Backends<H>,
    registry: &DeviceRegistry,
    id: u16,
) -> Result<Arc<BlockFront<H>>, BlkError> {
    let front_path = format!("device/vbd/{id}");

    debug!("vbd {id}: {:?}", HandshakeState::Discovering);
    let backend_id = ctx
        .store
        .read_u16(&format!("{front_path}/backend-id"))
        .map_err(|_| BlkError::MissingField("backend-id"))?;
    let backend_path = ctx
        .store
        .read(&format!("{front_path}/backend"))
        .map_err(|_| BlkError::MissingField("backend"))?;

    debug!("vbd {id}: {:?}", HandshakeState::Initializing);
    let backend = backends.get_or_create(&ctx.grants, DomId(backend_id))?;

    let ring_page = H::alloc_pages(1);
    // SAFETY: freshly allocated zeroed page, owned by this ring for the
    // device's lifetime.
    let ring = unsafe { FrontRing::new(ring_page) };
    let ring_gref = ctx.grants.grant_access(
        backend.id,
        H::virt_to_mfn(ring_page.as_ptr() as usize),
        false,
    )?;

    let port = ctx.events.alloc_unbound(backend.id)?;
    let chan = Arc::new(IoChannel {
        ring,
        ring_space: H::WaitQueue::default(),
        backend: backend.clone(),
    });
    {
        let chan = chan.clone();
        ctx.events
            .bind_handler(port, Arc::new(move || chan.handle_interrupt()))?;
    }

    debug!(
        "vbd {id}: {:?} (ring-ref {ring_gref}, port {port})",
        HandshakeState::Publishing
    );
    ctx.store
        .write(&format!("{front_path}/ring-ref"), &format!("{ring_gref}"))?;
    ctx.store
        .write(&format!("{front_path}/event-channel"), &format!("{port}"))?;
    ctx.store
        .write(&format!("{front_path}/feature-persistent"), "1")?;
    ctx.store
        .write(&format!("{front_path}/feature-large-sector-size"), "1")?;
    ctx.store.write(
        &format!("{front_path}/state"),
        &format!("{}", XenbusState::Connected.raw()),
    )?;

    debug!("vbd {id}: {:?}", HandshakeState::AwaitingBackend);
    let mut state = XenbusState::Unknown;
    for _ in 0..BACKEND_WAIT_RETRIES {
        if state.raw() >= XenbusState::Connected.raw() {
            break;
        }
        H::delay_ms(BACKEND_WAIT_DELAY_MS);
        state = XenbusState::from_raw(
            ctx.store
                .read_u32(&format!("{backend_path}/state"))
                .map_err(BlkError::Store)?,
        );
    }
    if state != XenbusState::Connected {
        return Err(BlkError::BackendNotReady);
    }

    debug!("vbd {id}: {:?}", HandshakeState::Ready);
    let name = ctx
        .store
        .read(&format!("{backend_path}/dev"))
        .unwrap_or_else(|_| format!("xvd{id}"));
    let sector_size = ctx
        .store
        .read_u32(&format!("{backend_path}/sector-size"))
        .unwrap_or(DEFAULT_SECTOR_SIZE);
    let block_size = ctx
        .store
        .read_u32(&format!("{backend_path}/physical-sector-size"))
        .unwrap_or(sector_size);
    if sector_size == 0
        || sector_size as usize > PAGE_SIZE
        || !sector_size.is_power_of_two()
        || block_size % sector_size != 0
    {
        return Err(BlkError::BadGeometry);
    }
    let sectors = ctx
        .store
        .read_u64(&format!("{backend_path}/sectors"))
        .map_err(|_| BlkError::MissingField("sectors"))?;

    let front = Arc::new(BlockFront {
        id,
        name: name.clone(),
        sector_size,
        block_size,
        size: u64::from(sector_size) * sectors,
        port,
        ring_gref,
        events: ctx.events.clone(),
        chan,
    });

    registry
        .register(name, front.clone())
        .map_err(|_| BlkError::AlreadyRegistered)?;

    Ok(front)
}

/// Enumerate `device/vbd` and attach every child. The first failing
/// device aborts the probe; devices already attached stay attached.
pub fn probe<H: XenHal>(
    ctx: &XenContext,
    backends: &Backends<H>,
    registry: &DeviceRegistry,
) -> Result<usize, BlkError> {
    let Ok(ids) = ctx.store.ls("device/vbd") else {
        // No virtual block devices offered to this domain.
        return Ok(0);
    };

    let mut attached = 0;
    for id in &ids {
        let id: u16 = parse_device_id(id)?;
        attach(ctx, backends, registry, id)?;
        attached += 1;
    }
    Ok(attached)
}

fn parse_device_id(raw: &str) -> Result<u16, BlkError> {
    raw.parse()
        .map_err(|_| BlkError::MissingField("device id"))
}
