//! The block frontend device.
//!
//! `read`/`write` copy caller data through a pool slot, queue one blkif
//! request on the shared ring, notify the backend if it asked to be
//! notified, and suspend until the IRQ handler posts the completion
//! status. Completions are matched by the slot index round-tripped in the
//! request id, so the backend may reorder them freely.

use alloc::string::String;
use alloc::sync::Arc;

use caldera_storage::{BlockDevice, BlockError, Geometry};
use caldera_xen::ring::RingFull;
use caldera_xen::{EvtchnPort, EventChannelOps, FrontRing, GrantRef, WaitQueue, XenHal, PAGE_SIZE};

use crate::backend::BackendConnection;
use crate::error::BlkError;
use crate::pool::SlotGuard;
use crate::proto::{
    BlkifEntry, BlkifRequest, BlkifSegment, BLKIF_OP_READ, BLKIF_OP_WRITE, BLKIF_RSP_OKAY,
    RING_SIZE,
};

/// Ring-facing half of a device, shared with the bound IRQ handler.
///
/// This is all the completion path needs: the interrupt handler drains
/// responses, routes each status to the pool by slot id, and wakes anyone
/// waiting for ring space. It never blocks.
pub(crate) struct IoChannel<H: XenHal> {
    pub(crate) ring: FrontRing<BlkifEntry, RING_SIZE>,
    pub(crate) ring_space: H::WaitQueue,
    pub(crate) backend: Arc<BackendConnection<H>>,
}

impl<H: XenHal> IoChannel<H> {
    pub(crate) fn handle_interrupt(&self) {
        self.ring.pop_responses(|entry| {
            let rsp = entry.response();
            self.backend.pool.complete(rsp.id, rsp.status);
        });
        self.ring_space.wake_all();
    }
}

/// One attached virtual block device.
pub struct BlockFront<H: XenHal> {
    pub(crate) id: u16,
    pub(crate) name: String,
    /// Backend's logical sector size; ring sector numbers and segment
    /// sub-ranges are in these units.
    pub(crate) sector_size: u32,
    /// Exposed block size (the backend's physical sector size).
    pub(crate) block_size: u32,
    pub(crate) size: u64,
    pub(crate) port: EvtchnPort,
    pub(crate) ring_gref: GrantRef,
    pub(crate) events: Arc<dyn EventChannelOps>,
    pub(crate) chan: Arc<IoChannel<H>>,
}

impl<H: XenHal> BlockFront<H> {
    /// Device name as registered with the block layer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Virtual device id (the blkif request handle).
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Grant reference of the shared ring page.
    pub fn ring_ref(&self) -> GrantRef {
        self.ring_gref
    }

    /// Deliver a completion upcall. Exposed for platforms that dispatch
    /// interrupts by device rather than by bound closure.
    pub fn handle_interrupt(&self) {
        self.chan.handle_interrupt();
    }

    /// Transfer `count` bytes starting at block `blkno`; `buf` is wrapped
    /// by the public read/write entry points.
    fn do_io(&self, op: u8, count: usize, blkno: u64, buf: IoBuf<'_>) -> Result<usize, BlkError> {
        if count == 0 {
            return Ok(0);
        }
        let segments = count.div_ceil(PAGE_SIZE);
        let mut slot = self.backend().pool.acquire(segments)?;

        if let IoBuf::Out(data) = &buf {
            slot.buffer_mut()[..count].copy_from_slice(data);
        }

        let request = self.build_request(&slot, op, count, blkno);
        let status = self.submit_and_wait(&slot, request);
        if status != BLKIF_RSP_OKAY {
            return Err(BlkError::Io(status));
        }

        if let IoBuf::In(data) = buf {
            data.copy_from_slice(&slot.buffer()[..count]);
        }
        Ok(count)
    }

    fn backend(&self) -> &BackendConnection<H> {
        &self.chan.backend
    }

    fn build_request(
        &self,
        slot: &SlotGuard<'_, H>,
        op: u8,
        count: usize,
        blkno: u64,
    ) -> BlkifRequest {
        let segments = count.div_ceil(PAGE_SIZE);
        let sector_size = self.sector_size as usize;

        let mut request = BlkifRequest {
            operation: op,
            nr_segments: segments as u8,
            handle: self.id,
            id: u64::from(slot.index()),
            // Caller blocks are converted to the negotiated sector size.
            sector_number: blkno * u64::from(self.block_size) / u64::from(self.sector_size),
            ..Default::default()
        };

        let full_page_last = ((PAGE_SIZE - 1) / sector_size) as u8;
        for (seg, gref) in request.seg[..segments].iter_mut().zip(slot.grefs()) {
            *seg = BlkifSegment {
                gref: gref.0,
                first_sect: 0,
                last_sect: full_page_last,
                _pad: [0; 2],
            };
        }
        // The final page may be partial; truncate its sector range to the
        // bytes actually transferred.
        request.seg[segments - 1].last_sect = (((count - 1) % PAGE_SIZE) / sector_size) as u8;

        request
    }

    /// Queue the request, blocking while the ring is full, and wait for
    /// the IRQ handler to post the terminal status.
    fn submit_and_wait(&self, slot: &SlotGuard<'_, H>, request: BlkifRequest) -> i16 {
        // The completion can race submit's return; mark the slot in
        // flight before the backend can see the request.
        slot.begin();

        let entry = BlkifEntry::from_request(request);
        loop {
            match self.chan.ring.submit(entry) {
                Ok(notify) => {
                    if notify {
                        if let Err(e) = self.events.notify(self.port) {
                            log::warn!("{}: event notify failed: {e}", self.name);
                        }
                    }
                    break;
                }
                Err(RingFull) => {
                    self.chan
                        .ring_space
                        .wait_while(|| self.chan.ring.is_full());
                }
            }
        }

        slot.wait_status()
    }
}

enum IoBuf<'a> {
    /// Device-to-caller (read): filled after completion.
    In(&'a mut [u8]),
    /// Caller-to-device (write): copied into the slot before submission.
    Out(&'a [u8]),
}

impl<H: XenHal> BlockDevice for BlockFront<H> {
    fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            size: self.size,
        }
    }

    fn read(&self, buf: &mut [u8], blkno: u64) -> Result<usize, BlockError> {
        let count = buf.len();
        self.do_io(BLKIF_OP_READ, count, blkno, IoBuf::In(buf))
            .map_err(BlockError::from)
    }

    fn write(&self, buf: &[u8], blkno: u64) -> Result<usize, BlockError> {
        self.do_io(BLKIF_OP_WRITE, buf.len(), blkno, IoBuf::Out(buf))
            .map_err(BlockError::from)
    }
}
