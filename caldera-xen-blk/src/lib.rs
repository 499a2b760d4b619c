//! # caldera-xen-blk
//!
//! Xen paravirtualized block frontend for Caldera OS.
//!
//! The driver multiplexes caller threads onto a fixed set of pre-granted
//! DMA buffers ([`RequestPool`]), queues blkif requests on a shared ring
//! granted to the backend domain, and matches completions delivered over
//! an event channel back to the blocked callers. Device discovery and the
//! connection handshake run over XenStore ([`attach`], [`probe`]).
//!
//! Resource exhaustion (pool slots, ring entries) blocks callers rather
//! than failing; waits are unbounded, as appropriate for a cooperative
//! paravirtualized backend. Only the handshake's backend-readiness poll is
//! bounded.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod attach;
pub mod backend;
pub mod error;
pub mod front;
pub mod pool;
pub mod proto;

pub use attach::{attach, probe, BACKEND_WAIT_DELAY_MS, BACKEND_WAIT_RETRIES};
pub use backend::{BackendConnection, Backends};
pub use error::BlkError;
pub use front::BlockFront;
pub use pool::{PoolConfig, RequestPool, SlotGuard};
pub use proto::RING_SIZE;
