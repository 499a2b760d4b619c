//! # caldera-xen
//!
//! Xen platform layer for Caldera OS.
//!
//! This crate provides the pieces a paravirtualized frontend driver builds
//! on:
//! - [`GrantTable`] - capability tokens granting a foreign domain access to
//!   guest pages
//! - [`FrontRing`] - the frontend half of a shared request/response ring
//! - [`Hypercalls`], [`EventChannelOps`], [`XenStore`] traits - the
//!   hypervisor call, doorbell and configuration-store surfaces, implemented
//!   by platform code (and by in-process mocks behind the `std` feature)
//! - [`XenHal`] - page allocation and address translation supplied by the
//!   kernel
//!
//! The real hypercall trampoline and event upcall dispatch live in
//! platform code; everything here is written against the traits so the full
//! stack also runs on a host against [`mock`] implementations.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod evtchn;
pub mod gnttab;
pub mod hal;
pub mod hypercall;
pub mod ring;
pub mod store;

#[cfg(feature = "std")]
pub mod mock;

pub use error::{GrantStatus, XenError};
pub use evtchn::{EventChannelOps, IrqHandler};
pub use gnttab::{GrantFlags, GrantRef, GrantTable};
pub use hal::{WaitQueue, XenHal, PAGE_SIZE, pages_for};
pub use hypercall::Hypercalls;
pub use ring::{FrontRing, RingFull, SharedRing};
pub use store::{StoreError, XenStore, XenbusState};

use alloc::sync::Arc;

/// Domain identifier under the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DomId(pub u16);

/// Event channel port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct EvtchnPort(pub u32);

impl core::fmt::Display for DomId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::fmt::Display for EvtchnPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide Xen handles, constructed once at startup and passed by
/// reference to every component that needs them. No module globals.
#[derive(Clone)]
pub struct XenContext {
    pub hypercalls: Arc<dyn Hypercalls>,
    pub events: Arc<dyn EventChannelOps>,
    pub store: Arc<dyn XenStore>,
    pub grants: Arc<GrantTable>,
}
