//! Event channel interface.
//!
//! Event channels are the asynchronous doorbell between two domains: the
//! frontend notifies the backend that requests are queued, the backend
//! signals completions back, delivered to the guest as an upcall on the
//! bound handler. Allocation and send are `HYPERVISOR_event_channel_op`
//! hypercalls; upcall dispatch belongs to the platform interrupt code.
//! Both live behind this trait.

use alloc::sync::Arc;

use crate::error::XenError;
use crate::{DomId, EvtchnPort};

/// Callback invoked in IRQ context when the remote end signals the port.
/// Handlers must not block.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// Event channel allocation, signaling and upcall binding.
pub trait EventChannelOps: Send + Sync {
    /// Allocate a new unbound channel for `remote` to bind to
    /// (`EVTCHNOP_alloc_unbound` with `dom = DOMID_SELF`).
    fn alloc_unbound(&self, remote: DomId) -> Result<EvtchnPort, XenError>;

    /// Signal the remote end of `port` (`EVTCHNOP_send`).
    fn notify(&self, port: EvtchnPort) -> Result<(), XenError>;

    /// Bind `handler` to upcalls on `port`. At most one handler per port;
    /// rebinding replaces the previous handler.
    fn bind_handler(&self, port: EvtchnPort, handler: IrqHandler) -> Result<(), XenError>;
}
