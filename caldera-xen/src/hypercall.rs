//! Hypervisor call surface used by the grant-table code.
//!
//! The actual trampoline is platform code; this trait captures the three
//! operations the platform layer needs, with the hypervisor's signed-status
//! convention (negative return means failure) already folded into
//! [`XenError`].

use crate::error::XenError;

/// Page-table entry bits for mapping grant-table frames: present | rw | user.
pub const PTE_FLAGS_RW: u64 = 7;

/// Grant-table and page-table hypercalls.
///
/// Implementations translate each call into the corresponding
/// `HYPERVISOR_grant_table_op` / `HYPERVISOR_update_va_mapping` invocation
/// and map failures (negative return values, `GNTST_*` status fields) into
/// [`XenError`].
pub trait Hypercalls: Send + Sync {
    /// Maximum number of grant-table frames the hypervisor will back
    /// (`GNTTABOP_query_size`). Callers fall back to the legacy limit when
    /// this fails.
    fn grant_query_size(&self) -> Result<u32, XenError>;

    /// Ask the hypervisor to back `frames.len()` grant-table frames
    /// (`GNTTABOP_setup_table`); machine frame numbers are written into
    /// `frames`.
    fn grant_setup_table(&self, frames: &mut [u64]) -> Result<(), XenError>;

    /// Point the page-table entry for `vaddr` at `pte`
    /// (`HYPERVISOR_update_va_mapping`, with TLB flush).
    fn update_va_mapping(&self, vaddr: usize, pte: u64) -> Result<(), XenError>;
}
