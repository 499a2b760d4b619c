//! Per-backend-domain shared state.
//!
//! One backend domain may serve several virtual block devices; the
//! request pool (and its pre-issued grants) is shared per domain, while
//! each device keeps its own ring, event channel and geometry. The
//! registry is an explicit object constructed at startup and passed to
//! `probe`/`attach`; there are no module-level device lists.

use alloc::sync::Arc;
use alloc::vec::Vec;

use caldera_xen::{DomId, GrantTable, XenError, XenHal};

use crate::pool::{PoolConfig, RequestPool};

/// Shared state for one remote domain: its id and the request pool whose
/// buffers are granted to it.
pub struct BackendConnection<H: XenHal> {
    pub id: DomId,
    pub pool: RequestPool<H>,
}

/// Registry of live backend connections, keyed by domain id.
pub struct Backends<H: XenHal> {
    config: PoolConfig,
    inner: spin::Mutex<Vec<Arc<BackendConnection<H>>>>,
}

impl<H: XenHal> Backends<H> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: spin::Mutex::new(Vec::new()),
        }
    }

    /// Look up the connection for `id`, building it (and its pre-granted
    /// pool) on first use.
    pub fn get_or_create(
        &self,
        grants: &GrantTable,
        id: DomId,
    ) -> Result<Arc<BackendConnection<H>>, XenError> {
        if let Some(existing) = self.inner.lock().iter().find(|b| b.id == id) {
            return Ok(existing.clone());
        }

        // Built outside the lock: pool construction allocates and grants
        // every slot buffer.
        let built = Arc::new(BackendConnection {
            id,
            pool: RequestPool::new(grants, id, self.config)?,
        });

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.iter().find(|b| b.id == id) {
            return Ok(existing.clone());
        }
        inner.push(built.clone());
        Ok(built)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<H: XenHal> Default for Backends<H> {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
