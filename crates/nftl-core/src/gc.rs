//! Garbage-collection contract surface.
//!
//! The GC policy engine lives outside the core. The core exposes: the
//! edge-triggered kick, the per-block `gc_running` flag (reads of a marked
//! block fail and defer), the per-pool prio list of fully committed blocks,
//! and the recycle helper that erases a drained block and returns it to the
//! free list.

use crate::Ftl;
use nftl_types::{BlockId, PoolId, NR_PHY_IN_LOG};
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

/// Hooks implemented by the external GC engine.
pub trait GcHooks: Send + Sync {
    /// The pipeline hit an exhaustion/deferral condition. Called once per
    /// episode; re-armed by [`Ftl::kick_deferred`].
    fn kick(&self, _ftl: &Ftl) {}
}

/// Default hooks: no garbage collector attached.
#[derive(Debug, Default)]
pub struct NoopGc;

impl GcHooks for NoopGc {}

impl Ftl {
    /// Signal the GC engine that the FTL ran out of mappable space.
    ///
    /// Idempotent: repeated kicks collapse until [`Ftl::kick_deferred`]
    /// re-arms the edge.
    pub fn kick_gc(&self) {
        if !self.gc_pending.swap(true, Ordering::AcqRel) {
            trace!(target: "nftl::gc", event = "kick");
            self.gc.kick(self);
        }
    }

    /// Re-arm the GC kick and wake the deferred-drain worker. The GC engine
    /// calls this after freeing blocks.
    pub fn kick_deferred(&self) {
        self.gc_pending.store(false, Ordering::Release);
        self.deferred_trigger.signal();
    }

    /// Mark a block as being relocated. Primary-map reads of its pages will
    /// fail and defer until [`Ftl::gc_end_block`].
    pub fn gc_begin_block(&self, block: BlockId) {
        self.blocks[block.0].set_gc_running(true);
        debug!(target: "nftl::gc", event = "gc_begin", block = block.0);
    }

    pub fn gc_end_block(&self, block: BlockId) {
        self.blocks[block.0].set_gc_running(false);
        debug!(target: "nftl::gc", event = "gc_end", block = block.0);
    }

    /// Oldest fully committed block of a pool, if any. Candidate ordering
    /// beyond FIFO belongs to the policy engine.
    #[must_use]
    pub fn pop_gc_candidate(&self, pool: PoolId) -> Option<BlockId> {
        self.pools[pool.0].pop_prio()
    }

    /// Erase a drained block on the device and return it to its pool's free
    /// list.
    ///
    /// Precondition: every valid page has been migrated elsewhere.
    pub fn recycle_block(&self, block: BlockId) -> nftl_error::Result<()> {
        let blk = &self.blocks[block.0];
        let start = blk.start_page().to_sector();
        let nr_sectors = u64::from(self.geo.nr_host_pages_in_blk) * NR_PHY_IN_LOG;
        self.device.erase(start, nr_sectors)?;
        self.pools[blk.pool().0].put_block(block);
        debug!(target: "nftl::gc", event = "block_recycled", block = block.0);
        Ok(())
    }
}
