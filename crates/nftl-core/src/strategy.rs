//! Pluggable translation strategy (the FTL "type" of the design).
//!
//! The trait bundles the seams an extension can substitute without touching
//! the pipeline: lookup, mapping policy, deferral, the waiting-queue insert,
//! and the optional completion/allocation hooks. The default strategy is
//! plain round-robin.

use crate::block::{Block, PageSpecialFn};
use crate::map::{AddrHandle, MapKind};
use crate::pipeline::{self, DeferredIo, WriteOpts, WriteOutcome};
use crate::request::{HostRequest, IoJob, RequestWrapper};
use crate::Ftl;
use nftl_types::{ApId, LogicalAddr, PoolId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Strategy vtable. Default methods delegate to the pipeline; `map_ltop` is
/// the one genuinely policy-shaped decision every strategy must make.
pub trait FtlStrategy: Send + Sync {
    /// Resolve a logical address for reading.
    fn lookup_ltop(&self, ftl: &Ftl, l: LogicalAddr, map: MapKind) -> Option<AddrHandle> {
        ftl.map.lookup(&ftl.blocks, l, map)
    }

    /// Reserve a physical page for `l` and install the mapping. `None`
    /// defers the write.
    fn map_ltop(&self, ftl: &Ftl, l: LogicalAddr, is_gc: bool, map: MapKind)
        -> Option<AddrHandle>;

    /// Park a request that could not be mapped.
    fn defer_bio(&self, ftl: &Ftl, io: DeferredIo) {
        ftl.deferred.lock().push_back(io);
    }

    /// Re-dispatch entry for parked reads (locks internally).
    fn read_bio(&self, ftl: &Arc<Ftl>, req: HostRequest) {
        pipeline::read_bio(ftl, req);
    }

    /// Re-dispatch entry for parked writes (locks internally).
    fn write_bio(&self, ftl: &Arc<Ftl>, req: HostRequest, opts: WriteOpts) -> WriteOutcome {
        let (l, _) = req.sector.to_lpage();
        ftl.addr_locks.lock(l);
        pipeline::write_locked(ftl, req, opts)
    }

    /// Insert a job into a serialized pool's waiting queue.
    fn bio_wait_add(&self, waiting: &mut VecDeque<IoJob>, job: IoJob) {
        waiting.push_back(job);
    }

    /// Completion hook; may adjust the device wait.
    fn end_io(&self, _ftl: &Ftl, _wrapper: &RequestWrapper, _dev_wait_us: &mut u32) {}

    /// Called after each successful cursor advance, with the block lock
    /// held.
    fn alloc_phys_addr(&self, _block: &Block) {}

    /// Predicate vetoing flash pages at cursor rollover.
    fn page_special(&self) -> Option<&PageSpecialFn> {
        None
    }
}

/// Round-robin strategy: host writes rotate across append points; GC writes
/// go to the pool with the most free blocks so relocation cannot devour a
/// pool that is already short.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next_ap: AtomicUsize,
}

impl RoundRobinStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn select_ap(&self, ftl: &Ftl, is_gc: bool) -> ApId {
        if !is_gc {
            let idx = self.next_ap.fetch_add(1, Ordering::Relaxed) % ftl.geo.nr_aps;
            return ApId(idx);
        }

        // Best-effort survey, no locks: ties resolve to the lowest index.
        let mut best = PoolId(0);
        let mut best_free = ftl.pools[0].nr_free_blocks();
        for (idx, pool) in ftl.pools.iter().enumerate().skip(1) {
            let free = pool.nr_free_blocks();
            if free > best_free {
                best = PoolId(idx);
                best_free = free;
            }
        }
        ftl.geo.ap_of_pool(best)
    }
}

impl FtlStrategy for RoundRobinStrategy {
    fn map_ltop(
        &self,
        ftl: &Ftl,
        l: LogicalAddr,
        is_gc: bool,
        map: MapKind,
    ) -> Option<AddrHandle> {
        let ap_id = self.select_ap(ftl, is_gc);
        let ap = &ftl.aps[ap_id.0];
        let pool = &ftl.pools[ap.pool().0];

        let p = ap.alloc_addr(
            &ftl.blocks,
            pool,
            &ftl.geo,
            is_gc,
            self.page_special(),
            None,
        )?;
        ftl.map.update_map(&ftl.blocks, &ftl.geo, l, p, map);
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use nftl_types::{FtlConfig, OptFlags};

    fn ftl(nr_pools: usize, nr_blks: usize) -> Arc<Ftl> {
        let config = FtlConfig {
            nr_pools,
            nr_blks_per_pool: nr_blks,
            nr_host_pages_in_blk: 4,
            nr_host_pages_in_flash_page: 1,
            nr_pages: 8,
            flags: OptFlags::NONE,
            t_read_us: 0,
            t_write_us: 0,
        };
        let geo = config.geometry().expect("valid test geometry");
        let device = Arc::new(MemDevice::new(geo.required_sectors()));
        Ftl::new(config, device).expect("ftl init")
    }

    #[test]
    fn host_writes_rotate_append_points() {
        let ftl = ftl(2, 4);
        let rr = RoundRobinStrategy::new();

        let first = rr
            .map_ltop(&ftl, LogicalAddr(0), false, MapKind::Primary)
            .expect("space available");
        let second = rr
            .map_ltop(&ftl, LogicalAddr(1), false, MapKind::Primary)
            .expect("space available");

        let pool_a = ftl.geo.pool_of_block(first.block.expect("bound"));
        let pool_b = ftl.geo.pool_of_block(second.block.expect("bound"));
        assert_ne!(pool_a, pool_b);
    }

    #[test]
    fn gc_writes_prefer_freest_pool() {
        let ftl = ftl(2, 4);
        let rr = RoundRobinStrategy::new();

        // drain pool 0 below pool 1
        ftl.pools[0]
            .get_block(&ftl.blocks, &ftl.geo, false)
            .expect("free block");

        let gc = rr
            .map_ltop(&ftl, LogicalAddr(2), true, MapKind::Primary)
            .expect("gc space");
        let pool = ftl.geo.pool_of_block(gc.block.expect("bound"));
        assert_eq!(pool, PoolId(1));
    }

    #[test]
    fn gc_survey_ties_resolve_to_lowest_pool() {
        let ftl = ftl(2, 4);
        let rr = RoundRobinStrategy::new();
        let gc = rr
            .map_ltop(&ftl, LogicalAddr(3), true, MapKind::Primary)
            .expect("gc space");
        assert_eq!(ftl.geo.pool_of_block(gc.block.expect("bound")), PoolId(0));
    }

    #[test]
    fn map_ltop_installs_reverse_entry() {
        let ftl = ftl(1, 4);
        let rr = RoundRobinStrategy::new();
        let p = rr
            .map_ltop(&ftl, LogicalAddr(5), false, MapKind::Primary)
            .expect("space available");
        assert_eq!(ftl.map.reverse_entry(p.addr).l_addr, 5);
    }
}
