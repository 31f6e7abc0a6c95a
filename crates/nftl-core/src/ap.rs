//! Append point: the write cursor of one pool.
//!
//! Host writes consume the current block; GC writes fall back to a separate
//! GC block so relocation can drain even when the host tier is exhausted,
//! and host writes can never steal the GC reserve.

use crate::block::{AllocPhysHook, Block, PageSpecialFn};
use crate::map::AddrHandle;
use crate::pool::Pool;
use crate::request::Direction;
use nftl_types::{ApId, BlockId, Geometry, PoolId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct ApCursor {
    cur: Option<BlockId>,
    gc_cur: Option<BlockId>,
}

/// Per-direction access counts; accounting is semi-accurate by design (no
/// lock around the increment relative to the submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApStats {
    pub reads: u64,
    pub writes: u64,
}

pub struct AppendPoint {
    id: ApId,
    pool: PoolId,
    cursor: Mutex<ApCursor>,
    /// Emulated device-wait targets, microseconds.
    pub t_read_us: u32,
    pub t_write_us: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl AppendPoint {
    #[must_use]
    pub fn new(id: ApId, pool: PoolId, t_read_us: u32, t_write_us: u32) -> Self {
        Self {
            id,
            pool,
            cursor: Mutex::new(ApCursor::default()),
            t_read_us,
            t_write_us,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> ApId {
        self.id
    }

    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn account(&self, dir: Direction) {
        match dir {
            Direction::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            Direction::Write => self.writes.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[must_use]
    pub fn stats(&self) -> ApStats {
        ApStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn current_block(&self) -> Option<BlockId> {
        self.cursor.lock().cur
    }

    #[must_use]
    pub fn gc_block(&self) -> Option<BlockId> {
        self.cursor.lock().gc_cur
    }

    /// Install a new current block, swapping back-references.
    ///
    /// The outgoing block is expected to be full; seeing room left is
    /// diagnosed but not fatal, since a recycled block re-enters with a
    /// reset cursor while still named by the append point.
    pub fn set_cur(&self, blocks: &[Block], geo: &Geometry, new: BlockId) {
        let mut cursor = self.cursor.lock();
        Self::install_cur(&mut cursor, blocks, geo, self.id, new);
    }

    fn install_cur(
        cursor: &mut ApCursor,
        blocks: &[Block],
        geo: &Geometry,
        ap: ApId,
        new: BlockId,
    ) {
        if let Some(old) = cursor.cur {
            if !blocks[old.0].is_full(geo) && old != new {
                warn!(
                    target: "nftl::ap",
                    event = "replacing_unfull_block",
                    ap = ap.0,
                    block = old.0
                );
            }
            blocks[old.0].set_current_ap(None);
        }
        blocks[new.0].set_current_ap(Some(ap));
        cursor.cur = Some(new);
    }

    /// Reserve the next physical page, on behalf of a host or GC write.
    ///
    /// Tier order: the current block, then a fresh host block, then (GC
    /// only) the GC block, then a fresh block from the GC reserve. Returns
    /// `None` when every tier is exhausted; the caller defers.
    pub fn alloc_addr(
        &self,
        blocks: &[Block],
        pool: &Pool,
        geo: &Geometry,
        is_gc: bool,
        ps: Option<&PageSpecialFn>,
        hook: Option<&AllocPhysHook>,
    ) -> Option<AddrHandle> {
        let mut cursor = self.cursor.lock();

        if let Some(cur) = cursor.cur {
            if let Some(addr) = blocks[cur.0].alloc_phys(geo, ps, hook) {
                return Some(AddrHandle {
                    addr,
                    block: Some(cur),
                });
            }
        }

        if let Some(fresh) = pool.get_block(blocks, geo, false) {
            Self::install_cur(&mut cursor, blocks, geo, self.id, fresh);
            let addr = blocks[fresh.0].alloc_phys(geo, ps, hook)?;
            return Some(AddrHandle {
                addr,
                block: Some(fresh),
            });
        }

        if !is_gc {
            return None;
        }

        if let Some(gc) = cursor.gc_cur {
            if let Some(addr) = blocks[gc.0].alloc_phys(geo, ps, hook) {
                return Some(AddrHandle {
                    addr,
                    block: Some(gc),
                });
            }
        }

        let fresh = pool.get_block(blocks, geo, true)?;
        if let Some(old) = cursor.gc_cur {
            blocks[old.0].set_current_ap(None);
        }
        blocks[fresh.0].set_current_ap(Some(self.id));
        cursor.gc_cur = Some(fresh);
        trace!(
            target: "nftl::ap",
            event = "gc_block_installed",
            ap = self.id.0,
            block = fresh.0
        );
        let addr = blocks[fresh.0].alloc_phys(geo, ps, hook)?;
        Some(AddrHandle {
            addr,
            block: Some(fresh),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nftl_types::{FtlConfig, OptFlags, PhysPageAddr};

    fn setup(nr_blks: usize) -> (Geometry, Vec<Block>, Pool, AppendPoint) {
        setup_pools(1, nr_blks)
    }

    fn setup_pools(nr_pools: usize, nr_blks: usize) -> (Geometry, Vec<Block>, Pool, AppendPoint) {
        let geo = FtlConfig {
            nr_pools,
            nr_blks_per_pool: nr_blks,
            nr_host_pages_in_blk: 2,
            nr_host_pages_in_flash_page: 1,
            nr_pages: 2,
            flags: OptFlags::NONE,
            t_read_us: 0,
            t_write_us: 0,
        }
        .geometry()
        .expect("valid test geometry");
        let blocks: Vec<Block> = (0..geo.total_blocks)
            .map(|i| Block::new(BlockId(i), &geo))
            .collect();
        let pool = Pool::new(PoolId(0), &geo);
        let ap = AppendPoint::new(ApId(0), PoolId(0), 0, 0);
        (geo, blocks, pool, ap)
    }

    #[test]
    fn lazy_activation_then_sequential_fill() {
        let (geo, blocks, pool, ap) = setup(2);
        assert_eq!(ap.current_block(), None);

        let first = ap
            .alloc_addr(&blocks, &pool, &geo, false, None, None)
            .expect("block available");
        assert_eq!(first.addr, PhysPageAddr(0));
        assert_eq!(ap.current_block(), Some(BlockId(0)));
        assert_eq!(blocks[0].current_ap(), Some(ApId(0)));

        let second = ap
            .alloc_addr(&blocks, &pool, &geo, false, None, None)
            .expect("room in current block");
        assert_eq!(second.addr, PhysPageAddr(1));
    }

    #[test]
    fn rolls_to_fresh_block_when_full() {
        let (geo, blocks, pool, ap) = setup(2);
        for _ in 0..2 {
            ap.alloc_addr(&blocks, &pool, &geo, false, None, None)
                .expect("host tier");
        }
        let third = ap
            .alloc_addr(&blocks, &pool, &geo, false, None, None)
            .expect("fresh block");
        assert_eq!(third.block, Some(BlockId(1)));
        assert_eq!(blocks[0].current_ap(), None);
        assert_eq!(blocks[1].current_ap(), Some(ApId(0)));
    }

    #[test]
    fn host_exhaustion_defers_but_gc_drains() {
        let (geo, blocks, pool, ap) = setup(1);
        for _ in 0..2 {
            ap.alloc_addr(&blocks, &pool, &geo, false, None, None)
                .expect("host tier");
        }
        // single block spent: host allocation must fail
        assert!(ap.alloc_addr(&blocks, &pool, &geo, false, None, None).is_none());
        // the GC tier fails too (free list empty), but only after trying
        assert!(ap.alloc_addr(&blocks, &pool, &geo, true, None, None).is_none());
    }

    #[test]
    fn gc_tier_uses_gc_block() {
        // two pools => the host headroom reserve is two blocks per pool,
        // leaving a GC reserve once host allocations are refused
        let (geo, blocks, pool, ap) = setup_pools(2, 3);
        loop {
            if ap
                .alloc_addr(&blocks, &pool, &geo, false, None, None)
                .is_none()
            {
                break;
            }
        }
        let gc = ap
            .alloc_addr(&blocks, &pool, &geo, true, None, None)
            .expect("gc reserve");
        assert_eq!(gc.block, ap.gc_block());
        assert_ne!(ap.gc_block(), None);
        assert_ne!(ap.gc_block(), ap.current_block());
    }

    #[test]
    fn set_cur_swaps_back_references() {
        let (geo, blocks, pool, ap) = setup(2);
        for _ in 0..2 {
            ap.alloc_addr(&blocks, &pool, &geo, false, None, None)
                .expect("host tier");
        }
        let fresh = pool.get_block(&blocks, &geo, false).expect("second block");
        ap.set_cur(&blocks, &geo, fresh);
        assert_eq!(blocks[0].current_ap(), None);
        assert_eq!(blocks[fresh.0].current_ap(), Some(ApId(0)));
        assert_eq!(ap.current_block(), Some(fresh));
    }

    #[test]
    fn accounting_counts_directions() {
        let (_geo, _blocks, _pool, ap) = setup(1);
        ap.account(Direction::Read);
        ap.account(Direction::Write);
        ap.account(Direction::Write);
        let stats = ap.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 2);
    }
}
