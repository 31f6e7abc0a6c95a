//! Pool: one independent flash channel owning a set of erase-blocks.
//!
//! List discipline: a newly activated block moves from the front of
//! `free_list` to the back of `used_list`, so the head of the used list is
//! the oldest block and the most likely to hold invalidated pages. A drained
//! block returns to the back of the free list, which round-robins block
//! reuse across the pool (naive wear-leveling). A fully committed block is
//! additionally linked on `prio_list` as a GC candidate without leaving the
//! used list.

use crate::block::Block;
use crate::request::WaitingQueue;
use nftl_types::{BlockId, Geometry, PoolId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, warn};

struct PoolLists {
    free: VecDeque<BlockId>,
    used: VecDeque<BlockId>,
    prio: VecDeque<BlockId>,
    nr_free_blocks: usize,
}

/// Counters exposed for diagnostics and the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub nr_free_blocks: usize,
    pub nr_used_blocks: usize,
    pub nr_prio_blocks: usize,
    pub nr_waiting: usize,
}

pub struct Pool {
    id: PoolId,
    lists: Mutex<PoolLists>,
    /// Lock-free mirror of `nr_free_blocks` for the GC pool survey.
    approx_free: AtomicUsize,
    /// Serialized-mode waiting queue (`waiting_lock` of the design).
    pub(crate) waiting: Mutex<WaitingQueue>,
    /// 1 while a serialized submission is owned by the pool worker.
    pub(crate) is_active: AtomicU32,
}

impl Pool {
    #[must_use]
    pub fn new(id: PoolId, geo: &Geometry) -> Self {
        let free: VecDeque<BlockId> = geo.blocks_of_pool(id).map(BlockId).collect();
        let nr_free = free.len();
        Self {
            id,
            lists: Mutex::new(PoolLists {
                free,
                used: VecDeque::new(),
                prio: VecDeque::new(),
                nr_free_blocks: nr_free,
            }),
            approx_free: AtomicUsize::new(nr_free),
            waiting: Mutex::new(WaitingQueue::default()),
            is_active: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Take a block off the free list and activate it.
    ///
    /// Non-GC callers are refused while the pool's free headroom is below the
    /// append-point count, so garbage collection can always obtain blocks to
    /// drain into. The block is reset and given a staging buffer after the
    /// pool lock is released.
    pub fn get_block(
        &self,
        blocks: &[Block],
        geo: &Geometry,
        is_gc: bool,
    ) -> Option<BlockId> {
        let mut lists = self.lists.lock();
        if lists.free.is_empty() {
            warn!(
                target: "nftl::pool",
                event = "no_free_blocks",
                pool = self.id.0,
                nr_used = lists.used.len()
            );
            return None;
        }
        if !is_gc && lists.nr_free_blocks < geo.nr_aps {
            return None;
        }

        let id = lists.free.pop_front()?;
        lists.used.push_back(id);
        lists.nr_free_blocks -= 1;
        self.approx_free.store(lists.nr_free_blocks, Ordering::Release);
        drop(lists);

        let block = &blocks[id.0];
        block.reset(geo);
        block.alloc_staging(geo);
        debug!(
            target: "nftl::pool",
            event = "block_activated",
            pool = self.id.0,
            block = id.0,
            is_gc
        );
        Some(id)
    }

    /// Return a drained block to the back of the free list.
    ///
    /// Precondition: all valid pages have been migrated elsewhere.
    pub fn put_block(&self, id: BlockId) {
        let mut lists = self.lists.lock();
        lists.used.retain(|b| *b != id);
        lists.prio.retain(|b| *b != id);
        lists.free.push_back(id);
        lists.nr_free_blocks += 1;
        self.approx_free.store(lists.nr_free_blocks, Ordering::Release);
        debug!(
            target: "nftl::pool",
            event = "block_freed",
            pool = self.id.0,
            block = id.0
        );
    }

    /// Link a fully committed block on the GC candidate list.
    pub fn promote_prio(&self, id: BlockId) {
        self.lists.lock().prio.push_back(id);
    }

    /// Pop the oldest GC candidate; ordering beyond FIFO is the policy
    /// engine's business.
    pub fn pop_prio(&self) -> Option<BlockId> {
        self.lists.lock().prio.pop_front()
    }

    /// Best-effort free-block count (no lock; GC pool survey).
    #[must_use]
    pub fn nr_free_blocks(&self) -> usize {
        self.approx_free.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let lists = self.lists.lock();
        PoolStats {
            nr_free_blocks: lists.nr_free_blocks,
            nr_used_blocks: lists.used.len(),
            nr_prio_blocks: lists.prio.len(),
            nr_waiting: self.waiting.lock().bios.len(),
        }
    }

    /// Invariant: the free counter mirrors the free list length.
    #[must_use]
    pub fn free_list_consistent(&self) -> bool {
        let lists = self.lists.lock();
        lists.nr_free_blocks == lists.free.len()
    }

    #[must_use]
    pub fn prio_contains(&self, id: BlockId) -> bool {
        self.lists.lock().prio.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nftl_types::{FtlConfig, OptFlags};

    fn setup(nr_pools: usize, nr_blks: usize) -> (Geometry, Vec<Block>, Pool) {
        let geo = FtlConfig {
            nr_pools,
            nr_blks_per_pool: nr_blks,
            nr_host_pages_in_blk: 4,
            nr_host_pages_in_flash_page: 1,
            nr_pages: 4,
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
        (geo, blocks, pool)
    }

    #[test]
    fn get_block_round_robins_from_front() {
        let (geo, blocks, pool) = setup(1, 4);
        let first = pool.get_block(&blocks, &geo, false).expect("free block");
        assert_eq!(first, BlockId(0));
        let second = pool.get_block(&blocks, &geo, false).expect("free block");
        assert_eq!(second, BlockId(1));

        pool.put_block(first);
        pool.put_block(second);
        // freed blocks re-queue at the back
        assert_eq!(pool.get_block(&blocks, &geo, false), Some(BlockId(2)));
        assert!(pool.free_list_consistent());
    }

    #[test]
    fn activation_resets_and_stages() {
        let (geo, blocks, pool) = setup(1, 2);
        let id = pool.get_block(&blocks, &geo, false).expect("free block");
        assert!(blocks[id.0].has_staging());
        assert_eq!(blocks[id.0].nr_invalid_pages(), 0);
    }

    #[test]
    fn host_headroom_is_reserved_for_aps() {
        // two pools => nr_aps == 2; a pool down to one free block refuses
        // host allocations but still serves GC
        let (geo, blocks, pool) = setup(2, 2);
        assert!(pool.get_block(&blocks, &geo, false).is_some());
        assert_eq!(pool.nr_free_blocks(), 1);
        assert!(pool.get_block(&blocks, &geo, false).is_none());
        assert!(pool.get_block(&blocks, &geo, true).is_some());
        assert_eq!(pool.nr_free_blocks(), 0);
        assert!(pool.get_block(&blocks, &geo, true).is_none());
    }

    #[test]
    fn put_block_unlinks_prio() {
        let (geo, blocks, pool) = setup(1, 2);
        let id = pool.get_block(&blocks, &geo, false).expect("free block");
        pool.promote_prio(id);
        assert!(pool.prio_contains(id));
        pool.put_block(id);
        assert!(!pool.prio_contains(id));
        assert_eq!(pool.pop_prio(), None);
        let stats = pool.stats();
        assert_eq!(stats.nr_free_blocks, 2);
        assert_eq!(stats.nr_used_blocks, 0);
    }

    #[test]
    fn pop_prio_is_fifo() {
        let (geo, blocks, pool) = setup(1, 3);
        let a = pool.get_block(&blocks, &geo, false).expect("free block");
        let b = pool.get_block(&blocks, &geo, false).expect("free block");
        pool.promote_prio(a);
        pool.promote_prio(b);
        assert_eq!(pool.pop_prio(), Some(a));
        assert_eq!(pool.pop_prio(), Some(b));
    }
}
