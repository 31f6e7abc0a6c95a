//! Erase-block state and bookkeeping.
//!
//! A block is created once at init and recycled indefinitely:
//! free → used (active write target) → optionally prio (fully committed,
//! GC candidate) → free. The staging buffer exists only while the block is
//! an active write target that has not yet fully committed.

use crate::bitmap::{bitmap_bytes, bitmap_count_set, bitmap_get, bitmap_test_and_set};
use crate::request::PageBuf;
use nftl_types::{ApId, BlockId, Geometry, PhysPageAddr, PoolId, HOST_PAGE_SIZE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, error};

/// Predicate consulted when the write cursor opens a new flash page; a
/// `false` return rejects the allocation (hint-driven placement seam).
pub type PageSpecialFn = dyn Fn(u32) -> bool + Send + Sync;

/// Strategy hook invoked after a successful cursor advance.
///
/// Runs with the block lock held; must not call back into locking block
/// methods.
pub type AllocPhysHook = dyn Fn(&Block) + Send + Sync;

struct BlockInner {
    /// Append point currently writing this block, if any.
    ap: Option<ApId>,
    /// Next flash page to write.
    next_page: u32,
    /// Next host-page slot within the current flash page.
    next_offset: u32,
    invalid_pages: Vec<u8>,
    nr_invalid_pages: u32,
    /// Staging buffer, present while the block is an active write target.
    data: Option<PageBuf>,
}

pub struct Block {
    id: BlockId,
    pool: PoolId,
    start_page: PhysPageAddr,
    inner: Mutex<BlockInner>,
    gc_running: AtomicBool,
    /// Host pages copied into the staging buffer.
    data_size: AtomicU32,
    /// Host pages whose device write has completed.
    data_cmnt_size: AtomicU32,
}

impl Block {
    #[must_use]
    pub fn new(id: BlockId, geo: &Geometry) -> Self {
        Self {
            id,
            pool: geo.pool_of_block(id),
            start_page: geo.block_start_page(id),
            inner: Mutex::new(BlockInner {
                ap: None,
                next_page: 0,
                next_offset: 0,
                invalid_pages: vec![0_u8; bitmap_bytes(geo.nr_host_pages_in_blk)],
                nr_invalid_pages: 0,
                data: None,
            }),
            gc_running: AtomicBool::new(false),
            data_size: AtomicU32::new(0),
            data_cmnt_size: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    #[must_use]
    pub fn start_page(&self) -> PhysPageAddr {
        self.start_page
    }

    /// Zero all cursors, counters, and the invalid bitmap.
    ///
    /// Called when the block leaves the free list; the pool lock is already
    /// released at that point.
    pub fn reset(&self, geo: &Geometry) {
        let mut inner = self.inner.lock();
        inner.invalid_pages.fill(0);
        inner.ap = None;
        inner.next_page = 0;
        inner.next_offset = 0;
        inner.nr_invalid_pages = 0;
        inner.data = None;
        drop(inner);
        self.gc_running.store(false, Ordering::Release);
        self.data_size.store(0, Ordering::Release);
        self.data_cmnt_size.store(0, Ordering::Release);
        debug!(
            target: "nftl::block",
            event = "reset",
            block = self.id.0,
            nr_host_pages = geo.nr_host_pages_in_blk
        );
    }

    /// Allocate the staging buffer (block activation).
    pub fn alloc_staging(&self, geo: &Geometry) {
        let mut inner = self.inner.lock();
        inner.data = Some(PageBuf::zeroed(
            geo.nr_host_pages_in_blk as usize * HOST_PAGE_SIZE,
        ));
    }

    fn full(inner: &BlockInner, geo: &Geometry) -> bool {
        inner.next_page * geo.nr_host_pages_in_flash_page + inner.next_offset
            >= geo.nr_host_pages_in_blk
    }

    #[must_use]
    pub fn is_full(&self, geo: &Geometry) -> bool {
        Self::full(&self.inner.lock(), geo)
    }

    /// Advance the write cursor and return the next physical page address.
    ///
    /// The host-page offset advances first; a new flash page is only opened
    /// when the offset saturates, at which point `ps` may veto the page.
    /// Returns `None` when the block is full or the predicate rejects.
    pub fn alloc_phys(
        &self,
        geo: &Geometry,
        ps: Option<&PageSpecialFn>,
        hook: Option<&AllocPhysHook>,
    ) -> Option<PhysPageAddr> {
        let mut inner = self.inner.lock();
        if Self::full(&inner, geo) {
            return None;
        }

        if inner.next_offset == geo.nr_host_pages_in_flash_page {
            if let Some(ps) = ps {
                if !ps(inner.next_page + 1) {
                    return None;
                }
            }
            inner.next_offset = 0;
            inner.next_page += 1;
        }

        let addr = PhysPageAddr(
            self.start_page.0
                + u64::from(inner.next_page * geo.nr_host_pages_in_flash_page + inner.next_offset),
        );
        inner.next_offset += 1;

        if let Some(hook) = hook {
            hook(self);
        }
        Some(addr)
    }

    /// Mark one page of this block invalid.
    ///
    /// Double invalidation means the maps and the bitmap disagree; that is
    /// state corruption and fatal.
    pub fn invalidate_page(&self, page_offset: u32) {
        let mut inner = self.inner.lock();
        let already = bitmap_test_and_set(&mut inner.invalid_pages, page_offset);
        if already {
            error!(
                target: "nftl::block",
                event = "double_invalidation",
                block = self.id.0,
                page_offset
            );
            panic!(
                "double invalidation of page {page_offset} in block {}",
                self.id
            );
        }
        inner.nr_invalid_pages += 1;
    }

    /// Copy one host page into the staging buffer at `page_offset`.
    ///
    /// Returns the staged-page count after the copy. Writing to a block
    /// without a staging buffer is a lifecycle violation.
    pub fn stage_write(&self, page_offset: u32, payload: &[u8]) -> u32 {
        assert_eq!(payload.len(), HOST_PAGE_SIZE, "payload must be one host page");
        let mut inner = self.inner.lock();
        let Some(data) = inner.data.as_mut() else {
            error!(
                target: "nftl::block",
                event = "write_to_inactive_block",
                block = self.id.0,
                page_offset
            );
            panic!("write staged to inactive block {}", self.id);
        };
        let at = page_offset as usize * HOST_PAGE_SIZE;
        data.as_mut_slice()[at..at + HOST_PAGE_SIZE].copy_from_slice(payload);
        drop(inner);
        self.data_size.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Clone the flash page containing `page_offset` out of the staging
    /// buffer, so the device writes the flash page as one unit.
    ///
    /// Returns the first page offset of the flash page and its bytes.
    #[must_use]
    pub fn flash_page_copy(&self, geo: &Geometry, page_offset: u32) -> (u32, PageBuf) {
        let start = geo.flash_page_start(page_offset);
        let inner = self.inner.lock();
        let Some(data) = inner.data.as_ref() else {
            error!(
                target: "nftl::block",
                event = "copy_from_inactive_block",
                block = self.id.0,
                page_offset
            );
            panic!("flash page copy from inactive block {}", self.id);
        };
        let from = start as usize * HOST_PAGE_SIZE;
        let to = from + geo.nr_host_pages_in_flash_page as usize * HOST_PAGE_SIZE;
        (start, PageBuf::from_vec(data.as_slice()[from..to].to_vec()))
    }

    /// Account one completed page write. When the whole block has committed,
    /// release the staging buffer and report `true` so the caller can
    /// promote the block to the GC candidate list.
    pub fn commit_page(&self, geo: &Geometry) -> bool {
        let committed = self.data_cmnt_size.fetch_add(1, Ordering::AcqRel) + 1;
        if committed < geo.nr_host_pages_in_blk {
            return false;
        }
        if committed > geo.nr_host_pages_in_blk {
            error!(
                target: "nftl::block",
                event = "commit_overflow",
                block = self.id.0,
                committed,
                nr_host_pages = geo.nr_host_pages_in_blk
            );
            panic!("block {} committed more pages than it holds", self.id);
        }
        self.inner.lock().data = None;
        debug!(
            target: "nftl::block",
            event = "fully_committed",
            block = self.id.0
        );
        true
    }

    pub fn set_gc_running(&self, running: bool) {
        self.gc_running.store(running, Ordering::Release);
    }

    #[must_use]
    pub fn is_gc_running(&self) -> bool {
        self.gc_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_ap(&self, ap: Option<ApId>) {
        self.inner.lock().ap = ap;
    }

    #[must_use]
    pub fn current_ap(&self) -> Option<ApId> {
        self.inner.lock().ap
    }

    #[must_use]
    pub fn nr_invalid_pages(&self) -> u32 {
        self.inner.lock().nr_invalid_pages
    }

    /// Popcount of the invalid bitmap (invariant checking).
    #[must_use]
    pub fn invalid_popcount(&self, geo: &Geometry) -> u32 {
        bitmap_count_set(&self.inner.lock().invalid_pages, geo.nr_host_pages_in_blk)
    }

    #[must_use]
    pub fn page_invalid(&self, page_offset: u32) -> bool {
        bitmap_get(&self.inner.lock().invalid_pages, page_offset)
    }

    #[must_use]
    pub fn has_staging(&self) -> bool {
        self.inner.lock().data.is_some()
    }

    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.data_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn data_cmnt_size(&self) -> u32 {
        self.data_cmnt_size.load(Ordering::Acquire)
    }

    /// Whether a physical page falls inside this block's range.
    #[must_use]
    pub fn contains_page(&self, geo: &Geometry, addr: PhysPageAddr) -> bool {
        addr.0 >= self.start_page.0
            && addr.0 < self.start_page.0 + u64::from(geo.nr_host_pages_in_blk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nftl_types::{FtlConfig, OptFlags};

    fn geo(nr_host_pages_in_blk: u32, nr_host_pages_in_flash_page: u32) -> Geometry {
        FtlConfig {
            nr_pools: 1,
            nr_blks_per_pool: 2,
            nr_host_pages_in_blk,
            nr_host_pages_in_flash_page,
            nr_pages: u64::from(nr_host_pages_in_blk),
            flags: OptFlags::NONE,
            t_read_us: 0,
            t_write_us: 0,
        }
        .geometry()
        .expect("valid test geometry")
    }

    #[test]
    fn alloc_phys_is_sequential() {
        let geo = geo(8, 1);
        let block = Block::new(BlockId(1), &geo);
        for expect in 8_u64..16 {
            assert_eq!(block.alloc_phys(&geo, None, None), Some(PhysPageAddr(expect)));
        }
        assert!(block.is_full(&geo));
        assert_eq!(block.alloc_phys(&geo, None, None), None);
    }

    #[test]
    fn alloc_phys_groups_flash_pages() {
        let geo = geo(8, 2);
        let block = Block::new(BlockId(0), &geo);
        let addrs: Vec<_> = (0..8)
            .map(|_| block.alloc_phys(&geo, None, None).expect("room left").0)
            .collect();
        assert_eq!(addrs, (0_u64..8).collect::<Vec<_>>());
        assert!(block.is_full(&geo));
    }

    #[test]
    fn page_special_rejects_next_flash_page() {
        let geo = geo(8, 2);
        let block = Block::new(BlockId(0), &geo);
        let reject_page_one: Box<PageSpecialFn> = Box::new(|page| page != 1);

        assert!(block.alloc_phys(&geo, Some(&*reject_page_one), None).is_some());
        assert!(block.alloc_phys(&geo, Some(&*reject_page_one), None).is_some());
        // flash page 0 exhausted; predicate vetoes page 1
        assert_eq!(block.alloc_phys(&geo, Some(&*reject_page_one), None), None);
        // without the predicate the cursor proceeds
        assert_eq!(block.alloc_phys(&geo, None, None), Some(PhysPageAddr(2)));
    }

    #[test]
    fn invalidate_tracks_popcount() {
        let geo = geo(8, 1);
        let block = Block::new(BlockId(0), &geo);
        block.invalidate_page(3);
        block.invalidate_page(5);
        assert_eq!(block.nr_invalid_pages(), 2);
        assert_eq!(block.invalid_popcount(&geo), 2);
        assert!(block.page_invalid(3));
        assert!(!block.page_invalid(4));
    }

    #[test]
    #[should_panic(expected = "double invalidation")]
    fn double_invalidation_is_fatal() {
        let geo = geo(8, 1);
        let block = Block::new(BlockId(0), &geo);
        block.invalidate_page(2);
        block.invalidate_page(2);
    }

    #[test]
    fn staging_lifecycle() {
        let geo = geo(4, 1);
        let block = Block::new(BlockId(0), &geo);
        assert!(!block.has_staging());
        block.alloc_staging(&geo);
        assert!(block.has_staging());

        let page = vec![0x11_u8; HOST_PAGE_SIZE];
        for offset in 0..4 {
            assert_eq!(block.stage_write(offset, &page), offset + 1);
        }
        assert_eq!(block.data_size(), 4);

        for n in 0..4 {
            let full = block.commit_page(&geo);
            assert_eq!(full, n == 3);
        }
        assert!(!block.has_staging());
        assert_eq!(block.data_cmnt_size(), 4);
    }

    #[test]
    fn flash_page_copy_is_aligned() {
        let geo = geo(8, 2);
        let block = Block::new(BlockId(0), &geo);
        block.alloc_staging(&geo);
        let a = vec![0xAA_u8; HOST_PAGE_SIZE];
        let b = vec![0xBB_u8; HOST_PAGE_SIZE];
        block.stage_write(2, &a);
        block.stage_write(3, &b);

        let (start, buf) = block.flash_page_copy(&geo, 3);
        assert_eq!(start, 2);
        assert_eq!(buf.len(), 2 * HOST_PAGE_SIZE);
        assert!(buf.as_slice()[..HOST_PAGE_SIZE].iter().all(|x| *x == 0xAA));
        assert!(buf.as_slice()[HOST_PAGE_SIZE..].iter().all(|x| *x == 0xBB));
    }

    #[test]
    fn reset_clears_everything() {
        let geo = geo(8, 1);
        let block = Block::new(BlockId(0), &geo);
        block.alloc_staging(&geo);
        block.alloc_phys(&geo, None, None);
        block.invalidate_page(0);
        block.set_gc_running(true);

        block.reset(&geo);
        assert_eq!(block.nr_invalid_pages(), 0);
        assert_eq!(block.invalid_popcount(&geo), 0);
        assert!(!block.is_gc_running());
        assert!(!block.has_staging());
        assert_eq!(block.alloc_phys(&geo, None, None), Some(PhysPageAddr(0)));
    }

    #[test]
    fn contains_page_bounds() {
        let geo = geo(8, 1);
        let block = Block::new(BlockId(1), &geo);
        assert!(!block.contains_page(&geo, PhysPageAddr(7)));
        assert!(block.contains_page(&geo, PhysPageAddr(8)));
        assert!(block.contains_page(&geo, PhysPageAddr(15)));
        assert!(!block.contains_page(&geo, PhysPageAddr(16)));
    }
}
