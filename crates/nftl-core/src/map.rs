//! Logical↔physical translation maps.
//!
//! The forward tables (primary plus the GC-scoped shadow) and the reverse
//! table are updated as a couple under one `rev_lock`; the per-logical-
//! address lock table serializes concurrent operations on the same logical
//! address across the whole submit→complete window.

use crate::block::Block;
use nftl_types::{Geometry, LogicalAddr, PhysPageAddr, LTOP_EMPTY, LTOP_POISON};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use tracing::{error, trace};

/// Which translation table owns a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Primary,
    /// GC-scoped shadow table used while relocations are in flight.
    Shadow,
}

/// Forward entry: logical page → physical page + owning block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardEntry {
    /// Physical page address, `LTOP_EMPTY` if unwritten.
    pub addr: u64,
    pub block: Option<nftl_types::BlockId>,
}

impl Default for ForwardEntry {
    fn default() -> Self {
        Self {
            addr: LTOP_EMPTY,
            block: None,
        }
    }
}

/// Reverse entry: physical page → logical page + owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseEntry {
    /// Logical address; `LTOP_EMPTY` if the page never held data,
    /// `LTOP_POISON` if its forward owner was just invalidated.
    pub l_addr: u64,
    pub map: MapKind,
}

impl Default for ReverseEntry {
    fn default() -> Self {
        Self {
            l_addr: LTOP_EMPTY,
            map: MapKind::Primary,
        }
    }
}

/// Resolved translation handed to the submit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrHandle {
    pub addr: PhysPageAddr,
    /// `None` for a never-written logical page (zero-fill fast path).
    pub block: Option<nftl_types::BlockId>,
}

struct MapTables {
    primary: Vec<ForwardEntry>,
    shadow: Vec<ForwardEntry>,
    reverse: Vec<ReverseEntry>,
}

impl MapTables {
    fn table(&self, map: MapKind) -> &[ForwardEntry] {
        match map {
            MapKind::Primary => &self.primary,
            MapKind::Shadow => &self.shadow,
        }
    }

    fn table_mut(&mut self, map: MapKind) -> &mut [ForwardEntry] {
        match map {
            MapKind::Primary => &mut self.primary,
            MapKind::Shadow => &mut self.shadow,
        }
    }
}

pub struct TranslationMap {
    rev_lock: Mutex<MapTables>,
}

impl TranslationMap {
    #[must_use]
    pub fn new(geo: &Geometry) -> Self {
        let nr_pages = geo.nr_pages as usize;
        Self {
            rev_lock: Mutex::new(MapTables {
                primary: vec![ForwardEntry::default(); nr_pages],
                shadow: vec![ForwardEntry::default(); nr_pages],
                reverse: vec![ReverseEntry::default(); geo.total_phys_pages as usize],
            }),
        }
    }

    /// Install `l → p`, invalidating and poisoning the previous mapping.
    ///
    /// After this returns, the forward entry is the unique live mapping for
    /// `l` and the reverse entry for `p.addr` points back at `l` through
    /// `map`.
    pub fn update_map(&self, blocks: &[Block], geo: &Geometry, l: LogicalAddr, p: AddrHandle, map: MapKind) {
        if l.0 >= geo.nr_pages {
            error!(
                target: "nftl::map",
                event = "l_addr_out_of_range",
                l_addr = l.0,
                nr_pages = geo.nr_pages
            );
            panic!("logical address {l} out of range");
        }
        if p.addr.0 >= geo.total_phys_pages {
            error!(
                target: "nftl::map",
                event = "p_addr_out_of_range",
                p_addr = p.addr.0,
                total_phys_pages = geo.total_phys_pages
            );
            panic!("physical address {} out of range", p.addr);
        }
        let Some(block) = p.block else {
            error!(target: "nftl::map", event = "mapping_without_block", l_addr = l.0);
            panic!("mapping installed without a block");
        };

        let mut tables = self.rev_lock.lock();
        let prev = tables.table(map)[l.0 as usize];
        if let Some(prev_block) = prev.block {
            let offset = geo.page_offset_in_block(PhysPageAddr(prev.addr));
            blocks[prev_block.0].invalidate_page(offset);
            tables.reverse[prev.addr as usize].l_addr = LTOP_POISON;
        }

        tables.table_mut(map)[l.0 as usize] = ForwardEntry {
            addr: p.addr.0,
            block: Some(block),
        };
        tables.reverse[p.addr.0 as usize] = ReverseEntry { l_addr: l.0, map };
        drop(tables);
        trace!(
            target: "nftl::map",
            event = "map_update",
            l_addr = l.0,
            p_addr = p.addr.0,
            block = block.0
        );
    }

    /// Resolve `l` through `map`.
    ///
    /// Fails (caller defers) while the target block is being relocated:
    /// serving the read now could observe the page mid-move, before the
    /// forward map catches up.
    #[must_use]
    pub fn lookup(&self, blocks: &[Block], l: LogicalAddr, map: MapKind) -> Option<AddrHandle> {
        let entry = {
            let tables = self.rev_lock.lock();
            tables.table(map)[l.0 as usize]
        };

        if let Some(block) = entry.block {
            if blocks[block.0].is_gc_running() {
                return None;
            }
        }
        Some(AddrHandle {
            addr: PhysPageAddr(entry.addr),
            block: entry.block,
        })
    }

    #[must_use]
    pub fn forward_entry(&self, l: LogicalAddr, map: MapKind) -> ForwardEntry {
        self.rev_lock.lock().table(map)[l.0 as usize]
    }

    #[must_use]
    pub fn reverse_entry(&self, p: PhysPageAddr) -> ReverseEntry {
        self.rev_lock.lock().reverse[p.0 as usize]
    }
}

/// Per-logical-address lock table.
///
/// A lock is held logically from submission until completion, which happens
/// on another thread; membership in the set is the lock, so release does not
/// require the acquiring thread.
#[derive(Default)]
pub struct AddrLockTable {
    locked: Mutex<HashSet<u64>>,
    cv: Condvar,
}

impl AddrLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `l` is free, then take it.
    pub fn lock(&self, l: LogicalAddr) {
        let mut locked = self.locked.lock();
        while locked.contains(&l.0) {
            self.cv.wait(&mut locked);
        }
        locked.insert(l.0);
    }

    /// Release `l`. Releasing an address that is not held means the
    /// submit/complete pairing broke down.
    pub fn unlock(&self, l: LogicalAddr) {
        let mut locked = self.locked.lock();
        let was_held = locked.remove(&l.0);
        if !was_held {
            error!(target: "nftl::map", event = "unlock_without_lock", l_addr = l.0);
            panic!("unlock of address {l} that is not locked");
        }
        drop(locked);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn is_locked(&self, l: LogicalAddr) -> bool {
        self.locked.lock().contains(&l.0)
    }
}
