#![forbid(unsafe_code)]
//! Shared types for the NFTL workspace.
//!
//! Address and index newtypes, the translation-map sentinels, the validated
//! FTL configuration, and the geometry derived from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Device sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Host page size in bytes (one request payload).
pub const HOST_PAGE_SIZE: usize = 4096;

/// Device sectors per host page.
pub const NR_PHY_IN_LOG: u64 = (HOST_PAGE_SIZE / SECTOR_SIZE) as u64;

/// Sentinel physical address: the logical page has never been written.
pub const LTOP_EMPTY: u64 = u64::MAX;

/// Sentinel logical address: the reverse-map slot's forward owner was just
/// invalidated and no new owner has been installed yet.
pub const LTOP_POISON: u64 = u64::MAX - 1;

/// Logical page address (host page granularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalAddr(pub u64);

/// Physical page address (host page granularity, global across pools).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysPageAddr(pub u64);

/// Device sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

/// Index of a pool (one flash channel) in the FTL's pool array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub usize);

/// Index of an append point. Append points and pools are 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApId(pub usize);

/// Index of an erase-block in the FTL's global block array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub usize);

impl fmt::Display for LogicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PhysPageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sector {
    /// Split a host-facing sector into its logical page and the sector
    /// offset inside that page.
    #[must_use]
    pub fn to_lpage(self) -> (LogicalAddr, u64) {
        (LogicalAddr(self.0 / NR_PHY_IN_LOG), self.0 % NR_PHY_IN_LOG)
    }
}

impl PhysPageAddr {
    /// First device sector of this physical page.
    #[must_use]
    pub fn to_sector(self) -> Sector {
        Sector(self.0 * NR_PHY_IN_LOG)
    }
}

// ── Option flags ────────────────────────────────────────────────────────────

/// FTL behavior flags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct OptFlags(pub u32);

impl OptFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Disable device-wait pacing on completion.
    pub const NO_WAITS: Self = Self(1 << 0);
    /// Serialize I/O within each pool through the waiting queue.
    pub const POOL_SERIALIZE: Self = Self(1 << 1);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OptFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Configuration rejection reasons.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("device too small: need {needed_sectors} sectors, device has {device_sectors}")]
    DeviceTooSmall {
        needed_sectors: u64,
        device_sectors: u64,
    },
}

/// FTL configuration as handed over by the target glue.
///
/// `nr_pools` doubles as the append-point count (1:1). `nr_pages` is the
/// logical page count exposed upstream and may be smaller than the physical
/// page count (over-provisioning headroom for garbage collection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtlConfig {
    pub nr_pools: usize,
    pub nr_blks_per_pool: usize,
    pub nr_host_pages_in_blk: u32,
    pub nr_host_pages_in_flash_page: u32,
    pub nr_pages: u64,
    pub flags: OptFlags,
    /// Emulated read latency target, microseconds.
    pub t_read_us: u32,
    /// Emulated write latency target, microseconds.
    pub t_write_us: u32,
}

impl FtlConfig {
    /// Derive and validate the geometry.
    pub fn geometry(&self) -> Result<Geometry, ConfigError> {
        if self.nr_pools == 0 {
            return Err(ConfigError::InvalidField {
                field: "nr_pools",
                reason: "must be > 0",
            });
        }
        if self.nr_blks_per_pool == 0 {
            return Err(ConfigError::InvalidField {
                field: "nr_blks_per_pool",
                reason: "must be > 0",
            });
        }
        if self.nr_host_pages_in_blk == 0 {
            return Err(ConfigError::InvalidField {
                field: "nr_host_pages_in_blk",
                reason: "must be > 0",
            });
        }
        if self.nr_host_pages_in_flash_page == 0 {
            return Err(ConfigError::InvalidField {
                field: "nr_host_pages_in_flash_page",
                reason: "must be > 0",
            });
        }
        if self.nr_host_pages_in_blk % self.nr_host_pages_in_flash_page != 0 {
            return Err(ConfigError::InvalidField {
                field: "nr_host_pages_in_blk",
                reason: "must be a multiple of nr_host_pages_in_flash_page",
            });
        }

        let total_blocks = self
            .nr_pools
            .checked_mul(self.nr_blks_per_pool)
            .ok_or(ConfigError::InvalidField {
                field: "nr_blks_per_pool",
                reason: "total block count overflows",
            })?;
        let total_phys_pages = (total_blocks as u64)
            .checked_mul(u64::from(self.nr_host_pages_in_blk))
            .ok_or(ConfigError::InvalidField {
                field: "nr_host_pages_in_blk",
                reason: "total page count overflows",
            })?;

        if self.nr_pages == 0 || self.nr_pages > total_phys_pages {
            return Err(ConfigError::InvalidField {
                field: "nr_pages",
                reason: "must be in 1..=total physical pages",
            });
        }

        Ok(Geometry {
            nr_pools: self.nr_pools,
            nr_aps: self.nr_pools,
            nr_blks_per_pool: self.nr_blks_per_pool,
            nr_host_pages_in_blk: self.nr_host_pages_in_blk,
            nr_host_pages_in_flash_page: self.nr_host_pages_in_flash_page,
            nr_flash_pages_in_blk: self.nr_host_pages_in_blk / self.nr_host_pages_in_flash_page,
            nr_pages: self.nr_pages,
            total_blocks,
            total_phys_pages,
        })
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Validated geometric facts derived from [`FtlConfig`].
///
/// All the index math between pools, blocks, and physical pages lives here
/// so the core never recomputes it ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub nr_pools: usize,
    pub nr_aps: usize,
    pub nr_blks_per_pool: usize,
    pub nr_host_pages_in_blk: u32,
    pub nr_host_pages_in_flash_page: u32,
    pub nr_flash_pages_in_blk: u32,
    pub nr_pages: u64,
    pub total_blocks: usize,
    pub total_phys_pages: u64,
}

impl Geometry {
    /// First physical page of a block.
    #[must_use]
    pub fn block_start_page(&self, block: BlockId) -> PhysPageAddr {
        PhysPageAddr(block.0 as u64 * u64::from(self.nr_host_pages_in_blk))
    }

    /// Block containing a physical page.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // bounded by total_blocks
    pub fn block_of_page(&self, addr: PhysPageAddr) -> BlockId {
        BlockId((addr.0 / u64::from(self.nr_host_pages_in_blk)) as usize)
    }

    /// Page offset of a physical page inside its block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // modulo a u32 always fits
    pub fn page_offset_in_block(&self, addr: PhysPageAddr) -> u32 {
        (addr.0 % u64::from(self.nr_host_pages_in_blk)) as u32
    }

    /// Pool owning a block.
    #[must_use]
    pub fn pool_of_block(&self, block: BlockId) -> PoolId {
        PoolId(block.0 / self.nr_blks_per_pool)
    }

    /// Append point bound to a pool (1:1).
    #[must_use]
    pub fn ap_of_pool(&self, pool: PoolId) -> ApId {
        ApId(pool.0)
    }

    /// Block-id range owned by a pool.
    #[must_use]
    pub fn blocks_of_pool(&self, pool: PoolId) -> std::ops::Range<usize> {
        let start = pool.0 * self.nr_blks_per_pool;
        start..start + self.nr_blks_per_pool
    }

    /// Round a page offset down to its flash-page boundary.
    #[must_use]
    pub fn flash_page_start(&self, page_offset: u32) -> u32 {
        page_offset - page_offset % self.nr_host_pages_in_flash_page
    }

    /// Total device sectors the physical page space occupies.
    #[must_use]
    pub fn required_sectors(&self) -> u64 {
        self.total_phys_pages * NR_PHY_IN_LOG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FtlConfig {
        FtlConfig {
            nr_pools: 2,
            nr_blks_per_pool: 4,
            nr_host_pages_in_blk: 8,
            nr_host_pages_in_flash_page: 2,
            nr_pages: 48,
            flags: OptFlags::NONE,
            t_read_us: 0,
            t_write_us: 0,
        }
    }

    #[test]
    fn geometry_derivation() {
        let geo = config().geometry().expect("valid config");
        assert_eq!(geo.total_blocks, 8);
        assert_eq!(geo.total_phys_pages, 64);
        assert_eq!(geo.nr_flash_pages_in_blk, 4);
        assert_eq!(geo.required_sectors(), 64 * NR_PHY_IN_LOG);
    }

    #[test]
    fn geometry_index_math() {
        let geo = config().geometry().expect("valid config");
        assert_eq!(geo.block_start_page(BlockId(3)), PhysPageAddr(24));
        assert_eq!(geo.block_of_page(PhysPageAddr(24)), BlockId(3));
        assert_eq!(geo.block_of_page(PhysPageAddr(31)), BlockId(3));
        assert_eq!(geo.page_offset_in_block(PhysPageAddr(31)), 7);
        assert_eq!(geo.pool_of_block(BlockId(3)), PoolId(0));
        assert_eq!(geo.pool_of_block(BlockId(4)), PoolId(1));
        assert_eq!(geo.blocks_of_pool(PoolId(1)), 4..8);
        assert_eq!(geo.flash_page_start(5), 4);
        assert_eq!(geo.flash_page_start(4), 4);
    }

    #[test]
    fn sector_page_round_trip() {
        let (l, off) = Sector(43).to_lpage();
        assert_eq!(l, LogicalAddr(5));
        assert_eq!(off, 3);
        assert_eq!(PhysPageAddr(5).to_sector(), Sector(40));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut cfg = config();
        cfg.nr_host_pages_in_blk = 7; // not a multiple of flash grouping
        assert!(cfg.geometry().is_err());

        let mut cfg = config();
        cfg.nr_pages = 65; // beyond physical space
        assert!(cfg.geometry().is_err());

        let mut cfg = config();
        cfg.nr_pools = 0;
        assert!(cfg.geometry().is_err());
    }

    #[test]
    fn opt_flags() {
        let flags = OptFlags::NO_WAITS | OptFlags::POOL_SERIALIZE;
        assert!(flags.contains(OptFlags::NO_WAITS));
        assert!(flags.contains(OptFlags::POOL_SERIALIZE));
        assert!(!OptFlags::NONE.contains(OptFlags::NO_WAITS));
    }

    #[test]
    fn sentinels_are_distinct_and_out_of_range() {
        assert_ne!(LTOP_EMPTY, LTOP_POISON);
        let geo = config().geometry().expect("valid config");
        assert!(LTOP_POISON > geo.total_phys_pages);
    }
}
