#![forbid(unsafe_code)]
//! Host-side flash translation layer.
//!
//! `Ftl` exposes a linear logical page space to block I/O clients and
//! internally manages an array of flash-like pools made of erase-blocks:
//! logical→physical translation, sequential write allocation inside active
//! blocks, invalid-page tracking for garbage collection, per-logical-address
//! serialization, optional per-pool I/O serialization, and per-access
//! latency emulation.
//!
//! Pools, append points, and blocks reference each other by index into the
//! three arrays owned here; ownership never cycles.

pub mod ap;
pub mod bitmap;
pub mod block;
pub mod device;
pub mod gc;
pub mod map;
pub mod pipeline;
pub mod pool;
pub mod request;
pub mod strategy;
mod worker;

pub use crate::ap::{ApStats, AppendPoint};
pub use crate::block::Block;
pub use crate::device::{DeviceDone, MemDevice, PageDevice};
pub use crate::gc::{GcHooks, NoopGc};
pub use crate::map::{AddrHandle, AddrLockTable, ForwardEntry, MapKind, ReverseEntry, TranslationMap};
pub use crate::pipeline::{DeferredIo, WriteOpts, WriteOutcome};
pub use crate::pool::{Pool, PoolStats};
pub use crate::request::{Completion, Direction, EndIo, HostRequest, PageBuf, RequestWrapper, WrapperKind};
pub use crate::strategy::{FtlStrategy, RoundRobinStrategy};

use crate::request::WrapperKind as Wk;
use crate::worker::Trigger;
use nftl_error::{NftlError, Result};
use nftl_types::{ApId, ConfigError, FtlConfig, Geometry, LogicalAddr, PoolId, Sector, NR_PHY_IN_LOG};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// The FTL instance: one long-lived object with explicit init and teardown.
pub struct Ftl {
    pub(crate) config: FtlConfig,
    pub(crate) geo: Geometry,
    pub(crate) pools: Vec<Pool>,
    pub(crate) aps: Vec<AppendPoint>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) map: TranslationMap,
    pub(crate) addr_locks: AddrLockTable,
    pub(crate) deferred: Mutex<VecDeque<DeferredIo>>,
    pub(crate) deferred_trigger: Arc<Trigger>,
    pub(crate) pool_triggers: Vec<Arc<Trigger>>,
    pub(crate) device: Arc<dyn PageDevice>,
    pub(crate) strategy: Arc<dyn FtlStrategy>,
    pub(crate) gc: Arc<dyn GcHooks>,
    pub(crate) gc_pending: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Ftl {
    /// Bring up an FTL with the round-robin strategy and no GC engine.
    pub fn new(config: FtlConfig, device: Arc<dyn PageDevice>) -> Result<Arc<Self>> {
        Self::with_parts(
            config,
            device,
            Arc::new(RoundRobinStrategy::new()),
            Arc::new(NoopGc),
        )
    }

    /// Bring up an FTL with an explicit strategy and GC hooks.
    pub fn with_parts(
        config: FtlConfig,
        device: Arc<dyn PageDevice>,
        strategy: Arc<dyn FtlStrategy>,
        gc: Arc<dyn GcHooks>,
    ) -> Result<Arc<Self>> {
        let geo = config.geometry().map_err(NftlError::Config)?;
        if device.nr_sectors() < geo.required_sectors() {
            return Err(NftlError::Config(ConfigError::DeviceTooSmall {
                needed_sectors: geo.required_sectors(),
                device_sectors: device.nr_sectors(),
            }));
        }

        let blocks: Vec<Block> = (0..geo.total_blocks)
            .map(|i| Block::new(nftl_types::BlockId(i), &geo))
            .collect();
        let pools: Vec<Pool> = (0..geo.nr_pools).map(|i| Pool::new(PoolId(i), &geo)).collect();
        let aps: Vec<AppendPoint> = (0..geo.nr_aps)
            .map(|i| AppendPoint::new(ApId(i), PoolId(i), config.t_read_us, config.t_write_us))
            .collect();
        let pool_triggers: Vec<Arc<Trigger>> =
            (0..geo.nr_pools).map(|_| Arc::new(Trigger::new())).collect();

        let ftl = Arc::new(Self {
            config,
            geo,
            pools,
            aps,
            blocks,
            map: TranslationMap::new(&geo),
            addr_locks: AddrLockTable::new(),
            deferred: Mutex::new(VecDeque::new()),
            deferred_trigger: Arc::new(Trigger::new()),
            pool_triggers,
            device,
            strategy,
            gc,
            gc_pending: AtomicBool::new(false),
            worker_handles: Mutex::new(Vec::new()),
        });

        ftl.spawn_workers()?;
        info!(
            target: "nftl::core",
            event = "ftl_up",
            nr_pools = geo.nr_pools,
            nr_blks_per_pool = geo.nr_blks_per_pool,
            nr_pages = geo.nr_pages
        );
        Ok(ftl)
    }

    /// One delayed-submit worker per pool plus the global deferred drain.
    fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        for pool_id in 0..self.geo.nr_pools {
            let trigger = Arc::clone(&self.pool_triggers[pool_id]);
            let weak = Arc::downgrade(self);
            let handle = thread::Builder::new()
                .name(format!("nftl-pool-{pool_id}"))
                .spawn(move || {
                    while trigger.wait_next() {
                        let Some(ftl) = weak.upgrade() else { break };
                        pipeline::delayed_submit(&ftl, PoolId(pool_id));
                    }
                })?;
            self.worker_handles.lock().push(handle);
        }

        let trigger = Arc::clone(&self.deferred_trigger);
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("nftl-deferred".to_owned())
            .spawn(move || {
                while trigger.wait_next() {
                    let Some(ftl) = weak.upgrade() else { break };
                    pipeline::deferred_drain(&ftl);
                }
            })?;
        self.worker_handles.lock().push(handle);
        Ok(())
    }

    // ── Client surface ──────────────────────────────────────────────────

    /// Submit a read. Rejects sectors beyond the logical space; an accepted
    /// read completes asynchronously through the request's hook
    /// (immediately for unwritten pages, which answer zeros).
    pub fn read(self: &Arc<Self>, req: HostRequest) -> Result<()> {
        self.check_addr(req.sector)?;
        self.strategy.read_bio(self, req);
        Ok(())
    }

    /// Submit a write. The caller holds the address lock for the request's
    /// logical page (`lock_addr`/`unlock_addr`); on success the lock is
    /// released by the completion path, on deferral it is released here.
    /// Rejects sectors beyond the logical space without touching the lock.
    pub fn write(self: &Arc<Self>, req: HostRequest, opts: WriteOpts) -> Result<WriteOutcome> {
        self.check_addr(req.sector)?;
        Ok(pipeline::write_locked(self, req, opts))
    }

    fn check_addr(&self, sector: Sector) -> Result<()> {
        let (l, _) = sector.to_lpage();
        if l.0 >= self.geo.nr_pages {
            error!(
                target: "nftl::core",
                event = "addr_out_of_range",
                l_addr = l.0,
                nr_pages = self.geo.nr_pages
            );
            return Err(NftlError::AddrOutOfRange {
                addr: l.0,
                limit: self.geo.nr_pages,
            });
        }
        Ok(())
    }

    /// Take the per-address lock for `l`, blocking while another request
    /// for the same logical page is in flight.
    pub fn lock_addr(&self, l: LogicalAddr) {
        self.addr_locks.lock(l);
    }

    pub fn unlock_addr(&self, l: LogicalAddr) {
        self.addr_locks.unlock(l);
    }

    /// Submit a GC read for a page the GC engine resolved itself. The
    /// caller holds the address lock and keeps ownership of `p`.
    pub fn submit_gc_read(
        self: &Arc<Self>,
        mut req: HostRequest,
        p: AddrHandle,
        signal: Arc<Completion>,
    ) {
        let (l, sector_offset) = req.sector.to_lpage();
        req.sector = Sector(p.addr.0 * NR_PHY_IN_LOG + sector_offset);
        pipeline::submit_bio(self, req, p, l, Wk::GcRead, None, Some(signal), MapKind::Primary);
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn config(&self) -> &FtlConfig {
        &self.config
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[must_use]
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    #[must_use]
    pub fn aps(&self) -> &[AppendPoint] {
        &self.aps
    }

    #[must_use]
    pub fn translation(&self) -> &TranslationMap {
        &self.map
    }

    #[must_use]
    pub fn pool_stats(&self, pool: PoolId) -> PoolStats {
        self.pools[pool.0].stats()
    }

    #[must_use]
    pub fn ap_stats(&self, ap: ApId) -> ApStats {
        self.aps[ap.0].stats()
    }

    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }
}

impl Drop for Ftl {
    fn drop(&mut self) {
        debug!(target: "nftl::core", event = "ftl_down");
        self.deferred_trigger.shutdown();
        for trigger in &self.pool_triggers {
            trigger.shutdown();
        }
        let handles = std::mem::take(&mut *self.worker_handles.lock());
        let me = thread::current().id();
        for handle in handles {
            // A worker that held the last reference tears the FTL down from
            // its own thread; it cannot join itself and exits right after.
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
    }
}
