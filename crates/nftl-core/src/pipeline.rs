//! Submit pipeline: inbound read/write handling, deferred and delayed
//! queues, device submission, and the completion path.
//!
//! A request that cannot be mapped is parked on the deferred list and the
//! GC engine is kicked; the deferred-drain worker re-dispatches in enqueue
//! order once space exists. With pool serialization enabled, submissions
//! funnel through the pool's waiting queue and at most one request per pool
//! is at the device.

use crate::map::{AddrHandle, MapKind};
use crate::request::{
    Completion, Direction, HostRequest, IoJob, RequestWrapper, WrapperKind,
};
use crate::Ftl;
use nftl_error::IoResult;
use nftl_types::{LogicalAddr, OptFlags, PhysPageAddr, PoolId, Sector, HOST_PAGE_SIZE, NR_PHY_IN_LOG};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, trace, warn};

/// Remaining wait above which the pacing loop sleeps instead of spinning.
const DEV_WAIT_SLEEP_THRESHOLD_US: u64 = 10;
/// Device waits beyond this are a sign the timing model is off.
const DEV_WAIT_EXCESSIVE_US: u64 = 1500;

/// Outcome of a write submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write is on its way to the device.
    Submitted,
    /// No physical space; the request is parked on the deferred list and
    /// the GC engine has been kicked.
    Deferred,
}

/// Write-path parameters beyond the request itself.
pub struct WriteOpts {
    pub is_gc: bool,
    pub map: MapKind,
    pub signal: Option<Arc<Completion>>,
    /// Complete the host request from the completion path. When `false`
    /// the caller keeps responsibility (GC write-back) and the request is
    /// consumed once its payload is staged.
    pub complete_original: bool,
}

impl Default for WriteOpts {
    fn default() -> Self {
        Self {
            is_gc: false,
            map: MapKind::Primary,
            signal: None,
            complete_original: true,
        }
    }
}

/// A parked request awaiting re-dispatch.
pub enum DeferredIo {
    Read(HostRequest),
    Write { req: HostRequest, opts: WriteOpts },
}

/// Read entry point. The logical address is locked here and released on
/// completion.
pub(crate) fn read_bio(ftl: &Arc<Ftl>, mut req: HostRequest) {
    debug_assert_eq!(req.dir, Direction::Read);
    let (l, sector_offset) = req.sector.to_lpage();
    if l.0 >= ftl.geo.nr_pages {
        error!(
            target: "nftl::pipeline",
            event = "read_out_of_range",
            l_addr = l.0,
            nr_pages = ftl.geo.nr_pages
        );
        panic!("read of logical address {l} beyond nr_pages {}", ftl.geo.nr_pages);
    }

    ftl.addr_locks.lock(l);

    let Some(p) = ftl.strategy.lookup_ltop(ftl, l, MapKind::Primary) else {
        ftl.addr_locks.unlock(l);
        trace!(target: "nftl::pipeline", event = "read_deferred", l_addr = l.0);
        ftl.strategy.defer_bio(ftl, DeferredIo::Read(req));
        ftl.kick_gc();
        return;
    };

    let Some(_block) = p.block else {
        // Never written: answer zeros without touching the device.
        req.data.zero();
        if let Some(end_io) = req.end_io.take() {
            end_io(&mut req, Ok(()));
        }
        ftl.addr_locks.unlock(l);
        trace!(target: "nftl::pipeline", event = "read_zero_fill", l_addr = l.0);
        return;
    };

    req.sector = Sector(p.addr.0 * NR_PHY_IN_LOG + sector_offset);
    submit_bio(ftl, req, p, l, WrapperKind::HostRead, None, None, MapKind::Primary);
}

/// Write path. The caller holds the logical-address lock; on deferral the
/// lock is released here and re-taken by the drain worker.
pub(crate) fn write_locked(ftl: &Arc<Ftl>, req: HostRequest, opts: WriteOpts) -> WriteOutcome {
    debug_assert_eq!(req.dir, Direction::Write);
    if req.data.len() != HOST_PAGE_SIZE {
        error!(
            target: "nftl::pipeline",
            event = "bad_write_payload",
            len = req.data.len()
        );
        panic!("write payload must be one host page");
    }
    let (l, _) = req.sector.to_lpage();
    if l.0 >= ftl.geo.nr_pages {
        error!(
            target: "nftl::pipeline",
            event = "write_out_of_range",
            l_addr = l.0,
            nr_pages = ftl.geo.nr_pages
        );
        panic!("write of logical address {l} beyond nr_pages {}", ftl.geo.nr_pages);
    }

    let Some(p) = ftl.strategy.map_ltop(ftl, l, opts.is_gc, opts.map) else {
        ftl.addr_locks.unlock(l);
        trace!(
            target: "nftl::pipeline",
            event = "write_deferred",
            l_addr = l.0,
            is_gc = opts.is_gc
        );
        ftl.strategy.defer_bio(ftl, DeferredIo::Write { req, opts });
        ftl.kick_gc();
        return WriteOutcome::Deferred;
    };

    let Some(block_id) = p.block else {
        error!(target: "nftl::pipeline", event = "mapping_without_block", l_addr = l.0);
        panic!("write mapping without a block");
    };
    let block = &ftl.blocks[block_id.0];
    let page_offset = ftl.geo.page_offset_in_block(p.addr);
    block.stage_write(page_offset, req.data.as_slice());

    // The device writes the whole flash page around the staged host page.
    let (flash_start, flash_data) = block.flash_page_copy(&ftl.geo, page_offset);
    let child_sector =
        PhysPageAddr(block.start_page().0 + u64::from(flash_start)).to_sector();
    let mut child = HostRequest::write(child_sector, flash_data);
    child.sync = opts.signal.is_some();

    let kind = if opts.is_gc {
        WrapperKind::GcWrite
    } else {
        WrapperKind::HostWrite
    };
    // Without complete_original the host request is consumed here; its
    // payload already lives in the staging buffer.
    let orig = if opts.complete_original { Some(req) } else { None };
    submit_bio(ftl, child, p, l, kind, orig, opts.signal, opts.map);
    WriteOutcome::Submitted
}

/// Wrap and dispatch one device-facing request.
#[allow(clippy::too_many_arguments)]
pub(crate) fn submit_bio(
    ftl: &Arc<Ftl>,
    mut req: HostRequest,
    p: AddrHandle,
    l: LogicalAddr,
    kind: WrapperKind,
    orig: Option<HostRequest>,
    signal: Option<Arc<Completion>>,
    map: MapKind,
) {
    let Some(block_id) = p.block else {
        error!(target: "nftl::pipeline", event = "submit_without_block", l_addr = l.0);
        panic!("submission without a block binding");
    };
    let ap_id = ftl.geo.ap_of_pool(ftl.geo.pool_of_block(block_id));
    let ap = &ftl.aps[ap_id.0];

    ap.account(req.dir);
    req.sync = req.sync || signal.is_some();

    let wrapper = RequestWrapper {
        kind,
        saved_end_io: req.end_io.take(),
        saved_private: req.private.take(),
        start: None,
        ap: ap_id,
        handle: p,
        l_addr: l,
        orig,
        signal,
        map,
    };
    let job = IoJob { req, wrapper };

    if ftl.config.flags.contains(OptFlags::POOL_SERIALIZE) {
        let pool = &ftl.pools[ap.pool().0];
        let mut waiting = pool.waiting.lock();
        ftl.strategy.bio_wait_add(&mut waiting.bios, job);

        // Hand-off: whoever flips is_active 0→1 owns scheduling the pool
        // worker; the worker clears it under the waiting lock only when the
        // queue is drained, so a concurrent submitter re-arms it here.
        if pool
            .is_active
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            ftl.pool_triggers[pool.id().0].signal();
        }
        return;
    }

    device_submit(ftl, job);
}

/// Stamp the wrapper and push the request to the device.
pub(crate) fn device_submit(ftl: &Arc<Ftl>, job: IoJob) {
    let IoJob { req, mut wrapper } = job;
    wrapper.start = Some(Instant::now());
    let ftl2 = Arc::clone(ftl);
    ftl.device.submit(
        req,
        Box::new(move |req, res| end_io(&ftl2, req, wrapper, res)),
    );
}

/// Pool worker body: advance the serialized queue by one request.
pub(crate) fn delayed_submit(ftl: &Arc<Ftl>, pool_id: PoolId) {
    let pool = &ftl.pools[pool_id.0];
    let job = {
        let mut waiting = pool.waiting.lock();
        match waiting.bios.pop_front() {
            Some(job) => {
                waiting.cur = Some((job.sector(), job.dir()));
                Some(job)
            }
            None => {
                waiting.cur = None;
                pool.is_active.store(0, Ordering::Release);
                None
            }
        }
    };
    if let Some(job) = job {
        device_submit(ftl, job);
    }
}

/// Deferred worker body: take the whole parked list and re-dispatch in
/// enqueue order. Requests that defer again land on the fresh list and wait
/// for the next kick.
pub(crate) fn deferred_drain(ftl: &Arc<Ftl>) {
    let drained = std::mem::take(&mut *ftl.deferred.lock());
    if drained.is_empty() {
        return;
    }
    trace!(
        target: "nftl::pipeline",
        event = "deferred_drain",
        nr_requests = drained.len()
    );
    for io in drained {
        match io {
            DeferredIo::Read(req) => ftl.strategy.read_bio(ftl, req),
            DeferredIo::Write { req, opts } => {
                let _ = ftl.strategy.write_bio(ftl, req, opts);
            }
        }
    }
}

/// Completion path, run from the device's callback context.
pub(crate) fn end_io(ftl: &Arc<Ftl>, mut req: HostRequest, mut wrapper: RequestWrapper, res: IoResult) {
    ftl.addr_locks.unlock(wrapper.l_addr);

    let ap = &ftl.aps[wrapper.ap.0];
    let mut dev_wait_us = match req.dir {
        Direction::Write => {
            let Some(block_id) = wrapper.handle.block else {
                error!(
                    target: "nftl::pipeline",
                    event = "write_completion_without_block",
                    l_addr = wrapper.l_addr.0
                );
                panic!("write completion without block");
            };
            let block = &ftl.blocks[block_id.0];
            if block.commit_page(&ftl.geo) {
                // Fully committed: the block becomes a GC candidate.
                ftl.pools[block.pool().0].promote_prio(block_id);
            }
            ap.t_write_us
        }
        Direction::Read => ap.t_read_us,
    };

    ftl.strategy.end_io(ftl, &wrapper, &mut dev_wait_us);

    if !ftl.config.flags.contains(OptFlags::NO_WAITS) && dev_wait_us > 0 {
        if let Some(start) = wrapper.start {
            pace_dev_wait(start, u64::from(dev_wait_us));
        }
    }

    if ftl.config.flags.contains(OptFlags::POOL_SERIALIZE) {
        let pool = &ftl.pools[ap.pool().0];
        // Clear cur here, not in the worker: the worker only runs later and
        // would leave a window where cur names an already-ended request.
        pool.waiting.lock().cur = None;
        ftl.pool_triggers[pool.id().0].signal();
    }

    // Restore the upstream hook and cookie, then hand the request back.
    req.private = wrapper.saved_private.take();
    if let Some(end_io) = wrapper.saved_end_io.take() {
        end_io(&mut req, res);
    }

    if let Some(mut orig) = wrapper.orig.take() {
        if let Some(end_io) = orig.end_io.take() {
            end_io(&mut orig, res);
        }
    }

    if let Some(signal) = wrapper.signal.take() {
        signal.complete();
    }

    // WrapperKind::GcRead: the address handle stays with the GC engine;
    // everything else owned by the wrapper ends here.
    trace!(
        target: "nftl::pipeline",
        event = "end_io",
        l_addr = wrapper.l_addr.0,
        kind = ?wrapper.kind,
        ok = res.is_ok()
    );
}

/// Busy-pace the emulated device latency against a monotonic clock.
fn pace_dev_wait(start: Instant, target_us: u64) {
    let mut warned = false;
    loop {
        let elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        if elapsed_us >= target_us {
            return;
        }
        let remaining = target_us - elapsed_us;
        if remaining > DEV_WAIT_EXCESSIVE_US && !warned {
            warn!(
                target: "nftl::pipeline",
                event = "excessive_dev_wait",
                remaining_us = remaining
            );
            warned = true;
        }
        if remaining > DEV_WAIT_SLEEP_THRESHOLD_US {
            std::thread::sleep(std::time::Duration::from_micros(5));
        } else {
            std::hint::spin_loop();
        }
    }
}
