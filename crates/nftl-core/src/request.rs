//! Host request model and the per-I/O wrapper.
//!
//! A `HostRequest` carries one host page worth of payload plus the upstream
//! completion hook and private cookie. Before submission the pipeline strips
//! both into a `RequestWrapper`; the completion path restores them on the
//! request and then invokes the hook, so the upstream callback stacking is an
//! explicit field move, never a closure capture.

use crate::map::{AddrHandle, MapKind};
use nftl_error::IoResult;
use nftl_types::{ApId, LogicalAddr, Sector};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// I/O direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Owned page-granular payload buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuf {
    bytes: Vec<u8>,
}

impl PageBuf {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zero the whole buffer (unwritten-read fast path).
    pub fn zero(&mut self) {
        self.bytes.fill(0);
    }
}

/// Upstream end-of-I/O hook. Receives the finished request with its private
/// cookie restored and the device result verbatim.
pub type EndIo = Box<dyn FnOnce(&mut HostRequest, IoResult) + Send>;

/// One block-I/O request as handed over by the target glue.
///
/// `sector` is host-facing on entry; the pipeline rewrites it to the physical
/// sector before the request reaches the device.
pub struct HostRequest {
    pub sector: Sector,
    pub dir: Direction,
    pub data: PageBuf,
    /// Set when a completion signal is attached (sync hint for the device).
    pub sync: bool,
    pub end_io: Option<EndIo>,
    /// Opaque upstream cookie, preserved across the pipeline.
    pub private: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for HostRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRequest")
            .field("sector", &self.sector)
            .field("dir", &self.dir)
            .field("len", &self.data.len())
            .field("sync", &self.sync)
            .field("has_end_io", &self.end_io.is_some())
            .finish()
    }
}

impl HostRequest {
    /// A read of one host page at `sector`, buffer pre-zeroed.
    #[must_use]
    pub fn read(sector: Sector, len: usize) -> Self {
        Self {
            sector,
            dir: Direction::Read,
            data: PageBuf::zeroed(len),
            sync: false,
            end_io: None,
            private: None,
        }
    }

    /// A write of `payload` at `sector`.
    #[must_use]
    pub fn write(sector: Sector, payload: PageBuf) -> Self {
        Self {
            sector,
            dir: Direction::Write,
            data: payload,
            sync: false,
            end_io: None,
            private: None,
        }
    }

    #[must_use]
    pub fn with_end_io(mut self, end_io: EndIo) -> Self {
        self.end_io = Some(end_io);
        self
    }

    #[must_use]
    pub fn with_private(mut self, private: Box<dyn Any + Send>) -> Self {
        self.private = Some(private);
        self
    }
}

/// Waitable one-shot completion signal for synchronous submitters.
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    /// Block until `complete` has been called.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }
}

/// What kind of I/O a wrapper mediates.
///
/// GC reads are a distinct variant: their address handle stays owned by the
/// GC engine rather than the completion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperKind {
    HostRead,
    HostWrite,
    GcRead,
    GcWrite,
}

/// Per-I/O state carried from submission to completion.
pub struct RequestWrapper {
    pub(crate) kind: WrapperKind,
    pub(crate) saved_end_io: Option<EndIo>,
    pub(crate) saved_private: Option<Box<dyn Any + Send>>,
    pub(crate) start: Option<Instant>,
    pub(crate) ap: ApId,
    pub(crate) handle: AddrHandle,
    pub(crate) l_addr: LogicalAddr,
    pub(crate) orig: Option<HostRequest>,
    pub(crate) signal: Option<Arc<Completion>>,
    pub(crate) map: MapKind,
}

impl RequestWrapper {
    #[must_use]
    pub fn kind(&self) -> WrapperKind {
        self.kind
    }

    #[must_use]
    pub fn l_addr(&self) -> LogicalAddr {
        self.l_addr
    }

    #[must_use]
    pub fn handle(&self) -> AddrHandle {
        self.handle
    }

    #[must_use]
    pub fn ap(&self) -> ApId {
        self.ap
    }

    #[must_use]
    pub fn map(&self) -> MapKind {
        self.map
    }
}

/// A request paired with its wrapper, queued for (possibly delayed)
/// device submission.
pub struct IoJob {
    pub(crate) req: HostRequest,
    pub(crate) wrapper: RequestWrapper,
}

impl IoJob {
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.req.sector
    }

    #[must_use]
    pub fn dir(&self) -> Direction {
        self.req.dir
    }
}

/// Per-pool serialized submission state, guarded by the pool's waiting lock.
#[derive(Default)]
pub(crate) struct WaitingQueue {
    pub(crate) bios: VecDeque<IoJob>,
    /// The serialized request currently at the device, if any.
    pub(crate) cur: Option<(Sector, Direction)>,
}
