//! Physical device interface and the RAM-backed emulation device.
//!
//! The driver below the FTL is an external collaborator; the core only
//! needs sector-addressed page I/O with asynchronous completion plus an
//! erase primitive for block recycling. `MemDevice` implements the trait
//! over a RAM image with immediate completions, standing in for the real
//! open-firmware backend in tests and emulation setups.

use crate::request::{Direction, HostRequest};
use nftl_error::{DeviceError, IoResult};
use nftl_types::{Sector, SECTOR_SIZE};
use parking_lot::Mutex;
use tracing::trace;

/// Completion callback for one device submission. The device hands the
/// request back together with the result; the result code reaches the
/// upstream hook verbatim.
pub type DeviceDone = Box<dyn FnOnce(HostRequest, IoResult) + Send>;

/// Sector-addressed page device.
pub trait PageDevice: Send + Sync {
    /// Device capacity in sectors.
    fn nr_sectors(&self) -> u64;

    /// Submit one request. `req.sector` is a physical sector; `req.data`
    /// spans a whole number of sectors. The device must call `done` exactly
    /// once, from any thread.
    fn submit(&self, req: HostRequest, done: DeviceDone);

    /// Erase a sector range (block recycling).
    fn erase(&self, start: Sector, nr_sectors: u64) -> IoResult;
}

/// RAM-backed device with synchronous, in-line completions.
pub struct MemDevice {
    nr_sectors: u64,
    bytes: Mutex<Vec<u8>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(nr_sectors: u64) -> Self {
        Self {
            nr_sectors,
            bytes: Mutex::new(vec![0_u8; nr_sectors as usize * SECTOR_SIZE]),
        }
    }

    fn range(&self, start: Sector, len_bytes: usize) -> Result<(usize, usize), DeviceError> {
        let offset = start.0 as usize * SECTOR_SIZE;
        let end = offset.checked_add(len_bytes).ok_or(DeviceError { code: -22 })?;
        if len_bytes % SECTOR_SIZE != 0 || end > self.nr_sectors as usize * SECTOR_SIZE {
            return Err(DeviceError { code: -22 });
        }
        Ok((offset, end))
    }
}

impl PageDevice for MemDevice {
    fn nr_sectors(&self) -> u64 {
        self.nr_sectors
    }

    fn submit(&self, mut req: HostRequest, done: DeviceDone) {
        let res = match self.range(req.sector, req.data.len()) {
            Ok((offset, end)) => {
                let mut bytes = self.bytes.lock();
                match req.dir {
                    Direction::Read => {
                        req.data.as_mut_slice().copy_from_slice(&bytes[offset..end]);
                    }
                    Direction::Write => {
                        bytes[offset..end].copy_from_slice(req.data.as_slice());
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        };
        trace!(
            target: "nftl::device",
            event = "mem_io",
            sector = req.sector.0,
            dir = ?req.dir,
            ok = res.is_ok()
        );
        done(req, res);
    }

    fn erase(&self, start: Sector, nr_sectors: u64) -> IoResult {
        let (offset, end) = self.range(start, nr_sectors as usize * SECTOR_SIZE)?;
        self.bytes.lock()[offset..end].fill(0);
        trace!(
            target: "nftl::device",
            event = "erase",
            sector = start.0,
            nr_sectors
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PageBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn write_then_read_round_trip() {
        let dev = MemDevice::new(16);
        let payload = PageBuf::from_vec(vec![0x5A; SECTOR_SIZE * 2]);
        let done_count = Arc::new(AtomicUsize::new(0));

        let dc = Arc::clone(&done_count);
        dev.submit(
            HostRequest::write(Sector(4), payload),
            Box::new(move |_, res| {
                assert!(res.is_ok());
                dc.fetch_add(1, Ordering::AcqRel);
            }),
        );

        let dc = Arc::clone(&done_count);
        dev.submit(
            HostRequest::read(Sector(4), SECTOR_SIZE * 2),
            Box::new(move |req, res| {
                assert!(res.is_ok());
                assert!(req.data.as_slice().iter().all(|b| *b == 0x5A));
                dc.fetch_add(1, Ordering::AcqRel);
            }),
        );

        assert_eq!(done_count.load(Ordering::Acquire), 2);
    }

    #[test]
    fn erase_zeroes_range() {
        let dev = MemDevice::new(8);
        dev.submit(
            HostRequest::write(Sector(2), PageBuf::from_vec(vec![0xFF; SECTOR_SIZE])),
            Box::new(|_, res| assert!(res.is_ok())),
        );
        dev.erase(Sector(2), 1).expect("erase in range");
        dev.submit(
            HostRequest::read(Sector(2), SECTOR_SIZE),
            Box::new(|req, _| assert!(req.data.as_slice().iter().all(|b| *b == 0))),
        );
    }

    #[test]
    fn out_of_range_fails_with_code() {
        let dev = MemDevice::new(2);
        dev.submit(
            HostRequest::read(Sector(2), SECTOR_SIZE),
            Box::new(|_, res| assert_eq!(res, Err(DeviceError { code: -22 }))),
        );
        assert!(dev.erase(Sector(1), 4).is_err());
    }
}
