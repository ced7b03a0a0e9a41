use std::io::{Read, Seek, SeekFrom, Write};

use log::warn;

use crate::error::{FatError, Result};

/// Sector-addressed access to a raw image or block device.
///
/// Every transfer is bounds-checked against the sector count. The count
/// starts out as the device length and is narrowed to the BPB total once the
/// volume has been parsed.
pub struct BlockStore<D> {
    device: D,
    sector_size: usize,
    sector_count: u64,
}

impl<D: Read + Write + Seek> BlockStore<D> {
    /// Wrap a device, deriving the sector count from its length.
    pub fn new(mut device: D, sector_size: usize) -> Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(FatError::Unsupported(format!(
                "sector size {sector_size} is not a power of two"
            )));
        }
        let len = device.seek(SeekFrom::End(0))?;
        Ok(Self {
            device,
            sector_size,
            sector_count: len / sector_size as u64,
        })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Restrict transfers to the first `count` sectors.
    ///
    /// A count beyond the device length is kept (the BPB is authoritative)
    /// but logged, since accesses past the end will fail with an I/O error.
    pub fn set_sector_count(&mut self, count: u64) {
        if count > self.sector_count {
            warn!(
                "volume claims {count} sectors but the device only holds {}",
                self.sector_count
            );
        }
        self.sector_count = count;
    }

    /// Read whole sectors starting at `lba` into `buf`.
    ///
    /// `buf.len()` must be a multiple of the sector size.
    pub fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(lba, buf.len())?;
        self.device.seek(SeekFrom::Start(lba * self.sector_size as u64))?;
        self.device.read_exact(buf)?;
        Ok(())
    }

    /// Write whole sectors starting at `lba`.
    pub fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.check_range(lba, buf.len())?;
        self.device.seek(SeekFrom::Start(lba * self.sector_size as u64))?;
        self.device.write_all(buf)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()?;
        Ok(())
    }

    /// Give the device back to the caller.
    pub fn into_inner(self) -> D {
        self.device
    }

    fn check_range(&self, lba: u64, len: usize) -> Result<()> {
        let sectors = (len / self.sector_size) as u64;
        if len % self.sector_size != 0 {
            return Err(FatError::OutOfBounds {
                what: "transfer length",
                address: len as u64,
                limit: self.sector_size as u64,
            });
        }
        if lba.saturating_add(sectors) > self.sector_count {
            return Err(FatError::OutOfBounds {
                what: "sector",
                address: lba + sectors.saturating_sub(1),
                limit: self.sector_count,
            });
        }
        Ok(())
    }
}
