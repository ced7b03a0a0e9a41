use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::device::BlockStore;
use crate::error::{FatError, Result};

const LEAD_SIGNATURE: u32 = 0x4161_5252;
const MID_SIGNATURE: u32 = 0x6141_7272;
const TRAIL_SIGNATURE: u32 = 0xAA55_0000;

const LEAD_OFFSET: u64 = 0x000;
const MID_OFFSET: u64 = 0x1E4;
const FREE_COUNT_OFFSET: u64 = 0x1E8;
const NEXT_FREE_OFFSET: u64 = 0x1EC;
const TRAIL_OFFSET: u64 = 0x1FC;

/// Value of either hint when the volume does not know it.
pub const UNKNOWN: u32 = 0xFFFF_FFFF;

/// The FSInfo sector: free-cluster count and next-free hint.
///
/// Both values are hints. The allocator keeps them current in memory and
/// they reach the disk once, at unmount.
#[derive(Debug, Clone)]
pub struct FsInfo {
    lba: u64,
    raw: Vec<u8>,
    free_count: u32,
    next_free: u32,
}

impl FsInfo {
    pub fn read<D: Read + Write + Seek>(store: &mut BlockStore<D>, lba: u64) -> Result<Self> {
        let mut raw = vec![0u8; store.sector_size()];
        store.read_sectors(lba, &mut raw)?;
        Self::parse(lba, raw)
    }

    /// Validate the three signatures and pick out the hints.
    pub fn parse(lba: u64, raw: Vec<u8>) -> Result<Self> {
        let mut r = Cursor::new(&raw[..]);
        for (offset, expected, structure) in [
            (LEAD_OFFSET, LEAD_SIGNATURE, "FSInfo lead"),
            (MID_OFFSET, MID_SIGNATURE, "FSInfo mid"),
            (TRAIL_OFFSET, TRAIL_SIGNATURE, "FSInfo trail"),
        ] {
            r.seek(SeekFrom::Start(offset))?;
            let found = r.read_u32::<LittleEndian>()?;
            if found != expected {
                return Err(FatError::CorruptSignature {
                    structure,
                    expected,
                    found,
                });
            }
        }
        r.seek(SeekFrom::Start(FREE_COUNT_OFFSET))?;
        let free_count = r.read_u32::<LittleEndian>()?;
        let next_free = r.read_u32::<LittleEndian>()?;
        debug!("FSInfo at LBA {lba}: free={free_count:#x} next={next_free:#x}");
        Ok(Self {
            lba,
            raw,
            free_count,
            next_free,
        })
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    pub(crate) fn set_free_count(&mut self, count: u32) {
        self.free_count = count;
    }

    pub(crate) fn set_next_free(&mut self, cluster: u32) {
        self.next_free = cluster;
    }

    /// A free count that is unknown or larger than the volume cannot be trusted.
    pub fn free_count_plausible(&self, cluster_count: u32) -> bool {
        self.free_count != UNKNOWN && self.free_count <= cluster_count
    }

    pub fn next_free_plausible(&self, cluster_count: u32) -> bool {
        self.next_free >= 2 && self.next_free < cluster_count + 2
    }

    /// Store the current hints into the sector and write it to disk.
    pub fn write_back<D: Read + Write + Seek>(&mut self, store: &mut BlockStore<D>) -> Result<()> {
        let mut w = Cursor::new(&mut self.raw[..]);
        w.seek(SeekFrom::Start(FREE_COUNT_OFFSET))?;
        w.write_u32::<LittleEndian>(self.free_count)?;
        w.write_u32::<LittleEndian>(self.next_free)?;
        store.write_sectors(self.lba, &self.raw)?;
        debug!(
            "FSInfo written: free={} next={}",
            self.free_count, self.next_free
        );
        Ok(())
    }
}
