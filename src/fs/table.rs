use std::io::{Read, Seek, Write};

use log::{debug, warn};

use super::cache::{BlockCache, CacheStats, FatSectors};
use super::fsinfo::{FsInfo, UNKNOWN};
use super::volume::Volume;
use crate::device::BlockStore;
use crate::error::{FatError, Result};

/// Lowest end-of-chain link value.
pub const EOC_LOW: u32 = 0x0FFF_FFF8;
/// End-of-chain marker written by this driver.
pub const EOC: u32 = 0x0FFF_FFFF;
pub const FREE: u32 = 0;

const ENTRY_MASK: u32 = 0x0FFF_FFFF;
const FIRST_DATA_CLUSTER: u32 = 2;

pub fn is_end_of_chain(link: u32) -> bool {
    link >= EOC_LOW
}

/// The file allocation table, read and written through a sector cache over
/// the first copy.
pub struct FatTable {
    cache: BlockCache<FatSectors>,
    sector_size: u64,
    size_bytes: u64,
    /// One past the highest cluster the table can describe.
    end: u32,
}

impl FatTable {
    pub fn new(volume: &Volume, cache_lines: usize, mirror: bool) -> Result<Self> {
        let sector_size = volume.sector_size as u64;
        let size_bytes = volume.fat_size as u64 * sector_size;
        let entries = (size_bytes / 4).min(u32::MAX as u64) as u32;
        let end = entries.min(volume.cluster_count + 2);
        if end < volume.cluster_count + 2 {
            warn!(
                "FAT holds {entries} entries, fewer than the {} clusters of the volume",
                volume.cluster_count
            );
        }
        Ok(Self {
            cache: BlockCache::new(FatSectors::new(volume, mirror), cache_lines)?,
            sector_size,
            size_bytes,
            end,
        })
    }

    fn locate(&self, cluster: u32) -> Result<u64> {
        let offset = cluster as u64 * 4;
        if offset + 4 > self.size_bytes {
            return Err(FatError::OutOfBounds {
                what: "FAT entry",
                address: cluster as u64,
                limit: self.size_bytes / 4,
            });
        }
        Ok(offset)
    }

    fn byte_at(&self, pos: u64) -> (u32, usize) {
        ((pos / self.sector_size) as u32, (pos % self.sector_size) as usize)
    }

    /// Link value stored for `cluster`, with the reserved top nibble masked off.
    pub fn read_entry<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        cluster: u32,
    ) -> Result<u32> {
        let offset = self.locate(cluster)?;
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            let (tag, off) = self.byte_at(offset + i as u64);
            *b = self.cache.read_byte(store, tag, off)?;
        }
        Ok(u32::from_le_bytes(bytes) & ENTRY_MASK)
    }

    /// Store a link value, keeping the reserved top nibble of the old entry.
    pub fn write_entry<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        cluster: u32,
        value: u32,
    ) -> Result<()> {
        let offset = self.locate(cluster)?;
        let (tag, off) = self.byte_at(offset + 3);
        let reserved = self.cache.read_byte(store, tag, off)? & 0xF0;
        let mut bytes = (value & ENTRY_MASK).to_le_bytes();
        bytes[3] |= reserved;
        for (i, b) in bytes.iter().enumerate() {
            let (tag, off) = self.byte_at(offset + i as u64);
            self.cache.write_byte(store, tag, off, *b)?;
        }
        Ok(())
    }

    /// Follow `n` links from `start`.
    ///
    /// Stops early on an end-of-chain value and returns it, so callers must
    /// check [`is_end_of_chain`] before treating the result as a cluster. A
    /// link into a free or reserved entry is reported as end-of-chain.
    pub fn chain_read<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        start: u32,
        n: u32,
    ) -> Result<u32> {
        let mut link = start;
        for _ in 0..n {
            if is_end_of_chain(link) {
                break;
            }
            if link < FIRST_DATA_CLUSTER {
                warn!("chain from cluster {start} runs into reserved link {link}");
                return Ok(EOC);
            }
            link = self.read_entry(store, link)?;
        }
        Ok(link)
    }

    /// Number of clusters in the chain starting at `start`.
    pub fn chain_len<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        start: u32,
    ) -> Result<u32> {
        if !self.is_data_cluster(start) {
            return Ok(0);
        }
        let mut len = 1;
        let mut link = start;
        loop {
            let next = self.read_entry(store, link)?;
            if is_end_of_chain(next) || !self.is_data_cluster(next) {
                return Ok(len);
            }
            if len >= self.end {
                warn!("chain from cluster {start} does not terminate");
                return Ok(len);
            }
            len += 1;
            link = next;
        }
    }

    /// Final cluster of the chain starting at `start`.
    pub fn last_cluster<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        start: u32,
    ) -> Result<u32> {
        let len = self.chain_len(store, start)?;
        self.chain_read(store, start, len.saturating_sub(1))
    }

    /// Count free entries across the data clusters.
    pub fn free_cluster_count<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
    ) -> Result<u32> {
        let mut free = 0;
        for cluster in FIRST_DATA_CLUSTER..self.end {
            if self.read_entry(store, cluster)? == FREE {
                free += 1;
            }
        }
        Ok(free)
    }

    pub fn first_free_cluster<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
    ) -> Result<Option<u32>> {
        self.scan_free(store, FIRST_DATA_CLUSTER, self.end)
    }

    fn scan_free<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        from: u32,
        to: u32,
    ) -> Result<Option<u32>> {
        for cluster in from..to {
            if self.read_entry(store, cluster)? == FREE {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Claim a free cluster and write `content` (usually [`EOC`]) as its link.
    ///
    /// The scan starts at the next-free hint and wraps around once.
    pub fn alloc_cluster<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        info: &mut FsInfo,
        content: u32,
    ) -> Result<u32> {
        if info.free_count() == 0 {
            return Err(FatError::ClusterAllocError);
        }
        let hint = info.next_free();
        let hint = if self.is_data_cluster(hint) {
            hint
        } else {
            FIRST_DATA_CLUSTER
        };
        let found = match self.scan_free(store, hint, self.end)? {
            Some(c) => Some(c),
            None => self.scan_free(store, FIRST_DATA_CLUSTER, hint)?,
        };
        let Some(cluster) = found else {
            warn!("free count hint was {} but no free cluster exists", info.free_count());
            info.set_free_count(0);
            return Err(FatError::ClusterAllocError);
        };

        self.write_entry(store, cluster, content)?;
        if info.free_count() != UNKNOWN {
            info.set_free_count(info.free_count() - 1);
        }
        info.set_next_free(cluster);
        debug!("allocated cluster {cluster} (link {content:#x})");
        Ok(cluster)
    }

    /// Release every cluster of the chain starting at `start`.
    pub fn free_chain<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        info: &mut FsInfo,
        start: u32,
    ) -> Result<u32> {
        let mut freed = 0;
        let mut link = start;
        while self.is_data_cluster(link) && freed < self.end {
            let next = self.read_entry(store, link)?;
            self.write_entry(store, link, FREE)?;
            freed += 1;
            if link < info.next_free() {
                info.set_next_free(link);
            }
            link = next;
        }
        if info.free_count() != UNKNOWN {
            info.set_free_count(info.free_count().saturating_add(freed));
        }
        debug!("freed {freed} clusters from chain at {start}");
        Ok(freed)
    }

    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        (FIRST_DATA_CLUSTER..self.end).contains(&cluster)
    }

    pub fn flush<D: Read + Write + Seek>(&mut self, store: &mut BlockStore<D>) -> Result<()> {
        self.cache.flush(store)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
