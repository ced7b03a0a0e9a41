//! Direct-mapped block cache.
//!
//! One cache type serves two consumers: the FAT table (sector-sized blocks)
//! and each open file (cluster-sized blocks). What a block *is* and where it
//! lives on disk is decided by the [`BlockBacking`] the cache is built with.

use std::io::{Read, Seek, Write};

use log::{debug, warn};

use super::volume::Volume;
use crate::device::BlockStore;
use crate::error::{FatError, Result};

/// Fetch/store strategy for one kind of block.
pub trait BlockBacking {
    fn block_size(&self) -> usize;

    fn fetch<D: Read + Write + Seek>(
        &self,
        store: &mut BlockStore<D>,
        tag: u32,
        buf: &mut [u8],
    ) -> Result<()>;

    fn store<D: Read + Write + Seek>(
        &self,
        store: &mut BlockStore<D>,
        tag: u32,
        buf: &[u8],
    ) -> Result<()>;
}

/// Sectors of the FAT region; the tag is the sector index within one copy.
#[derive(Debug, Clone)]
pub struct FatSectors {
    start: u64,
    sectors_per_copy: u64,
    copies: u8,
    sector_size: usize,
}

impl FatSectors {
    /// `mirror` controls whether write-back reaches every FAT copy or only
    /// the first one. Reads always come from the first copy.
    pub fn new(volume: &Volume, mirror: bool) -> Self {
        Self {
            start: volume.fat_start,
            sectors_per_copy: volume.fat_size as u64,
            copies: if mirror { volume.fat_count } else { 1 },
            sector_size: volume.sector_size,
        }
    }
}

impl BlockBacking for FatSectors {
    fn block_size(&self) -> usize {
        self.sector_size
    }

    fn fetch<D: Read + Write + Seek>(
        &self,
        store: &mut BlockStore<D>,
        tag: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        if tag as u64 >= self.sectors_per_copy {
            return Err(FatError::OutOfBounds {
                what: "FAT sector",
                address: tag as u64,
                limit: self.sectors_per_copy,
            });
        }
        store.read_sectors(self.start + tag as u64, buf)
    }

    fn store<D: Read + Write + Seek>(
        &self,
        store: &mut BlockStore<D>,
        tag: u32,
        buf: &[u8],
    ) -> Result<()> {
        for copy in 0..self.copies as u64 {
            store.write_sectors(self.start + copy * self.sectors_per_copy + tag as u64, buf)?;
        }
        Ok(())
    }
}

/// Clusters of the data region; the tag is the cluster number.
#[derive(Debug, Clone)]
pub struct ClusterData {
    data_start: u64,
    sectors_per_cluster: u64,
    cluster_size: usize,
    cluster_count: u32,
}

impl ClusterData {
    pub fn new(volume: &Volume) -> Self {
        Self {
            data_start: volume.data_start,
            sectors_per_cluster: volume.sectors_per_cluster as u64,
            cluster_size: volume.cluster_size,
            cluster_count: volume.cluster_count,
        }
    }

    fn lba(&self, cluster: u32) -> Result<u64> {
        if cluster < 2 || cluster >= self.cluster_count + 2 {
            return Err(FatError::OutOfBounds {
                what: "cluster",
                address: cluster as u64,
                limit: self.cluster_count as u64 + 2,
            });
        }
        Ok(self.data_start + (cluster as u64 - 2) * self.sectors_per_cluster)
    }
}

impl BlockBacking for ClusterData {
    fn block_size(&self) -> usize {
        self.cluster_size
    }

    fn fetch<D: Read + Write + Seek>(
        &self,
        store: &mut BlockStore<D>,
        tag: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let lba = self.lba(tag)?;
        store.read_sectors(lba, buf)
    }

    fn store<D: Read + Write + Seek>(
        &self,
        store: &mut BlockStore<D>,
        tag: u32,
        buf: &[u8],
    ) -> Result<()> {
        let lba = self.lba(tag)?;
        store.write_sectors(lba, buf)
    }
}

/// Counters for observing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub fetches: u64,
    pub write_backs: u64,
}

struct Line {
    tag: Option<u32>,
    dirty: bool,
    data: Vec<u8>,
}

pub struct BlockCache<B> {
    backing: B,
    lines: Vec<Line>,
    stats: CacheStats,
}

impl<B: BlockBacking> BlockCache<B> {
    pub fn new(backing: B, line_count: usize) -> Result<Self> {
        let line_count = line_count.max(1);
        let mut lines = Vec::new();
        lines.try_reserve_exact(line_count).map_err(|e| {
            FatError::AllocationFailure(format!("{line_count} cache lines: {e}"))
        })?;
        lines.extend((0..line_count).map(|_| Line {
            tag: None,
            dirty: false,
            data: Vec::new(),
        }));
        Ok(Self {
            backing,
            lines,
            stats: CacheStats::default(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.backing.block_size()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn read_byte<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        tag: u32,
        offset: usize,
    ) -> Result<u8> {
        let idx = self.resident(store, tag, offset)?;
        Ok(self.lines[idx].data[offset])
    }

    pub fn write_byte<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        tag: u32,
        offset: usize,
        value: u8,
    ) -> Result<()> {
        let idx = self.resident(store, tag, offset)?;
        let line = &mut self.lines[idx];
        line.data[offset] = value;
        line.dirty = true;
        Ok(())
    }

    /// Whether any line holds writes not yet stored.
    pub fn is_dirty(&self) -> bool {
        self.lines.iter().any(|l| l.dirty)
    }

    /// Write back every dirty line. Lines stay resident.
    pub fn flush<D: Read + Write + Seek>(&mut self, store: &mut BlockStore<D>) -> Result<()> {
        for line in &mut self.lines {
            if let (Some(tag), true) = (line.tag, line.dirty) {
                self.backing.store(store, tag, &line.data)?;
                line.dirty = false;
                self.stats.write_backs += 1;
            }
        }
        Ok(())
    }

    /// Drop a block without writing it back.
    pub fn discard(&mut self, tag: u32) {
        let idx = self.index(tag);
        let line = &mut self.lines[idx];
        if line.tag == Some(tag) {
            line.tag = None;
            line.dirty = false;
        }
    }

    fn index(&self, tag: u32) -> usize {
        tag as usize % self.lines.len()
    }

    /// Make `tag` resident and return its line index.
    fn resident<D: Read + Write + Seek>(
        &mut self,
        store: &mut BlockStore<D>,
        tag: u32,
        offset: usize,
    ) -> Result<usize> {
        let block_size = self.backing.block_size();
        if offset >= block_size {
            return Err(FatError::OutOfBounds {
                what: "block offset",
                address: offset as u64,
                limit: block_size as u64,
            });
        }

        let idx = self.index(tag);
        let line = &mut self.lines[idx];
        if line.tag == Some(tag) {
            self.stats.hits += 1;
            return Ok(idx);
        }

        if let (Some(old), true) = (line.tag, line.dirty) {
            debug!("evicting dirty block {old} for {tag}");
            self.backing.store(store, old, &line.data)?;
            line.dirty = false;
            self.stats.write_backs += 1;
        }
        line.tag = None;

        if line.data.len() != block_size {
            line.data.clear();
            line.data.try_reserve_exact(block_size).map_err(|e| {
                FatError::AllocationFailure(format!("{block_size}-byte cache line: {e}"))
            })?;
            line.data.resize(block_size, 0);
        }

        if let Err(e) = self.backing.fetch(store, tag, &mut line.data) {
            warn!("cache fetch of block {tag} failed: {e}");
            return Err(e);
        }
        line.tag = Some(tag);
        self.stats.fetches += 1;
        Ok(idx)
    }
}
