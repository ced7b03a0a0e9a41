use std::io::{Read, Seek, Write};

use log::{debug, warn};

use super::cache::{BlockCache, ClusterData};
use super::dir;
use super::entry::{Entry, FatDateTime};
use super::table::{is_end_of_chain, EOC};
use super::FatFs;
use crate::error::{FatError, Result};

/// Value handed back for reads past the end of the data or the chain.
pub const EOF_BYTE: u8 = 0;

/// Where the file's last access landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// The cluster holding the last accessed byte is resident.
    Positioned { cluster: u32 },
    /// An access walked past the final cluster of the chain.
    EndOfChain,
}

/// An open file or directory: its entry plus a private cluster cache.
///
/// Byte offsets are mapped to clusters by walking the chain, so any offset
/// can be read or written. Writes stay in the cache until the cluster is
/// evicted or the file is closed, and [`File::close`] is the only place the
/// updated entry goes back to its directory.
pub struct File {
    entry: Entry,
    len: u64,
    cache: BlockCache<ClusterData>,
    cluster_size: u64,
    state: FileState,
    /// Chain index and cluster number of the most recent access.
    resident: Option<(u32, u32)>,
    entry_dirty: bool,
    data_written: bool,
    closed: bool,
}

impl File {
    pub fn open<D: Read + Write + Seek>(fs: &mut FatFs<D>, entry: &Entry) -> Result<Self> {
        let mut entry = entry.clone();
        if entry.is_directory() && entry.start_cluster == 0 {
            // `..` entries use cluster 0 for the root
            entry.start_cluster = fs.volume.root_cluster;
        }

        let cluster_size = fs.volume.cluster_size as u64;
        let mut cache = BlockCache::new(
            ClusterData::new(&fs.volume),
            fs.options.file_cache_lines,
        )?;

        let start = entry.start_cluster;
        let (state, resident) = if fs.table.is_data_cluster(start) {
            cache.read_byte(&mut fs.store, start, 0)?;
            (FileState::Positioned { cluster: start }, Some((0, start)))
        } else {
            (FileState::EndOfChain, None)
        };

        let len = if entry.is_directory() {
            fs.table.chain_len(&mut fs.store, start)? as u64 * cluster_size
        } else {
            entry.size as u64
        };

        Ok(Self {
            entry,
            len,
            cache,
            cluster_size,
            state,
            resident,
            entry_dirty: false,
            data_written: false,
            closed: false,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Logical size: the recorded size for files, the chain's byte span for
    /// directories.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// Resolve the cluster holding `offset`, updating the state machine.
    fn locate<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
    ) -> Result<Option<u32>> {
        let start = self.entry.start_cluster;
        let index = match u32::try_from(offset / self.cluster_size) {
            Ok(i) if fs.table.is_data_cluster(start) => i,
            _ => {
                self.state = FileState::EndOfChain;
                return Ok(None);
            }
        };

        let cluster = match self.resident {
            Some((i, c)) if i == index => c,
            Some((i, c)) if i + 1 == index => fs.table.chain_read(&mut fs.store, c, 1)?,
            _ => fs.table.chain_read(&mut fs.store, start, index)?,
        };
        if is_end_of_chain(cluster) || !fs.table.is_data_cluster(cluster) {
            self.state = FileState::EndOfChain;
            return Ok(None);
        }

        self.resident = Some((index, cluster));
        self.state = FileState::Positioned { cluster };
        Ok(Some(cluster))
    }

    /// Byte at `offset`, or `None` past the end of the data or the chain.
    fn byte_at<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
    ) -> Result<Option<u8>> {
        if offset >= self.len {
            return Ok(None);
        }
        let Some(cluster) = self.locate(fs, offset)? else {
            return Ok(None);
        };
        let pos = (offset % self.cluster_size) as usize;
        Ok(Some(self.cache.read_byte(&mut fs.store, cluster, pos)?))
    }

    /// Read one byte. Past the end of the file or its chain this yields
    /// [`EOF_BYTE`]; check [`File::state`] to tell the two apart.
    pub fn read_byte<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
    ) -> Result<u8> {
        Ok(self.byte_at(fs, offset)?.unwrap_or(EOF_BYTE))
    }

    pub fn read_u16<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
    ) -> Result<u16> {
        let lo = self.read_byte(fs, offset)?;
        let hi = self.read_byte(fs, offset + 1)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn read_u32<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
    ) -> Result<u32> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_byte(fs, offset + i as u64)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Fill `buf` from `offset`, stopping at the end of the data or chain.
    /// Returns the number of bytes read.
    pub fn read<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.byte_at(fs, offset + i as u64)? {
                Some(b) => *slot = b,
                None => return Ok(i),
            }
        }
        Ok(buf.len())
    }

    /// Write one byte into an already allocated cluster.
    ///
    /// Past the end of the chain nothing is written and the state becomes
    /// [`FileState::EndOfChain`]; use [`File::write`] to grow the file.
    pub fn write_byte<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        value: u8,
    ) -> Result<()> {
        let Some(cluster) = self.locate(fs, offset)? else {
            return Ok(());
        };
        let pos = (offset % self.cluster_size) as usize;
        self.cache.write_byte(&mut fs.store, cluster, pos, value)?;
        self.data_written = true;
        if !self.entry.is_directory() && offset >= self.len {
            self.len = offset + 1;
            self.entry.size = self.len as u32;
            self.entry_dirty = true;
        }
        Ok(())
    }

    /// Write `data` at `offset`, allocating clusters as needed.
    pub fn write<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(FatError::OutOfBounds {
                what: "file offset",
                address: end,
                limit: u32::MAX as u64,
            });
        }
        self.reserve(fs, end)?;
        for (i, &b) in data.iter().enumerate() {
            self.write_byte(fs, offset + i as u64, b)?;
        }
        Ok(data.len())
    }

    /// Make the chain long enough to hold `end` bytes.
    pub(crate) fn reserve<D: Read + Write + Seek>(
        &mut self,
        fs: &mut FatFs<D>,
        end: u64,
    ) -> Result<()> {
        let needed = end.div_ceil(self.cluster_size) as u32;
        if !fs.table.is_data_cluster(self.entry.start_cluster) {
            let first = fs.alloc_zeroed_cluster()?;
            self.entry.start_cluster = first;
            self.entry_dirty = true;
            self.resident = None;
        }
        let start = self.entry.start_cluster;
        let have = fs.table.chain_len(&mut fs.store, start)?;
        if have >= needed {
            return Ok(());
        }

        let grown_from = fs.table.chain_read(&mut fs.store, start, have - 1)?;
        let mut last = grown_from;
        for _ in have..needed {
            let next = match fs.alloc_zeroed_cluster() {
                Ok(next) => next,
                Err(e) => {
                    // give back whatever this call linked; the chain ends where it did
                    if last != grown_from {
                        let tail = fs.table.read_entry(&mut fs.store, grown_from)?;
                        fs.table.write_entry(&mut fs.store, grown_from, EOC)?;
                        fs.table.free_chain(&mut fs.store, &mut fs.info, tail)?;
                        warn!("chain at {start} left at {have} clusters: {e}");
                    }
                    return Err(e);
                }
            };
            fs.table.write_entry(&mut fs.store, last, next)?;
            last = next;
        }
        debug!("chain at {start} grown from {have} to {needed} clusters");
        if self.entry.is_directory() {
            self.len = needed as u64 * self.cluster_size;
        }
        Ok(())
    }

    /// Shorten a file to `len` bytes and release the clusters past the new
    /// end. The first cluster is kept even for `len == 0`. A `len` at or
    /// beyond the current size changes nothing.
    pub fn truncate<D: Read + Write + Seek>(&mut self, fs: &mut FatFs<D>, len: u64) -> Result<()> {
        if self.entry.is_directory() {
            return Err(FatError::TypeMismatch {
                path: self.entry.name(),
                expected: "file",
            });
        }
        if len >= self.len {
            return Ok(());
        }

        let start = self.entry.start_cluster;
        if fs.table.is_data_cluster(start) {
            let keep = len.div_ceil(self.cluster_size).max(1) as u32;
            let last = fs.table.chain_read(&mut fs.store, start, keep - 1)?;
            if fs.table.is_data_cluster(last) {
                let tail = fs.table.read_entry(&mut fs.store, last)?;
                fs.table.write_entry(&mut fs.store, last, EOC)?;
                let dropped = fs.table.chain_len(&mut fs.store, tail)?;
                let mut link = tail;
                for _ in 0..dropped {
                    self.cache.discard(link);
                    link = fs.table.read_entry(&mut fs.store, link)?;
                }
                fs.table.free_chain(&mut fs.store, &mut fs.info, tail)?;
                if matches!(self.resident, Some((i, _)) if i >= keep) {
                    self.resident = None;
                    self.state = FileState::Positioned { cluster: last };
                }
            }
        }

        debug!("{} truncated from {} to {len} bytes", self.entry.name(), self.len);
        self.len = len;
        self.entry.size = len as u32;
        self.entry_dirty = true;
        self.data_written = true;
        Ok(())
    }

    /// Flush pending writes, store the updated entry in its directory and
    /// release the cache. Returns the entry as it now stands on disk.
    pub fn close<D: Read + Write + Seek>(mut self, fs: &mut FatFs<D>) -> Result<Entry> {
        self.cache.flush(&mut fs.store)?;
        if self.data_written && self.entry.is_file() {
            let now = FatDateTime::now();
            self.entry.modified = now;
            self.entry.accessed = now.date;
            self.entry_dirty = true;
        }
        if self.entry_dirty {
            if let Some(slot) = self.entry.slot() {
                dir::write_slot(fs, slot, &self.entry.encode())?;
            }
        }
        self.closed = true;
        Ok(self.entry.clone())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed && self.cache.is_dirty() {
            warn!(
                "file {} dropped with unflushed writes; call close()",
                self.entry.name()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::{TestImage, CLUSTER, EOC};
    use crate::fs::Expect;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_read_across_clusters() {
        let mut img = TestImage::new();
        let data = pattern(2500);
        img.add_file(2, 0, b"DATA    BIN", &[5, 9, 7], &data);
        let mut fs = img.mount();
        let entry = fs.resolve("/DATA.BIN", Expect::File).unwrap();
        let mut file = fs.open(&entry).unwrap();
        assert_eq!(file.len(), 2500);

        let mut buf = vec![0u8; 4000];
        assert_eq!(file.read(&mut fs, 0, &mut buf).unwrap(), 2500);
        assert_eq!(&buf[..2500], &data[..]);
        assert_eq!(file.read_byte(&mut fs, 1024).unwrap(), data[1024]);
        assert_eq!(file.state(), FileState::Positioned { cluster: 9 });
        assert_eq!(file.read_byte(&mut fs, 2049).unwrap(), data[2049]);
        assert_eq!(file.state(), FileState::Positioned { cluster: 7 });
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_word_and_long_reads() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"NUM     BIN", &[3], &[0x78, 0x56, 0x34, 0x12, 0xCD, 0xAB]);
        let mut fs = img.mount();
        let mut file = fs.open_file("/NUM.BIN").unwrap();
        assert_eq!(file.read_u32(&mut fs, 0).unwrap(), 0x1234_5678);
        assert_eq!(file.read_u16(&mut fs, 4).unwrap(), 0xABCD);
        // the high byte is past the end
        assert_eq!(file.read_u16(&mut fs, 5).unwrap(), 0x00AB);
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_read_past_size_yields_sentinel() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"SMALL   TXT", &[3], b"abc");
        let mut fs = img.mount();
        let mut file = fs.open_file("/SMALL.TXT").unwrap();
        assert_eq!(file.read_byte(&mut fs, 3).unwrap(), EOF_BYTE);
        assert_eq!(file.state(), FileState::Positioned { cluster: 3 });
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_read_past_chain_sets_end_of_chain() {
        let mut img = TestImage::new();
        // size claims three clusters, chain has one
        img.add_file(2, 0, b"SHORT   BIN", &[4], &pattern(CLUSTER));
        img.put_entry(2, 0, b"SHORT   BIN", crate::fs::entry::ATTR_ARCHIVE, 4, 3 * CLUSTER as u32);
        let mut fs = img.mount();
        let mut file = fs.open_file("/SHORT.BIN").unwrap();
        assert_eq!(file.read_byte(&mut fs, 10).unwrap(), 10);
        assert_eq!(file.read_byte(&mut fs, CLUSTER as u64 + 5).unwrap(), EOF_BYTE);
        assert_eq!(file.state(), FileState::EndOfChain);

        let mut buf = vec![0u8; 3 * CLUSTER];
        assert_eq!(file.read(&mut fs, 0, &mut buf).unwrap(), CLUSTER);
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_write_byte_round_trip_after_eviction() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"RW      BIN", &[3, 4], &pattern(2 * CLUSTER));
        let mut fs = img.mount();
        let mut file = fs.open_file("/RW.BIN").unwrap();
        file.write_byte(&mut fs, 100, 0xEE).unwrap();
        // touch the second cluster so the first is evicted
        file.read_byte(&mut fs, CLUSTER as u64 + 1).unwrap();
        assert_eq!(file.read_byte(&mut fs, 100).unwrap(), 0xEE);
        file.close(&mut fs).unwrap();

        let img = TestImage::from_cursor(fs.unmount().unwrap());
        assert_eq!(img.cluster(3)[100], 0xEE);
    }

    #[test]
    fn test_write_byte_past_chain_is_ignored() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"ONE     BIN", &[3], &[1, 2, 3]);
        let mut fs = img.mount();
        let mut file = fs.open_file("/ONE.BIN").unwrap();
        file.write_byte(&mut fs, CLUSTER as u64 * 2, 9).unwrap();
        assert_eq!(file.state(), FileState::EndOfChain);
        assert_eq!(file.len(), 3);
        let entry = file.close(&mut fs).unwrap();
        assert_eq!(entry.size, 3);
    }

    #[test]
    fn test_write_grows_chain_and_updates_entry() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"GROW    BIN", &[3], b"x");
        let mut fs = img.mount();
        let free_before = fs.free_cluster_hint();

        let data = pattern(3 * CLUSTER - 7);
        let mut file = fs.open_file("/GROW.BIN").unwrap();
        assert_eq!(file.write(&mut fs, 0, &data).unwrap(), data.len());
        let entry = file.close(&mut fs).unwrap();
        assert_eq!(entry.size as usize, data.len());
        assert_eq!(fs.free_cluster_hint(), free_before - 2);

        assert_eq!(fs.read_file("/GROW.BIN").unwrap(), data);
        let again = fs.resolve_path("/GROW.BIN").unwrap();
        assert_eq!(again.size as usize, data.len());
        assert_eq!(fs.read_fat_entry(3).unwrap(), 4);
        assert_eq!(fs.read_fat_entry(5).unwrap(), EOC);
    }

    #[test]
    fn test_write_into_file_without_clusters() {
        let mut img = TestImage::new();
        img.put_entry(2, 0, b"EMPTY   TXT", crate::fs::entry::ATTR_ARCHIVE, 0, 0);
        let mut fs = img.mount();
        let mut file = fs.open_file("/EMPTY.TXT").unwrap();
        assert_eq!(file.state(), FileState::EndOfChain);
        assert_eq!(file.read_byte(&mut fs, 0).unwrap(), EOF_BYTE);
        file.write(&mut fs, 0, b"hello").unwrap();
        let entry = file.close(&mut fs).unwrap();
        assert_eq!(entry.start_cluster, 3);
        assert_eq!(fs.read_file("/EMPTY.TXT").unwrap(), b"hello");
    }

    #[test]
    fn test_directory_len_is_chain_span() {
        let mut img = TestImage::new();
        img.chain(&[2, 10]);
        let mut fs = img.mount();
        let root = fs.root_entry();
        let file = fs.open(&root).unwrap();
        assert_eq!(file.len(), 2 * CLUSTER as u64);
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_sequential_reads_walk_one_link() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"SEQ     BIN", &[3, 4, 5, 6], &pattern(4 * CLUSTER));
        let mut fs = img.mount();
        let mut file = fs.open_file("/SEQ.BIN").unwrap();
        let before = fs.table.cache_stats();
        let mut buf = vec![0u8; 4 * CLUSTER];
        file.read(&mut fs, 0, &mut buf).unwrap();
        let after = fs.table.cache_stats();
        // one FAT lookup per cluster boundary
        assert_eq!((after.hits + after.fetches) - (before.hits + before.fetches), 12);
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_truncate_shorter_overwrite() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"A       TXT", &[3], b"0123456789");
        let mut fs = img.mount();
        let mut file = fs.open_file("/A.TXT").unwrap();
        file.write(&mut fs, 0, b"hi").unwrap();
        file.truncate(&mut fs, 2).unwrap();
        assert_eq!(file.read_byte(&mut fs, 2).unwrap(), EOF_BYTE);
        let entry = file.close(&mut fs).unwrap();
        assert_eq!(entry.size, 2);
        assert_eq!(fs.read_file("/A.TXT").unwrap(), b"hi");
        assert_eq!(fs.resolve_path("/A.TXT").unwrap().size, 2);
    }

    #[test]
    fn test_truncate_releases_tail_clusters() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"TAIL    BIN", &[3, 4, 5], &pattern(3 * CLUSTER));
        let mut fs = img.mount();
        let free_before = fs.free_cluster_hint();

        let mut file = fs.open_file("/TAIL.BIN").unwrap();
        // pending write in a cluster that is about to be released
        file.write_byte(&mut fs, 2 * CLUSTER as u64 + 3, 0xAA).unwrap();
        file.truncate(&mut fs, CLUSTER as u64 + 1).unwrap();
        assert_eq!(file.len(), CLUSTER as u64 + 1);
        assert_eq!(file.state(), FileState::Positioned { cluster: 4 });
        file.close(&mut fs).unwrap();

        assert_eq!(fs.read_fat_entry(3).unwrap(), 4);
        assert_eq!(fs.read_fat_entry(4).unwrap(), EOC);
        assert_eq!(fs.read_fat_entry(5).unwrap(), 0);
        assert_eq!(fs.free_cluster_hint(), free_before + 1);

        let img = TestImage::from_cursor(fs.unmount().unwrap());
        assert_eq!(img.cluster(5)[3], pattern(3 * CLUSTER)[2 * CLUSTER + 3]);
    }

    #[test]
    fn test_truncate_to_zero_keeps_first_cluster() {
        let mut img = TestImage::new();
        img.add_file(2, 0, b"ZERO    BIN", &[3, 4], &pattern(2 * CLUSTER));
        let mut fs = img.mount();
        let mut file = fs.open_file("/ZERO.BIN").unwrap();
        file.truncate(&mut fs, 0).unwrap();
        assert!(file.is_empty());
        // growing past the current size is not a truncate
        file.truncate(&mut fs, 100).unwrap();
        assert!(file.is_empty());
        let entry = file.close(&mut fs).unwrap();
        assert_eq!(entry.start_cluster, 3);
        assert_eq!(entry.size, 0);
        assert_eq!(fs.read_fat_entry(3).unwrap(), EOC);
        assert_eq!(fs.read_fat_entry(4).unwrap(), 0);
    }

    #[test]
    fn test_truncate_directory_rejected() {
        let mut fs = TestImage::new().mount();
        let root = fs.root_entry();
        let mut file = fs.open(&root).unwrap();
        assert!(matches!(
            file.truncate(&mut fs, 0),
            Err(FatError::TypeMismatch { expected: "file", .. })
        ));
        file.close(&mut fs).unwrap();
    }

    #[test]
    fn test_write_out_of_space_keeps_chain() {
        let mut img = TestImage::new();
        // everything but clusters 3 and 4 is taken
        for c in 5..62 {
            img.set_fat(c, EOC);
        }
        img.add_file(2, 0, b"FULL    BIN", &[3], b"x");
        img.set_fsinfo(crate::fs::fsinfo::UNKNOWN, crate::fs::fsinfo::UNKNOWN);
        let mut fs = img.mount();
        assert_eq!(fs.free_cluster_hint(), 1);

        let mut file = fs.open_file("/FULL.BIN").unwrap();
        assert!(matches!(
            file.write(&mut fs, 0, &pattern(3 * CLUSTER)),
            Err(FatError::ClusterAllocError)
        ));
        assert_eq!(fs.read_fat_entry(3).unwrap(), EOC);
        assert_eq!(fs.read_fat_entry(4).unwrap(), 0);
        assert_eq!(fs.free_cluster_hint(), 1);
        assert_eq!(file.len(), 1);
        let entry = file.close(&mut fs).unwrap();
        assert_eq!(entry.size, 1);
        assert_eq!(fs.read_file("/FULL.BIN").unwrap(), b"x");
    }
}
