pub mod cache;
pub mod dir;
pub mod entry;
pub mod file;
pub mod fsinfo;
pub mod path;
pub mod table;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

use std::io::{Read, Seek, Write};

use log::{debug, warn};

pub use dir::Directory;
pub use entry::{DirSlot, Entry, FatDate, FatDateTime, FatTime};
pub use file::{File, FileState};
pub use fsinfo::FsInfo;
pub use volume::Volume;

use crate::device::BlockStore;
use crate::error::{FatError, Result};
use entry::{decode_short_name, encode_short_name, ATTR_ARCHIVE, ATTR_DIRECTORY};
use fsinfo::UNKNOWN;
use path::PathCursor;
use table::{FatTable, EOC};
use volume::BiosParameterBlock;

/// Tunables for a mount.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Sector size the device is addressed in; the BPB must agree.
    pub sector_size: usize,
    /// Lines in the FAT sector cache.
    pub fat_cache_lines: usize,
    /// Lines in each open file's cluster cache.
    pub file_cache_lines: usize,
    /// Write FAT sectors back to every copy rather than just the first.
    pub mirror_fat_copies: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            sector_size: 512,
            fat_cache_lines: 10,
            file_cache_lines: 1,
            mirror_fat_copies: true,
        }
    }
}

/// What kind of entry a lookup must end on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    File,
    Directory,
}

impl Expect {
    fn check(self, entry: &Entry, path: &str) -> Result<()> {
        let expected = match self {
            Expect::File if !entry.is_file() => "file",
            Expect::Directory if !entry.is_directory() => "directory",
            _ => return Ok(()),
        };
        Err(FatError::TypeMismatch {
            path: path.to_string(),
            expected,
        })
    }
}

/// A mounted FAT32 volume.
///
/// Owns the device, the FAT cache and the FSInfo hints. Files and
/// directories opened from it borrow it mutably per call and must be closed
/// before [`FatFs::unmount`], which is the only point at which the FAT cache
/// and FSInfo sector are guaranteed to reach the disk.
pub struct FatFs<D> {
    pub(crate) store: BlockStore<D>,
    pub(crate) volume: Volume,
    pub(crate) table: FatTable,
    pub(crate) info: FsInfo,
    pub(crate) options: MountOptions,
}

impl<D: Read + Write + Seek> FatFs<D> {
    pub fn mount(device: D) -> Result<Self> {
        Self::mount_with(device, MountOptions::default())
    }

    pub fn mount_with(device: D, options: MountOptions) -> Result<Self> {
        let mut store = BlockStore::new(device, options.sector_size)?;
        let mut boot = vec![0u8; options.sector_size];
        store.read_sectors(0, &mut boot)?;
        let bpb = BiosParameterBlock::parse(&boot)?;
        let volume = Volume::from_bpb(&bpb, options.sector_size)?;
        store.set_sector_count(volume.sector_count);
        debug!("FAT32 geometry:\n{volume}");

        let mut table = FatTable::new(
            &volume,
            options.fat_cache_lines,
            options.mirror_fat_copies,
        )?;
        let mut info = FsInfo::read(&mut store, volume.fsinfo_sector)?;

        if !info.free_count_plausible(volume.cluster_count) {
            if info.free_count() != UNKNOWN {
                warn!(
                    "FSInfo free count {} exceeds {} clusters; rescanning",
                    info.free_count(),
                    volume.cluster_count
                );
            }
            let free = table.free_cluster_count(&mut store)?;
            debug!("free cluster count recomputed: {free}");
            info.set_free_count(free);
        }
        if !info.next_free_plausible(volume.cluster_count) {
            let next = table.first_free_cluster(&mut store)?.unwrap_or(2);
            debug!("next free cluster recomputed: {next}");
            info.set_next_free(next);
        }

        Ok(Self {
            store,
            volume,
            table,
            info,
            options,
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Free clusters according to the in-memory FSInfo hint.
    pub fn free_cluster_hint(&self) -> u32 {
        self.info.free_count()
    }

    pub fn next_free_hint(&self) -> u32 {
        self.info.next_free()
    }

    /// Free clusters according to a full FAT scan.
    pub fn free_cluster_count(&mut self) -> Result<u32> {
        self.table.free_cluster_count(&mut self.store)
    }

    /// Raw link value of a FAT entry.
    pub fn read_fat_entry(&mut self, cluster: u32) -> Result<u32> {
        self.table.read_entry(&mut self.store, cluster)
    }

    /// Follow `n` links from `start`; see [`FatTable::chain_read`].
    pub fn chain_read(&mut self, start: u32, n: u32) -> Result<u32> {
        self.table.chain_read(&mut self.store, start, n)
    }

    /// Claim one cluster and store `content` as its link.
    pub fn alloc_cluster(&mut self, content: u32) -> Result<u32> {
        self.table.alloc_cluster(&mut self.store, &mut self.info, content)
    }

    /// Allocate an end-of-chain cluster and clear its data on disk.
    pub(crate) fn alloc_zeroed_cluster(&mut self) -> Result<u32> {
        let cluster = self.alloc_cluster(EOC)?;
        let zeros = vec![0u8; self.volume.cluster_size];
        self.store.write_sectors(self.volume.cluster_lba(cluster), &zeros)?;
        Ok(cluster)
    }

    pub fn root_entry(&self) -> Entry {
        Entry::root(self.volume.root_cluster)
    }

    pub fn open_root(&mut self) -> Result<Directory> {
        let root = self.root_entry();
        Directory::open(self, &root)
    }

    pub fn open_directory(&mut self, entry: &Entry) -> Result<Directory> {
        Directory::open(self, entry)
    }

    pub fn open(&mut self, entry: &Entry) -> Result<File> {
        File::open(self, entry)
    }

    /// Look up an absolute path. A trailing `/` requires a directory.
    pub fn resolve_path(&mut self, path: &str) -> Result<Entry> {
        self.resolve(path, Expect::Any)
    }

    pub fn resolve(&mut self, path: &str, expect: Expect) -> Result<Entry> {
        let mut cursor = PathCursor::new(path)?;
        let root = self.root_entry();
        if cursor.is_done() {
            expect.check(&root, path)?;
            return Ok(root);
        }
        self.resolve_in(root, &mut cursor, expect)
    }

    fn resolve_in(
        &mut self,
        dir: Entry,
        cursor: &mut PathCursor<'_>,
        expect: Expect,
    ) -> Result<Entry> {
        let Some(component) = cursor.next() else {
            return Ok(dir);
        };
        let directory = self.open_directory(&dir)?;
        let found = directory.search(component.name);
        directory.close();

        let entry = found.ok_or_else(|| FatError::PathNotFound(cursor.path().to_string()))?;
        if component.last {
            if component.wants_directory {
                Expect::Directory.check(&entry, cursor.path())?;
            }
            expect.check(&entry, cursor.path())?;
            return Ok(entry);
        }
        Expect::Directory.check(&entry, cursor.path())?;
        self.resolve_in(entry, cursor, expect)
    }

    pub fn open_file(&mut self, path: &str) -> Result<File> {
        let entry = self.resolve(path, Expect::File)?;
        File::open(self, &entry)
    }

    pub fn open_dir(&mut self, path: &str) -> Result<Directory> {
        let entry = self.resolve(path, Expect::Directory)?;
        Directory::open(self, &entry)
    }

    /// Whole contents of a file.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open_file(path)?;
        let mut data = vec![0u8; file.len() as usize];
        let n = file.read(self, 0, &mut data)?;
        data.truncate(n);
        file.close(self)?;
        Ok(data)
    }

    /// Stream a file to `writer` a cluster at a time. Returns the byte count.
    pub fn write_file_to(&mut self, path: &str, writer: &mut dyn Write) -> Result<u64> {
        let mut file = self.open_file(path)?;
        let mut buf = vec![0u8; self.volume.cluster_size];
        let mut offset = 0u64;
        while offset < file.len() {
            let n = file.read(self, offset, &mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            offset += n as u64;
        }
        file.close(self)?;
        Ok(offset)
    }

    /// Create an empty file in the directory at `dir_path`.
    ///
    /// Returns `Ok(None)` without touching the volume when the name is
    /// already taken.
    pub fn create_file(&mut self, dir_path: &str, name: &str) -> Result<Option<Entry>> {
        self.create_entry(dir_path, name, ATTR_ARCHIVE)
    }

    /// Create an empty subdirectory holding `.` and `..`.
    pub fn create_directory(&mut self, dir_path: &str, name: &str) -> Result<Option<Entry>> {
        self.create_entry(dir_path, name, ATTR_DIRECTORY)
    }

    fn create_entry(
        &mut self,
        dir_path: &str,
        name: &str,
        attributes: u8,
    ) -> Result<Option<Entry>> {
        let short = encode_short_name(name)?;
        let parent = self.resolve(dir_path, Expect::Directory)?;
        let directory = self.open_directory(&parent)?;
        let exists = directory.search(&decode_short_name(&short)).is_some();
        let parent = directory.entry().clone();
        directory.close();
        if exists {
            debug!("{name} already exists in {dir_path}");
            return Ok(None);
        }

        let slot = dir::find_free_slot(self, &parent)?;
        let cluster = self.alloc_zeroed_cluster()?;
        let entry = Entry::new(short, attributes, cluster).with_slot(slot);

        if attributes & ATTR_DIRECTORY != 0 {
            let up = if parent.start_cluster == self.volume.root_cluster {
                0
            } else {
                parent.start_cluster
            };
            let dot = Entry::new(*b".          ", ATTR_DIRECTORY, cluster);
            let dotdot = Entry::new(*b"..         ", ATTR_DIRECTORY, up);
            for (i, e) in [dot, dotdot].iter().enumerate() {
                let at = DirSlot {
                    dir_cluster: cluster,
                    offset: (i * entry::DIR_ENTRY_SIZE) as u32,
                };
                dir::write_slot(self, at, &e.encode())?;
            }
        }

        dir::write_slot(self, slot, &entry.encode())?;
        debug!("created {} in {dir_path} at cluster {cluster}", entry.name());
        Ok(Some(entry))
    }

    /// Remove a file: clear its directory slot and free its chain.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let entry = self.resolve(path, Expect::File)?;
        let slot = entry
            .slot()
            .ok_or_else(|| FatError::PathNotFound(path.to_string()))?;
        dir::write_slot(self, slot, &[0u8; entry::DIR_ENTRY_SIZE])?;
        if self.table.is_data_cluster(entry.start_cluster) {
            self.table
                .free_chain(&mut self.store, &mut self.info, entry.start_cluster)?;
        }
        debug!("deleted {path}");
        Ok(())
    }

    /// Push cached FAT sectors to the device. FSInfo is left for unmount.
    pub fn flush(&mut self) -> Result<()> {
        self.table.flush(&mut self.store)?;
        self.store.flush()
    }

    /// Flush the FAT cache, then write FSInfo, then flush the device, and
    /// hand the device back.
    pub fn unmount(mut self) -> Result<D> {
        self.table.flush(&mut self.store)?;
        self.info.write_back(&mut self.store)?;
        self.store.flush()?;
        debug!("unmounted");
        Ok(self.store.into_inner())
    }
}
