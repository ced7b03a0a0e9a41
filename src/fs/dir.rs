use std::io::{Read, Seek, Write};

use log::debug;

use super::entry::{DirSlot, Entry, SlotKind, DIR_ENTRY_SIZE};
use super::file::File;
use super::FatFs;
use crate::error::{FatError, Result};

/// The decoded entries of one directory, in on-disk order.
///
/// The backing file is closed as soon as the scan finishes, so a
/// `Directory` is a snapshot: it does not see later changes.
#[derive(Debug, Clone)]
pub struct Directory {
    entry: Entry,
    entries: Vec<Entry>,
}

impl Directory {
    /// Scan every slot of `entry`'s chain, keeping short-name entries and
    /// skipping free, deleted, long-name and volume-label slots.
    pub fn open<D: Read + Write + Seek>(fs: &mut FatFs<D>, entry: &Entry) -> Result<Self> {
        if !entry.is_directory() {
            return Err(FatError::TypeMismatch {
                path: entry.name(),
                expected: "directory",
            });
        }
        let mut file = File::open(fs, entry)?;
        let dir_cluster = file.entry().start_cluster;

        let mut entries = Vec::new();
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        let mut offset = 0u64;
        while offset + DIR_ENTRY_SIZE as u64 <= file.len() {
            if file.read(fs, offset, &mut raw)? < DIR_ENTRY_SIZE {
                break;
            }
            if SlotKind::of(&raw) == SlotKind::Used {
                let slot = DirSlot {
                    dir_cluster,
                    offset: offset as u32,
                };
                entries.push(Entry::decode(&raw).with_slot(slot));
            }
            offset += DIR_ENTRY_SIZE as u64;
        }
        let entry = file.close(fs)?;
        Ok(Self { entry, entries })
    }

    /// The directory's own entry (the root pseudo-entry for `/`).
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Case-insensitive lookup by 8.3 display name. First match wins.
    pub fn search(&self, name: &str) -> Option<Entry> {
        self.entries
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Release the entry list.
    pub fn close(self) {}
}

/// Find a slot for a new entry in `dir`, appending a zeroed cluster to the
/// directory's chain when every slot is taken.
pub(crate) fn find_free_slot<D: Read + Write + Seek>(
    fs: &mut FatFs<D>,
    dir: &Entry,
) -> Result<DirSlot> {
    let mut file = File::open(fs, dir)?;
    let dir_cluster = file.entry().start_cluster;

    let mut raw = [0u8; DIR_ENTRY_SIZE];
    let mut offset = 0u64;
    let mut found = None;
    while offset + DIR_ENTRY_SIZE as u64 <= file.len() {
        if file.read(fs, offset, &mut raw)? < DIR_ENTRY_SIZE {
            break;
        }
        if SlotKind::of(&raw).is_reusable() {
            found = Some(offset);
            break;
        }
        offset += DIR_ENTRY_SIZE as u64;
    }

    let offset = match found {
        Some(offset) => offset,
        None => {
            let end = file.len();
            file.reserve(fs, end + DIR_ENTRY_SIZE as u64)?;
            debug!("directory at cluster {dir_cluster} extended to {} bytes", file.len());
            end
        }
    };
    file.close(fs)?;
    Ok(DirSlot {
        dir_cluster,
        offset: offset as u32,
    })
}

/// Overwrite one 32-byte directory record.
pub(crate) fn write_slot<D: Read + Write + Seek>(
    fs: &mut FatFs<D>,
    slot: DirSlot,
    raw: &[u8; DIR_ENTRY_SIZE],
) -> Result<()> {
    let dir = Entry::directory_at(slot.dir_cluster);
    let mut file = File::open(fs, &dir)?;
    file.write(fs, slot.offset as u64, raw)?;
    file.close(fs)?;
    Ok(())
}
