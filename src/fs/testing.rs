//! Miniature FAT32 image for unit tests.
//!
//! 126 sectors of 512 bytes: boot sector, FSInfo at sector 1, four reserved
//! sectors, two one-sector FAT copies at LBA 4 and 5, and 60 two-sector
//! clusters from LBA 6. The root directory is cluster 2.

use std::io::Cursor;

use super::entry::{ATTR_ARCHIVE, ATTR_DIRECTORY};
use super::{FatFs, MountOptions};

pub const SECTOR: usize = 512;
pub const CLUSTER: usize = 1024;
const TOTAL_SECTORS: usize = 126;
const FAT_LBA: usize = 4;
const DATA_LBA: usize = 6;
pub const EOC: u32 = 0x0FFF_FFFF;

pub struct TestImage {
    data: Vec<u8>,
}

impl TestImage {
    pub fn new() -> Self {
        let mut img = Self {
            data: vec![0u8; TOTAL_SECTORS * SECTOR],
        };
        img.patch(0, &[0xEB, 0x58, 0x90]);
        img.patch(3, b"FATDRIVE");
        img.patch(0x0B, &512u16.to_le_bytes());
        img.patch(0x0D, &[2]);
        img.patch(0x0E, &4u16.to_le_bytes());
        img.patch(0x10, &[2]);
        img.patch(0x13, &(TOTAL_SECTORS as u16).to_le_bytes());
        img.patch(0x15, &[0xF8]);
        img.patch(0x24, &1u32.to_le_bytes());
        img.patch(0x2C, &2u32.to_le_bytes());
        img.patch(0x30, &1u16.to_le_bytes());
        img.patch(0x47, b"FATDRIVE   ");
        img.patch(0x52, b"FAT32   ");
        img.patch(510, &[0x55, 0xAA]);

        img.patch(SECTOR, &0x4161_5252u32.to_le_bytes());
        img.patch(SECTOR + 0x1E4, &0x6141_7272u32.to_le_bytes());
        img.patch(SECTOR + 0x1FC, &0xAA55_0000u32.to_le_bytes());
        img.set_fsinfo(59, 3);

        img.set_fat(0, 0x0FFF_FFF8);
        img.set_fat(1, EOC);
        img.set_fat(2, EOC);
        img
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_fsinfo(&mut self, free: u32, next: u32) {
        self.patch(SECTOR + 0x1E8, &free.to_le_bytes());
        self.patch(SECTOR + 0x1EC, &next.to_le_bytes());
    }

    pub fn fsinfo(&self) -> (u32, u32) {
        (self.u32_at(SECTOR + 0x1E8), self.u32_at(SECTOR + 0x1EC))
    }

    /// Set a FAT link in both copies.
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..2 {
            self.patch(
                (FAT_LBA + copy) * SECTOR + cluster as usize * 4,
                &value.to_le_bytes(),
            );
        }
    }

    pub fn fat(&self, copy: usize, cluster: u32) -> u32 {
        self.u32_at((FAT_LBA + copy) * SECTOR + cluster as usize * 4)
    }

    /// Link `clusters` into one chain terminated by EOC.
    pub fn chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat(last, EOC);
        }
    }

    pub fn cluster_offset(cluster: u32) -> usize {
        DATA_LBA * SECTOR + (cluster as usize - 2) * CLUSTER
    }

    pub fn cluster(&self, cluster: u32) -> &[u8] {
        let off = Self::cluster_offset(cluster);
        &self.data[off..off + CLUSTER]
    }

    /// Fill a chain's clusters with `data`, spilling into each in turn.
    pub fn write_chain(&mut self, clusters: &[u32], data: &[u8]) {
        for (chunk, &cluster) in data.chunks(CLUSTER).zip(clusters) {
            self.patch(Self::cluster_offset(cluster), chunk);
        }
    }

    /// Write a raw short-name entry into slot `slot` of a directory cluster.
    pub fn put_entry(
        &mut self,
        dir_cluster: u32,
        slot: usize,
        name: &[u8; 11],
        attr: u8,
        start: u32,
        size: u32,
    ) {
        let off = Self::cluster_offset(dir_cluster) + slot * 32;
        let mut raw = [0u8; 32];
        raw[..11].copy_from_slice(name);
        raw[11] = attr;
        raw[20..22].copy_from_slice(&((start >> 16) as u16).to_le_bytes());
        raw[26..28].copy_from_slice(&(start as u16).to_le_bytes());
        raw[28..32].copy_from_slice(&size.to_le_bytes());
        self.patch(off, &raw);
    }

    /// Add a file with contents, occupying the given clusters.
    pub fn add_file(
        &mut self,
        dir_cluster: u32,
        slot: usize,
        name: &[u8; 11],
        clusters: &[u32],
        data: &[u8],
    ) {
        self.chain(clusters);
        self.write_chain(clusters, data);
        self.put_entry(dir_cluster, slot, name, ATTR_ARCHIVE, clusters[0], data.len() as u32);
    }

    /// Add an empty subdirectory with dot entries at `cluster`.
    pub fn add_dir(&mut self, parent: u32, slot: usize, name: &[u8; 11], cluster: u32) {
        self.chain(&[cluster]);
        self.put_entry(parent, slot, name, ATTR_DIRECTORY, cluster, 0);
        self.put_entry(cluster, 0, b".          ", ATTR_DIRECTORY, cluster, 0);
        let dotdot = if parent == 2 { 0 } else { parent };
        self.put_entry(cluster, 1, b"..         ", ATTR_DIRECTORY, dotdot, 0);
    }

    pub fn mount(self) -> FatFs<Cursor<Vec<u8>>> {
        FatFs::mount(Cursor::new(self.data)).unwrap()
    }

    pub fn mount_with(self, options: MountOptions) -> FatFs<Cursor<Vec<u8>>> {
        FatFs::mount_with(Cursor::new(self.data), options).unwrap()
    }

    pub fn from_cursor(cursor: Cursor<Vec<u8>>) -> Self {
        Self {
            data: cursor.into_inner(),
        }
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }
}
