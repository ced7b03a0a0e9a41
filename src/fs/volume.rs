use std::fmt;
use std::io::{Cursor, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{FatError, Result};

const BOOT_SIGNATURE: u16 = 0xAA55;

/// Raw fields of the FAT32 BIOS Parameter Block.
#[derive(Debug, Clone, PartialEq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub total_sectors_16: u16,
    pub sectors_per_fat_16: u16,
    pub total_sectors_32: u32,
    pub sectors_per_fat: u32,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub volume_label: [u8; 11],
}

impl BiosParameterBlock {
    /// Parse the boot sector. Only the 0x55AA signature is checked here;
    /// geometry validation happens in [`Volume::from_bpb`].
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 512 {
            return Err(FatError::OutOfBounds {
                what: "boot sector length",
                address: sector.len() as u64,
                limit: 512,
            });
        }
        let signature = u16::from_le_bytes([sector[510], sector[511]]);
        if signature != BOOT_SIGNATURE {
            return Err(FatError::CorruptSignature {
                structure: "boot sector",
                expected: BOOT_SIGNATURE as u32,
                found: signature as u32,
            });
        }

        let mut r = Cursor::new(sector);
        r.seek(SeekFrom::Start(0x0B))?;
        let bytes_per_sector = r.read_u16::<LittleEndian>()?;
        let sectors_per_cluster = r.read_u8()?;
        let reserved_sectors = r.read_u16::<LittleEndian>()?;
        let fat_count = r.read_u8()?;
        r.seek(SeekFrom::Start(0x13))?;
        let total_sectors_16 = r.read_u16::<LittleEndian>()?;
        r.seek(SeekFrom::Start(0x16))?;
        let sectors_per_fat_16 = r.read_u16::<LittleEndian>()?;
        r.seek(SeekFrom::Start(0x20))?;
        let total_sectors_32 = r.read_u32::<LittleEndian>()?;
        let sectors_per_fat = r.read_u32::<LittleEndian>()?;
        r.seek(SeekFrom::Start(0x2C))?;
        let root_cluster = r.read_u32::<LittleEndian>()?;
        let fsinfo_sector = r.read_u16::<LittleEndian>()?;

        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&sector[0x47..0x52]);

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            fat_count,
            total_sectors_16,
            sectors_per_fat_16,
            total_sectors_32,
            sectors_per_fat,
            root_cluster,
            fsinfo_sector,
            volume_label,
        })
    }

    /// The 16-bit count when non-zero, else the 32-bit "large" count.
    pub fn total_sectors(&self) -> u64 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u64
        } else {
            self.total_sectors_32 as u64
        }
    }
}

/// Geometry of a mounted volume, fixed after mount.
#[derive(Debug, Clone)]
pub struct Volume {
    pub sector_size: usize,
    pub sectors_per_cluster: u32,
    pub cluster_size: usize,
    pub sector_count: u64,
    /// Number of data clusters; valid cluster numbers are `2..cluster_count + 2`.
    pub cluster_count: u32,
    pub fat_start: u64,
    pub fat_size: u32,
    pub fat_count: u8,
    pub data_start: u64,
    pub root_cluster: u32,
    pub fsinfo_sector: u64,
    pub label: Option<String>,
}

impl Volume {
    /// Derive the geometry, rejecting anything that is not a FAT32 layout
    /// with the expected sector size.
    pub fn from_bpb(bpb: &BiosParameterBlock, sector_size: usize) -> Result<Self> {
        if bpb.bytes_per_sector as usize != sector_size {
            return Err(FatError::Unsupported(format!(
                "volume uses {}-byte sectors, expected {sector_size}",
                bpb.bytes_per_sector
            )));
        }
        if bpb.sectors_per_cluster == 0 || !bpb.sectors_per_cluster.is_power_of_two() {
            return Err(FatError::Unsupported(format!(
                "invalid sectors per cluster: {}",
                bpb.sectors_per_cluster
            )));
        }
        if bpb.sectors_per_fat_16 != 0 || bpb.sectors_per_fat == 0 {
            return Err(FatError::Unsupported(
                "FAT12/16 layouts are not supported".into(),
            ));
        }
        if bpb.fat_count == 0 {
            return Err(FatError::Unsupported("volume has no FAT copies".into()));
        }

        let sector_count = bpb.total_sectors();
        let fat_start = bpb.reserved_sectors as u64;
        let data_start = fat_start + bpb.sectors_per_fat as u64 * bpb.fat_count as u64;
        if data_start >= sector_count {
            return Err(FatError::Unsupported(format!(
                "data region starts at sector {data_start} beyond the {sector_count}-sector volume"
            )));
        }
        let cluster_count =
            ((sector_count - data_start) / bpb.sectors_per_cluster as u64).min(0x0FFF_FFF5) as u32;

        if bpb.root_cluster < 2 || bpb.root_cluster >= cluster_count + 2 {
            return Err(FatError::OutOfBounds {
                what: "root cluster",
                address: bpb.root_cluster as u64,
                limit: cluster_count as u64 + 2,
            });
        }

        let label = String::from_utf8_lossy(&bpb.volume_label).trim().to_string();
        let label = if label.is_empty() || label == "NO NAME" {
            None
        } else {
            Some(label)
        };

        Ok(Self {
            sector_size,
            sectors_per_cluster: bpb.sectors_per_cluster as u32,
            cluster_size: bpb.sectors_per_cluster as usize * sector_size,
            sector_count,
            cluster_count,
            fat_start,
            fat_size: bpb.sectors_per_fat,
            fat_count: bpb.fat_count,
            data_start,
            root_cluster: bpb.root_cluster,
            fsinfo_sector: bpb.fsinfo_sector as u64,
            label,
        })
    }

    /// First LBA of a data cluster.
    pub fn cluster_lba(&self, cluster: u32) -> u64 {
        self.data_start + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "label:            {}", self.label.as_deref().unwrap_or("(none)"))?;
        writeln!(f, "sector size:      {}", self.sector_size)?;
        writeln!(
            f,
            "cluster size:     {} sectors ({} bytes)",
            self.sectors_per_cluster, self.cluster_size
        )?;
        writeln!(f, "sectors:          {}", self.sector_count)?;
        writeln!(f, "clusters:         {}", self.cluster_count)?;
        writeln!(
            f,
            "FAT:              {} copies x {} sectors at LBA {}",
            self.fat_count, self.fat_size, self.fat_start
        )?;
        writeln!(f, "data region:      LBA {}", self.data_start)?;
        write!(f, "root cluster:     {}", self.root_cluster)
    }
}
