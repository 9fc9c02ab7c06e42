use crate::storage::*;
use log::debug;
use thiserror::Error;

pub const DIR_ENTRY_SIZE: u32 = 32;

const BOOT_SIGNATURE: u16 = 0xAA55;
const PARTITION0_LBA: usize = 446 + 8;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_VOLUME: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;

/// Entries below this are free/reserved, above `LAST_CLUSTER` bad or end of chain.
pub const FIRST_CLUSTER: u16 = 0x0002;
pub const LAST_CLUSTER: u16 = 0xFFF6;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FatError {
    #[error("storage: {0}")]
    Read(#[from] StorageError),
    #[error("missing boot signature")]
    BadSignature,
    #[error("no FAT16 file system found")]
    NoFat,
    #[error("unsupported sector size {0}")]
    BlockSize(u16),
}

fn le16(buf: &[u8], at: usize) -> u16 {
    return u16::from_le_bytes([buf[at], buf[at + 1]]);
}

fn le32(buf: &[u8], at: usize) -> u32 {
    return u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
}

pub fn is_chain_link(cluster: u16) -> bool {
    return (FIRST_CLUSTER..=LAST_CLUSTER).contains(&cluster);
}

/// The bits of a directory entry the drive cares about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attribute: u8,
    pub first_cluster: u16,
    pub size: u32,
}

impl DirEntry {
    pub fn parse(raw: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        return DirEntry {
            name,
            attribute: raw[11],
            first_cluster: le16(raw, 26),
            size: le32(raw, 28),
        };
    }

    pub fn is_file(&self) -> bool {
        return self.attribute & (ATTR_VOLUME | ATTR_DIRECTORY) == 0;
    }

    pub fn is_read_only(&self) -> bool {
        return self.attribute & ATTR_READ_ONLY != 0;
    }
}

/**
Layout of a mounted FAT16 volume, all in 512 byte blocks. Holds no
 reference to the card; every lookup borrows the storage it needs.
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FatVolume {
    pub fat_start: u32,
    pub root_start: u32,
    pub data_start: u32,
    pub sectors_per_cluster_log2: u8,
    pub root_entries: u16,
}

impl FatVolume {
    /// Look for a FAT16 boot sector at block 0, or behind the first
    /// MBR partition.
    pub fn mount<S: BlockStorage>(storage: &mut S) -> Result<Self, FatError> {
        let mut block = [0u8; BLOCK_SIZE];

        storage.read_block(0, &mut block)?;
        if le16(&block, 510) != BOOT_SIGNATURE {
            return Err(FatError::BadSignature);
        }

        let mut boot = 0;
        if !Self::is_fat16(&block) {
            // Partitioned card
            boot = le32(&block, PARTITION0_LBA);
            storage.read_block(boot, &mut block)?;
            if le16(&block, 510) != BOOT_SIGNATURE || !Self::is_fat16(&block) {
                return Err(FatError::NoFat);
            }
        }

        return Self::from_boot_sector(boot, &block);
    }

    fn is_fat16(boot: &Block) -> bool {
        return &boot[54..56] == b"FA";
    }

    fn from_boot_sector(boot: u32, block: &Block) -> Result<Self, FatError> {
        let bytes_per_sector = le16(block, 11);
        if bytes_per_sector as usize != BLOCK_SIZE {
            return Err(FatError::BlockSize(bytes_per_sector));
        }

        let sectors_per_cluster = block[13];
        if !sectors_per_cluster.is_power_of_two() {
            return Err(FatError::NoFat);
        }

        let reserved = le16(block, 14) as u32;
        let num_fats = block[16] as u32;
        let root_entries = le16(block, 17);
        let fat_size = le16(block, 22) as u32;

        let fat_start = boot + reserved;
        let root_start = fat_start + fat_size * num_fats;
        let root_blocks = (root_entries as u32 * DIR_ENTRY_SIZE).div_ceil(BLOCK_SIZE as u32);

        let volume = FatVolume {
            fat_start,
            root_start,
            data_start: root_start + root_blocks,
            sectors_per_cluster_log2: sectors_per_cluster.trailing_zeros() as u8,
            root_entries,
        };

        debug!(
            "fat16: fat {} root {} data {} spc {}",
            volume.fat_start, volume.root_start, volume.data_start, sectors_per_cluster
        );

        return Ok(volume);
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        return 1 << self.sectors_per_cluster_log2;
    }

    /// First block of a data cluster.
    pub fn cluster_block(&self, cluster: u16) -> u32 {
        return self.data_start + ((cluster as u32 - FIRST_CLUSTER as u32) << self.sectors_per_cluster_log2);
    }

    /// Entry `index` of the root directory.
    pub fn root_entry<S: BlockStorage>(&self, storage: &mut S, index: u16) -> Result<DirEntry, StorageError> {
        let mut raw = [0u8; DIR_ENTRY_SIZE as usize];
        let offset = self.root_start * BLOCK_SIZE as u32 + index as u32 * DIR_ENTRY_SIZE;
        storage.read_offset(offset, &mut raw)?;
        return Ok(DirEntry::parse(&raw));
    }

    /**
    First live file in the root directory with extension `ext`. The
     scan stops at the end-of-directory marker.
    */
    pub fn find_file<S: BlockStorage>(&self, storage: &mut S, ext: &[u8; 3]) -> Result<Option<u16>, StorageError> {
        for index in 0..self.root_entries {
            let entry = self.root_entry(storage, index)?;
            match entry.name[0] {
                0x00 => break,
                0xE5 => continue,
                _ => {}
            }
            if entry.is_file() && &entry.name[8..11] == ext {
                return Ok(Some(index));
            }
        }
        return Ok(None);
    }

    /// FAT entry for `cluster`: the next link, or a marker.
    pub fn next_cluster<S: BlockStorage>(&self, storage: &mut S, cluster: u16) -> Result<u16, StorageError> {
        let mut raw = [0u8; 2];
        let offset = self.fat_start * BLOCK_SIZE as u32 + cluster as u32 * 2;
        storage.read_offset(offset, &mut raw)?;
        return Ok(u16::from_le_bytes(raw));
    }
}
