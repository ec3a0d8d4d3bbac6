// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry of the synthetic volume.
//!
//! The host sees an 8 MiB FAT16 disk laid out as
//!
//! ```text
//! sector 0        boot sector (BPB)
//! sectors 1..17   FAT #1
//! sectors 17..33  FAT #2
//! sectors 33..65  root directory (512 entries)
//! sectors 65..    data region, cluster 2 first
//! ```
//!
//! None of it exists in memory. These numbers are all the volume generator and
//! write filter need to decide what a given sector _would_ contain.

/// Bytes per sector. Also the SCSI logical block size.
pub const SECTOR_SIZE: usize = 512;
/// Sectors per allocation cluster (4 KiB clusters).
pub const SECTORS_PER_CLUSTER: u32 = 8;
/// Bytes per cluster.
pub const CLUSTER_SIZE: usize = SECTORS_PER_CLUSTER as usize * SECTOR_SIZE;
/// Sectors before the first FAT; just the boot sector.
pub const RESERVED_SECTORS: u32 = 1;
/// Number of FAT copies.
pub const FAT_COUNT: u32 = 2;
/// Size of each FAT copy, in sectors.
pub const SECTORS_PER_FAT: u32 = 16;
/// Root directory capacity, in 32-byte entries.
pub const ROOT_ENTRIES: u32 = 512;
/// Size of one directory entry.
pub const DIR_ENTRY_SIZE: usize = 32;
/// Total sectors on the volume (8 MiB).
pub const TOTAL_SECTORS: u32 = 0x4000;
/// Media descriptor byte: fixed disk. Also the low byte of FAT entry 0.
pub const MEDIA_DESCRIPTOR: u8 = 0xF8;
/// First cluster number that maps to the data region.
pub const FIRST_DATA_CLUSTER: u16 = 2;

pub const FAT1_START: u32 = RESERVED_SECTORS;
pub const FAT2_START: u32 = FAT1_START + SECTORS_PER_FAT;
pub const ROOT_DIR_START: u32 = FAT1_START + FAT_COUNT * SECTORS_PER_FAT;
pub const ROOT_DIR_SECTORS: u32 = ROOT_ENTRIES * DIR_ENTRY_SIZE as u32 / SECTOR_SIZE as u32;
pub const DATA_START: u32 = ROOT_DIR_START + ROOT_DIR_SECTORS;

const _: () = {
    assert!(FAT1_START == 1);
    assert!(FAT2_START == 17);
    assert!(ROOT_DIR_START == 33);
    assert!(DATA_START == 65);
    assert!(DATA_START == ROOT_DIR_START + ROOT_DIR_SECTORS);
    assert!(DATA_START < TOTAL_SECTORS);
    assert!(CLUSTER_SIZE == 4096);
};

/// Which part of the volume a sector belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Region {
    Boot,
    /// A FAT sector. `copy` is 0 or 1, `index` is the sector within that copy.
    Fat { copy: u32, index: u32 },
    /// `index` is the sector within the root directory.
    RootDir { index: u32 },
    /// `index` is the sector within the data region.
    Data { index: u32 },
    /// Past the last sector we advertise.
    Beyond,
}

impl Region {
    pub const fn of(sector: u32) -> Self {
        if sector < FAT1_START {
            Region::Boot
        } else if sector < ROOT_DIR_START {
            let rel = sector - FAT1_START;
            Region::Fat {
                copy: rel / SECTORS_PER_FAT,
                index: rel % SECTORS_PER_FAT,
            }
        } else if sector < DATA_START {
            Region::RootDir { index: sector - ROOT_DIR_START }
        } else if sector < TOTAL_SECTORS {
            Region::Data { index: sector - DATA_START }
        } else {
            Region::Beyond
        }
    }
}

/// Cluster number holding the given data-region sector.
pub const fn cluster_of(data_index: u32) -> u32 {
    FIRST_DATA_CLUSTER as u32 + data_index / SECTORS_PER_CLUSTER
}

/// Byte offset of the given data-region sector within its own cluster.
pub const fn offset_in_cluster(data_index: u32) -> usize {
    (data_index % SECTORS_PER_CLUSTER) as usize * SECTOR_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_ordered_and_contiguous() {
        assert_eq!(Region::of(0), Region::Boot);
        assert_eq!(Region::of(1), Region::Fat { copy: 0, index: 0 });
        assert_eq!(Region::of(16), Region::Fat { copy: 0, index: 15 });
        assert_eq!(Region::of(17), Region::Fat { copy: 1, index: 0 });
        assert_eq!(Region::of(32), Region::Fat { copy: 1, index: 15 });
        assert_eq!(Region::of(33), Region::RootDir { index: 0 });
        assert_eq!(Region::of(64), Region::RootDir { index: 31 });
        assert_eq!(Region::of(65), Region::Data { index: 0 });
        assert_eq!(Region::of(TOTAL_SECTORS - 1), Region::Data { index: TOTAL_SECTORS - 1 - 65 });
        assert_eq!(Region::of(TOTAL_SECTORS), Region::Beyond);
    }

    #[test]
    fn clusters_are_eight_sectors() {
        assert_eq!(cluster_of(0), 2);
        assert_eq!(cluster_of(7), 2);
        assert_eq!(cluster_of(8), 3);
        assert_eq!(offset_in_cluster(9), 512);
        assert_eq!(offset_in_cluster(16), 0);
    }
}
