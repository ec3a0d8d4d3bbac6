// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ghost filesystem write filter.
//!
//! There is no FAT or directory to update, so host writes are not stored.
//! Instead we watch them: directory writes tell us where the host put our
//! file and how big it is now, and data writes are let through to the RAM
//! disk only when they land at or after the file's starting cluster. Boot
//! sector and FAT writes are accepted and thrown away.
//!
//! The cluster test assumes the host lays the file out as one chain that
//! starts at the cluster named in its directory entry. Writes the host makes
//! to lower clusters (journal or metadata scratch on some drivers) get
//! dropped; writes to higher clusters are assumed to be ours.

use log::{debug, trace, warn};
use zerocopy::LayoutVerified;

use crate::file::{ActiveFile, RamDisk};
use crate::layout::{cluster_of, offset_in_cluster, Region, DIR_ENTRY_SIZE};
use crate::volume::DirEntry;

/// What became of a chunk of written data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored in the RAM disk (possibly clipped at its end).
    Stored,
    /// A directory write that was scanned for our file.
    Snooped,
    /// Accepted and thrown away.
    Discarded,
}

/// Routes `data`, which the host is writing at byte `offset` of `sector`.
pub fn write<const N: usize>(
    file_name: &[u8; 11],
    file: &mut ActiveFile,
    ram: &mut RamDisk<N>,
    sector: u32,
    offset: usize,
    data: &[u8],
) -> WriteOutcome {
    match Region::of(sector) {
        Region::RootDir { .. } => {
            snoop_directory(file_name, file, RamDisk::<N>::CAPACITY, data);
            WriteOutcome::Snooped
        }
        Region::Data { index } => {
            let cluster = cluster_of(index);
            if cluster < u32::from(file.cluster) {
                trace!("drop write to cluster {} (file at {})", cluster, file.cluster);
                return WriteOutcome::Discarded;
            }
            let at = offset_in_cluster(index) + offset;
            let stored = ram.write(at, data);
            if stored < data.len() {
                warn!(
                    "write past RAM disk end: {} of {} bytes at {} kept",
                    stored,
                    data.len(),
                    at,
                );
            }
            WriteOutcome::Stored
        }
        Region::Boot | Region::Fat { .. } | Region::Beyond => WriteOutcome::Discarded,
    }
}

/// Looks through whole directory slots in `data` for `file_name`, and
/// takes its cluster and size from the last one found.
fn snoop_directory(file_name: &[u8; 11], file: &mut ActiveFile, capacity: usize, data: &[u8]) {
    for slot in data.chunks_exact(DIR_ENTRY_SIZE) {
        let entry = match LayoutVerified::<_, DirEntry>::new(slot) {
            Some(e) => e,
            None => continue,
        };
        if !entry.is_named(file_name) {
            continue;
        }
        let cluster = entry.cluster.get();
        if cluster == 0 {
            // Delete-then-recreate or truncate in progress. The real entry
            // arrives in a later write.
            debug!("ignoring zero-cluster entry for tracked file");
            continue;
        }
        let size = entry.size.get().min(capacity as u32);
        file.relocate(cluster, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DATA_START, FAT1_START, ROOT_DIR_START, SECTORS_PER_CLUSTER};
    use zerocopy::AsBytes;

    const NAME: &[u8; 11] = b"MAIN    PY ";

    fn slot(name: &[u8; 11], cluster: u16, size: u32) -> [u8; 32] {
        let mut f = ActiveFile::new(size);
        f.cluster = cluster;
        let mut s = [0; 32];
        s.copy_from_slice(DirEntry::for_file(*name, &f).as_bytes());
        s
    }

    #[test]
    fn directory_write_moves_file() {
        let mut file = ActiveFile::new(10);
        let mut ram = RamDisk::<2048>::new();
        let mut packet = [0; 64];
        packet[..32].copy_from_slice(&slot(b"OTHER   TXT", 9, 1));
        packet[32..].copy_from_slice(&slot(NAME, 6, 100));

        let r = write(NAME, &mut file, &mut ram, ROOT_DIR_START + 3, 64, &packet);
        assert_eq!(r, WriteOutcome::Snooped);
        assert_eq!(file.cluster, 6);
        assert_eq!(file.size, 100);
        assert!(file.dirty);
        // Nothing lands in RAM.
        assert!(ram.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_cluster_is_ignored() {
        let mut file = ActiveFile::new(10);
        let mut ram = RamDisk::<2048>::new();
        write(NAME, &mut file, &mut ram, ROOT_DIR_START, 0, &slot(NAME, 0, 0));
        assert_eq!(file, ActiveFile::new(10));
    }

    #[test]
    fn size_is_clamped_to_capacity() {
        let mut file = ActiveFile::new(10);
        let mut ram = RamDisk::<2048>::new();
        write(NAME, &mut file, &mut ram, ROOT_DIR_START, 0, &slot(NAME, 3, 1_000_000));
        assert_eq!(file.cluster, 3);
        assert_eq!(file.size, 2048);
    }

    #[test]
    fn lowercase_name_matches() {
        let mut file = ActiveFile::new(10);
        let mut ram = RamDisk::<2048>::new();
        write(NAME, &mut file, &mut ram, ROOT_DIR_START, 0, &slot(b"main    py ", 4, 20));
        assert_eq!(file.cluster, 4);
    }

    #[test]
    fn data_write_filtered_by_cluster() {
        let mut file = ActiveFile::new(0);
        file.cluster = 3;
        let mut ram = RamDisk::<2048>::new();

        // Cluster 2: before the file, dropped.
        let r = write(NAME, &mut file, &mut ram, DATA_START, 0, &[1; 64]);
        assert_eq!(r, WriteOutcome::Discarded);
        assert!(ram.as_bytes().iter().all(|&b| b == 0));

        // Cluster 3, second sector: lands 512 bytes into RAM.
        let s = DATA_START + SECTORS_PER_CLUSTER + 1;
        let r = write(NAME, &mut file, &mut ram, s, 64, &[2; 64]);
        assert_eq!(r, WriteOutcome::Stored);
        assert_eq!(&ram.as_bytes()[512 + 64..512 + 128], &[2; 64]);
    }

    #[test]
    fn data_write_past_ram_is_clipped() {
        let mut file = ActiveFile::new(0);
        let mut ram = RamDisk::<100>::new();
        write(NAME, &mut file, &mut ram, DATA_START, 64, &[5; 64]);
        assert_eq!(&ram.as_bytes()[64..], &[5; 36]);
        write(NAME, &mut file, &mut ram, DATA_START + 4, 0, &[6; 64]);
        assert!(ram.as_bytes()[..64].iter().all(|&b| b == 0));
    }

    #[test]
    fn fat_and_boot_writes_discarded() {
        let mut file = ActiveFile::new(0);
        let mut ram = RamDisk::<2048>::new();
        assert_eq!(write(NAME, &mut file, &mut ram, 0, 0, &[9; 64]), WriteOutcome::Discarded);
        assert_eq!(
            write(NAME, &mut file, &mut ram, FAT1_START, 0, &[9; 64]),
            WriteOutcome::Discarded
        );
        assert!(ram.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(file, ActiveFile::new(0));
    }
}
