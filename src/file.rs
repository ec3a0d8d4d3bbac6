// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The one file on the volume, and the RAM that backs it.

use log::debug;

use crate::layout::{CLUSTER_SIZE, FIRST_DATA_CLUSTER};

/// Metadata of the single file the host can see.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActiveFile {
    /// Starting cluster, as last reported or assigned.
    pub cluster: u16,
    /// Size in bytes, never more than the RAM disk capacity.
    pub size: u32,
    /// Set when a host directory write moved or resized the file.
    pub dirty: bool,
}

impl ActiveFile {
    pub const fn new(size: u32) -> Self {
        Self {
            cluster: FIRST_DATA_CLUSTER,
            size,
            dirty: false,
        }
    }

    /// Applies what the host wrote into our directory slot. `size` must
    /// already be clamped.
    pub fn relocate(&mut self, cluster: u16, size: u32) {
        if cluster != self.cluster || size != self.size {
            debug!(
                "file moved: cluster {} -> {}, size {} -> {}",
                self.cluster, cluster, self.size, size,
            );
            self.dirty = true;
        }
        self.cluster = cluster;
        self.size = size;
    }

    /// Puts the file back at the first data cluster, where the RAM disk is
    /// always presented for reading.
    pub fn rehome(&mut self) {
        self.cluster = FIRST_DATA_CLUSTER;
    }
}

/// Fixed RAM buffer backing the file's data.
///
/// The FAT only ever chains the file through one cluster, and writes are
/// placed by their offset within a cluster, so `N` can't exceed
/// [`CLUSTER_SIZE`]. Larger disks fail to build.
pub struct RamDisk<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> RamDisk<N> {
    pub const CAPACITY: usize = {
        assert!(N <= CLUSTER_SIZE, "RAM disk larger than one cluster");
        N
    };

    pub const fn new() -> Self {
        let _capacity = Self::CAPACITY;
        Self { bytes: [0; N] }
    }

    /// Fills the disk from `contents`, truncating if needed. Returns how many
    /// bytes were kept.
    pub fn load(&mut self, contents: &[u8]) -> usize {
        let n = contents.len().min(Self::CAPACITY);
        self.bytes[..n].copy_from_slice(&contents[..n]);
        self.bytes[n..].fill(0);
        n
    }

    /// Copies from `offset` into `out`. Whatever falls past the end of the disk
    /// reads as zero.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        out.fill(0);
        if offset >= Self::CAPACITY {
            return;
        }
        let n = out.len().min(Self::CAPACITY - offset);
        out[..n].copy_from_slice(&self.bytes[offset..offset + n]);
    }

    /// Copies `data` in at `offset`. Whatever falls past the end of the disk is
    /// dropped. Returns the number of bytes stored.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> usize {
        if offset >= Self::CAPACITY {
            return 0;
        }
        let n = data.len().min(Self::CAPACITY - offset);
        self.bytes[offset..offset + n].copy_from_slice(&data[..n]);
        n
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<const N: usize> Default for RamDisk<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read handle over the file contents, shaped for a script engine's `open()`.
///
/// `read` hands back everything from the current position to the end of the
/// file in one go, then empty slices.
pub struct ScriptReader<'a> {
    contents: &'a [u8],
    pos: usize,
}

impl<'a> ScriptReader<'a> {
    pub fn new(contents: &'a [u8]) -> Self {
        Self { contents, pos: 0 }
    }

    pub fn read(&mut self) -> &'a [u8] {
        let rest = &self.contents[self.pos..];
        self.pos = self.contents.len();
        rest
    }

    /// Nothing to release; present so callers can treat this like a file.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_clips_reads_and_writes() {
        let mut ram = RamDisk::<8>::new();
        assert_eq!(ram.write(6, &[1, 2, 3, 4]), 2);
        assert_eq!(ram.write(8, &[9]), 0);
        assert_eq!(ram.write(usize::MAX, &[9]), 0);

        let mut out = [0xAA; 4];
        ram.read(6, &mut out);
        assert_eq!(out, [1, 2, 0, 0]);
        ram.read(100, &mut out);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn capacity_tops_out_at_one_cluster() {
        assert_eq!(RamDisk::<2048>::CAPACITY, 2048);
        assert_eq!(RamDisk::<CLUSTER_SIZE>::CAPACITY, 4096);

        let mut ram = RamDisk::<CLUSTER_SIZE>::new();
        assert_eq!(ram.write(CLUSTER_SIZE - 4, &[7; 8]), 4);
        let mut out = [0; 8];
        ram.read(CLUSTER_SIZE - 4, &mut out);
        assert_eq!(out, [7, 7, 7, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn load_truncates() {
        let mut ram = RamDisk::<4>::new();
        assert_eq!(ram.load(b"hello"), 4);
        assert_eq!(ram.as_bytes(), b"hell");
    }

    #[test]
    fn relocate_only_dirties_on_change() {
        let mut f = ActiveFile::new(10);
        f.relocate(2, 10);
        assert!(!f.dirty);
        f.relocate(5, 10);
        assert!(f.dirty);
        assert_eq!(f.cluster, 5);
        f.rehome();
        assert_eq!(f.cluster, 2);
        assert_eq!(f.size, 10);
    }

    #[test]
    fn reader_returns_rest_once() {
        let mut r = ScriptReader::new(b"print(1)\n");
        assert_eq!(r.read(), b"print(1)\n");
        assert_eq!(r.read(), b"");
        r.close();
    }
}
