// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual volume generator.
//!
//! Answers "what bytes are at offset X of sector S" for the synthetic FAT16
//! volume. Nothing is cached: the boot sector, FAT head and directory entry
//! are rebuilt for each chunk the host reads, and the data region is a window
//! onto the RAM disk.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, Unaligned, U16, U32};

use crate::config::DiskConfig;
use crate::file::{ActiveFile, RamDisk};
use crate::layout::{
    Region, FAT_COUNT, MEDIA_DESCRIPTOR, RESERVED_SECTORS, ROOT_ENTRIES, SECTORS_PER_CLUSTER,
    SECTORS_PER_FAT, SECTOR_SIZE, TOTAL_SECTORS,
};

/// Offset of the 0x55 0xAA boot signature.
const BOOT_SIGNATURE_OFFSET: usize = 510;

/// The first six bytes of each FAT copy: entry 0 carries the media byte,
/// entry 1 is reserved, entry 2 (our file) is end-of-chain. All other
/// clusters read as free.
pub const FAT_HEAD: [u8; 6] = [MEDIA_DESCRIPTOR, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Attribute byte for an ordinary file.
const ATTR_ARCHIVE: u8 = 0x20;
/// NT case flags: base name and extension stored upper, shown lower.
const NT_LOWERCASE_NAME_AND_EXT: u8 = 0x18;
/// 1980-01-01 / 00:01:02 in FAT packed format. The file never changes date.
const FAT_STAMP: u16 = 0x0021;
/// First name byte of a deleted directory slot.
pub const DELETED_ENTRY: u8 = 0xE5;

/// FAT16 boot sector up to and including the extended BPB. The rest of the
/// sector is zero apart from the trailing signature.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct BootSector {
    jump: [u8; 3],
    oem_name: [u8; 8],
    bytes_per_sector: U16<LittleEndian>,
    sectors_per_cluster: u8,
    reserved_sectors: U16<LittleEndian>,
    fat_count: u8,
    root_entries: U16<LittleEndian>,
    total_sectors_16: U16<LittleEndian>,
    media: u8,
    sectors_per_fat: U16<LittleEndian>,
    sectors_per_track: U16<LittleEndian>,
    heads: U16<LittleEndian>,
    hidden_sectors: U32<LittleEndian>,
    total_sectors_32: U32<LittleEndian>,
    drive_number: u8,
    reserved: u8,
    /// 0x29: the next three fields are valid.
    extended_signature: u8,
    serial: U32<LittleEndian>,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<BootSector>() == 62);

impl BootSector {
    pub fn new(config: &DiskConfig) -> Self {
        Self {
            // jmp short 0x3E; nop
            jump: [0xEB, 0x3C, 0x90],
            oem_name: config.oem_name,
            bytes_per_sector: U16::new(SECTOR_SIZE as u16),
            sectors_per_cluster: SECTORS_PER_CLUSTER as u8,
            reserved_sectors: U16::new(RESERVED_SECTORS as u16),
            fat_count: FAT_COUNT as u8,
            root_entries: U16::new(ROOT_ENTRIES as u16),
            total_sectors_16: U16::new(TOTAL_SECTORS as u16),
            media: MEDIA_DESCRIPTOR,
            sectors_per_fat: U16::new(SECTORS_PER_FAT as u16),
            sectors_per_track: U16::new(63),
            heads: U16::new(255),
            hidden_sectors: U32::new(0),
            total_sectors_32: U32::new(0),
            drive_number: 0x80,
            reserved: 0,
            extended_signature: 0x29,
            serial: U32::new(config.volume_serial),
            volume_label: config.volume_label,
            fs_type: *b"FAT16   ",
        }
    }
}

/// A 32-byte FAT directory entry.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, Unaligned)]
pub struct DirEntry {
    pub name: [u8; 11],
    pub attributes: u8,
    pub nt_flags: u8,
    pub create_time_tenths: u8,
    pub create_time: U16<LittleEndian>,
    pub create_date: U16<LittleEndian>,
    pub access_date: U16<LittleEndian>,
    /// Always zero on FAT16.
    pub cluster_high: U16<LittleEndian>,
    pub write_time: U16<LittleEndian>,
    pub write_date: U16<LittleEndian>,
    pub cluster: U16<LittleEndian>,
    pub size: U32<LittleEndian>,
}

const _: () = assert!(core::mem::size_of::<DirEntry>() == crate::layout::DIR_ENTRY_SIZE);

impl DirEntry {
    /// The entry describing `file` under `name`.
    pub fn for_file(name: [u8; 11], file: &ActiveFile) -> Self {
        Self {
            name,
            attributes: ATTR_ARCHIVE,
            nt_flags: NT_LOWERCASE_NAME_AND_EXT,
            create_time_tenths: 0,
            create_time: U16::new(0),
            create_date: U16::new(0),
            access_date: U16::new(0),
            cluster_high: U16::new(0),
            write_time: U16::new(FAT_STAMP),
            write_date: U16::new(FAT_STAMP),
            cluster: U16::new(file.cluster),
            size: U32::new(file.size),
        }
    }

    /// Whether this slot holds `name`, ignoring ASCII case. Deleted slots never
    /// match.
    pub fn is_named(&self, name: &[u8; 11]) -> bool {
        self.name[0] != DELETED_ENTRY && self.name.eq_ignore_ascii_case(name)
    }
}

/// Copies the part of `src` (which starts at sector offset `src_start`) that
/// overlaps the window `out` (which starts at sector offset `offset`).
fn overlay(out: &mut [u8], offset: usize, src: &[u8], src_start: usize) {
    let lo = offset.max(src_start);
    let hi = (offset + out.len()).min(src_start + src.len());
    if lo < hi {
        out[lo - offset..hi - offset].copy_from_slice(&src[lo - src_start..hi - src_start]);
    }
}

/// Fills `out` with the bytes of `sector` starting at `offset`.
///
/// `offset + out.len()` must not exceed [`SECTOR_SIZE`]; callers chunk
/// transfers so a request never spans sectors.
pub fn read<const N: usize>(
    config: &DiskConfig,
    file: &ActiveFile,
    ram: &RamDisk<N>,
    sector: u32,
    offset: usize,
    out: &mut [u8],
) {
    debug_assert!(offset + out.len() <= SECTOR_SIZE);
    out.fill(0);

    match Region::of(sector) {
        Region::Boot => {
            overlay(out, offset, BootSector::new(config).as_bytes(), 0);
            overlay(out, offset, &[0x55, 0xAA], BOOT_SIGNATURE_OFFSET);
        }
        Region::Fat { index: 0, .. } => {
            overlay(out, offset, &FAT_HEAD, 0);
        }
        Region::RootDir { index: 0 } => {
            let entry = DirEntry::for_file(config.file_name, file);
            overlay(out, offset, entry.as_bytes(), 0);
        }
        Region::Data { index } => {
            ram.read(index as usize * SECTOR_SIZE + offset, out);
        }
        Region::Fat { .. } | Region::RootDir { .. } | Region::Beyond => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DATA_START, FAT1_START, FAT2_START, ROOT_DIR_START};

    fn sector<const N: usize>(file: &ActiveFile, ram: &RamDisk<N>, s: u32) -> [u8; SECTOR_SIZE] {
        let mut buf = [0xAA; SECTOR_SIZE];
        for (i, chunk) in buf.chunks_mut(64).enumerate() {
            read(&DiskConfig::DEFAULT, file, ram, s, i * 64, chunk);
        }
        buf
    }

    #[test]
    fn boot_sector_bpb() {
        let ram = RamDisk::<2048>::new();
        let b = sector(&ActiveFile::new(0), &ram, 0);
        assert_eq!(&b[..3], &[0xEB, 0x3C, 0x90]);
        assert_eq!(&b[3..11], b"ghostfat");
        // bytes/sector, sectors/cluster, reserved, FATs, root entries
        assert_eq!(&b[11..19], &[0x00, 0x02, 0x08, 0x01, 0x00, 0x02, 0x00, 0x02]);
        // total sectors, media, sectors/FAT
        assert_eq!(&b[19..24], &[0x00, 0x40, 0xF8, 0x10, 0x00]);
        assert_eq!(b[38], 0x29);
        assert_eq!(&b[39..43], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&b[43..54], b"GHOSTDISK  ");
        assert_eq!(&b[54..62], b"FAT16   ");
        assert!(b[62..510].iter().all(|&x| x == 0));
        assert_eq!(&b[510..], &[0x55, 0xAA]);
    }

    #[test]
    fn fat_head_in_both_copies_only() {
        let ram = RamDisk::<2048>::new();
        let f = ActiveFile::new(0);
        for s in [FAT1_START, FAT2_START] {
            let b = sector(&f, &ram, s);
            assert_eq!(&b[..6], &FAT_HEAD);
            assert!(b[6..].iter().all(|&x| x == 0));
        }
        assert!(sector(&f, &ram, FAT1_START + 1).iter().all(|&x| x == 0));
    }

    #[test]
    fn fat_head_at_odd_offsets() {
        let ram = RamDisk::<2048>::new();
        let mut out = [0xAA; 4];
        read(&DiskConfig::DEFAULT, &ActiveFile::new(0), &ram, FAT2_START, 4, &mut out);
        assert_eq!(out, [0xFF, 0xFF, 0, 0]);
    }

    #[test]
    fn directory_entry_reflects_file() {
        let ram = RamDisk::<2048>::new();
        let mut f = ActiveFile::new(0x1234);
        f.cluster = 7;
        let b = sector(&f, &ram, ROOT_DIR_START);
        assert_eq!(&b[..11], b"MAIN    PY ");
        assert_eq!(b[11], 0x20);
        assert_eq!(&b[26..28], &[7, 0]);
        assert_eq!(&b[28..32], &[0x34, 0x12, 0, 0]);
        assert!(b[32..].iter().all(|&x| x == 0));
        assert!(sector(&f, &ram, ROOT_DIR_START + 1).iter().all(|&x| x == 0));
    }

    #[test]
    fn data_region_is_ram_window() {
        let mut ram = RamDisk::<1024>::new();
        ram.load(&[7; 1024]);
        let f = ActiveFile::new(1024);
        assert!(sector(&f, &ram, DATA_START + 1).iter().all(|&x| x == 7));
        // Past the end of RAM reads as zero, not out of bounds.
        assert!(sector(&f, &ram, DATA_START + 2).iter().all(|&x| x == 0));
        assert!(sector(&f, &ram, TOTAL_SECTORS + 5).iter().all(|&x| x == 0));
    }

    #[test]
    fn slot_name_match() {
        let f = ActiveFile::new(0);
        let mut e = DirEntry::for_file(*b"main    py ", &f);
        assert!(e.is_named(b"MAIN    PY "));
        assert!(!e.is_named(b"MAIN    TXT"));
        e.name[0] = DELETED_ENTRY;
        assert!(!e.is_named(b"\xE5AIN    PY "));
    }
}
