// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of SCSI we speak, and the canned answers we give.
//!
//! Everything inside a CDB, and in the READ CAPACITY response, is big-endian.
//! (This is the opposite of the BOT wrapper around it.)

use byteorder::BigEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16, U32};

use crate::bot::MAX_CDB_SIZE;
use crate::config::DiskConfig;
use crate::layout::{SECTOR_SIZE, TOTAL_SECTORS};

/// Operation codes we recognize. Decoded with `ScsiOpcode::from_u8`, which
/// gives `None` for everything else.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    PreventAllowMediumRemoval = 0x1E,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    ModeSense10 = 0x5A,
}

/// A decoded command block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScsiCommand {
    TestUnitReady,
    PreventAllowMediumRemoval,
    RequestSense,
    Inquiry,
    ReadCapacity10,
    ModeSense6,
    ModeSense10,
    Read10 { lba: u32, blocks: u16 },
    Write10 { lba: u32, blocks: u16 },
    Unknown { opcode: u8 },
}

/// What happens between the CBW and the CSW.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataPhase {
    /// Nothing; straight to status.
    None,
    /// A single canned response of at most this many bytes.
    Fixed(usize),
    /// Sector data streamed from the volume generator.
    Stream,
    /// Sector data from the host.
    Receive,
}

/// Common shape of READ(10) and WRITE(10).
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
struct ReadWrite10 {
    opcode: u8,
    flags: u8,
    lba: U32<BigEndian>,
    group: u8,
    blocks: U16<BigEndian>,
    control: u8,
}

impl ScsiCommand {
    pub fn parse(cdb: &[u8; MAX_CDB_SIZE]) -> Self {
        let opcode = cdb[0];
        match ScsiOpcode::from_u8(opcode) {
            Some(ScsiOpcode::TestUnitReady) => Self::TestUnitReady,
            Some(ScsiOpcode::PreventAllowMediumRemoval) => Self::PreventAllowMediumRemoval,
            Some(ScsiOpcode::RequestSense) => Self::RequestSense,
            Some(ScsiOpcode::Inquiry) => Self::Inquiry,
            Some(ScsiOpcode::ReadCapacity10) => Self::ReadCapacity10,
            Some(ScsiOpcode::ModeSense6) => Self::ModeSense6,
            Some(ScsiOpcode::ModeSense10) => Self::ModeSense10,
            Some(op @ (ScsiOpcode::Read10 | ScsiOpcode::Write10)) => {
                // 16 bytes in hand, 10 needed, so the prefix always exists.
                let (rw, _) = match LayoutVerified::<_, ReadWrite10>::new_from_prefix(&cdb[..]) {
                    Some(x) => x,
                    None => return Self::Unknown { opcode },
                };
                let lba = rw.lba.get();
                let blocks = rw.blocks.get();
                if op == ScsiOpcode::Read10 {
                    Self::Read10 { lba, blocks }
                } else {
                    Self::Write10 { lba, blocks }
                }
            }
            None => Self::Unknown { opcode },
        }
    }

    pub fn data_phase(&self) -> DataPhase {
        match self {
            Self::RequestSense => DataPhase::Fixed(core::mem::size_of::<SenseData>()),
            Self::Inquiry => DataPhase::Fixed(core::mem::size_of::<InquiryData>()),
            Self::ReadCapacity10 => DataPhase::Fixed(core::mem::size_of::<Capacity10>()),
            Self::ModeSense6 => DataPhase::Fixed(core::mem::size_of::<ModeHeader6>()),
            Self::ModeSense10 => DataPhase::Fixed(core::mem::size_of::<ModeHeader10>()),
            Self::Read10 { .. } => DataPhase::Stream,
            Self::Write10 { .. } => DataPhase::Receive,
            Self::TestUnitReady | Self::PreventAllowMediumRemoval | Self::Unknown { .. } => {
                DataPhase::None
            }
        }
    }

    /// Writes the canned response for a `DataPhase::Fixed` command into `out`
    /// and returns its length. Other commands produce nothing.
    pub fn fixed_response(&self, config: &DiskConfig, out: &mut [u8]) -> usize {
        match self {
            Self::Inquiry => put(out, InquiryData::new(config).as_bytes()),
            Self::RequestSense => put(out, SenseData::NO_SENSE.as_bytes()),
            Self::ReadCapacity10 => put(out, Capacity10::VOLUME.as_bytes()),
            Self::ModeSense6 => put(out, ModeHeader6::WRITABLE.as_bytes()),
            Self::ModeSense10 => put(out, ModeHeader10::WRITABLE.as_bytes()),
            _ => 0,
        }
    }
}

fn put(out: &mut [u8], bytes: &[u8]) -> usize {
    out[..bytes.len()].copy_from_slice(bytes);
    bytes.len()
}

/// Standard INQUIRY data, 36 bytes.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct InquiryData {
    /// Peripheral qualifier and device type; 0 is a direct-access block device.
    peripheral: u8,
    /// Bit 7: removable medium.
    removable: u8,
    version: u8,
    response_format: u8,
    /// Bytes following this field.
    additional_length: u8,
    flags: [u8; 3],
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
}

const _: () = assert!(core::mem::size_of::<InquiryData>() == 36);

impl InquiryData {
    fn new(config: &DiskConfig) -> Self {
        Self {
            peripheral: 0x00,
            removable: 0x80,
            version: 0x02,
            response_format: 0x02,
            additional_length: 36 - 4,
            flags: [0; 3],
            vendor: config.vendor,
            product: config.product,
            revision: config.revision,
        }
    }
}

/// Fixed-format sense data, 18 bytes.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct SenseData {
    response_code: u8,
    obsolete: u8,
    sense_key: u8,
    information: [u8; 4],
    additional_length: u8,
    command_specific: [u8; 4],
    asc: u8,
    ascq: u8,
    fru: u8,
    key_specific: [u8; 3],
}

const _: () = assert!(core::mem::size_of::<SenseData>() == 18);

impl SenseData {
    /// Current error, fixed format, sense key NO SENSE. We never have anything
    /// else to report.
    const NO_SENSE: Self = Self {
        response_code: 0x70,
        obsolete: 0,
        sense_key: 0x00,
        information: [0; 4],
        additional_length: 10,
        command_specific: [0; 4],
        asc: 0,
        ascq: 0,
        fru: 0,
        key_specific: [0; 3],
    };
}

/// READ CAPACITY(10) data: last LBA and block size, big-endian.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct Capacity10 {
    last_lba: U32<BigEndian>,
    block_size: U32<BigEndian>,
}

impl Capacity10 {
    const VOLUME: Self = Self {
        last_lba: U32::from_bytes((TOTAL_SECTORS - 1).to_be_bytes()),
        block_size: U32::from_bytes((SECTOR_SIZE as u32).to_be_bytes()),
    };
}

/// MODE SENSE(6) parameter header with no mode pages or block descriptors.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct ModeHeader6 {
    /// Bytes following this field.
    mode_data_length: u8,
    medium_type: u8,
    /// Bit 7 would be write-protect.
    device_specific: u8,
    block_descriptor_length: u8,
}

impl ModeHeader6 {
    const WRITABLE: Self = Self {
        mode_data_length: 3,
        medium_type: 0,
        device_specific: 0,
        block_descriptor_length: 0,
    };
}

/// MODE SENSE(10) parameter header with no mode pages or block descriptors.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned)]
pub struct ModeHeader10 {
    mode_data_length: U16<BigEndian>,
    medium_type: u8,
    device_specific: u8,
    reserved: [u8; 2],
    block_descriptor_length: U16<BigEndian>,
}

impl ModeHeader10 {
    const WRITABLE: Self = Self {
        mode_data_length: U16::from_bytes(6u16.to_be_bytes()),
        medium_type: 0,
        device_specific: 0,
        reserved: [0; 2],
        block_descriptor_length: U16::from_bytes([0, 0]),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cdb(bytes: &[u8]) -> [u8; MAX_CDB_SIZE] {
        let mut c = [0; MAX_CDB_SIZE];
        c[..bytes.len()].copy_from_slice(bytes);
        c
    }

    #[test]
    fn read10_fields_are_big_endian() {
        let c = cdb(&[0x28, 0, 0x00, 0x00, 0x01, 0x02, 0, 0x00, 0x03, 0]);
        assert_eq!(ScsiCommand::parse(&c), ScsiCommand::Read10 { lba: 0x0102, blocks: 3 });
        let c = cdb(&[0x2A, 0, 0x12, 0x34, 0x56, 0x78, 0, 0x01, 0x00, 0]);
        assert_eq!(
            ScsiCommand::parse(&c),
            ScsiCommand::Write10 { lba: 0x1234_5678, blocks: 256 }
        );
    }

    #[test]
    fn unknown_opcode_has_no_data_phase() {
        let cmd = ScsiCommand::parse(&cdb(&[0x9E]));
        assert_eq!(cmd, ScsiCommand::Unknown { opcode: 0x9E });
        assert_eq!(cmd.data_phase(), DataPhase::None);
    }

    #[test]
    fn fixed_response_sizes() {
        let config = DiskConfig::DEFAULT;
        let mut out = [0; 64];
        for (op, len) in [(0x12, 36), (0x03, 18), (0x25, 8), (0x1A, 4), (0x5A, 8)] {
            let cmd = ScsiCommand::parse(&cdb(&[op]));
            assert_eq!(cmd.data_phase(), DataPhase::Fixed(len));
            assert_eq!(cmd.fixed_response(&config, &mut out), len);
        }
    }

    #[test]
    fn inquiry_carries_identity() {
        let config = DiskConfig::DEFAULT;
        let mut out = [0; 64];
        ScsiCommand::Inquiry.fixed_response(&config, &mut out);
        assert_eq!(&out[..5], &[0x00, 0x80, 0x02, 0x02, 32]);
        assert_eq!(&out[8..16], &config.vendor);
        assert_eq!(&out[16..32], &config.product);
        assert_eq!(&out[32..36], &config.revision);
    }

    #[test]
    fn capacity_is_last_lba_and_block_size() {
        let mut out = [0; 64];
        ScsiCommand::ReadCapacity10.fixed_response(&DiskConfig::DEFAULT, &mut out);
        assert_eq!(&out[..8], &[0x00, 0x00, 0x3F, 0xFF, 0x00, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn mode_sense_is_not_write_protected() {
        let mut out = [0xFF; 64];
        ScsiCommand::ModeSense6.fixed_response(&DiskConfig::DEFAULT, &mut out);
        assert_eq!(&out[..4], &[3, 0, 0, 0]);
        ScsiCommand::ModeSense10.fixed_response(&DiskConfig::DEFAULT, &mut out);
        assert_eq!(&out[..8], &[0, 6, 0, 0, 0, 0, 0, 0]);
    }
}
