// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bulk-Only Transport framing: the Command Block Wrapper the host sends to
//! start every command, and the Command Status Wrapper we send to end it.
//!
//! Both are little-endian on the wire. See USB Mass Storage Class - Bulk Only
//! Transport, section 5.

use byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U32};

use crate::error::CbwError;

/// `dCBWSignature`, "USBC" read as a little-endian u32.
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// `dCSWSignature`, "USBS" read as a little-endian u32.
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

pub const CBW_SIZE: usize = 31;
pub const CSW_SIZE: usize = 13;
/// Largest command block a CBW can carry.
pub const MAX_CDB_SIZE: usize = 16;

/// Direction bit in `bmCBWFlags`: set means Data-In (device to host).
const FLAG_DATA_IN: u8 = 0x80;

/// Layout of a 31-byte Command Block Wrapper.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct CommandBlockWrapper {
    signature: U32<LittleEndian>,
    /// Opaque; echoed back in the CSW.
    pub tag: U32<LittleEndian>,
    /// Number of bytes the host expects to move during the data phase.
    pub data_transfer_length: U32<LittleEndian>,
    pub flags: u8,
    /// We expose exactly one logical unit, so this should always be zero.
    pub lun: u8,
    /// Valid bytes in `command_block`, 1 through 16.
    pub command_block_length: u8,
    pub command_block: [u8; MAX_CDB_SIZE],
}

const _: () = assert!(core::mem::size_of::<CommandBlockWrapper>() == CBW_SIZE);

impl CommandBlockWrapper {
    /// Validates and copies a CBW out of a received packet.
    ///
    /// The packet must be exactly [`CBW_SIZE`] bytes and start with
    /// [`CBW_SIGNATURE`]. Nothing else is checked.
    pub fn decode(packet: &[u8]) -> Result<Self, CbwError> {
        let cbw = LayoutVerified::<_, CommandBlockWrapper>::new(packet)
            .ok_or(CbwError::Length(packet.len()))?;
        let signature = cbw.signature.get();
        if signature != CBW_SIGNATURE {
            return Err(CbwError::Signature(signature));
        }
        Ok(*cbw)
    }

    pub fn is_data_in(&self) -> bool {
        self.flags & FLAG_DATA_IN != 0
    }

    /// The command block, padded with zeros to 16 bytes.
    pub fn command_block(&self) -> &[u8; MAX_CDB_SIZE] {
        &self.command_block
    }
}

/// Values for `bCSWStatus`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
}

/// Layout of a 13-byte Command Status Wrapper.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct CommandStatusWrapper {
    signature: U32<LittleEndian>,
    pub tag: U32<LittleEndian>,
    /// Bytes the host asked to move, minus bytes actually moved.
    pub data_residue: U32<LittleEndian>,
    status: u8,
}

const _: () = assert!(core::mem::size_of::<CommandStatusWrapper>() == CSW_SIZE);

impl CommandStatusWrapper {
    /// Starts a passing status for the command `cbw`. The residue is filled in
    /// as the command runs.
    pub fn for_command(cbw: &CommandBlockWrapper) -> Self {
        Self {
            signature: U32::new(CSW_SIGNATURE),
            tag: cbw.tag,
            data_residue: U32::new(0),
            status: CommandStatus::Passed as u8,
        }
    }

    pub fn set_status(&mut self, status: CommandStatus) {
        self.status = status as u8;
    }

    pub fn status(&self) -> u8 {
        self.status
    }
}

impl Default for CommandStatusWrapper {
    fn default() -> Self {
        Self {
            signature: U32::new(CSW_SIGNATURE),
            tag: U32::new(0),
            data_residue: U32::new(0),
            status: CommandStatus::Passed as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cbw_bytes() -> [u8; CBW_SIZE] {
        let mut p = [0; CBW_SIZE];
        p[..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        p[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        p[8..12].copy_from_slice(&36u32.to_le_bytes());
        p[12] = 0x80;
        p[14] = 6;
        p[15] = 0x12;
        p[19] = 36;
        p
    }

    #[test]
    fn decodes_little_endian_fields() {
        let cbw = CommandBlockWrapper::decode(&cbw_bytes()).unwrap();
        assert_eq!(cbw.tag.get(), 0xDEAD_BEEF);
        assert_eq!(cbw.data_transfer_length.get(), 36);
        assert!(cbw.is_data_in());
        assert_eq!(cbw.command_block_length, 6);
        assert_eq!(cbw.command_block()[0], 0x12);
        assert_eq!(cbw.command_block()[4], 36);
    }

    #[test]
    fn rejects_wrong_length() {
        let p = cbw_bytes();
        assert!(matches!(CommandBlockWrapper::decode(&p[..30]), Err(CbwError::Length(30))));
        let mut long = [0u8; 32];
        long[..31].copy_from_slice(&p);
        assert!(matches!(CommandBlockWrapper::decode(&long), Err(CbwError::Length(32))));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut p = cbw_bytes();
        p[0] = b'X';
        assert!(matches!(CommandBlockWrapper::decode(&p), Err(CbwError::Signature(_))));
    }

    #[test]
    fn csw_echoes_tag() {
        let cbw = CommandBlockWrapper::decode(&cbw_bytes()).unwrap();
        let mut csw = CommandStatusWrapper::for_command(&cbw);
        csw.data_residue.set(4);
        csw.set_status(CommandStatus::Failed);
        assert_eq!(
            csw.as_bytes(),
            &[0x55, 0x53, 0x42, 0x53, 0xEF, 0xBE, 0xAD, 0xDE, 4, 0, 0, 0, 1]
        );
    }
}
