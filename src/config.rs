// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity of the emulated disk: the strings the host sees, the name of the
//! one file, what it contains at power-up, and which endpoints carry what.

/// Endpoint numbers of the composite device. Numbers only; direction is
/// implied by use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointMap {
    /// CDC notification (interrupt IN). Never written by this crate.
    pub cdc_notify: u8,
    pub cdc_out: u8,
    pub cdc_in: u8,
    pub msc_in: u8,
    pub msc_out: u8,
}

impl EndpointMap {
    pub const DEFAULT: Self = Self {
        cdc_notify: 1,
        cdc_out: 2,
        cdc_in: 3,
        msc_in: 5,
        msc_out: 6,
    };
}

#[derive(Copy, Clone, Debug)]
pub struct DiskConfig {
    /// INQUIRY vendor identification, space padded.
    pub vendor: [u8; 8],
    /// INQUIRY product identification, space padded.
    pub product: [u8; 16],
    /// INQUIRY product revision level.
    pub revision: [u8; 4],
    /// Boot sector OEM name.
    pub oem_name: [u8; 8],
    /// Boot sector volume label.
    pub volume_label: [u8; 11],
    pub volume_serial: u32,
    /// The tracked file, as a space-padded 8.3 name without the dot.
    pub file_name: [u8; 11],
    /// Copied into the RAM disk at construction. Truncated to fit.
    pub initial_contents: &'static [u8],
    pub endpoints: EndpointMap,
}

impl DiskConfig {
    pub const DEFAULT: Self = Self {
        vendor: *b"RP2040  ",
        product: *b"Ghost Disk      ",
        revision: *b"1.00",
        oem_name: *b"ghostfat",
        volume_label: *b"GHOSTDISK  ",
        volume_serial: 0x7856_3412,
        file_name: *b"MAIN    PY ",
        initial_contents: b"",
        endpoints: EndpointMap::DEFAULT,
    };
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
