// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Reasons an OUT packet on the mass storage endpoint is not a usable CBW.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum CbwError {
    #[error("CBW must be 31 bytes, got {0}")]
    Length(usize),
    #[error("bad CBW signature {0:#010x}")]
    Signature(u32),
}

/// The endpoint is still holding a packet the host hasn't collected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("endpoint {endpoint} busy")]
pub struct Busy {
    pub endpoint: u8,
}
