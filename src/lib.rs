// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A USB flash drive with exactly one file on it, none of which exists.
//!
//! The host sees an 8 MiB FAT16 volume holding `main.py`. The boot sector,
//! FATs and directory are synthesized sector by sector as the host reads
//! them. Writes are watched rather than stored: a directory write tells us
//! where the host moved the file and how long it is, and data writes to the
//! file's clusters land in a small RAM buffer. Whatever is in that buffer is
//! the program another part of the firmware runs.
//!
//! The mass storage function shares a composite device with a CDC serial
//! console, whose input is queued here until the main loop drains it.
//!
//! The USB controller itself is someone else's problem: implement
//! [`EndpointIo`] for it and forward endpoint events to [`GhostDisk`].

#![cfg_attr(not(test), no_std)]

pub mod bot;
pub mod config;
mod device;
pub mod error;
pub mod file;
pub mod filter;
pub mod layout;
pub mod ring;
pub mod scsi;
pub mod transfer;
pub mod usb;
pub mod volume;

pub use config::{DiskConfig, EndpointMap};
pub use device::{GhostDisk, DEFAULT_RAM_DISK_SIZE};
pub use error::{Busy, CbwError};
pub use file::{ActiveFile, ScriptReader};
pub use transfer::Phase;
pub use usb::{ClassResponse, Console, ConsoleWriter, EndpointIo};
