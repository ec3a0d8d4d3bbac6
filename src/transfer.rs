// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bulk-Only Transport state machine for the mass storage interface.
//!
//! One command is a CBW from the host, an optional data phase of many
//! packets in one direction, and a CSW back. Each step is driven by an
//! endpoint event (OUT packet arrived, IN packet collected) or by the main
//! loop polling us, so all progress lives in [`TransferContext`] between
//! calls:
//!
//! ```text
//! Idle --CBW--> DataIn  --last chunk collected--> StatusPending --CSW collected--> Idle
//! Idle --CBW--> DataOut --last byte received----> StatusPending
//! Idle --CBW--------------------------------------> StatusPending
//! ```
//!
//! Nothing here waits. If the IN endpoint is still busy after a bounded poll,
//! the step is left for the next event or poll to retry.

use log::{debug, trace, warn};
use zerocopy::AsBytes;

use crate::bot::{CommandBlockWrapper, CommandStatus, CommandStatusWrapper, CBW_SIZE};
use crate::config::DiskConfig;
use crate::file::{ActiveFile, RamDisk};
use crate::filter;
use crate::layout::{Region, SECTOR_SIZE};
use crate::scsi::{DataPhase, ScsiCommand};
use crate::usb::{send_polling, EndpointIo, MAX_PACKET, TX_POLL_LIMIT};
use crate::volume;

/// Where we are in the current command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a CBW.
    Idle,
    /// Sending response data to the host.
    DataIn,
    /// Receiving write data from the host.
    DataOut,
    /// Data phase over; the CSW is queued or about to be.
    StatusPending,
}

/// Live state of the command in flight.
#[derive(Copy, Clone, Debug)]
pub struct TransferContext {
    pub phase: Phase,
    /// `None` only while idle.
    pub command: Option<ScsiCommand>,
    /// Byte offset on the volume for READ(10)/WRITE(10). Unused otherwise.
    pub offset: u64,
    /// Bytes left in the data phase.
    pub remaining: u32,
    pub csw: CommandStatusWrapper,
    /// The CSW has been handed to the IN endpoint.
    pub status_queued: bool,
}

impl TransferContext {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            command: None,
            offset: 0,
            remaining: 0,
            csw: CommandStatusWrapper::default(),
            status_queued: false,
        }
    }

    fn sector(&self) -> (u32, usize) {
        let sector = u32::try_from(self.offset / SECTOR_SIZE as u64).unwrap_or(u32::MAX);
        (sector, (self.offset % SECTOR_SIZE as u64) as usize)
    }
}

/// The mass storage function: transport state plus the file it exposes.
pub struct MassStorage<const N: usize> {
    config: DiskConfig,
    transfer: TransferContext,
    file: ActiveFile,
    ram: RamDisk<N>,
}

impl<const N: usize> MassStorage<N> {
    pub fn new(config: DiskConfig) -> Self {
        let mut ram = RamDisk::new();
        let size = ram.load(config.initial_contents);
        Self {
            config,
            transfer: TransferContext::idle(),
            file: ActiveFile::new(size as u32),
            ram,
        }
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn transfer(&self) -> &TransferContext {
        &self.transfer
    }

    pub fn file(&self) -> &ActiveFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut ActiveFile {
        &mut self.file
    }

    pub fn ram(&self) -> &RamDisk<N> {
        &self.ram
    }

    /// Forgets any command in flight.
    pub fn reset(&mut self) {
        if self.transfer.phase != Phase::Idle {
            debug!("transfer reset during {:?}", self.transfer.phase);
        }
        self.transfer = TransferContext::idle();
    }

    /// A packet arrived on the bulk OUT endpoint.
    pub fn on_out(&mut self, io: &mut impl EndpointIo, packet: &[u8]) {
        trace!("msc out {} bytes in {:?}", packet.len(), self.transfer.phase);
        match self.transfer.phase {
            Phase::Idle => match CommandBlockWrapper::decode(packet) {
                Ok(cbw) => self.begin(io, cbw),
                Err(e) => warn!("dropping OUT packet: {}", e),
            },
            Phase::DataOut => {
                // Write data comes in full packets, so a CBW-sized packet
                // carrying the CBW signature is the host starting over.
                if packet.len() == CBW_SIZE {
                    if let Ok(cbw) = CommandBlockWrapper::decode(packet) {
                        warn!("new CBW mid-write; abandoning {:?}", self.transfer.command);
                        self.begin(io, cbw);
                        return;
                    }
                }
                self.receive(io, packet);
            }
            Phase::DataIn | Phase::StatusPending => match CommandBlockWrapper::decode(packet) {
                Ok(cbw) => {
                    warn!("new CBW during {:?}; abandoning", self.transfer.phase);
                    self.begin(io, cbw);
                }
                Err(_) => trace!("stray OUT packet during {:?}", self.transfer.phase),
            },
        }
    }

    /// The host collected our last packet on the bulk IN endpoint.
    pub fn on_in_complete(&mut self, io: &mut impl EndpointIo) {
        match self.transfer.phase {
            Phase::DataIn => self.advance(io),
            Phase::StatusPending if self.transfer.status_queued => {
                trace!("CSW collected, tag {:#x}", self.transfer.csw.tag.get());
                self.transfer = TransferContext::idle();
            }
            Phase::StatusPending => self.send_status(io),
            Phase::Idle | Phase::DataOut => {}
        }
    }

    /// Pushes along anything that stalled on a busy endpoint.
    pub fn poll(&mut self, io: &mut impl EndpointIo) {
        match self.transfer.phase {
            Phase::DataIn => self.advance(io),
            Phase::StatusPending if !self.transfer.status_queued => self.send_status(io),
            _ => {}
        }
    }

    fn begin(&mut self, io: &mut impl EndpointIo, cbw: CommandBlockWrapper) {
        let command = ScsiCommand::parse(cbw.command_block());
        let requested = cbw.data_transfer_length.get();
        debug!("{:?}, tag {:#x}, {} bytes", command, cbw.tag.get(), requested);
        if cbw.lun != 0 {
            trace!("CBW for LUN {}; answering as LUN 0", cbw.lun);
        }

        let mut t = TransferContext {
            phase: Phase::StatusPending,
            command: Some(command),
            offset: 0,
            remaining: 0,
            csw: CommandStatusWrapper::for_command(&cbw),
            status_queued: false,
        };

        match (command, command.data_phase()) {
            (_, DataPhase::Fixed(_)) => {
                t.phase = Phase::DataIn;
                t.remaining = requested;
            }
            (ScsiCommand::Read10 { lba, blocks }, _) | (ScsiCommand::Write10 { lba, blocks }, _) => {
                let mut len = u32::from(blocks) * SECTOR_SIZE as u32;
                t.offset = u64::from(lba) * SECTOR_SIZE as u64;
                if requested < len {
                    // The host won't take everything the CDB names. Move what
                    // it asked for and flag the mismatch.
                    warn!("{:?} wants {} bytes but host allows {}", command, len, requested);
                    t.csw.set_status(CommandStatus::PhaseError);
                    len = requested;
                }
                t.remaining = len;
                t.csw.data_residue.set(requested - len);
                if len > 0 {
                    t.phase = if command.data_phase() == DataPhase::Receive {
                        Phase::DataOut
                    } else {
                        Phase::DataIn
                    };
                }
            }
            _ => {
                // No data phase, known or not. Whatever the host meant to
                // move, nothing moved.
                t.csw.data_residue.set(requested);
            }
        }

        self.transfer = t;
        match self.transfer.phase {
            Phase::DataIn => self.advance(io),
            Phase::StatusPending => self.send_status(io),
            Phase::Idle | Phase::DataOut => {}
        }
    }

    /// Sends the next chunk of a Data-In phase, or the CSW if there is none.
    fn advance(&mut self, io: &mut impl EndpointIo) {
        if self.transfer.remaining == 0 {
            self.send_status(io);
            return;
        }
        let command = match self.transfer.command {
            Some(c) => c,
            None => return,
        };
        let msc_in = self.config.endpoints.msc_in;
        let mut buf = [0u8; MAX_PACKET];

        match command.data_phase() {
            DataPhase::Stream => {
                let (sector, within) = self.transfer.sector();
                let len = (self.transfer.remaining as usize)
                    .min(MAX_PACKET)
                    .min(SECTOR_SIZE - within);
                if within == 0 && Region::of(sector) == (Region::RootDir { index: 0 }) {
                    // The data region read mapping only knows the first
                    // cluster, so that's where the directory says we are.
                    self.file.rehome();
                }
                volume::read(&self.config, &self.file, &self.ram, sector, within, &mut buf[..len]);
                if send_polling(io, msc_in, &buf[..len], TX_POLL_LIMIT).is_err() {
                    return;
                }
                self.transfer.offset += len as u64;
                self.transfer.remaining -= len as u32;
            }
            DataPhase::Fixed(_) => {
                let have = command.fixed_response(&self.config, &mut buf);
                let len = have.min(self.transfer.remaining as usize);
                if send_polling(io, msc_in, &buf[..len], TX_POLL_LIMIT).is_err() {
                    return;
                }
                // One packet is all there is. Whatever else the host asked
                // for is residue.
                let residue = self.transfer.remaining - len as u32;
                self.transfer.csw.data_residue.set(residue);
                self.transfer.remaining = 0;
            }
            DataPhase::None | DataPhase::Receive => {
                self.transfer.remaining = 0;
                self.send_status(io);
            }
        }
    }

    /// Takes one packet of a Data-Out phase.
    fn receive(&mut self, io: &mut impl EndpointIo, packet: &[u8]) {
        let len = packet.len().min(self.transfer.remaining as usize);
        let mut data = &packet[..len];
        // A packet could straddle sectors if the host sent an odd size; split
        // it so each piece is routed by its own sector.
        while !data.is_empty() {
            let (sector, within) = self.transfer.sector();
            let n = data.len().min(SECTOR_SIZE - within);
            let outcome = filter::write(
                &self.config.file_name,
                &mut self.file,
                &mut self.ram,
                sector,
                within,
                &data[..n],
            );
            trace!("write sector {} +{}: {:?}", sector, within, outcome);
            self.transfer.offset += n as u64;
            data = &data[n..];
        }
        self.transfer.remaining -= len as u32;

        if self.transfer.remaining == 0 {
            self.send_status(io);
        }
    }

    fn send_status(&mut self, io: &mut impl EndpointIo) {
        self.transfer.phase = Phase::StatusPending;
        if self.transfer.status_queued {
            return;
        }
        let msc_in = self.config.endpoints.msc_in;
        match send_polling(io, msc_in, self.transfer.csw.as_bytes(), TX_POLL_LIMIT) {
            Ok(()) => self.transfer.status_queued = true,
            Err(e) => trace!("{}; CSW deferred", e),
        }
    }
}
