// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, trace};
use num_traits::FromPrimitive;

use crate::config::DiskConfig;
use crate::file::{ActiveFile, ScriptReader};
use crate::ring::CdcRing;
use crate::transfer::{MassStorage, Phase};
use crate::usb::{ClassResponse, Console, ConsoleWriter, EndpointIo, MscRequest};

/// RAM backing the file, in bytes.
pub const DEFAULT_RAM_DISK_SIZE: usize = 2 * 1024;

/// The composite CDC + mass storage function.
///
/// Owns every piece of cross-callback state. The USB stack calls
/// [`on_data_out`](Self::on_data_out) and
/// [`on_data_in_complete`](Self::on_data_in_complete) from its endpoint
/// events, and the main loop calls [`poll`](Self::poll). None of them block,
/// and none may be entered while another is running.
pub struct GhostDisk<const N: usize = DEFAULT_RAM_DISK_SIZE> {
    msc: MassStorage<N>,
    cdc: CdcRing,
}

impl<const N: usize> GhostDisk<N> {
    pub fn new(config: DiskConfig) -> Self {
        Self {
            msc: MassStorage::new(config),
            cdc: CdcRing::new(),
        }
    }

    pub fn config(&self) -> &DiskConfig {
        self.msc.config()
    }

    /// The host sent `data` on OUT endpoint `endpoint`.
    pub fn on_data_out(&mut self, io: &mut impl EndpointIo, endpoint: u8, data: &[u8]) {
        let eps = self.msc.config().endpoints;
        if endpoint == eps.msc_out {
            self.msc.on_out(io, data);
        } else if endpoint == eps.cdc_out {
            self.cdc.push(data);
        } else {
            trace!("ignoring {} bytes on EP{} OUT", data.len(), endpoint);
        }
    }

    /// The host collected the packet we queued on IN endpoint `endpoint`.
    pub fn on_data_in_complete(&mut self, io: &mut impl EndpointIo, endpoint: u8, _data: &[u8]) {
        if endpoint == self.msc.config().endpoints.msc_in {
            self.msc.on_in_complete(io);
        }
    }

    /// Background work: moves a stalled Data-In or status phase along, and
    /// hands buffered console input to `console`.
    pub fn poll(&mut self, io: &mut impl EndpointIo, console: &mut impl Console) {
        self.msc.poll(io);
        self.cdc.drain(|bytes| console.input(bytes));
    }

    /// Answers a class-specific request addressed to the mass storage
    /// interface.
    pub fn class_request(&mut self, request: u8) -> ClassResponse {
        match MscRequest::from_u8(request) {
            Some(MscRequest::GetMaxLun) => ClassResponse::Data([0]),
            Some(MscRequest::BulkOnlyReset) => {
                debug!("bulk-only reset");
                self.msc.reset();
                ClassResponse::Ack
            }
            None => ClassResponse::Unsupported,
        }
    }

    /// Drops any transfer in flight, e.g. on bus reset.
    pub fn reset(&mut self) {
        self.msc.reset();
    }

    pub fn phase(&self) -> Phase {
        self.msc.transfer().phase
    }

    pub fn file(&self) -> &ActiveFile {
        self.msc.file()
    }

    /// The file's current contents, as the host last wrote them.
    ///
    /// Only meaningful between host writes; nothing signals when the host is
    /// done, so read it at a point of your choosing (boot, a button, a
    /// console command).
    pub fn script(&self) -> &[u8] {
        let size = (self.msc.file().size as usize).min(N);
        &self.msc.ram().as_bytes()[..size]
    }

    pub fn open_script(&self) -> ScriptReader<'_> {
        ScriptReader::new(self.script())
    }

    /// Reports, and clears, whether the host moved or resized the file since
    /// the last call.
    pub fn take_changed(&mut self) -> bool {
        let file = self.msc.file_mut();
        let changed = file.dirty;
        file.dirty = false;
        changed
    }

    /// Text output over the CDC IN endpoint.
    pub fn console<'a, E: EndpointIo>(&self, io: &'a mut E) -> ConsoleWriter<'a, E> {
        ConsoleWriter::new(io, self.msc.config().endpoints.cdc_in)
    }
}

impl<const N: usize> Default for GhostDisk<N> {
    fn default() -> Self {
        Self::new(DiskConfig::DEFAULT)
    }
}
