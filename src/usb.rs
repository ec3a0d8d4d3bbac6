// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Seams to the USB device stack and the console.
//!
//! The controller driver owns descriptors, enumeration and the endpoint
//! buffers. All we need from it is a way to queue a packet on an IN endpoint,
//! and a way to hear about OUT packets and completed INs (see
//! [`GhostDisk`](crate::GhostDisk)).

use core::fmt;

use log::trace;
use num_derive::FromPrimitive;

use crate::error::Busy;

/// Full-speed bulk max packet size; no packet we send is larger.
pub const MAX_PACKET: usize = 64;

/// How many times to offer a mass storage packet to a busy endpoint before
/// leaving it for the next poll.
pub const TX_POLL_LIMIT: usize = 64;

/// Console output gets one retry, then is dropped.
pub const CONSOLE_TX_TRIES: usize = 2;

/// Transmit side of the device controller.
pub trait EndpointIo {
    /// Queues `data` (at most [`MAX_PACKET`] bytes) on IN endpoint `endpoint`.
    ///
    /// Returns `Busy` without side effects if the previous packet on that
    /// endpoint hasn't been collected by the host yet. `data` is copied; the
    /// caller can reuse it as soon as this returns.
    fn send(&mut self, endpoint: u8, data: &[u8]) -> Result<(), Busy>;
}

/// Consumer of console input drained from the CDC OUT endpoint.
pub trait Console {
    fn input(&mut self, bytes: &[u8]);
}

impl<F: FnMut(&[u8])> Console for F {
    fn input(&mut self, bytes: &[u8]) {
        self(bytes)
    }
}

/// Offers `data` to `endpoint` up to `tries` times. This is a tight poll, not
/// a timed wait.
pub fn send_polling(
    io: &mut impl EndpointIo,
    endpoint: u8,
    data: &[u8],
    tries: usize,
) -> Result<(), Busy> {
    let mut last = Busy { endpoint };
    for _ in 0..tries {
        match io.send(endpoint, data) {
            Ok(()) => return Ok(()),
            Err(e) => last = e,
        }
    }
    Err(last)
}

/// Mass storage class-specific control requests (BOT section 3).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum MscRequest {
    GetMaxLun = 0xFE,
    BulkOnlyReset = 0xFF,
}

/// How the control endpoint should answer a class request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClassResponse {
    /// Send these bytes in the data stage.
    Data([u8; 1]),
    /// No data stage; acknowledge with a zero-length status.
    Ack,
    /// Not ours. Stall or ignore, as the stack prefers.
    Unsupported,
}

/// `core::fmt::Write` onto the CDC IN endpoint.
///
/// Text is cut into packets. If the endpoint stays busy past one retry the
/// rest of the text is dropped, so printing never holds up the firmware.
pub struct ConsoleWriter<'a, E: EndpointIo> {
    io: &'a mut E,
    endpoint: u8,
}

impl<'a, E: EndpointIo> ConsoleWriter<'a, E> {
    pub fn new(io: &'a mut E, endpoint: u8) -> Self {
        Self { io, endpoint }
    }
}

impl<E: EndpointIo> fmt::Write for ConsoleWriter<'_, E> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for chunk in s.as_bytes().chunks(MAX_PACKET) {
            if let Err(e) = send_polling(&mut *self.io, self.endpoint, chunk, CONSOLE_TX_TRIES) {
                trace!("{}; console output dropped", e);
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    /// Busy for the first `busy_for` attempts, then accepts.
    struct Flaky {
        busy_for: usize,
        attempts: usize,
        sent: Vec<(u8, Vec<u8>)>,
    }

    impl EndpointIo for Flaky {
        fn send(&mut self, endpoint: u8, data: &[u8]) -> Result<(), Busy> {
            self.attempts += 1;
            if self.attempts <= self.busy_for {
                return Err(Busy { endpoint });
            }
            self.sent.push((endpoint, data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn polling_is_bounded() {
        let mut io = Flaky { busy_for: usize::MAX, attempts: 0, sent: Vec::new() };
        assert_eq!(send_polling(&mut io, 5, b"x", 3), Err(Busy { endpoint: 5 }));
        assert_eq!(io.attempts, 3);
    }

    #[test]
    fn console_retries_once() {
        let mut io = Flaky { busy_for: 1, attempts: 0, sent: Vec::new() };
        write!(ConsoleWriter::new(&mut io, 3), "hi").unwrap();
        assert_eq!(io.sent, vec![(3, b"hi".to_vec())]);

        let mut io = Flaky { busy_for: 2, attempts: 0, sent: Vec::new() };
        write!(ConsoleWriter::new(&mut io, 3), "hi").unwrap();
        assert!(io.sent.is_empty());
    }

    #[test]
    fn console_splits_packets() {
        let mut io = Flaky { busy_for: 0, attempts: 0, sent: Vec::new() };
        let text = "x".repeat(100);
        ConsoleWriter::new(&mut io, 3).write_str(&text).unwrap();
        assert_eq!(io.sent.len(), 2);
        assert_eq!(io.sent[0].1.len(), 64);
        assert_eq!(io.sent[1].1.len(), 36);
    }
}
