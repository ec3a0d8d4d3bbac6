// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte queue between CDC OUT packets and whoever consumes console input.
//!
//! Packets arrive at USB rate, the consumer runs when the main loop gets to
//! it. If it falls behind, the oldest input is dropped to make room.

use heapless::Deque;
use log::trace;

/// One full-speed packet's worth.
pub const CDC_RING_SIZE: usize = 64;

pub struct CdcRing<const N: usize = CDC_RING_SIZE> {
    bytes: Deque<u8, N>,
}

impl<const N: usize> CdcRing<N> {
    pub const fn new() -> Self {
        Self { bytes: Deque::new() }
    }

    /// Appends `data`, discarding the oldest bytes if there isn't room.
    pub fn push(&mut self, data: &[u8]) {
        // Only the newest N bytes of an oversized packet can survive anyway.
        let data = &data[data.len().saturating_sub(N)..];
        let overflow = (self.bytes.len() + data.len()).saturating_sub(N);
        if overflow > 0 {
            trace!("cdc ring full, dropping {} bytes", overflow);
            for _ in 0..overflow {
                self.bytes.pop_front();
            }
        }
        for &b in data {
            // Room was made above.
            let _ = self.bytes.push_back(b);
        }
    }

    /// Hands everything queued to `sink`, oldest first, and empties the queue.
    /// `sink` may be called twice when the queue has wrapped.
    pub fn drain(&mut self, mut sink: impl FnMut(&[u8])) {
        if self.bytes.is_empty() {
            return;
        }
        let (front, back) = self.bytes.as_slices();
        sink(front);
        if !back.is_empty() {
            sink(back);
        }
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl<const N: usize> Default for CdcRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drained<const N: usize>(ring: &mut CdcRing<N>) -> Vec<u8> {
        let mut out = Vec::new();
        ring.drain(|s| out.extend_from_slice(s));
        out
    }

    #[test]
    fn fifo_order() {
        let mut ring = CdcRing::<8>::new();
        ring.push(b"abc");
        ring.push(b"de");
        assert_eq!(ring.len(), 5);
        assert_eq!(drained(&mut ring), b"abcde");
        assert!(ring.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut ring = CdcRing::<4>::new();
        ring.push(b"abc");
        ring.push(b"de");
        assert_eq!(drained(&mut ring), b"bcde");
        ring.push(b"0123456789");
        assert_eq!(drained(&mut ring), b"6789");
    }

    #[test]
    fn drains_across_wrap() {
        let mut ring = CdcRing::<4>::new();
        ring.push(b"ab");
        let mut first = Vec::new();
        ring.drain(|s| first.extend_from_slice(s));
        ring.push(b"wxyz");
        ring.push(b"!");
        assert_eq!(drained(&mut ring), b"xyz!");
    }
}
