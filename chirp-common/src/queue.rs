// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Byte-stream reassembly for the TLV packet encoding.
//!
//! BLE and SPP deliveries do not respect packet boundaries once the peer
//! speaks TLV: a delivery may hold half a packet, or three packets and the
//! start of a fourth. [`CommandQueue`] buffers raw deliveries and yields
//! complete `[type][payload]` frames.

use crate::protocol::{DecodeError, MAX_FRAME_LEN, TLV_HEADER_LEN};
use heapless::Vec;

const QUEUE_CAP: usize = 2048;

/// Fixed-capacity reassembly buffer. `push` raw transport deliveries in,
/// then drain complete frames with `next_frame` until it returns `None`.
pub struct CommandQueue {
    buf: [u8; QUEUE_CAP],
    len: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub const fn new() -> Self {
        Self {
            buf: [0; QUEUE_CAP],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if self.len + bytes.len() > QUEUE_CAP {
            return Err(DecodeError::QueueFull);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Pop the next complete frame, header stripped down to `[type][payload]`.
    ///
    /// Returns `None` while the buffered bytes end mid-packet.
    pub fn next_frame(&mut self) -> Option<Vec<u8, MAX_FRAME_LEN>> {
        if self.len < TLV_HEADER_LEN {
            return None;
        }
        let len_rfu = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let payload_len = (len_rfu & 0x3FF) as usize;
        let packet_len = TLV_HEADER_LEN + payload_len;
        if self.len < packet_len {
            return None;
        }

        let mut frame = Vec::new();
        // payload_len <= 1023 so the frame always fits
        let _ = frame.push(self.buf[0]);
        let _ = frame.extend_from_slice(&self.buf[TLV_HEADER_LEN..packet_len]);

        self.buf.copy_within(packet_len..self.len, 0);
        self.len -= packet_len;
        Some(frame)
    }
}
