//! Incremental reassembly of Meshtastic stream frames.
//!
//! Serial and TCP links carry each `FromRadio` as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Anything between frames (boot banners, debug log text) is skipped. A header whose
//! declared length is zero or oversize is treated as noise and the framer advances one
//! byte to resynchronize.
use bytes::{Buf, BytesMut};

use super::codec::{MAX_STREAM_FRAME_LEN, STREAM_START1, STREAM_START2};

const HEADER_LEN: usize = 4;

pub struct StreamFramer {
    buf: BytesMut,
    skipped: usize,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while hunting for a frame header.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame body, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // Realign to the start marker.
            match self.buf.iter().position(|&b| b == STREAM_START1) {
                Some(0) => {}
                Some(pos) => {
                    self.buf.advance(pos);
                    self.skipped += pos;
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != STREAM_START2 {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_STREAM_FRAME_LEN {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }

            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}
