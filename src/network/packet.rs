//! RTP packet layout
//!
//! A minimal RTP v2 header subset: no padding, extension or CSRC list.
//!
//! ```text
//! ┌────────┬────────┬─────────────────┬─────────────────────────────────┐
//! │  0x80  │ 0|PT   │ sequence (BE)   │ timestamp (BE)                  │
//! ├────────┴────────┴─────────────────┼─────────────────────────────────┤
//! │ ssrc (BE)                         │ payload (fixed size) ...        │
//! └───────────────────────────────────┴─────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes};
use std::net::SocketAddr;

/// Size of the RTP header in bytes
pub const HEADER_SIZE: usize = 12;

/// First header byte: version 2, no padding, no extension, no CSRCs
pub const RTP_MARKER: u8 = 0x80;

/// Decoded RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Append the 12 header bytes to `buf`; the payload type is masked to 7 bits
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(RTP_MARKER);
        buf.put_u8(self.payload_type & 0x7f);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Parse a header, or `None` if the marker or payload-type bit is wrong
    pub fn parse(mut data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let marker = data.get_u8();
        let payload_type = data.get_u8();
        if marker != RTP_MARKER || payload_type & 0x80 != 0 {
            return None;
        }

        Some(Self {
            payload_type,
            sequence: data.get_u16(),
            timestamp: data.get_u32(),
            ssrc: data.get_u32(),
        })
    }
}

/// A validated packet from a registered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub peer: SocketAddr,
    pub payload_type: u8,
    /// Extended 32-bit sequence number
    pub sequence: u32,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}
