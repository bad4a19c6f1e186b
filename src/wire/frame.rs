//! Packet framing for the SSP wire protocol (§3/§4.A).
//!
//! A packet on the wire looks like:
//!
//! ```text
//! STX  [ADDR+SEQ]  [LENGTH]  [PAYLOAD...]  [CRC_LO]  [CRC_HI]
//! ```
//!
//! `STX` (`0x7F`) marks the start of a packet and is never itself stuffed.
//! Every other `0x7F` byte in the address/length/payload/crc region is
//! doubled on the wire (byte-stuffed) so a receiver can always find the
//! next packet boundary by scanning for a lone `0x7F`. `LENGTH` counts the
//! payload only (0-254); the CRC16 is computed over the unstuffed
//! address+length+payload bytes and is itself subject to stuffing like any
//! other byte.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::crc::crc16;

/// Sentinel byte marking the start of a packet. Never appears unstuffed
/// anywhere else in the frame.
pub const STX: u8 = 0x7F;

/// Maximum payload length the protocol allows in the `LENGTH` byte.
pub const MAX_PAYLOAD_LEN: usize = 254;

/// Bit set in the address byte when the sequence flag is 1.
const SEQ_BIT: u8 = 0x80;
/// Mask recovering the 7-bit device address from the address byte.
const ADDR_MASK: u8 = 0x7F;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("packet did not start with STX (0x7F), got {0:#04x}")]
    InvalidStart(u8),
    #[error("payload length {0} exceeds the protocol maximum of {MAX_PAYLOAD_LEN}")]
    PayloadTooLong(usize),
    #[error("crc mismatch: expected {expected:#06x}, calculated {calculated:#06x}")]
    CrcMismatch { expected: u16, calculated: u16 },
    #[error("unescaped STX encountered mid-frame, previous packet is truncated")]
    UnescapedStx,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single framed packet, already unstuffed and CRC-verified on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub address: u8,
    pub seq: bool,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(address: u8, seq: bool, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            address,
            seq,
            payload,
        })
    }

    fn address_byte(&self) -> u8 {
        (self.address & ADDR_MASK) | if self.seq { SEQ_BIT } else { 0 }
    }

    /// Unstuffed address+length+payload bytes the CRC is computed over.
    fn crc_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 + self.payload.len());
        body.push(self.address_byte());
        body.push(self.payload.len() as u8);
        body.extend_from_slice(&self.payload);
        body
    }

    fn crc(&self) -> u16 {
        crc16(&self.crc_body())
    }

    /// Stuff a single unstuffed byte into `dst`, doubling it if it equals STX.
    fn put_stuffed(dst: &mut BytesMut, byte: u8) {
        dst.put_u8(byte);
        if byte == STX {
            dst.put_u8(byte);
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(self.payload.len()));
        }
        dst.put_u8(STX);
        let body = self.crc_body();
        let crc = self.crc();
        for b in &body {
            Self::put_stuffed(dst, *b);
        }
        Self::put_stuffed(dst, (crc & 0x00FF) as u8);
        Self::put_stuffed(dst, ((crc >> 8) & 0x00FF) as u8);
        Ok(())
    }

    /// Attempt to decode one packet from `src`, consuming it on success.
    ///
    /// Returns `Ok(None)` when `src` holds an incomplete (but so-far valid)
    /// packet and the caller should wait for more bytes.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] != STX {
            return Err(FrameError::InvalidStart(src[0]));
        }

        // First pass: unstuff just enough to learn the payload length.
        let header = match unstuff(&src[1..], 2) {
            Unstuffed::Incomplete => return Ok(None),
            Unstuffed::Garbage { consumed } => {
                src.advance(1 + consumed);
                return Err(FrameError::UnescapedStx);
            }
            Unstuffed::Done { plain, .. } => plain,
        };
        let length = header[1] as usize;
        let want = 2 + length + 2;

        let (plain, raw_consumed) = match unstuff(&src[1..], want) {
            Unstuffed::Incomplete => return Ok(None),
            Unstuffed::Garbage { consumed } => {
                src.advance(1 + consumed);
                return Err(FrameError::UnescapedStx);
            }
            Unstuffed::Done { plain, raw_consumed } => (plain, raw_consumed),
        };

        let body = &plain[0..2 + length];
        let crc_bytes = &plain[2 + length..2 + length + 2];
        let calculated = crc16(body);
        let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);

        // Consume the frame from the buffer regardless of CRC outcome: a
        // mismatch means this packet is garbage, not that it is incomplete.
        src.advance(1 + raw_consumed);

        if calculated != expected {
            return Err(FrameError::CrcMismatch {
                expected,
                calculated,
            });
        }

        let address_byte = body[0];
        Ok(Some(Packet {
            address: address_byte & ADDR_MASK,
            seq: address_byte & SEQ_BIT != 0,
            payload: body[2..].to_vec(),
        }))
    }
}

enum Unstuffed {
    Incomplete,
    /// Hit a lone (non-doubled) STX before `want` plain bytes were produced:
    /// the previous packet was truncated and this STX starts the next one.
    /// `consumed` counts the raw bytes preceding that STX.
    Garbage { consumed: usize },
    Done {
        plain: Vec<u8>,
        raw_consumed: usize,
    },
}

/// Unstuff bytes from `raw` until `want` plain bytes have been produced or
/// the input is exhausted. A lone trailing `0x7F` (no following byte yet to
/// tell stuffed-pair from frame-restart) is treated as incomplete input.
fn unstuff(raw: &[u8], want: usize) -> Unstuffed {
    let mut plain = Vec::with_capacity(want);
    let mut i = 0;
    while plain.len() < want {
        if i >= raw.len() {
            return Unstuffed::Incomplete;
        }
        let b = raw[i];
        if b == STX {
            if i + 1 >= raw.len() {
                return Unstuffed::Incomplete;
            }
            if raw[i + 1] == STX {
                plain.push(STX);
                i += 2;
            } else {
                return Unstuffed::Garbage { consumed: i };
            }
        } else {
            plain.push(b);
            i += 1;
        }
    }
    Unstuffed::Done {
        plain,
        raw_consumed: i,
    }
}

/// `tokio_util` codec wrapping [`Packet::decode`]/[`Packet::encode`].
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Packet::decode(src)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

/// Scans `buf` for the next plausible packet start, dropping leading bytes
/// that cannot be a valid STX. Used by the session layer to resynchronize
/// after a `CrcMismatch`/`InvalidStart` error without tearing down the
/// connection (mirrors the framer contract in spec.md §4.A).
pub fn resync(buf: &mut BytesMut) -> bool {
    if let Some(pos) = buf.iter().position(|&b| b == STX) {
        buf.advance(pos);
        true
    } else {
        buf.clear();
        false
    }
}
