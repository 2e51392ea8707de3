//! WebSocket frame codec.
//!
//! [`parse`] drains every complete frame from a byte buffer and hands back the
//! undecoded tail; [`build`] serializes a server-to-client frame.
//!
//! ```text
//! byte0: FIN(1) RSV1-3(3) OPCODE(4)
//! byte1: MASK(1) LEN7(7)
//!   LEN7 == 126: next 2 bytes, big-endian = length
//!   LEN7 == 127: next 8 bytes, big-endian = length (high 4 bytes must be 0)
//! if MASK: next 4 bytes = masking key
//! payload: `length` bytes
//! ```

use crate::mask::apply_mask;
use crate::{ProtocolError, Result};

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7F;

const LEN_16_MARKER: u8 = 126;
const LEN_64_MARKER: u8 = 127;

/// Represents the opcode of a WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Indicates a continuation frame.
    Continuation,
    /// Indicates a text frame.
    Text,
    /// Indicates a binary frame.
    Binary,
    /// Indicates a close frame.
    Close,
    /// Indicates a ping frame.
    Ping,
    /// Indicates a pong frame.
    Pong,
    /// A reserved or unknown opcode, kept so it can be ignored by the receiver.
    Reserved(u8),
}

impl From<u8> for OpCode {
    /// Decodes the low four bits of `value`.
    fn from(value: u8) -> Self {
        match value & OPCODE_BITS {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(value) => value & OPCODE_BITS,
        }
    }
}

/// Represents a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final fragment in a message.
    pub fin: bool,
    /// The three reserved header bits, right-aligned (`RSV1` is `0b100`).
    pub rsv: u8,
    /// The opcode for this frame.
    pub opcode: OpCode,
    /// Whether the frame arrived with a masking key.
    pub masked: bool,
    /// The payload data, already unmasked.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a new final, unmasked frame with the given opcode and payload.
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Frame {
            fin: true,
            rsv: 0,
            opcode,
            masked: false,
            payload,
        }
    }

    /// Creates a close frame carrying a status code and reason text.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Frame::new(OpCode::Close, payload)
    }

    /// Checks if this frame is a close frame.
    pub fn is_close(&self) -> bool {
        self.opcode == OpCode::Close
    }

    /// Checks if this frame is masked.
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// The status code opening a close frame's payload, if present.
    pub fn close_code(&self) -> Option<u16> {
        match self.payload.as_slice() {
            [hi, lo, ..] if self.is_close() => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Converts the frame to its unmasked wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        build(self.opcode, &self.payload, self.fin)
    }
}

/// Outcome of a [`parse`] call.
#[derive(Debug, PartialEq, Eq)]
pub struct Parsed<'a> {
    /// Complete frames, in wire order.
    pub frames: Vec<Frame>,
    /// Suffix of the input holding a not-yet-complete frame.
    pub remainder: &'a [u8],
}

/// Decodes every complete frame at the front of `buffer`.
///
/// A frame whose header, masking key or payload is cut short is never
/// partially decoded; its bytes are returned untouched as the remainder.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if a 64-bit length has any of its
/// high 32 bits set.
pub fn parse(buffer: &[u8]) -> Result<Parsed<'_>> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buffer.len() - offset >= 2 {
        match decode_frame(&buffer[offset..])? {
            Some((frame, consumed)) => {
                frames.push(frame);
                offset += consumed;
            }
            None => break,
        }
    }

    Ok(Parsed {
        frames,
        remainder: &buffer[offset..],
    })
}

/// Decodes one frame from the start of `buf`, returning it with the number of
/// bytes it occupied, or `None` if `buf` ends before the frame does.
fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let first_byte = buf[0];
    let second_byte = buf[1];

    let fin = first_byte & FIN_BIT != 0;
    let rsv = (first_byte & RSV_BITS) >> 4;
    let opcode = OpCode::from(first_byte);

    let masked = second_byte & MASK_BIT != 0;
    let mut pos = 2;

    let payload_len = match second_byte & LEN_BITS {
        LEN_16_MARKER => {
            let Some(bytes) = take::<2>(buf, pos) else {
                return Ok(None);
            };
            pos += 2;
            usize::from(u16::from_be_bytes(bytes))
        }
        LEN_64_MARKER => {
            let Some(bytes) = take::<8>(buf, pos) else {
                return Ok(None);
            };
            pos += 8;
            let declared = u64::from_be_bytes(bytes);
            if declared >> 32 != 0 {
                return Err(ProtocolError::FrameTooLarge { declared }.into());
            }
            usize::try_from(declared).map_err(|_| ProtocolError::FrameTooLarge { declared })?
        }
        len => usize::from(len),
    };

    let key = if masked {
        let Some(key) = take::<4>(buf, pos) else {
            return Ok(None);
        };
        pos += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() - pos < payload_len {
        return Ok(None);
    }

    let mut payload = buf[pos..pos + payload_len].to_vec();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin,
        rsv,
        opcode,
        masked,
        payload,
    };
    Ok(Some((frame, pos + payload_len)))
}

fn take<const N: usize>(buf: &[u8], pos: usize) -> Option<[u8; N]> {
    buf.get(pos..pos + N)?.try_into().ok()
}

/// Serializes an unmasked frame, as sent from server to client.
///
/// The header is 2, 4 or 10 bytes depending on the payload length. Payloads
/// are limited to `u32::MAX` bytes, the most a 64-bit length with a zero high
/// half can declare.
pub fn build(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10 + payload.len());
    write_header(&mut bytes, opcode, payload.len(), fin, false);
    bytes.extend_from_slice(payload);
    bytes
}

/// Serializes a frame masked with `key`, as sent from client to server.
pub fn build_masked(opcode: OpCode, payload: &[u8], fin: bool, key: [u8; 4]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(14 + payload.len());
    write_header(&mut bytes, opcode, payload.len(), fin, true);
    bytes.extend_from_slice(&key);
    let start = bytes.len();
    bytes.extend_from_slice(payload);
    apply_mask(&mut bytes[start..], key);
    bytes
}

fn write_header(bytes: &mut Vec<u8>, opcode: OpCode, len: usize, fin: bool, masked: bool) {
    let mut first_byte = u8::from(opcode);
    if fin {
        first_byte |= FIN_BIT;
    }
    bytes.push(first_byte);

    let mask_bit = if masked { MASK_BIT } else { 0 };
    if len < usize::from(LEN_16_MARKER) {
        // `len` fits in seven bits here.
        bytes.push(mask_bit | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        bytes.push(mask_bit | LEN_16_MARKER);
        bytes.extend_from_slice(&len.to_be_bytes());
    } else {
        debug_assert!(
            u32::try_from(len).is_ok(),
            "payload of {len} bytes exceeds the 32-bit frame length limit"
        );
        bytes.push(mask_bit | LEN_64_MARKER);
        bytes.extend_from_slice(&(len as u64).to_be_bytes());
    }
}
