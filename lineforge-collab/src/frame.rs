//! WebSocket frame codec.
//!
//! Wire layout of a single frame:
//! ```text
//! ┌─────┬────────┬──────┬─────────────┬──────────────┬──────────┬─────────┐
//! │ FIN │ opcode │ MASK │ len (7 bit) │ ext len      │ mask key │ payload │
//! │ 1b  │ 4b     │ 1b   │ 0..=127     │ 0, 2, 8 bytes│ 0 / 4 B  │ len B   │
//! └─────┴────────┴──────┴─────────────┴──────────────┴──────────┴─────────┘
//! ```
//!
//! Length markers: 0–125 are used directly, 126 means a 16-bit big-endian
//! extended length follows, 127 means a 64-bit big-endian extended length
//! follows. Client frames are masked; server frames never are.
//!
//! Decoding is incremental: [`decode_next_frame`] consumes nothing and returns
//! `Ok(None)` until the buffer holds a complete frame, so it can be called
//! repeatedly against a growing byte buffer. [`FrameBuffer`] wraps that loop.

/// Largest length a JavaScript peer can represent exactly (2^53 - 1).
pub const MAX_SAFE_LENGTH: u64 = (1 << 53) - 1;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Reserved opcodes are carried through so callers can ignore them.
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(other) => other & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// One decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The declared payload length exceeds the accepted maximum.
    PayloadTooLarge { declared: u64, max: u64 },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::PayloadTooLarge { declared, max } => {
                write!(f, "Frame payload of {declared} bytes exceeds limit of {max} bytes")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Bounds-checked reader over a byte slice.
struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16_be(&mut self) -> Option<u16> {
        let b = self.take(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64_be(&mut self) -> Option<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Some(u64::from_be_bytes(raw))
    }
}

/// Decode the next complete frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `Ok(None)` if
/// the buffer does not yet hold a complete frame. Lengths above
/// [`MAX_SAFE_LENGTH`] are rejected.
pub fn decode_next_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    decode_next_frame_limited(buf, MAX_SAFE_LENGTH)
}

/// Like [`decode_next_frame`] but rejects payloads longer than `max_payload`.
///
/// The limit is checked as soon as the length field is readable, so an
/// oversized frame is refused before its payload is buffered.
pub fn decode_next_frame_limited(
    buf: &[u8],
    max_payload: u64,
) -> Result<Option<(Frame, usize)>, FrameError> {
    let mut cursor = ByteCursor::new(buf);

    let Some(first) = cursor.u8() else { return Ok(None) };
    let Some(second) = cursor.u8() else { return Ok(None) };

    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_u8(first);
    let masked = second & MASK_BIT != 0;

    let declared = match second & 0x7F {
        LEN_16 => match cursor.u16_be() {
            Some(len) => u64::from(len),
            None => return Ok(None),
        },
        LEN_64 => match cursor.u64_be() {
            Some(len) => len,
            None => return Ok(None),
        },
        len => u64::from(len),
    };

    let max = max_payload.min(MAX_SAFE_LENGTH);
    if declared > max {
        return Err(FrameError::PayloadTooLarge { declared, max });
    }
    let len = usize::try_from(declared)
        .map_err(|_| FrameError::PayloadTooLarge { declared, max })?;

    let mask = if masked {
        match cursor.take(4) {
            Some(key) => Some([key[0], key[1], key[2], key[3]]),
            None => return Ok(None),
        }
    } else {
        None
    };

    let Some(raw) = cursor.take(len) else { return Ok(None) };

    let payload = match mask {
        Some(key) => raw
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % 4])
            .collect(),
        None => raw.to_vec(),
    };

    Ok(Some((Frame { fin, opcode, payload }, cursor.pos)))
}

fn write_header(out: &mut Vec<u8>, opcode: Opcode, len: usize, mask_bit: u8) {
    out.push(FIN_BIT | opcode.as_u8());
    if len < LEN_16 as usize {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Encode a final, unmasked server frame.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    write_header(&mut out, opcode, payload.len(), 0);
    out.extend_from_slice(payload);
    out
}

/// Encode a text message as a single unmasked frame.
pub fn encode_text_frame(text: &str) -> Vec<u8> {
    encode_frame(Opcode::Text, text.as_bytes())
}

/// Encode a masked frame the way a client would send it.
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    write_header(&mut out, opcode, payload.len(), MASK_BIT);
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

/// Accumulates inbound bytes and yields complete frames.
///
/// Unconsumed bytes are retained and merged with the next read.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_payload: u64,
}

impl FrameBuffer {
    pub fn new(max_payload: u64) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_payload,
        }
    }

    /// Seed or extend the buffer with freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_next_frame_limited(&self.buf, self.max_payload)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Raw bytes currently buffered.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip_length_tiers() {
        for len in [0usize, 10, 125, 126, 65535, 65536] {
            let text = "a".repeat(len);
            let encoded = encode_text_frame(&text);
            let (frame, consumed) = decode_next_frame(&encoded).unwrap().unwrap();
            assert_eq!(consumed, encoded.len(), "length {len}");
            assert_eq!(frame.opcode, Opcode::Text);
            assert!(frame.fin);
            assert_eq!(frame.payload, text.as_bytes());
        }
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(encode_text_frame(&"x".repeat(125)).len(), 2 + 125);
        assert_eq!(encode_text_frame(&"x".repeat(126)).len(), 4 + 126);
        assert_eq!(encode_text_frame(&"x".repeat(65536)).len(), 10 + 65536);

        let frame = encode_text_frame(&"x".repeat(126));
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 126);
    }

    #[test]
    fn test_multibyte_text_uses_byte_length() {
        let text = "é".repeat(63); // 126 bytes, 63 chars
        let encoded = encode_text_frame(&text);
        assert_eq!(encoded[1], 126);
        let (frame, _) = decode_next_frame(&encoded).unwrap().unwrap();
        assert_eq!(frame.text(), Some(text.as_str()));
    }

    #[test]
    fn test_masked_payload_unmasked() {
        let mask = [0x37, 0xFA, 0x21, 0x3D];
        for len in [0usize, 1, 2, 3, 5, 7, 126, 1001] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let encoded = encode_masked_frame(Opcode::Binary, &payload, mask);
            let (frame, consumed) = decode_next_frame(&encoded).unwrap().unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(frame.opcode, Opcode::Binary);
            assert_eq!(frame.payload, payload, "length {len}");
        }
    }

    #[test]
    fn test_incomplete_frames_consume_nothing() {
        let encoded = encode_masked_frame(Opcode::Text, &[7u8; 300], [1, 2, 3, 4]);
        for cut in 0..encoded.len() {
            assert_eq!(decode_next_frame(&encoded[..cut]).unwrap(), None, "cut at {cut}");
        }
    }

    #[test]
    fn test_64bit_length_above_safe_integer_rejected() {
        let mut raw = vec![0x81, 127];
        raw.extend_from_slice(&(MAX_SAFE_LENGTH + 1).to_be_bytes());
        assert_eq!(
            decode_next_frame(&raw),
            Err(FrameError::PayloadTooLarge {
                declared: MAX_SAFE_LENGTH + 1,
                max: MAX_SAFE_LENGTH
            })
        );
    }

    #[test]
    fn test_limit_checked_before_payload_arrives() {
        let mut raw = vec![0x82, 126];
        raw.extend_from_slice(&1000u16.to_be_bytes());
        assert!(decode_next_frame_limited(&raw, 999).is_err());
        assert_eq!(decode_next_frame_limited(&raw, 1000).unwrap(), None);
    }

    #[test]
    fn test_close_and_control_opcodes() {
        let close = encode_masked_frame(Opcode::Close, &[0x03, 0xE8], [9, 9, 9, 9]);
        let (frame, _) = decode_next_frame(&close).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
        assert!(frame.opcode.is_control());
        assert!(!Opcode::Text.is_control());
        assert_eq!(Opcode::from_u8(0x83), Opcode::Reserved(3));
    }

    #[test]
    fn test_frame_buffer_multiple_frames_per_read() {
        let mut bytes = encode_masked_frame(Opcode::Text, b"one", [1, 2, 3, 4]);
        bytes.extend(encode_masked_frame(Opcode::Text, b"two", [5, 6, 7, 8]));
        bytes.extend(encode_masked_frame(Opcode::Text, b"three", [9, 10, 11, 12]));

        let mut buffer = FrameBuffer::new(1024);
        buffer.extend(&bytes[..bytes.len() - 2]);

        assert_eq!(buffer.next_frame().unwrap().unwrap().payload, b"one");
        assert_eq!(buffer.next_frame().unwrap().unwrap().payload, b"two");
        assert!(buffer.next_frame().unwrap().is_none());
        assert!(buffer.pending() > 0);

        buffer.extend(&bytes[bytes.len() - 2..]);
        assert_eq!(buffer.next_frame().unwrap().unwrap().payload, b"three");
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_byte_at_a_time() {
        let bytes = encode_masked_frame(Opcode::Text, &[b'z'; 70000], [4, 3, 2, 1]);
        let mut buffer = FrameBuffer::new(1 << 20);
        let mut decoded = None;
        for byte in &bytes {
            buffer.extend(std::slice::from_ref(byte));
            if let Some(frame) = buffer.next_frame().unwrap() {
                decoded = Some(frame);
            }
        }
        let frame = decoded.unwrap();
        assert_eq!(frame.payload.len(), 70000);
        assert!(frame.payload.iter().all(|b| *b == b'z'));
    }
}
