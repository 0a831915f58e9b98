//! `application/vnd.amazon.eventstream` framing.
//!
//! ```text
//! [total len u32][headers len u32][prelude crc u32][headers][payload][message crc u32]
//! ```
//! Both CRCs are CRC-32 (IEEE); the prelude CRC covers the first 8 bytes and
//! the message CRC everything before it.

use bytes::{Buf, Bytes, BytesMut};
use crc32fast::hash as crc32;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + CRC_LEN;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        match self.header(name)? {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid frame length {0}")]
    Length(usize),
    #[error("prelude checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    PreludeChecksum { expected: u32, actual: u32 },
    #[error("message checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    MessageChecksum { expected: u32, actual: u32 },
    #[error("malformed header: {0}")]
    Header(String),
}

/// Reassembles frames from arbitrarily split input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, `Ok(None)` if more input is needed.
    ///
    /// Any error leaves the stream unrecoverable: framing is lost.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = be_u32(&self.buf[0..4]) as usize;
        let headers_len = be_u32(&self.buf[4..8]) as usize;
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
            || headers_len > total_len - MIN_FRAME_LEN
        {
            return Err(FrameError::Length(total_len));
        }
        let expected = be_u32(&self.buf[8..12]);
        let actual = crc32(&self.buf[0..8]);
        if expected != actual {
            return Err(FrameError::PreludeChecksum { expected, actual });
        }
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total_len).freeze();
        let expected = be_u32(&frame[total_len - CRC_LEN..]);
        let actual = crc32(&frame[..total_len - CRC_LEN]);
        if expected != actual {
            return Err(FrameError::MessageChecksum { expected, actual });
        }

        frame.advance(PRELUDE_LEN);
        let headers = parse_headers(frame.split_to(headers_len))?;
        let payload_len = total_len - headers_len - MIN_FRAME_LEN;
        let payload = frame.split_to(payload_len);
        Ok(Some(Frame { headers, payload }))
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn parse_headers(mut raw: Bytes) -> Result<Vec<(String, HeaderValue)>, FrameError> {
    let mut headers = Vec::new();
    while raw.has_remaining() {
        let name_len = raw.get_u8() as usize;
        need(&raw, name_len + 1, "name")?;
        let name = String::from_utf8(raw.split_to(name_len).to_vec())
            .map_err(|_| FrameError::Header("name is not UTF-8".into()))?;
        let value = match raw.get_u8() {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                need(&raw, 1, &name)?;
                HeaderValue::Byte(raw.get_i8())
            }
            3 => {
                need(&raw, 2, &name)?;
                HeaderValue::Short(raw.get_i16())
            }
            4 => {
                need(&raw, 4, &name)?;
                HeaderValue::Int(raw.get_i32())
            }
            5 => {
                need(&raw, 8, &name)?;
                HeaderValue::Long(raw.get_i64())
            }
            6 => {
                need(&raw, 2, &name)?;
                let len = raw.get_u16() as usize;
                need(&raw, len, &name)?;
                HeaderValue::Bytes(raw.split_to(len))
            }
            7 => {
                need(&raw, 2, &name)?;
                let len = raw.get_u16() as usize;
                need(&raw, len, &name)?;
                let value = String::from_utf8(raw.split_to(len).to_vec())
                    .map_err(|_| FrameError::Header(format!("{name}: value is not UTF-8")))?;
                HeaderValue::String(value)
            }
            8 => {
                need(&raw, 8, &name)?;
                HeaderValue::Timestamp(raw.get_i64())
            }
            9 => {
                need(&raw, 16, &name)?;
                let mut id = [0u8; 16];
                raw.copy_to_slice(&mut id);
                HeaderValue::Uuid(id)
            }
            other => return Err(FrameError::Header(format!("{name}: unknown type {other}"))),
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn need(raw: &Bytes, n: usize, what: &str) -> Result<(), FrameError> {
    if raw.remaining() < n {
        return Err(FrameError::Header(format!("{what}: truncated")));
    }
    Ok(())
}

/// Encode a frame with string-typed headers. Used to build fixtures and
/// mock Bedrock endpoints.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }
    let total_len = MIN_FRAME_LEN + header_bytes.len() + payload.len();

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&(total_len as u32).to_be_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32(&out);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    let message_crc = crc32(&out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_empty_message_vector() {
        let bytes = [
            0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x05, 0xc2, 0x48, 0xeb, 0x7d, 0x98,
            0xc8, 0xff,
        ];
        assert_eq!(encode_frame(&[], b""), bytes);
        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        let frame = dec.next_frame().unwrap().unwrap();
        assert!(frame.headers.is_empty());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn decodes_encoded_frame() {
        let bytes = encode_frame(
            &[(":event-type", "contentBlockDelta"), (":message-type", "event")],
            br#"{"delta":{"text":"Hi"}}"#,
        );
        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.header_str(":event-type"), Some("contentBlockDelta"));
        assert_eq!(frame.header_str(":message-type"), Some("event"));
        assert_eq!(&frame.payload[..], br#"{"delta":{"text":"Hi"}}"#);
        assert_eq!(dec.next_frame().unwrap(), None);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn waits_for_split_frames() {
        let mut bytes = encode_frame(&[(":event-type", "messageStart")], b"{}");
        bytes.extend(encode_frame(&[(":event-type", "messageStop")], b"{}"));
        let mut dec = FrameDecoder::new();
        let mut types = Vec::new();
        for chunk in bytes.chunks(5) {
            dec.push(chunk);
            while let Some(frame) = dec.next_frame().unwrap() {
                types.push(frame.header_str(":event-type").unwrap().to_string());
            }
        }
        assert_eq!(types, vec!["messageStart", "messageStop"]);
    }

    #[test]
    fn rejects_corrupt_payload() {
        let mut bytes = encode_frame(&[], b"{\"x\":1}");
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        assert!(matches!(
            dec.next_frame(),
            Err(FrameError::MessageChecksum { .. })
        ));
    }

    #[test]
    fn rejects_corrupt_prelude() {
        let mut bytes = encode_frame(&[], b"{}");
        bytes[9] ^= 0x01;
        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        assert!(matches!(
            dec.next_frame(),
            Err(FrameError::PreludeChecksum { .. })
        ));
    }

    #[test]
    fn decodes_typed_headers() {
        // One int32 header, hand-assembled.
        let mut headers = vec![3u8];
        headers.extend_from_slice(b"seq");
        headers.push(4);
        headers.extend_from_slice(&7i32.to_be_bytes());
        let total = (MIN_FRAME_LEN + headers.len()) as u32;
        let mut bytes = total.to_be_bytes().to_vec();
        bytes.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes.extend_from_slice(&headers);
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        let mut dec = FrameDecoder::new();
        dec.push(&bytes);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.header("seq"), Some(&HeaderValue::Int(7)));
        assert!(frame.payload.is_empty());
    }
}
