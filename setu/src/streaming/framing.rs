//! Length-prefixed framing for the reliable stream transport
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Envelope (variable)      │
//! │ Big-endian u32   │ zstd-compressed          │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! TCP is a byte stream: one `write_all` on the server can arrive as several
//! reads on the client, and two publishes can arrive in one read. The
//! prefix makes frame boundaries explicit so neither case corrupts a value.

use crate::error::{Error, Result};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Build a complete frame into `buffer`, reusing its allocation
pub fn write_frame(payload: &[u8], buffer: &mut Vec<u8>) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    buffer.clear();
    buffer.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buffer.extend_from_slice(payload);
    Ok(())
}

/// Accumulates stream bytes and yields complete frames
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload
    ///
    /// `Ok(None)` means more bytes are needed. An oversized length prefix is
    /// an error: the stream position can no longer be trusted and the
    /// connection should be dropped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let end = LENGTH_PREFIX_SIZE + len;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let frame = self.buffer[LENGTH_PREFIX_SIZE..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(frame))
    }

    /// True when a frame has started arriving but is not yet complete
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered (used after a reconnect)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_frame(payload, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_prefix_is_big_endian() {
        let buf = frame(b"abc");
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);
        assert_eq!(&buf[4..], b"abc");
    }

    #[test]
    fn test_split_delivery() {
        let buf = frame(b"hello world");
        let mut reader = FrameReader::new();

        reader.extend(&buf[..2]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.extend(&buf[2..7]);
        assert_eq!(reader.next_frame().unwrap(), None);
        assert!(reader.has_partial());

        reader.extend(&buf[7..]);
        assert_eq!(reader.next_frame().unwrap(), Some(b"hello world".to_vec()));
        assert!(!reader.has_partial());
    }

    #[test]
    fn test_coalesced_frames() {
        let mut stream = frame(b"first");
        stream.extend(frame(b"second"));
        stream.extend(&frame(b"third")[..3]);

        let mut reader = FrameReader::new();
        reader.extend(&stream);
        assert_eq!(reader.next_frame().unwrap(), Some(b"first".to_vec()));
        assert_eq!(reader.next_frame().unwrap(), Some(b"second".to_vec()));
        assert_eq!(reader.next_frame().unwrap(), None);
        assert_eq!(reader.buffered(), 3);
    }

    #[test]
    fn test_empty_payload() {
        let mut reader = FrameReader::new();
        reader.extend(&frame(b""));
        assert_eq!(reader.next_frame().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut reader = FrameReader::new();
        reader.extend(&u32::MAX.to_be_bytes());
        assert!(matches!(
            reader.next_frame(),
            Err(Error::FrameTooLarge { .. })
        ));
    }
}
