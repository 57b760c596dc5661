//! Envelope codec shared by the UDP, TCP, ZeroMQ and MQTT transports
//!
//! An envelope pairs a channel name with an arbitrary serde value so several
//! logical channels can share one socket. Subscribers compare the name
//! against their own and drop anything else.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ zstd frame                                    │
//! │  └── [name, value] (MessagePack or JSON)      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Formats
//!
//! ### MessagePack (Default)
//! Compact binary, handles byte buffers (camera frames) without base64 bloat.
//!
//! ### JSON
//! Human-readable inside the compression layer, handy when a non-Rust peer
//! has to be debugged.
//!
//! Both ends of a channel must agree on the format; there is no negotiation.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Default zstd level. Level 1 keeps per-tick encoding well under a
/// millisecond for VGA JPEG frames.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 1;

/// Upper bound on the decompressed envelope size (16 MiB)
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Supported wire formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Binary MessagePack via rmp-serde
    #[default]
    MessagePack,
    /// JSON via serde_json
    Json,
}

/// A named value as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Logical channel name
    pub name: String,
    /// Payload
    pub value: T,
}

/// Borrowing twin of [`Envelope`] so publishing never clones the value
#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    name: &'a str,
    value: &'a T,
}

/// Serializer + compressor pair
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    format: WireFormat,
    level: i32,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(WireFormat::default())
    }
}

impl EnvelopeCodec {
    /// Create a codec for the given wire format with the default compression level
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// Override the zstd compression level
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Wire format used by this codec
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Serialize and compress `value` under `name`
    pub fn encode<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<Vec<u8>> {
        let envelope = EnvelopeRef { name, value };
        let raw = match self.format {
            WireFormat::MessagePack => {
                rmp_serde::to_vec(&envelope).map_err(|e| Error::Encode(e.to_string()))?
            }
            WireFormat::Json => {
                serde_json::to_vec(&envelope).map_err(|e| Error::Encode(e.to_string()))?
            }
        };
        if raw.len() > MAX_ENVELOPE_SIZE {
            return Err(Error::FrameTooLarge {
                size: raw.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }

        zstd::bulk::compress(&raw, self.level).map_err(|e| Error::Encode(e.to_string()))
    }

    /// Decompress and deserialize an envelope
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<Envelope<T>> {
        let raw = decompress(bytes)?;
        match self.format {
            WireFormat::MessagePack => {
                rmp_serde::from_slice(&raw).map_err(|e| Error::Decode(e.to_string()))
            }
            WireFormat::Json => {
                serde_json::from_slice(&raw).map_err(|e| Error::Decode(e.to_string()))
            }
        }
    }

    /// Decode `bytes` and keep the value only if the envelope carries `name`
    ///
    /// Returns `None` for decode failures and foreign channels alike; both
    /// mean "no value this cycle" to a subscriber.
    pub fn decode_named<T: DeserializeOwned>(&self, name: &str, bytes: &[u8]) -> Option<T> {
        match self.decode::<T>(bytes) {
            Ok(envelope) if envelope.name == name => Some(envelope.value),
            Ok(envelope) => {
                log::trace!("Ignoring envelope for '{}' (want '{}')", envelope.name, name);
                None
            }
            Err(e) => {
                log::debug!("Discarding undecodable frame on '{}': {}", name, e);
                None
            }
        }
    }
}

/// Encode with the default codec
pub fn encode<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<Vec<u8>> {
    EnvelopeCodec::default().encode(name, value)
}

/// Decode with the default codec
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Envelope<T>> {
    EnvelopeCodec::default().decode(bytes)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(bytes).map_err(|e| Error::Decode(e.to_string()))?;

    // Read one byte past the cap so an oversized payload is detectable
    let mut raw = Vec::with_capacity(bytes.len() * 4);
    decoder
        .take(MAX_ENVELOPE_SIZE as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| Error::Decode(e.to_string()))?;

    if raw.len() > MAX_ENVELOPE_SIZE {
        return Err(Error::FrameTooLarge {
            size: raw.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Frame {
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    }

    #[test]
    fn test_roundtrip_controls() {
        let bytes = encode("controls", &(0.5f64, -0.2f64)).unwrap();
        let envelope: Envelope<(f64, f64)> = decode(&bytes).unwrap();
        assert_eq!(envelope.name, "controls");
        assert_eq!(envelope.value, (0.5, -0.2));
    }

    #[test]
    fn test_roundtrip_json_struct() {
        let codec = EnvelopeCodec::new(WireFormat::Json);
        let mut readings = HashMap::new();
        readings.insert("battery".to_string(), 11.7f32);
        readings.insert("cpu_temp".to_string(), 54.0f32);

        let bytes = codec.encode("sensors", &readings).unwrap();
        let envelope: Envelope<HashMap<String, f32>> = codec.decode(&bytes).unwrap();
        assert_eq!(envelope.name, "sensors");
        assert_eq!(envelope.value, readings);
    }

    #[test]
    fn test_frame_payload_compresses() {
        // Flat grey image, the worst case for a raw feed and the best for zstd
        let frame = Frame {
            width: 160,
            height: 120,
            pixels: vec![128u8; 160 * 120 * 3],
        };
        let bytes = encode("camera", &frame).unwrap();
        assert!(bytes.len() < frame.pixels.len() / 10);

        let envelope: Envelope<Frame> = decode(&bytes).unwrap();
        assert_eq!(envelope.value, frame);
    }

    #[test]
    fn test_truncated_input_is_decode_error() {
        let bytes = encode("controls", &(0.5f64, -0.2f64)).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode::<(f64, f64)>(truncated).is_err());
        assert!(decode::<(f64, f64)>(&[]).is_err());
        assert!(decode::<(f64, f64)>(b"definitely not zstd").is_err());
    }

    #[test]
    fn test_type_mismatch_is_decode_error() {
        let bytes = encode("controls", "hi there").unwrap();
        assert!(matches!(
            decode::<(f64, f64)>(&bytes),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_decode_named_filters_foreign_channel() {
        let codec = EnvelopeCodec::default();
        let bytes = codec.encode("b", &42u32).unwrap();
        assert_eq!(codec.decode_named::<u32>("a", &bytes), None);
        assert_eq!(codec.decode_named::<u32>("b", &bytes), Some(42));
    }

    #[test]
    fn test_formats_are_not_interchangeable() {
        let bytes = EnvelopeCodec::new(WireFormat::Json)
            .encode("controls", &(1.0f64, 0.0f64))
            .unwrap();
        let msgpack = EnvelopeCodec::new(WireFormat::MessagePack);
        assert!(msgpack.decode::<(f64, f64)>(&bytes).is_err());
    }

    #[test]
    fn test_oversized_value_is_rejected_before_compression() {
        // Compresses to almost nothing, so only the raw size can catch it
        let huge = "a".repeat(MAX_ENVELOPE_SIZE + 1);
        for format in [WireFormat::MessagePack, WireFormat::Json] {
            let result = EnvelopeCodec::new(format).encode("camera", &huge);
            assert!(matches!(
                result,
                Err(Error::FrameTooLarge { size, max }) if size > MAX_ENVELOPE_SIZE && max == MAX_ENVELOPE_SIZE
            ));
        }

        // Just under the cap still encodes and decodes
        let fits = "a".repeat(MAX_ENVELOPE_SIZE - 64);
        let bytes = EnvelopeCodec::default().encode("camera", &fits).unwrap();
        let back: Envelope<String> = EnvelopeCodec::default().decode(&bytes).unwrap();
        assert_eq!(back.value.len(), fits.len());
    }
}
