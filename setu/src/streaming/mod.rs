//! Wire-level building blocks: envelope codec and stream framing

pub mod envelope;
pub mod framing;

pub use envelope::{decode, encode, Envelope, EnvelopeCodec, WireFormat};
pub use framing::{write_frame, FrameReader};
