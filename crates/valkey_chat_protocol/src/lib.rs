#![forbid(unsafe_code)]

pub mod envelope;

pub use envelope::{Envelope, EnvelopeCodec, EnvelopeEncoding, EnvelopeError};

/// Envelope format version, logged at startup.
pub mod version {
	/// Structured envelope schema version.
	pub const ENVELOPE_SCHEMA: u32 = 1;
}
