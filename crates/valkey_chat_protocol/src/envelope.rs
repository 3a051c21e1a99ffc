#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use valkey_chat_domain::{ChatMessage, StreamId};

/// How chat messages are encoded on the broker.
///
/// A deployment picks exactly one. Mixing them on one channel is unsafe: plain receivers render
/// structured payloads as raw JSON, and structured receivers drop plain payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeEncoding {
	/// The payload is the rendered line `"[sender] - body"`.
	Plain,
	/// The payload is a JSON record `{"username", "message"}`.
	#[default]
	Structured,
}

impl EnvelopeEncoding {
	pub const fn as_str(self) -> &'static str {
		match self {
			EnvelopeEncoding::Plain => "plain",
			EnvelopeEncoding::Structured => "structured",
		}
	}
}

impl fmt::Display for EnvelopeEncoding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EnvelopeEncoding {
	type Err = EnvelopeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"plain" | "text" => Ok(EnvelopeEncoding::Plain),
			"structured" | "json" => Ok(EnvelopeEncoding::Structured),
			other => Err(EnvelopeError::UnknownEncoding(other.to_string())),
		}
	}
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
	#[error("unknown envelope encoding: {0}")]
	UnknownEncoding(String),

	#[error("envelope is not valid UTF-8")]
	Utf8(#[from] std::str::Utf8Error),

	#[error("malformed structured envelope: {0}")]
	Json(#[from] serde_json::Error),
}

/// A decoded broker payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
	/// A user's chat line, with the log id it was stored under when history is persisted.
	Chat {
		message: ChatMessage,
		log_id: Option<StreamId>,
	},
	/// A server-generated line such as a join or leave announcement.
	Notice(String),
	/// Already-rendered text received over the plain encoding.
	Preformatted(String),
}

impl Envelope {
	pub fn chat(message: ChatMessage) -> Self {
		Envelope::Chat { message, log_id: None }
	}

	/// Text written to a client transport for this envelope.
	pub fn render(&self) -> String {
		match self {
			Envelope::Chat { message, .. } => message.render(),
			Envelope::Notice(text) | Envelope::Preformatted(text) => text.clone(),
		}
	}

	pub fn log_id(&self) -> Option<StreamId> {
		match self {
			Envelope::Chat { log_id, .. } => *log_id,
			_ => None,
		}
	}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireEnvelope {
	Chat {
		username: String,
		message: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		id: Option<StreamId>,
	},
	Notice {
		notice: String,
	},
}

/// Encoder/decoder bound to one deployment-wide encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeCodec {
	encoding: EnvelopeEncoding,
}

impl EnvelopeCodec {
	pub fn new(encoding: EnvelopeEncoding) -> Self {
		Self { encoding }
	}

	pub fn encoding(&self) -> EnvelopeEncoding {
		self.encoding
	}

	pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
		match self.encoding {
			EnvelopeEncoding::Plain => Ok(envelope.render().into_bytes()),
			EnvelopeEncoding::Structured => {
				let wire = match envelope {
					Envelope::Chat { message, log_id } => WireEnvelope::Chat {
						username: message.sender().to_string(),
						message: message.body().to_string(),
						id: *log_id,
					},
					Envelope::Notice(text) | Envelope::Preformatted(text) => WireEnvelope::Notice { notice: text.clone() },
				};
				Ok(serde_json::to_vec(&wire)?)
			}
		}
	}

	/// Decode a broker payload. Errors are meant to be dropped by the caller, never surfaced.
	pub fn decode(&self, payload: &[u8]) -> Result<Envelope, EnvelopeError> {
		match self.encoding {
			EnvelopeEncoding::Plain => {
				let text = core::str::from_utf8(payload)?;
				Ok(Envelope::Preformatted(text.to_string()))
			}
			EnvelopeEncoding::Structured => match serde_json::from_slice::<WireEnvelope>(payload)? {
				WireEnvelope::Chat { username, message, id } => Ok(Envelope::Chat {
					message: ChatMessage::new(username, message),
					log_id: id,
				}),
				WireEnvelope::Notice { notice } => Ok(Envelope::Notice(notice)),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encoding_parses_aliases() {
		assert_eq!("plain".parse::<EnvelopeEncoding>().unwrap(), EnvelopeEncoding::Plain);
		assert_eq!("JSON".parse::<EnvelopeEncoding>().unwrap(), EnvelopeEncoding::Structured);
		assert!("xml".parse::<EnvelopeEncoding>().is_err());
		assert_eq!(EnvelopeCodec::new(EnvelopeEncoding::Plain).encoding(), EnvelopeEncoding::Plain);
	}

	#[test]
	fn structured_chat_omits_missing_id() {
		let codec = EnvelopeCodec::new(EnvelopeEncoding::Structured);
		let bytes = codec.encode(&Envelope::chat(ChatMessage::new("Adam", "Hello"))).unwrap();
		let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(json, serde_json::json!({"username": "Adam", "message": "Hello"}));
	}
}
