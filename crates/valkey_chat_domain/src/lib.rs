#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::HashMap;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace prefix for broker topics.
pub const PUBSUB_PREFIX: &str = "chat/Channel/";

/// Namespace prefix for log (stream) keys.
pub const LOG_PREFIX: &str = "chat/List/";

/// Default upper bound on channel name length, in characters.
pub const DEFAULT_MAX_CHANNEL_LEN: usize = 128;

/// Errors raised while validating an upgrade request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("missing username")]
	MissingUsername,
	#[error("missing channel")]
	MissingChannel,
	#[error(transparent)]
	InvalidChannelName(#[from] ChannelKeyError),
}

/// Errors from channel key derivation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelKeyError {
	#[error("invalid channel name: empty")]
	Empty,
	#[error("invalid channel name: {len} chars exceeds max {max}")]
	TooLong { len: usize, max: usize },
}

/// Errors for parsing log ids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamIdError {
	#[error("empty stream id")]
	Empty,
	#[error("invalid stream id: {0}")]
	InvalidFormat(String),
}

/// Display name a session publishes under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct Username(String);

impl Username {
	/// Create a non-blank `Username`.
	pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
		let name = name.into();
		if name.trim().is_empty() {
			return Err(ValidationError::MissingUsername);
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// One chat line: who said it and what they said.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChatMessage {
	sender: String,
	body: String,
}

impl ChatMessage {
	pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			sender: sender.into(),
			body: body.into(),
		}
	}

	pub fn sender(&self) -> &str {
		&self.sender
	}

	pub fn body(&self) -> &str {
		&self.body
	}

	/// Formats the message as it appears on a client transport.
	pub fn render(&self) -> String {
		format!("[{}] - {}", self.sender, self.body)
	}
}

/// Broker topic and log key for one logical channel.
///
/// Both identifiers are the channel name behind a fixed prefix, so two distinct names never
/// map to the same topic or the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelIdentity {
	channel_name: String,
	pubsub_topic: String,
	log_key: String,
}

impl ChannelIdentity {
	/// Derive the identity for `channel_name`, rejecting empty or over-long names.
	pub fn derive(channel_name: &str, max_len: usize) -> Result<Self, ChannelKeyError> {
		if channel_name.is_empty() {
			return Err(ChannelKeyError::Empty);
		}
		let len = channel_name.chars().count();
		if len > max_len {
			return Err(ChannelKeyError::TooLong { len, max: max_len });
		}

		Ok(Self {
			channel_name: channel_name.to_string(),
			pubsub_topic: format!("{PUBSUB_PREFIX}{channel_name}"),
			log_key: format!("{LOG_PREFIX}{channel_name}"),
		})
	}

	pub fn channel_name(&self) -> &str {
		&self.channel_name
	}

	pub fn pubsub_topic(&self) -> &str {
		&self.pubsub_topic
	}

	pub fn log_key(&self) -> &str {
		&self.log_key
	}
}

impl fmt::Display for ChannelIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.channel_name)
	}
}

/// Log entry id: millisecond timestamp plus a per-millisecond sequence (`<ms>-<seq>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
	pub ms: u64,
	pub seq: u64,
}

impl StreamId {
	pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };

	pub const fn new(ms: u64, seq: u64) -> Self {
		Self { ms, seq }
	}

	/// Lowest id still inside a trailing time window ending at `now_ms`.
	pub fn lower_bound_for_window(now_ms: u64, window: Duration) -> Self {
		let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
		Self::new(now_ms.saturating_sub(window_ms), 0)
	}

	/// The id immediately before this one, if any.
	pub fn predecessor(self) -> Option<Self> {
		match (self.ms, self.seq) {
			(0, 0) => None,
			(ms, 0) => Some(Self::new(ms - 1, u64::MAX)),
			(ms, seq) => Some(Self::new(ms, seq - 1)),
		}
	}
}

impl fmt::Display for StreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.ms, self.seq)
	}
}

impl FromStr for StreamId {
	type Err = StreamIdError;

	/// Accepts `<ms>-<seq>` or a bare `<ms>` (sequence 0).
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(StreamIdError::Empty);
		}

		let (ms_s, seq_s) = s.split_once('-').unwrap_or((s, "0"));
		let ms = ms_s
			.parse::<u64>()
			.map_err(|_| StreamIdError::InvalidFormat(s.to_string()))?;
		let seq = seq_s
			.parse::<u64>()
			.map_err(|_| StreamIdError::InvalidFormat(s.to_string()))?;
		Ok(Self::new(ms, seq))
	}
}

#[cfg(feature = "serde")]
impl Serialize for StreamId {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for StreamId {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// One record read back from the append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
	pub id: StreamId,
	pub fields: HashMap<String, Vec<u8>>,
}

impl LogEntry {
	pub fn new(id: StreamId, fields: HashMap<String, Vec<u8>>) -> Self {
		Self { id, fields }
	}

	/// Field value as UTF-8, `None` when absent or not valid UTF-8.
	pub fn field_str(&self, name: &str) -> Option<&str> {
		self.fields.get(name).and_then(|v| core::str::from_utf8(v).ok())
	}
}
