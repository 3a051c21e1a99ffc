#![forbid(unsafe_code)]

//! Broker and log seams. The relay only talks to these traits; `valkey` and `memory` provide
//! the implementations.

pub mod memory;
pub mod valkey;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::info;
use valkey_chat_domain::{LogEntry, StreamId};

use crate::config::{BackendKind, BackendSettings};

#[derive(Debug, Error)]
pub enum BrokerError {
	#[error("broker unavailable: {0}")]
	Unavailable(String),

	#[error("publish to {topic} failed: {reason}")]
	Publish { topic: String, reason: String },

	#[error("subscribe failed: {0}")]
	Subscribe(String),

	#[error("subscription to {0} closed by broker")]
	SubscriptionClosed(String),
}

#[derive(Debug, Error)]
pub enum LogError {
	#[error("log unavailable: {0}")]
	Unavailable(String),

	#[error("append to {key} failed: {reason}")]
	Append { key: String, reason: String },

	#[error("read from {key} failed: {reason}")]
	Read { key: String, reason: String },

	#[error("log returned malformed id: {0}")]
	MalformedId(String),

	#[error("id {id} is not above the last id {last} of {key}")]
	IdNotIncreasing { key: String, id: StreamId, last: StreamId },
}

/// One payload delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
	pub topic: String,
	pub payload: Bytes,
}

/// A live broker subscription.
///
/// Single owner; dropping it releases the subscription on the broker.
pub struct Subscription {
	topics: Vec<String>,
	messages: BoxStream<'static, Result<BrokerMessage, BrokerError>>,
}

impl Subscription {
	pub fn new<S>(topics: Vec<String>, messages: S) -> Self
	where
		S: Stream<Item = Result<BrokerMessage, BrokerError>> + Send + 'static,
	{
		Self {
			topics,
			messages: messages.boxed(),
		}
	}

	pub fn topics(&self) -> &[String] {
		&self.topics
	}

	/// Next delivered message; `None` once the broker ends the subscription.
	pub async fn next_message(&mut self) -> Option<Result<BrokerMessage, BrokerError>> {
		self.messages.next().await
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription").field("topics", &self.topics).finish_non_exhaustive()
	}
}

/// Channel-based publish/subscribe.
///
/// A subscription that exists when `publish` returns observes that publish; later
/// subscriptions do not.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
	/// Publish `payload`, returning how many subscribers it was delivered to.
	async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64, BrokerError>;

	async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BrokerError>;
}

/// Inclusive bound for a log range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
	Min,
	Max,
	Id(StreamId),
}

impl RangeBound {
	pub(crate) fn admits_from_below(self, id: StreamId) -> bool {
		match self {
			RangeBound::Min => true,
			RangeBound::Max => false,
			RangeBound::Id(b) => id >= b,
		}
	}

	pub(crate) fn admits_from_above(self, id: StreamId) -> bool {
		match self {
			RangeBound::Min => false,
			RangeBound::Max => true,
			RangeBound::Id(b) => id <= b,
		}
	}
}

impl fmt::Display for RangeBound {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RangeBound::Min => f.write_str("-"),
			RangeBound::Max => f.write_str("+"),
			RangeBound::Id(id) => write!(f, "{id}"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Ascending,
	Descending,
}

/// Append-only log keyed by channel.
#[async_trait::async_trait]
pub trait MessageLog: Send + Sync {
	/// Append an entry under an auto-assigned, strictly increasing id.
	async fn append(&self, key: &str, fields: &[(&str, &[u8])]) -> Result<StreamId, LogError>;

	/// Entries with `start <= id <= end`, in `direction` order, at most `limit` of them.
	///
	/// `start` is always the low bound and `end` the high bound, whatever the direction.
	async fn range(
		&self,
		key: &str,
		start: RangeBound,
		end: RangeBound,
		direction: Direction,
		limit: Option<usize>,
	) -> Result<Vec<LogEntry>, LogError>;

	/// Entries strictly after `after`, waiting up to `timeout` for one to arrive.
	///
	/// `Ok(None)` means the wait timed out.
	async fn read_after(&self, key: &str, after: StreamId, timeout: Duration)
	-> Result<Option<Vec<LogEntry>>, LogError>;
}

/// Shared broker and log handles, constructed once and passed into every session.
#[derive(Clone)]
pub struct Backends {
	pub broker: Arc<dyn Broker>,
	pub log: Arc<dyn MessageLog>,
}

impl Backends {
	pub fn in_memory() -> Self {
		Self {
			broker: Arc::new(memory::MemoryBroker::default()),
			log: Arc::new(memory::MemoryLog::default()),
		}
	}

	pub async fn connect(settings: &BackendSettings) -> anyhow::Result<Self> {
		match settings.kind {
			BackendKind::Memory => {
				info!("using in-process broker and log (memory backend)");
				Ok(Self::in_memory())
			}
			BackendKind::Valkey => {
				let valkey = valkey::ValkeyBackend::connect(&settings.url)
					.await
					.with_context(|| format!("connect valkey at {}", settings.url))?;
				info!(url = %settings.url, "connected to valkey");
				let valkey = Arc::new(valkey);
				Ok(Self {
					broker: valkey.clone(),
					log: valkey,
				})
			}
		}
	}
}

impl fmt::Debug for Backends {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Backends").finish_non_exhaustive()
	}
}
