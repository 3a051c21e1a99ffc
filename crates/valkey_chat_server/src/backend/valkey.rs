#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId as RedisStreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use valkey_chat_domain::{LogEntry, StreamId};

use crate::backend::{Broker, BrokerError, BrokerMessage, Direction, LogError, MessageLog, RangeBound, Subscription};

/// Extra client-side allowance on top of a server-side `BLOCK` before a read counts as hung.
const BLOCKING_READ_GRACE: Duration = Duration::from_secs(5);

/// Valkey (or Redis) backed broker and stream log.
///
/// Plain commands share one auto-reconnecting multiplexed connection. Each subscription and each
/// blocking read gets a connection of its own, since both hold the connection server-side.
#[derive(Clone)]
pub struct ValkeyBackend {
	client: redis::Client,
	manager: ConnectionManager,
}

impl ValkeyBackend {
	pub async fn connect(url: &str) -> Result<Self, BrokerError> {
		let client = redis::Client::open(url).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
		let manager = ConnectionManager::new(client.clone())
			.await
			.map_err(|e| BrokerError::Unavailable(e.to_string()))?;
		Ok(Self { client, manager })
	}
}

fn convert_entry(raw: RedisStreamId) -> Result<LogEntry, LogError> {
	let id = raw
		.id
		.parse::<StreamId>()
		.map_err(|_| LogError::MalformedId(raw.id.clone()))?;

	let fields: HashMap<String, Vec<u8>> = raw
		.map
		.into_iter()
		.filter_map(|(k, v)| redis::from_redis_value::<Vec<u8>>(&v).ok().map(|bytes| (k, bytes)))
		.collect();

	Ok(LogEntry::new(id, fields))
}

fn convert_entries(raw: Vec<RedisStreamId>) -> Result<Vec<LogEntry>, LogError> {
	raw.into_iter().map(convert_entry).collect()
}

#[async_trait::async_trait]
impl Broker for ValkeyBackend {
	async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64, BrokerError> {
		let mut conn = self.manager.clone();
		let delivered: u64 = conn
			.publish(topic, payload.as_ref())
			.await
			.map_err(|e| BrokerError::Publish {
				topic: topic.to_string(),
				reason: e.to_string(),
			})?;
		Ok(delivered)
	}

	async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BrokerError> {
		let mut pubsub = self
			.client
			.get_async_pubsub()
			.await
			.map_err(|e| BrokerError::Unavailable(e.to_string()))?;

		for topic in topics {
			pubsub
				.subscribe(topic)
				.await
				.map_err(|e| BrokerError::Subscribe(format!("{topic}: {e}")))?;
		}

		let messages = pubsub.into_on_message().map(|msg| {
			Ok(BrokerMessage {
				topic: msg.get_channel_name().to_string(),
				payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
			})
		});

		Ok(Subscription::new(topics.to_vec(), messages))
	}
}

#[async_trait::async_trait]
impl MessageLog for ValkeyBackend {
	async fn append(&self, key: &str, fields: &[(&str, &[u8])]) -> Result<StreamId, LogError> {
		let mut conn = self.manager.clone();
		let id: String = conn.xadd(key, "*", fields).await.map_err(|e| LogError::Append {
			key: key.to_string(),
			reason: e.to_string(),
		})?;
		id.parse::<StreamId>().map_err(|_| LogError::MalformedId(id.clone()))
	}

	async fn range(
		&self,
		key: &str,
		start: RangeBound,
		end: RangeBound,
		direction: Direction,
		limit: Option<usize>,
	) -> Result<Vec<LogEntry>, LogError> {
		let mut conn = self.manager.clone();
		let (start, end) = (start.to_string(), end.to_string());

		let reply: redis::RedisResult<StreamRangeReply> = match (direction, limit) {
			(Direction::Ascending, Some(count)) => conn.xrange_count(key, start, end, count).await,
			(Direction::Ascending, None) => conn.xrange(key, start, end).await,
			(Direction::Descending, Some(count)) => conn.xrevrange_count(key, end, start, count).await,
			(Direction::Descending, None) => conn.xrevrange(key, end, start).await,
		};

		let reply = reply.map_err(|e| LogError::Read {
			key: key.to_string(),
			reason: e.to_string(),
		})?;
		convert_entries(reply.ids)
	}

	async fn read_after(
		&self,
		key: &str,
		after: StreamId,
		timeout: Duration,
	) -> Result<Option<Vec<LogEntry>>, LogError> {
		let read_err = |reason: String| LogError::Read {
			key: key.to_string(),
			reason,
		};

		let mut conn = self
			.client
			.get_multiplexed_async_connection()
			.await
			.map_err(|e| LogError::Unavailable(e.to_string()))?;

		// BLOCK 0 would wait forever.
		let block_ms = usize::try_from(timeout.as_millis()).unwrap_or(usize::MAX).max(1);
		let opts = StreamReadOptions::default().block(block_ms);
		let keys = [key];
		let ids = [after.to_string()];

		let reply: Option<StreamReadReply> =
			tokio::time::timeout(timeout + BLOCKING_READ_GRACE, conn.xread_options(&keys, &ids, &opts))
				.await
				.map_err(|_| read_err("blocking read did not return in time".to_string()))?
				.map_err(|e| read_err(e.to_string()))?;

		let Some(reply) = reply else {
			return Ok(None);
		};

		let mut out = Vec::new();
		for stream in reply.keys {
			out.extend(convert_entries(stream.ids)?);
		}

		if out.is_empty() { Ok(None) } else { Ok(Some(out)) }
	}
}
