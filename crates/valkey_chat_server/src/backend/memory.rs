#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;
use valkey_chat_domain::{LogEntry, StreamId};

use crate::backend::{Broker, BrokerError, BrokerMessage, Direction, LogError, MessageLog, RangeBound, Subscription};
use crate::util::time::unix_ms_now;

/// In-process broker that fans each publish out to the topic's current subscribers.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
	inner: Arc<Mutex<BrokerInner>>,
	cfg: MemoryBrokerConfig,
}

/// Configuration for `MemoryBroker`.
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
	/// Maximum number of queued messages per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for MemoryBrokerConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

impl Default for MemoryBroker {
	fn default() -> Self {
		Self::new(MemoryBrokerConfig::default())
	}
}

#[derive(Debug, Default)]
struct BrokerInner {
	topics: HashMap<String, TopicEntry>,
}

#[derive(Debug, Default)]
struct TopicEntry {
	subscribers: Vec<mpsc::Sender<BrokerMessage>>,
}

impl MemoryBroker {
	pub fn new(cfg: MemoryBrokerConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(BrokerInner::default())),
			cfg,
		}
	}

	/// Number of live subscriptions on `topic`.
	pub async fn subscriber_count(&self, topic: &str) -> usize {
		let inner = self.inner.lock().await;
		inner
			.topics
			.get(topic)
			.map(|entry| entry.subscribers.iter().filter(|s| !s.is_closed()).count())
			.unwrap_or(0)
	}
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
	async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64, BrokerError> {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.topics.get_mut(topic) else {
			return Ok(0);
		};

		entry.subscribers.retain(|s| !s.is_closed());

		let msg = BrokerMessage {
			topic: topic.to_string(),
			payload,
		};

		let mut delivered: u64 = 0;
		let mut dropped: u64 = 0;
		for sub in &entry.subscribers {
			match sub.try_send(msg.clone()) {
				Ok(()) => delivered += 1,
				Err(mpsc::error::TrySendError::Full(_)) => dropped += 1,
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		if entry.subscribers.is_empty() {
			inner.topics.remove(topic);
		}

		if dropped > 0 {
			metrics::counter!("valkey_chat_memory_broker_dropped_total").increment(dropped);
			if self.cfg.debug_logs {
				debug!(topic, dropped, "memory broker: dropped due to full subscriber queues");
			}
		}

		Ok(delivered)
	}

	async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BrokerError> {
		if topics.is_empty() {
			return Err(BrokerError::Subscribe("no topics given".to_string()));
		}

		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		for topic in topics {
			let entry = inner.topics.entry(topic.clone()).or_default();
			entry.subscribers.retain(|s| !s.is_closed());
			entry.subscribers.push(tx.clone());

			if self.cfg.debug_logs {
				debug!(topic = %topic, subs = entry.subscribers.len(), "memory broker: subscribed");
			}
		}

		let messages = futures::stream::unfold(rx, |mut rx| async move {
			let msg = rx.recv().await?;
			Some((Ok(msg), rx))
		});

		Ok(Subscription::new(topics.to_vec(), messages))
	}
}

/// In-process append-only log with ms-seq ids.
#[derive(Debug, Default)]
pub struct MemoryLog {
	streams: Mutex<HashMap<String, Vec<LogEntry>>>,
	appended: Notify,
}

impl MemoryLog {
	/// Append under an explicit id, which must be above the current last id of `key`.
	pub async fn insert(&self, key: &str, id: StreamId, fields: &[(&str, &[u8])]) -> Result<(), LogError> {
		let mut streams = self.streams.lock().await;
		let entries = streams.entry(key.to_string()).or_default();
		if let Some(last) = entries.last().map(|e| e.id)
			&& id <= last
		{
			return Err(LogError::IdNotIncreasing {
				key: key.to_string(),
				id,
				last,
			});
		}

		entries.push(LogEntry::new(id, to_field_map(fields)));
		drop(streams);
		self.appended.notify_waiters();
		Ok(())
	}

	async fn entries_after(&self, key: &str, after: StreamId) -> Vec<LogEntry> {
		let streams = self.streams.lock().await;
		streams
			.get(key)
			.map(|entries| entries.iter().filter(|e| e.id > after).cloned().collect())
			.unwrap_or_default()
	}
}

fn to_field_map(fields: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
	fields.iter().map(|(k, v)| ((*k).to_string(), v.to_vec())).collect()
}

fn next_id(last: Option<StreamId>, now_ms: u64) -> StreamId {
	match last {
		Some(last) if last.ms >= now_ms => StreamId::new(last.ms, last.seq.saturating_add(1)),
		_ => StreamId::new(now_ms, 0),
	}
}

#[async_trait::async_trait]
impl MessageLog for MemoryLog {
	async fn append(&self, key: &str, fields: &[(&str, &[u8])]) -> Result<StreamId, LogError> {
		let mut streams = self.streams.lock().await;
		let entries = streams.entry(key.to_string()).or_default();
		let id = next_id(entries.last().map(|e| e.id), unix_ms_now());
		entries.push(LogEntry::new(id, to_field_map(fields)));
		drop(streams);
		self.appended.notify_waiters();
		Ok(id)
	}

	async fn range(
		&self,
		key: &str,
		start: RangeBound,
		end: RangeBound,
		direction: Direction,
		limit: Option<usize>,
	) -> Result<Vec<LogEntry>, LogError> {
		let streams = self.streams.lock().await;
		let Some(entries) = streams.get(key) else {
			return Ok(Vec::new());
		};

		let in_range = |e: &&LogEntry| start.admits_from_below(e.id) && end.admits_from_above(e.id);
		let limit = limit.unwrap_or(usize::MAX);
		let out = match direction {
			Direction::Ascending => entries.iter().filter(in_range).take(limit).cloned().collect(),
			Direction::Descending => entries.iter().rev().filter(in_range).take(limit).cloned().collect(),
		};
		Ok(out)
	}

	async fn read_after(
		&self,
		key: &str,
		after: StreamId,
		timeout: Duration,
	) -> Result<Option<Vec<LogEntry>>, LogError> {
		let deadline = Instant::now() + timeout;
		loop {
			let notified = self.appended.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			let fresh = self.entries_after(key, after).await;
			if !fresh.is_empty() {
				return Ok(Some(fresh));
			}

			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return Ok(None);
			}
		}
	}
}
