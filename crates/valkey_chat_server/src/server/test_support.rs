#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use valkey_chat_domain::{ChannelIdentity, DEFAULT_MAX_CHANNEL_LEN, LogEntry, StreamId, Username};

use crate::backend::memory::{MemoryBroker, MemoryLog};
use crate::backend::{Backends, Broker, BrokerError, Direction, LogError, MessageLog, RangeBound, Subscription};
use crate::config::RelaySettings;
use crate::server::relay::{Relay, RelayError, Session};
use crate::server::transport::{Inbound, InboundFrame, Outbound, OutboundFrame, TransportError};

pub const GREETING: &str = "Say Hello!";

/// Relay settings that greet every client, so tests know when the subscription is live.
pub fn greeting_settings() -> RelaySettings {
	RelaySettings {
		greeting: Some(GREETING.to_string()),
		persist_history: false,
		read_block: Duration::from_millis(200),
		..RelaySettings::default()
	}
}

/// A log whose every call fails.
pub struct BrokenLog;

#[async_trait::async_trait]
impl MessageLog for BrokenLog {
	async fn append(&self, key: &str, _fields: &[(&str, &[u8])]) -> Result<StreamId, LogError> {
		Err(LogError::Append {
			key: key.to_string(),
			reason: "connection refused".to_string(),
		})
	}

	async fn range(
		&self,
		key: &str,
		_start: RangeBound,
		_end: RangeBound,
		_direction: Direction,
		_limit: Option<usize>,
	) -> Result<Vec<LogEntry>, LogError> {
		Err(LogError::Read {
			key: key.to_string(),
			reason: "connection refused".to_string(),
		})
	}

	async fn read_after(
		&self,
		key: &str,
		_after: StreamId,
		_timeout: Duration,
	) -> Result<Option<Vec<LogEntry>>, LogError> {
		Err(LogError::Read {
			key: key.to_string(),
			reason: "connection refused".to_string(),
		})
	}
}

/// A broker that refuses every subscription.
pub struct RefusingBroker;

#[async_trait::async_trait]
impl Broker for RefusingBroker {
	async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<u64, BrokerError> {
		Ok(0)
	}

	async fn subscribe(&self, _topics: &[String]) -> Result<Subscription, BrokerError> {
		Err(BrokerError::Unavailable("connection refused".to_string()))
	}
}

/// In-memory backends with the concrete handles kept for inspection.
pub struct Harness {
	pub broker: Arc<MemoryBroker>,
	pub log: Arc<MemoryLog>,
	pub relay: Relay,
}

impl Harness {
	pub fn new(settings: RelaySettings) -> Self {
		let broker = Arc::new(MemoryBroker::default());
		let log = Arc::new(MemoryLog::default());
		let backends = Backends {
			broker: broker.clone(),
			log: log.clone(),
		};
		Self {
			broker,
			log,
			relay: Relay::new(backends, settings),
		}
	}

	pub fn connect(&self, conn_id: u64, username: &str, channel: &str) -> TestClient {
		TestClient::spawn(self.relay.clone(), conn_id, username, channel, 1024)
	}
}

/// A scripted client driving one relay session over in-process channels.
pub struct TestClient {
	frames: mpsc::UnboundedSender<Result<InboundFrame, TransportError>>,
	written: mpsc::UnboundedReceiver<OutboundFrame>,
	pub task: JoinHandle<Result<(), RelayError>>,
}

impl TestClient {
	pub fn spawn(relay: Relay, conn_id: u64, username: &str, channel: &str, max_frame_bytes: usize) -> Self {
		let (frames_tx, frames_rx) = mpsc::unbounded();
		let (written_tx, written_rx) = mpsc::unbounded();

		let session = Session {
			conn_id,
			username: Username::new(username).expect("valid username"),
			channel: ChannelIdentity::derive(channel, DEFAULT_MAX_CHANNEL_LEN).expect("valid channel"),
		};
		let inbound = Inbound::new(frames_rx, max_frame_bytes);
		let outbound = Outbound::new(written_tx.sink_map_err(|e| TransportError::Connection(e.to_string())));

		let task = tokio::spawn(async move { relay.run_session(&session, inbound, outbound).await });

		Self {
			frames: frames_tx,
			written: written_rx,
			task,
		}
	}

	pub fn send(&self, text: &str) {
		self.frames
			.unbounded_send(Ok(InboundFrame::Text(text.to_string())))
			.expect("session still reading");
	}

	/// End the inbound side, as a client disconnect does.
	pub fn hang_up(&mut self) {
		self.frames.close_channel();
	}

	pub async fn next_frame(&mut self) -> OutboundFrame {
		timeout(Duration::from_secs(2), self.written.next())
			.await
			.expect("expected a frame within timeout")
			.expect("transport still open")
	}

	pub async fn next_text(&mut self) -> String {
		match self.next_frame().await {
			OutboundFrame::Text(text) => text,
			other => panic!("expected text frame, got {other:?}"),
		}
	}

	/// Wait for the greeting, which is written once the live subscription exists.
	pub async fn greeted(&mut self) {
		assert_eq!(self.next_text().await, GREETING);
	}

	pub async fn expect_silence(&mut self) {
		let got = timeout(Duration::from_millis(100), self.written.next()).await;
		assert!(got.is_err(), "unexpected frame: {got:?}");
	}
}
