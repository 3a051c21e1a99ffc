#![forbid(unsafe_code)]

//! Per-session relay: one inbound duty that publishes what the client sends, one outbound duty
//! that forwards what the channel carries. Both run inside a single `select!`, so when either
//! finishes the other is dropped along with whatever it owns (the broker subscription, an
//! in-flight blocking read).

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use valkey_chat_domain::{ChannelIdentity, ChatMessage, LogEntry, StreamId, Username};
use valkey_chat_protocol::{Envelope, EnvelopeCodec, EnvelopeError};

use crate::backend::{Backends, BrokerError, Direction, LogError, RangeBound, Subscription};
use crate::config::{AppendFailurePolicy, RelayMode, RelaySettings};
use crate::server::backfill::{self, BackfillOutcome, HistoryRequest};
use crate::server::transport::{CLOSE_INTERNAL, CLOSE_NORMAL, CLOSE_TOO_BIG, Inbound, InboundFrame, Outbound, TransportError};

#[derive(Debug, Error)]
pub enum RelayError {
	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error(transparent)]
	Broker(#[from] BrokerError),

	#[error(transparent)]
	Log(#[from] LogError),

	#[error("envelope encode failed: {0}")]
	Encode(#[from] EnvelopeError),
}

impl RelayError {
	pub fn close_code(&self) -> u16 {
		match self {
			RelayError::Transport(TransportError::FrameTooLarge { .. }) => CLOSE_TOO_BIG,
			_ => CLOSE_INTERNAL,
		}
	}

	pub fn close_reason(&self) -> &'static str {
		match self {
			RelayError::Transport(TransportError::FrameTooLarge { .. }) => "frame too large",
			RelayError::Transport(TransportError::Connection(_)) => "transport error",
			RelayError::Broker(_) => "broker error",
			RelayError::Log(_) => "log error",
			RelayError::Encode(_) => "internal error",
		}
	}
}

/// One connected participant.
#[derive(Debug, Clone)]
pub struct Session {
	pub conn_id: u64,
	pub username: Username,
	pub channel: ChannelIdentity,
}

/// Renders an entry written in stream mode. Joins by `own_username` are hidden.
pub fn stream_entry_line(entry: &LogEntry, own_username: Option<&str>) -> Option<String> {
	let username = entry.field_str("username")?;
	match entry.field_str("action") {
		None | Some("message") => {
			let body = entry.field_str("message")?;
			Some(ChatMessage::new(username, body).render())
		}
		Some("joined") if own_username == Some(username) => None,
		Some("joined") => Some(format!("{username} joined")),
		Some("left") => Some(format!("{username} left")),
		Some(_) => None,
	}
}

#[derive(Debug, Clone, Copy)]
enum StreamAction {
	Joined,
	Message,
	Left,
}

impl StreamAction {
	fn as_str(self) -> &'static str {
		match self {
			StreamAction::Joined => "joined",
			StreamAction::Message => "message",
			StreamAction::Left => "left",
		}
	}
}

#[derive(Clone)]
pub struct Relay {
	backends: Backends,
	settings: RelaySettings,
	codec: EnvelopeCodec,
}

impl Relay {
	pub fn new(backends: Backends, settings: RelaySettings) -> Self {
		let codec = EnvelopeCodec::new(settings.encoding);
		Self {
			backends,
			settings,
			codec,
		}
	}

	/// Run a session to completion and close the transport with a code matching the outcome.
	pub async fn run_session(&self, session: &Session, mut inbound: Inbound, mut outbound: Outbound) -> Result<(), RelayError> {
		info!(
			conn_id = session.conn_id,
			username = %session.username,
			channel = %session.channel,
			mode = ?self.settings.mode,
			encoding = %self.codec.encoding(),
			"session started"
		);

		let result = match self.settings.mode {
			RelayMode::Pubsub => self.run_pubsub(session, &mut inbound, &mut outbound).await,
			RelayMode::Stream => self.run_stream(session, &mut inbound, &mut outbound).await,
		};

		match &result {
			Ok(()) => {
				outbound.close(CLOSE_NORMAL, "").await;
				info!(conn_id = session.conn_id, "session ended");
			}
			Err(e) => {
				outbound.close(e.close_code(), e.close_reason()).await;
				debug!(conn_id = session.conn_id, code = e.close_code(), "closed transport after session error");
			}
		}

		result
	}

	async fn run_pubsub(&self, session: &Session, inbound: &mut Inbound, outbound: &mut Outbound) -> Result<(), RelayError> {
		let topic = session.channel.pubsub_topic().to_string();

		// Announced before subscribing, so the joiner does not see their own join.
		if self.settings.announce_presence {
			self.publish_notice(&topic, format!("{} joined.", session.username)).await?;
		}

		// Subscribe before reading history: anything published from here on is queued on the
		// subscription while backfill runs.
		let subscription = self.backends.broker.subscribe(std::slice::from_ref(&topic)).await?;
		debug!(conn_id = session.conn_id, topics = ?subscription.topics(), "subscribed");

		self.write_greeting(outbound).await?;

		let replayed = if self.settings.persist_history {
			Some(self.backfill(session, outbound, backfill::chat_entry_line).await?)
		} else {
			None
		};

		let result = tokio::select! {
			res = self.publish_inbound(session, inbound) => res,
			res = self.forward_subscription(session, subscription, outbound, replayed) => res,
		};

		if self.settings.announce_presence
			&& let Err(e) = self.publish_notice(&topic, format!("{} left.", session.username)).await
		{
			warn!(conn_id = session.conn_id, error = %e, "failed to announce leave");
		}

		result
	}

	async fn run_stream(&self, session: &Session, inbound: &mut Inbound, outbound: &mut Outbound) -> Result<(), RelayError> {
		self.write_greeting(outbound).await?;

		let own = session.username.as_str();
		let outcome = self
			.backfill(session, outbound, |entry| stream_entry_line(entry, Some(own)))
			.await?;
		let resume_after = if self.settings.history_max_count == 0 {
			// No history wanted: tail only what is appended from now on.
			self.log_tip(session).await?
		} else {
			outcome
				.last_id
				.or_else(|| outcome.lower_bound.predecessor())
				.unwrap_or(StreamId::MIN)
		};

		self.append_action(session, StreamAction::Joined, None).await?;

		let result = tokio::select! {
			res = self.append_inbound(session, inbound) => res,
			res = self.tail_log(session, outbound, resume_after, own) => res,
		};

		if let Err(e) = self.append_action(session, StreamAction::Left, None).await {
			warn!(conn_id = session.conn_id, error = %e, "failed to record leave");
		}

		result
	}

	async fn write_greeting(&self, outbound: &mut Outbound) -> Result<(), RelayError> {
		if let Some(greeting) = &self.settings.greeting {
			outbound.write_text(greeting.clone()).await?;
		}
		Ok(())
	}

	async fn backfill<F>(&self, session: &Session, outbound: &mut Outbound, render: F) -> Result<BackfillOutcome, RelayError>
	where
		F: Fn(&LogEntry) -> Option<String>,
	{
		let request = HistoryRequest {
			log_key: session.channel.log_key(),
			window: self.settings.history_window,
			max_count: self.settings.history_max_count,
		};
		let outcome = backfill::replay(self.backends.log.as_ref(), request, render, outbound).await?;
		debug!(
			conn_id = session.conn_id,
			replayed = outcome.replayed,
			skipped = outcome.skipped,
			last_id = ?outcome.last_id,
			"history replayed"
		);
		Ok(outcome)
	}

	/// Newest id in the channel log, or `StreamId::MIN` when it is empty.
	async fn log_tip(&self, session: &Session) -> Result<StreamId, RelayError> {
		let newest = self
			.backends
			.log
			.range(session.channel.log_key(), RangeBound::Min, RangeBound::Max, Direction::Descending, Some(1))
			.await?;
		Ok(newest.first().map_or(StreamId::MIN, |entry| entry.id))
	}

	async fn publish_inbound(&self, session: &Session, inbound: &mut Inbound) -> Result<(), RelayError> {
		while let Some(frame) = inbound.next_frame().await {
			match frame? {
				InboundFrame::Text(body) => self.publish_chat(session, body).await?,
				InboundFrame::Binary(data) => {
					debug!(conn_id = session.conn_id, len = data.len(), "ignoring binary frame");
				}
				InboundFrame::Close => break,
			}
		}
		Ok(())
	}

	async fn publish_chat(&self, session: &Session, body: String) -> Result<(), RelayError> {
		let log_id = if self.settings.persist_history {
			let fields: [(&str, &[u8]); 2] = [
				("username", session.username.as_str().as_bytes()),
				("message", body.as_bytes()),
			];
			match self.backends.log.append(session.channel.log_key(), &fields).await {
				Ok(id) => Some(id),
				Err(e) => match self.settings.append_failure {
					AppendFailurePolicy::Ignore => {
						metrics::counter!("valkey_chat_log_append_failures_total").increment(1);
						warn!(conn_id = session.conn_id, error = %e, "history append failed; publishing anyway");
						None
					}
					AppendFailurePolicy::Fail => {
						metrics::counter!("valkey_chat_log_append_failures_total").increment(1);
						return Err(e.into());
					}
				},
			}
		} else {
			None
		};

		let envelope = Envelope::Chat {
			message: ChatMessage::new(session.username.as_str(), body),
			log_id,
		};
		let payload = self.codec.encode(&envelope)?;
		let delivered = self
			.backends
			.broker
			.publish(session.channel.pubsub_topic(), Bytes::from(payload))
			.await?;

		metrics::counter!("valkey_chat_messages_published_total").increment(1);
		debug!(conn_id = session.conn_id, delivered, "published chat message");
		Ok(())
	}

	async fn publish_notice(&self, topic: &str, text: String) -> Result<(), RelayError> {
		let payload = self.codec.encode(&Envelope::Notice(text))?;
		self.backends.broker.publish(topic, Bytes::from(payload)).await?;
		Ok(())
	}

	async fn forward_subscription(
		&self,
		session: &Session,
		mut subscription: Subscription,
		outbound: &mut Outbound,
		replayed: Option<BackfillOutcome>,
	) -> Result<(), RelayError> {
		loop {
			let Some(msg) = subscription.next_message().await else {
				return Err(BrokerError::SubscriptionClosed(session.channel.pubsub_topic().to_string()).into());
			};
			let msg = msg?;

			let envelope = match self.codec.decode(&msg.payload) {
				Ok(envelope) => envelope,
				Err(e) => {
					metrics::counter!("valkey_chat_envelope_decode_dropped_total").increment(1);
					debug!(conn_id = session.conn_id, topic = %msg.topic, error = %e, "dropping undecodable envelope");
					continue;
				}
			};

			// Already delivered by backfill.
			if let (Some(id), Some(replayed)) = (envelope.log_id(), replayed.as_ref())
				&& replayed.covers(id)
			{
				debug!(conn_id = session.conn_id, %id, "dropping live duplicate of replayed entry");
				continue;
			}

			outbound.write_text(envelope.render()).await?;
		}
	}

	async fn append_inbound(&self, session: &Session, inbound: &mut Inbound) -> Result<(), RelayError> {
		while let Some(frame) = inbound.next_frame().await {
			match frame? {
				InboundFrame::Text(body) => {
					self.append_action(session, StreamAction::Message, Some(&body)).await?;
					metrics::counter!("valkey_chat_messages_published_total").increment(1);
				}
				InboundFrame::Binary(data) => {
					debug!(conn_id = session.conn_id, len = data.len(), "ignoring binary frame");
				}
				InboundFrame::Close => break,
			}
		}
		Ok(())
	}

	async fn append_action(&self, session: &Session, action: StreamAction, body: Option<&str>) -> Result<StreamId, RelayError> {
		let mut fields: Vec<(&str, &[u8])> = vec![
			("username", session.username.as_str().as_bytes()),
			("action", action.as_str().as_bytes()),
		];
		if let Some(body) = body {
			fields.push(("message", body.as_bytes()));
		}
		Ok(self.backends.log.append(session.channel.log_key(), &fields).await?)
	}

	async fn tail_log(&self, session: &Session, outbound: &mut Outbound, mut after: StreamId, own: &str) -> Result<(), RelayError> {
		let key = session.channel.log_key();
		loop {
			let Some(batch) = self.backends.log.read_after(key, after, self.settings.read_block).await? else {
				continue;
			};

			for entry in batch {
				after = after.max(entry.id);
				match stream_entry_line(&entry, Some(own)) {
					Some(line) => outbound.write_text(line).await?,
					None => debug!(conn_id = session.conn_id, id = %entry.id, "skipping log entry"),
				}
			}
		}
	}
}
