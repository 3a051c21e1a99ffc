#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::{debug, warn};
use valkey_chat_domain::{ChatMessage, LogEntry, StreamId};

use crate::backend::{Direction, MessageLog, RangeBound};
use crate::server::transport::{Outbound, TransportError};
use crate::util::time::unix_ms_now;

/// Which slice of a channel log to replay on join.
#[derive(Debug, Clone, Copy)]
pub struct HistoryRequest<'a> {
	pub log_key: &'a str,
	pub window: Duration,
	pub max_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillOutcome {
	/// `now - window`, with sequence 0.
	pub lower_bound: StreamId,
	/// Oldest id read from the log, including entries that were skipped.
	pub first_id: Option<StreamId>,
	/// Newest id read from the log, including entries that were skipped.
	pub last_id: Option<StreamId>,
	pub replayed: usize,
	pub skipped: usize,
}

impl BackfillOutcome {
	/// Whether `id` lies in the slice this replay read. The slice is contiguous, so anything
	/// between the oldest and newest ids read was delivered (or skipped) here.
	pub fn covers(&self, id: StreamId) -> bool {
		match (self.first_id, self.last_id) {
			(Some(first), Some(last)) => first <= id && id <= last,
			_ => false,
		}
	}
}

/// Renders a `{username, message}` log entry; `None` when either field is missing.
pub fn chat_entry_line(entry: &LogEntry) -> Option<String> {
	let username = entry.field_str("username")?;
	let message = entry.field_str("message")?;
	Some(ChatMessage::new(username, message).render())
}

/// Replay recent history to `sink`, oldest first.
pub async fn replay<F>(
	log: &dyn MessageLog,
	request: HistoryRequest<'_>,
	render: F,
	sink: &mut Outbound,
) -> Result<BackfillOutcome, TransportError>
where
	F: Fn(&LogEntry) -> Option<String>,
{
	replay_at(log, request, unix_ms_now(), render, sink).await
}

/// `replay` against a fixed clock.
///
/// Log failures are not fatal: they are logged and the session proceeds with no history. Only
/// transport failures are returned.
pub async fn replay_at<F>(
	log: &dyn MessageLog,
	request: HistoryRequest<'_>,
	now_ms: u64,
	render: F,
	sink: &mut Outbound,
) -> Result<BackfillOutcome, TransportError>
where
	F: Fn(&LogEntry) -> Option<String>,
{
	let lower_bound = StreamId::lower_bound_for_window(now_ms, request.window);
	let mut outcome = BackfillOutcome {
		lower_bound,
		first_id: None,
		last_id: None,
		replayed: 0,
		skipped: 0,
	};

	if request.max_count == 0 {
		return Ok(outcome);
	}

	// Newest first so the count cap keeps the most recent entries.
	let mut entries = match log
		.range(
			request.log_key,
			RangeBound::Id(lower_bound),
			RangeBound::Max,
			Direction::Descending,
			Some(request.max_count),
		)
		.await
	{
		Ok(entries) => entries,
		Err(e) => {
			warn!(key = request.log_key, error = %e, "history read failed; continuing without history");
			return Ok(outcome);
		}
	};
	entries.reverse();
	outcome.first_id = entries.first().map(|entry| entry.id);

	for entry in &entries {
		outcome.last_id = Some(entry.id);
		match render(entry) {
			Some(line) => {
				sink.write_text(line).await?;
				outcome.replayed += 1;
			}
			None => outcome.skipped += 1,
		}
	}

	metrics::counter!("valkey_chat_history_replayed_total").increment(outcome.replayed as u64);
	if outcome.skipped > 0 {
		debug!(key = request.log_key, skipped = outcome.skipped, "skipped malformed history entries");
	}

	Ok(outcome)
}
