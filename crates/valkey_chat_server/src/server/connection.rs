#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};
use url::form_urlencoded;
use valkey_chat_domain::{ChannelIdentity, Username, ValidationError};

use crate::server::relay::Session;
use crate::server::state::AppState;
use crate::server::transport::{Inbound, Outbound};

/// Why an upgrade request was turned away before the handshake completed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpgradeRefusal {
	#[error("no chat endpoint at {0}")]
	NotFound(String),

	#[error(transparent)]
	Invalid(#[from] ValidationError),
}

impl UpgradeRefusal {
	pub fn status(&self) -> StatusCode {
		match self {
			UpgradeRefusal::NotFound(_) => StatusCode::NOT_FOUND,
			UpgradeRefusal::Invalid(_) => StatusCode::BAD_REQUEST,
		}
	}

	fn into_response(self) -> ErrorResponse {
		let mut resp = ErrorResponse::new(Some(self.to_string()));
		*resp.status_mut() = self.status();
		resp
	}
}

/// Validated upgrade parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
	pub username: Username,
	pub channel: ChannelIdentity,
}

/// Check the path and the `username` / `channel` query parameters of an upgrade request.
///
/// When a parameter is repeated, the first occurrence wins.
pub fn validate_upgrade(uri: &Uri, ws_path: &str, max_channel_len: usize) -> Result<SessionRequest, UpgradeRefusal> {
	if uri.path() != ws_path {
		return Err(UpgradeRefusal::NotFound(uri.path().to_string()));
	}

	let mut username = None;
	let mut channel = None;
	for (key, value) in form_urlencoded::parse(uri.query().unwrap_or("").as_bytes()) {
		match key.as_ref() {
			"username" if username.is_none() => username = Some(value.into_owned()),
			"channel" if channel.is_none() => channel = Some(value.into_owned()),
			_ => {}
		}
	}

	let username = Username::new(username.ok_or(ValidationError::MissingUsername)?)?;
	let channel = channel
		.filter(|c| !c.is_empty())
		.ok_or(ValidationError::MissingChannel)?;
	let channel = ChannelIdentity::derive(&channel, max_channel_len).map_err(ValidationError::from)?;

	Ok(SessionRequest { username, channel })
}

/// Accept loop. Each TCP connection is handled on its own task.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local address")?;
	info!(%local, path = %state.ws_path, "accepting websocket connections");

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				continue;
			}
		};

		let conn_id = state.next_conn_id();
		metrics::counter!("valkey_chat_connections_total").increment(1);

		let state = Arc::clone(&state);
		tokio::spawn(async move {
			debug!(conn_id, %remote, "accepted tcp connection");
			if let Err(e) = handle_connection(conn_id, stream, state).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

pub async fn handle_connection(conn_id: u64, stream: TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
	let mut accepted: Option<SessionRequest> = None;
	let mut refused: Option<UpgradeRefusal> = None;

	let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
		match validate_upgrade(req.uri(), &state.ws_path, state.max_channel_len) {
			Ok(request) => {
				accepted = Some(request);
				Ok(resp)
			}
			Err(refusal) => {
				refused = Some(refusal.clone());
				Err(refusal.into_response())
			}
		}
	};

	let ws_config = WebSocketConfig::default()
		.max_message_size(Some(state.max_frame_bytes))
		.max_frame_size(Some(state.max_frame_bytes));

	let handshake = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;

	if let Some(refusal) = refused {
		metrics::counter!("valkey_chat_sessions_refused_total").increment(1);
		info!(conn_id, reason = %refusal, "refused upgrade");
		return Ok(());
	}

	let ws = handshake.context("websocket handshake")?;
	let Some(request) = accepted else {
		return Err(anyhow::anyhow!("handshake completed without validated parameters"));
	};

	metrics::counter!("valkey_chat_sessions_accepted_total").increment(1);

	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("valkey_chat_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("valkey_chat_active_sessions").increment(1.0);
	let _session_guard = SessionGaugeGuard;

	let session = Session {
		conn_id,
		username: request.username,
		channel: request.channel,
	};

	let (sink, frames) = ws.split();
	let inbound = Inbound::from_websocket(frames, state.max_frame_bytes);
	let outbound = Outbound::from_websocket(sink);

	state
		.relay
		.run_session(&session, inbound, outbound)
		.await
		.with_context(|| format!("session {conn_id} on {}", session.channel))
}
