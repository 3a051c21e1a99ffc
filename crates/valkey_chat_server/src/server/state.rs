#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::Backends;
use crate::config::ServerConfig;
use crate::server::relay::Relay;

/// Process-wide state shared by every connection task.
pub struct AppState {
	pub relay: Relay,
	pub ws_path: String,
	pub max_frame_bytes: usize,
	pub max_channel_len: usize,
	next_conn_id: AtomicU64,
}

impl AppState {
	pub fn new(cfg: &ServerConfig, backends: Backends) -> Self {
		Self {
			relay: Relay::new(backends, cfg.relay.clone()),
			ws_path: cfg.server.ws_path.clone(),
			max_frame_bytes: cfg.server.max_frame_bytes,
			max_channel_len: cfg.relay.max_channel_len,
			next_conn_id: AtomicU64::new(1),
		}
	}

	/// Allocates the next connection id, starting at 1.
	pub fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}
}
