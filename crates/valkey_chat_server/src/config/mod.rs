#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use valkey_chat_domain::DEFAULT_MAX_CHANNEL_LEN;
use valkey_chat_protocol::EnvelopeEncoding;

/// Default config path: `~/.valkey-chat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".valkey-chat").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub backend: BackendSettings,
	pub relay: RelaySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Path that accepts WebSocket upgrades.
	pub ws_path: String,
	/// Largest inbound WebSocket frame/message accepted, in bytes.
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			ws_path: "/api/chat".to_string(),
			max_frame_bytes: 1_000_000,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
	#[default]
	Valkey,
	Memory,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
	pub kind: BackendKind,
	/// Connection URL (`redis://host:port`), used by the `valkey` kind.
	pub url: String,
}

impl Default for BackendSettings {
	fn default() -> Self {
		Self {
			kind: BackendKind::Valkey,
			url: "redis://127.0.0.1:6379".to_string(),
		}
	}
}

/// Which path carries live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
	/// Publish/subscribe on the channel topic, with the log as optional history.
	#[default]
	Pubsub,
	/// Append to and tail the channel log; the broker is unused.
	Stream,
}

/// What a failed history append does to the session (pub/sub mode only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendFailurePolicy {
	/// Warn, count, and publish anyway.
	#[default]
	Ignore,
	/// End the session with a log error.
	Fail,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub mode: RelayMode,
	pub encoding: EnvelopeEncoding,
	/// Append every chat message to the channel log and replay it on join (pub/sub mode).
	pub persist_history: bool,
	pub history_window: Duration,
	pub history_max_count: usize,
	/// Publish `"<user> joined."` / `"<user> left."` notices (pub/sub mode).
	pub announce_presence: bool,
	/// Line written to each client before history.
	pub greeting: Option<String>,
	pub append_failure: AppendFailurePolicy,
	/// Upper bound on each blocking log read (stream mode).
	pub read_block: Duration,
	pub max_channel_len: usize,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			mode: RelayMode::Pubsub,
			encoding: EnvelopeEncoding::Structured,
			persist_history: true,
			history_window: Duration::from_secs(600),
			history_max_count: 200,
			announce_presence: false,
			greeting: None,
			append_failure: AppendFailurePolicy::Ignore,
			read_block: Duration::from_secs(10),
			max_channel_len: DEFAULT_MAX_CHANNEL_LEN,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	backend: FileBackendSettings,

	#[serde(default)]
	relay: FileRelaySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	ws_path: Option<String>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackendSettings {
	kind: Option<BackendKind>,
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	mode: Option<RelayMode>,
	encoding: Option<EnvelopeEncoding>,
	persist_history: Option<bool>,
	history_window_secs: Option<u64>,
	history_max_count: Option<usize>,
	announce_presence: Option<bool>,
	greeting: Option<String>,
	append_failure: Option<AppendFailurePolicy>,
	read_block_ms: Option<u64>,
	max_channel_len: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let server_defaults = ServerSettings::default();
		let backend_defaults = BackendSettings::default();
		let relay_defaults = RelaySettings::default();

		let ws_path = file
			.server
			.ws_path
			.filter(|s| !s.trim().is_empty())
			.unwrap_or(server_defaults.ws_path);
		if !ws_path.starts_with('/') {
			return Err(anyhow!("server.ws_path must start with '/': {ws_path}"));
		}

		let max_channel_len = file.relay.max_channel_len.unwrap_or(relay_defaults.max_channel_len);
		if max_channel_len == 0 {
			return Err(anyhow!("relay.max_channel_len must be positive"));
		}

		Ok(Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				ws_path,
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|v| *v > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
			},
			backend: BackendSettings {
				kind: file.backend.kind.unwrap_or(backend_defaults.kind),
				url: file
					.backend
					.url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(backend_defaults.url),
			},
			relay: RelaySettings {
				mode: file.relay.mode.unwrap_or(relay_defaults.mode),
				encoding: file.relay.encoding.unwrap_or(relay_defaults.encoding),
				persist_history: file.relay.persist_history.unwrap_or(relay_defaults.persist_history),
				history_window: file
					.relay
					.history_window_secs
					.map(Duration::from_secs)
					.unwrap_or(relay_defaults.history_window),
				history_max_count: file.relay.history_max_count.unwrap_or(relay_defaults.history_max_count),
				announce_presence: file.relay.announce_presence.unwrap_or(relay_defaults.announce_presence),
				greeting: file.relay.greeting.filter(|s| !s.is_empty()),
				append_failure: file.relay.append_failure.unwrap_or(relay_defaults.append_failure),
				read_block: file
					.relay
					.read_block_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(relay_defaults.read_block),
				max_channel_len,
			},
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("VALKEY_CHAT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_BACKEND") {
		let kind = match v.trim().to_ascii_lowercase().as_str() {
			"valkey" | "redis" => Some(BackendKind::Valkey),
			"memory" => Some(BackendKind::Memory),
			_ => None,
		};
		match kind {
			Some(kind) => {
				cfg.backend.kind = kind;
				info!(?kind, "backend config: kind overridden by env");
			}
			None => warn!(value = %v, "backend config: unknown VALKEY_CHAT_BACKEND; ignoring"),
		}
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_VALKEY_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.backend.url = v;
			info!("backend config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_ENCODING") {
		match v.parse::<EnvelopeEncoding>() {
			Ok(encoding) => {
				cfg.relay.encoding = encoding;
				info!(%encoding, "relay config: encoding overridden by env");
			}
			Err(e) => warn!(error = %e, "relay config: invalid VALKEY_CHAT_ENCODING; ignoring"),
		}
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_PERSIST_HISTORY")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.relay.persist_history = enabled;
		info!(enabled, "relay config: persist_history overridden by env");
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_HISTORY_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.relay.history_window = Duration::from_secs(secs);
		info!(secs, "relay config: history_window overridden by env");
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_HISTORY_MAX_COUNT")
		&& let Ok(count) = v.trim().parse::<usize>()
	{
		cfg.relay.history_max_count = count;
		info!(count, "relay config: history_max_count overridden by env");
	}

	if let Ok(v) = std::env::var("VALKEY_CHAT_ANNOUNCE_PRESENCE")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.relay.announce_presence = enabled;
		info!(enabled, "relay config: announce_presence overridden by env");
	}

	if cfg.relay.mode == RelayMode::Stream && !cfg.relay.persist_history {
		warn!("relay config: persist_history=false has no effect in stream mode (the log is the live path)");
	}

	if cfg.relay.mode == RelayMode::Stream && cfg.relay.announce_presence {
		info!("relay config: stream mode records joins/leaves in the log; announce_presence is ignored");
	}
}
