#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use valkey_chat_protocol::version::ENVELOPE_SCHEMA;
use valkey_chat_server::backend::Backends;
use valkey_chat_server::config;
use valkey_chat_server::server::connection::serve;
use valkey_chat_server::server::health::{HealthState, spawn_health_server};
use valkey_chat_server::server::state::AppState;

/// WebSocket chat relay backed by Valkey pub/sub and streams.
#[derive(Debug, Parser)]
#[command(name = "valkey_chat", version)]
struct Cli {
	/// Address to bind the WebSocket listener to.
	#[arg(long, default_value = "127.0.0.1")]
	hostname: String,

	#[arg(long, default_value_t = 8080)]
	port: u16,

	/// Log level used when RUST_LOG is unset (trace, debug, info, warn, error).
	#[arg(long, env = "LOG_LEVEL")]
	log_level: Option<String>,

	/// Config file path. Defaults to ~/.valkey-chat/config.toml.
	#[arg(long)]
	config: Option<PathBuf>,
}

fn init_tracing(log_level: Option<&str>) {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match log_level {
		Some(level) => format!("{level},valkey_chat_server={level}"),
		None => "info,valkey_chat_server=debug".to_string(),
	});

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("valkey_chat");
				global::set_tracer_provider(tracer_provider);

				base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.log_level.as_deref());

	let config_path = match cli.config.clone() {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(
		path = %config_path.display(),
		mode = ?server_cfg.relay.mode,
		encoding = %server_cfg.relay.encoding,
		envelope_schema = ENVELOPE_SCHEMA,
		"loaded server config (toml + env overrides)"
	);

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let backends = Backends::connect(&server_cfg.backend).await?;
	health_state.mark_ready();

	let bind = format!("{}:{}", cli.hostname, cli.port);
	let listener = TcpListener::bind(&bind)
		.await
		.with_context(|| format!("bind websocket listener on {bind}"))?;

	let state = Arc::new(AppState::new(&server_cfg, backends));
	serve(listener, state).await
}
