#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use valkey_chat_server::backend::Backends;
use valkey_chat_server::backend::memory::{MemoryBroker, MemoryLog};
use valkey_chat_server::config::ServerConfig;
use valkey_chat_server::server::connection::serve;
use valkey_chat_server::server::state::AppState;

const GREETING: &str = "Say Hello!";
const TOPIC: &str = "chat/Channel/valkey";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("VALKEY_CHAT_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

async fn start_server() -> anyhow::Result<(SocketAddr, Arc<MemoryBroker>)> {
	init_test_logging();

	let broker = Arc::new(MemoryBroker::default());
	let backends = Backends {
		broker: broker.clone(),
		log: Arc::new(MemoryLog::default()),
	};

	let mut cfg = ServerConfig::default();
	cfg.relay.greeting = Some(GREETING.to_string());

	let listener = TcpListener::bind("127.0.0.1:0").await.context("bind test listener")?;
	let addr = listener.local_addr()?;
	let state = Arc::new(AppState::new(&cfg, backends));
	tokio::spawn(serve(listener, state));

	Ok((addr, broker))
}

async fn join(addr: SocketAddr, username: &str, channel: &str) -> anyhow::Result<Client> {
	let url = format!("ws://{addr}/api/chat?username={username}&channel={channel}");
	let (mut ws, _resp) = connect_async(url.as_str()).await.context("connect")?;
	let greeting = next_text(&mut ws).await?;
	if greeting != GREETING {
		return Err(anyhow!("expected greeting, got {greeting:?}"));
	}
	Ok(ws)
}

async fn next_text(ws: &mut Client) -> anyhow::Result<String> {
	loop {
		let msg = timeout(Duration::from_secs(2), ws.next())
			.await
			.context("timed out waiting for a frame")?
			.ok_or_else(|| anyhow!("connection closed"))??;
		match msg {
			Message::Text(text) => return Ok(text.as_str().to_owned()),
			Message::Ping(_) | Message::Pong(_) => continue,
			other => return Err(anyhow!("unexpected frame: {other:?}")),
		}
	}
}

#[tokio::test]
async fn hello_reaches_both_clients() -> anyhow::Result<()> {
	let (addr, _broker) = start_server().await?;

	let mut adam = join(addr, "Adam", "valkey").await?;
	let mut eve = join(addr, "Eve", "valkey").await?;

	adam.send(Message::text("Hello")).await?;

	assert_eq!(next_text(&mut eve).await?, "[Adam] - Hello");
	assert_eq!(next_text(&mut adam).await?, "[Adam] - Hello");
	Ok(())
}

#[tokio::test]
async fn late_joiner_gets_recent_history() -> anyhow::Result<()> {
	let (addr, _broker) = start_server().await?;

	let mut adam = join(addr, "Adam", "valkey").await?;
	adam.send(Message::text("Hello")).await?;
	assert_eq!(next_text(&mut adam).await?, "[Adam] - Hello");

	let mut bob = join(addr, "Bob", "valkey").await?;
	assert_eq!(next_text(&mut bob).await?, "[Adam] - Hello");

	let silent = timeout(Duration::from_millis(100), bob.next()).await;
	assert!(silent.is_err(), "history replayed twice: {silent:?}");
	Ok(())
}

#[tokio::test]
async fn missing_channel_is_refused() -> anyhow::Result<()> {
	let (addr, broker) = start_server().await?;

	match connect_async(format!("ws://{addr}/api/chat?username=Adam").as_str()).await {
		Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 400),
		Err(other) => panic!("unexpected error: {other:?}"),
		Ok(_) => panic!("upgrade should be refused"),
	}
	assert_eq!(broker.subscriber_count(TOPIC).await, 0);
	Ok(())
}

#[tokio::test]
async fn unknown_path_is_refused() -> anyhow::Result<()> {
	let (addr, _broker) = start_server().await?;

	match connect_async(format!("ws://{addr}/api/other?username=Adam&channel=valkey").as_str()).await {
		Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 404),
		Err(other) => panic!("unexpected error: {other:?}"),
		Ok(_) => panic!("upgrade should be refused"),
	}
	Ok(())
}

#[tokio::test]
async fn disconnect_releases_the_subscription() -> anyhow::Result<()> {
	let (addr, broker) = start_server().await?;

	let mut adam = join(addr, "Adam", "valkey").await?;
	assert_eq!(broker.subscriber_count(TOPIC).await, 1);

	adam.close(None).await?;
	drop(adam);

	timeout(Duration::from_secs(2), async {
		while broker.subscriber_count(TOPIC).await != 0 {
			sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.context("subscription still held after disconnect")?;
	Ok(())
}
