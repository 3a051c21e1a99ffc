#![forbid(unsafe_code)]

use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Message too big.
pub const CLOSE_TOO_BIG: u16 = 1009;
/// Internal error.
pub const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("frame of {len} bytes exceeds max {max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("connection error: {0}")]
	Connection(String),
}

impl TransportError {
	fn from_ws(err: tokio_tungstenite::tungstenite::Error) -> Self {
		use tokio_tungstenite::tungstenite::Error as WsError;
		use tokio_tungstenite::tungstenite::error::CapacityError;

		match err {
			WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
				TransportError::FrameTooLarge { len: size, max: max_size }
			}
			other => TransportError::Connection(other.to_string()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
	Text(String),
	Binary(Bytes),
	Close,
}

/// Inbound half of a client transport.
///
/// Single-pass: once it yields `Close`, an error, or `None`, every later call returns `None`.
pub struct Inbound {
	frames: BoxStream<'static, Result<InboundFrame, TransportError>>,
	max_frame_bytes: usize,
	finished: bool,
}

impl Inbound {
	pub fn new<S>(frames: S, max_frame_bytes: usize) -> Self
	where
		S: Stream<Item = Result<InboundFrame, TransportError>> + Send + 'static,
	{
		Self {
			frames: frames.boxed(),
			max_frame_bytes,
			finished: false,
		}
	}

	pub fn from_websocket<S>(stream: SplitStream<WebSocketStream<S>>, max_frame_bytes: usize) -> Self
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let frames = stream.filter_map(|msg| {
			future::ready(match msg {
				Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text.as_str().to_owned()))),
				Ok(Message::Binary(data)) => Some(Ok(InboundFrame::Binary(data))),
				Ok(Message::Close(_)) => Some(Ok(InboundFrame::Close)),
				Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
				Err(e) => Some(Err(TransportError::from_ws(e))),
			})
		});
		Self::new(frames, max_frame_bytes)
	}

	pub async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
		if self.finished {
			return None;
		}

		let item = self.frames.next().await;
		let item = match item {
			Some(Ok(InboundFrame::Text(text))) if text.len() > self.max_frame_bytes => {
				Some(Err(TransportError::FrameTooLarge {
					len: text.len(),
					max: self.max_frame_bytes,
				}))
			}
			Some(Ok(InboundFrame::Binary(data))) if data.len() > self.max_frame_bytes => {
				Some(Err(TransportError::FrameTooLarge {
					len: data.len(),
					max: self.max_frame_bytes,
				}))
			}
			other => other,
		};

		if matches!(item, None | Some(Err(_)) | Some(Ok(InboundFrame::Close))) {
			self.finished = true;
		}
		item
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
	Text(String),
	Close { code: u16, reason: String },
}

impl OutboundFrame {
	fn into_message(self) -> Message {
		match self {
			OutboundFrame::Text(text) => Message::text(text),
			OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
				code: CloseCode::from(code),
				reason: reason.into(),
			})),
		}
	}
}

type FrameSink = Pin<Box<dyn Sink<OutboundFrame, Error = TransportError> + Send>>;

/// Outbound half of a client transport. Owned by exactly one writer.
pub struct Outbound {
	sink: FrameSink,
	closed: bool,
}

impl Outbound {
	pub fn new<S>(sink: S) -> Self
	where
		S: Sink<OutboundFrame, Error = TransportError> + Send + 'static,
	{
		Self {
			sink: Box::pin(sink),
			closed: false,
		}
	}

	pub fn from_websocket<S>(sink: SplitSink<WebSocketStream<S>, Message>) -> Self
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let sink = sink
			.sink_map_err(TransportError::from_ws)
			.with(|frame: OutboundFrame| future::ready(Ok::<_, TransportError>(frame.into_message())));
		Self::new(sink)
	}

	pub async fn write_text(&mut self, body: String) -> Result<(), TransportError> {
		if self.closed {
			return Err(TransportError::Connection("transport already closed".to_string()));
		}
		self.sink.send(OutboundFrame::Text(body)).await
	}

	/// Send a close frame and flush. Failures are logged, not returned; the peer may already be gone.
	pub async fn close(&mut self, code: u16, reason: &str) {
		if self.closed {
			return;
		}
		self.closed = true;

		let frame = OutboundFrame::Close {
			code,
			reason: reason.to_string(),
		};
		if let Err(e) = self.sink.send(frame).await {
			debug!(code, error = %e, "close frame not delivered");
		}
		if let Err(e) = self.sink.close().await {
			debug!(error = %e, "transport close failed");
		}
	}
}
