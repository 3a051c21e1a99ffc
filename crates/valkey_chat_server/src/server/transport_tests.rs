#![forbid(unsafe_code)]

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

use crate::server::transport::{Inbound, InboundFrame, Outbound, OutboundFrame, TransportError};

fn inbound_from(frames: Vec<Result<InboundFrame, TransportError>>, max: usize) -> Inbound {
	Inbound::new(futures::stream::iter(frames), max)
}

#[tokio::test]
async fn inbound_is_single_pass_after_close() {
	let mut inbound = inbound_from(
		vec![
			Ok(InboundFrame::Text("one".to_string())),
			Ok(InboundFrame::Close),
			Ok(InboundFrame::Text("after close".to_string())),
		],
		64,
	);

	assert_eq!(inbound.next_frame().await.unwrap().unwrap(), InboundFrame::Text("one".to_string()));
	assert_eq!(inbound.next_frame().await.unwrap().unwrap(), InboundFrame::Close);
	assert!(inbound.next_frame().await.is_none());
	assert!(inbound.next_frame().await.is_none());
}

#[tokio::test]
async fn inbound_rejects_oversized_frames_and_stops() {
	let mut inbound = inbound_from(
		vec![
			Ok(InboundFrame::Text("x".repeat(9))),
			Ok(InboundFrame::Text("ok".to_string())),
		],
		8,
	);

	let err = inbound.next_frame().await.unwrap().unwrap_err();
	assert!(matches!(err, TransportError::FrameTooLarge { len: 9, max: 8 }), "unexpected: {err:?}");
	assert!(inbound.next_frame().await.is_none());
}

#[tokio::test]
async fn inbound_passes_binary_frames_through() {
	let mut inbound = inbound_from(vec![Ok(InboundFrame::Binary(bytes::Bytes::from_static(b"\x00\x01")))], 8);
	assert!(matches!(inbound.next_frame().await, Some(Ok(InboundFrame::Binary(_)))));
	assert!(inbound.next_frame().await.is_none());
}

#[tokio::test]
async fn outbound_close_is_sent_once_and_blocks_later_writes() {
	let (tx, mut rx) = mpsc::unbounded::<OutboundFrame>();
	let mut outbound = Outbound::new(tx.sink_map_err(|e| TransportError::Connection(e.to_string())));

	outbound.write_text("hi".to_string()).await.expect("write");
	outbound.close(1000, "bye").await;
	outbound.close(1011, "again").await;
	assert!(outbound.write_text("late".to_string()).await.is_err());

	assert_eq!(rx.next().await, Some(OutboundFrame::Text("hi".to_string())));
	assert_eq!(
		rx.next().await,
		Some(OutboundFrame::Close {
			code: 1000,
			reason: "bye".to_string()
		})
	);
	assert_eq!(rx.next().await, None);
}
