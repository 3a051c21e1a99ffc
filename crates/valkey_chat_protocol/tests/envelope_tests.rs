use proptest::prelude::*;
use valkey_chat_domain::{ChatMessage, StreamId};
use valkey_chat_protocol::{Envelope, EnvelopeCodec, EnvelopeEncoding, EnvelopeError};

fn structured() -> EnvelopeCodec {
	EnvelopeCodec::new(EnvelopeEncoding::Structured)
}

fn plain() -> EnvelopeCodec {
	EnvelopeCodec::new(EnvelopeEncoding::Plain)
}

#[test]
fn plain_encoding_is_the_rendered_line() {
	let env = Envelope::chat(ChatMessage::new("Adam", "Hello"));
	let bytes = plain().encode(&env).expect("encode");
	assert_eq!(bytes, b"[Adam] - Hello");

	let decoded = plain().decode(&bytes).expect("decode");
	assert_eq!(decoded, Envelope::Preformatted("[Adam] - Hello".to_string()));
	assert_eq!(decoded.render(), env.render());
}

#[test]
fn plain_decode_rejects_invalid_utf8() {
	let err = plain().decode(&[0xc3, 0x28]).unwrap_err();
	assert!(matches!(err, EnvelopeError::Utf8(_)), "unexpected error: {err:?}");
}

#[test]
fn structured_carries_log_id() {
	let env = Envelope::Chat {
		message: ChatMessage::new("Eve", "hi"),
		log_id: Some(StreamId::new(1_700_000_000_000, 2)),
	};
	let bytes = structured().encode(&env).expect("encode");
	let decoded = structured().decode(&bytes).expect("decode");
	assert_eq!(decoded.log_id(), Some(StreamId::new(1_700_000_000_000, 2)));
	assert_eq!(decoded, env);
}

#[test]
fn structured_notice_renders_like_plain_notice() {
	let env = Envelope::Notice("Adam joined.".to_string());
	let s = structured().decode(&structured().encode(&env).expect("encode")).expect("decode");
	let p = plain().decode(&plain().encode(&env).expect("encode")).expect("decode");
	assert_eq!(s.render(), "Adam joined.");
	assert_eq!(p.render(), "Adam joined.");
}

#[test]
fn structured_decode_drops_wrong_shapes() {
	for payload in [
		&b"[Adam] - Hello"[..],
		&br#"{"username":"Adam"}"#[..],
		&br#"{"message":"Hello"}"#[..],
		&br#"{"username":"Adam","message":"Hello","id":"not-an-id"}"#[..],
		&br#"["Adam","Hello"]"#[..],
	] {
		let res = structured().decode(payload);
		assert!(res.is_err(), "expected decode failure for {:?}", String::from_utf8_lossy(payload));
	}
}

#[test]
fn structured_decode_tolerates_extra_fields() {
	let decoded = structured()
		.decode(br#"{"username":"Adam","message":"Hello","client":"web"}"#)
		.expect("decode");
	assert_eq!(decoded.render(), "[Adam] - Hello");
}

#[test]
fn mixed_encodings_do_not_silently_agree() {
	let bytes = structured()
		.encode(&Envelope::chat(ChatMessage::new("Adam", "Hello")))
		.expect("encode");
	let seen_by_plain = plain().decode(&bytes).expect("plain decode is a passthrough");
	assert_ne!(seen_by_plain.render(), "[Adam] - Hello");
}

proptest! {
	#[test]
	fn structured_round_trip(sender in "[^\\p{Cc}]{1,32}", body in any::<String>()) {
		let env = Envelope::chat(ChatMessage::new(sender, body));
		let bytes = structured().encode(&env).unwrap();
		prop_assert_eq!(structured().decode(&bytes).unwrap(), env);
	}
}
