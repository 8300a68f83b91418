#![forbid(unsafe_code)]

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

use crate::framing::{FramingError, encode_frame};
use crate::pb::{self, AuthResponse, MessageType};

#[derive(Debug, Error)]
pub enum CodecError {
	#[error(transparent)]
	Framing(#[from] FramingError),

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("unexpected message type: expected={expected:?} got={got}")]
	UnexpectedType {
		expected: MessageType,
		got: i32,
	},
}

/// Common packet header; `body` is the cursor for the type-specific decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
	/// Raw declared type; may not be a known `MessageType`.
	pub kind: i32,
	pub sender_id: String,
	pub hostname: String,
	body: Bytes,
}

impl Header {
	/// Declared type if it is one this protocol knows.
	pub fn message_type(&self) -> Option<MessageType> {
		MessageType::try_from(self.kind).ok()
	}

	pub fn body(&self) -> &Bytes {
		&self.body
	}

	fn expect(&self, expected: MessageType) -> Result<(), CodecError> {
		if self.kind != expected as i32 {
			return Err(CodecError::UnexpectedType {
				expected,
				got: self.kind,
			});
		}
		Ok(())
	}
}

/// Decode the header of one frame payload (length prefix already stripped).
pub fn decode_header(payload: Bytes) -> Result<Header, CodecError> {
	let packet = pb::Packet::decode(payload)?;
	Ok(Header {
		kind: packet.kind,
		sender_id: packet.sender_id,
		hostname: packet.hostname,
		body: packet.body,
	})
}

pub fn decode_authenticate(header: &Header) -> Result<pb::Authenticate, CodecError> {
	header.expect(MessageType::Authenticate)?;
	Ok(pb::Authenticate::decode(header.body.clone())?)
}

pub fn decode_chat(header: &Header) -> Result<pb::Chat, CodecError> {
	header.expect(MessageType::Chat)?;
	Ok(pb::Chat::decode(header.body.clone())?)
}

pub fn decode_event(header: &Header) -> Result<pb::Event, CodecError> {
	header.expect(MessageType::Event)?;
	Ok(pb::Event::decode(header.body.clone())?)
}

/// Encode a full frame for `body` under the given header fields.
pub fn encode_packet<M: Message>(
	kind: MessageType,
	sender_id: &str,
	hostname: &str,
	body: &M,
	max_frame_size: usize,
) -> Result<Vec<u8>, FramingError> {
	let packet = pb::Packet {
		kind: kind as i32,
		sender_id: sender_id.to_string(),
		hostname: hostname.to_string(),
		body: Bytes::from(body.encode_to_vec()),
	};
	encode_frame(&packet, max_frame_size)
}

pub fn encode_auth_response(response: AuthResponse, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let body = pb::AuthenticateResponse {
		response: response as i32,
	};
	encode_packet(MessageType::AuthenticateResponse, "", "", &body, max_frame_size)
}

pub fn encode_chat(sender_id: &str, hostname: &str, chat: &pb::Chat, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	encode_packet(MessageType::Chat, sender_id, hostname, chat, max_frame_size)
}

pub fn encode_event(
	sender_id: &str,
	hostname: &str,
	event: &pb::Event,
	max_frame_size: usize,
) -> Result<Vec<u8>, FramingError> {
	encode_packet(MessageType::Event, sender_id, hostname, event, max_frame_size)
}

/// Client-side authentication request.
pub fn encode_authenticate(token: &str, hostname: &str, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let body = pb::Authenticate {
		token: token.to_string(),
		hostname: hostname.to_string(),
	};
	encode_packet(MessageType::Authenticate, "", "", &body, max_frame_size)
}

/// Decode an authentication response header+body in one step.
pub fn decode_auth_response(header: &Header) -> Result<AuthResponse, CodecError> {
	header.expect(MessageType::AuthenticateResponse)?;
	let body = pb::AuthenticateResponse::decode(header.body.clone())?;
	Ok(AuthResponse::try_from(body.response).unwrap_or(AuthResponse::Denied))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::framing::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer};

	fn single_frame(frame: &[u8]) -> Bytes {
		let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
		fb.extend(frame);
		fb.next_frame().expect("ok").expect("frame")
	}

	#[test]
	fn header_exposes_unknown_types_as_raw() {
		let packet = pb::Packet {
			kind: 42,
			sender_id: String::new(),
			hostname: String::new(),
			body: Bytes::new(),
		};
		let header = decode_header(Bytes::from(packet.encode_to_vec())).expect("header");
		assert_eq!(header.kind, 42);
		assert_eq!(header.message_type(), None);
	}

	#[test]
	fn typed_decode_checks_declared_type() {
		let chat = pb::Chat {
			message: "hi".into(),
			..Default::default()
		};
		let frame = encode_chat("tok1", "srvA", &chat, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let header = decode_header(single_frame(&frame)).expect("header");

		assert!(matches!(
			decode_event(&header),
			Err(CodecError::UnexpectedType {
				expected: MessageType::Event,
				got: 3
			})
		));
		assert_eq!(decode_chat(&header).expect("chat").message, "hi");
	}

	#[test]
	fn unknown_auth_response_reads_as_denied() {
		let frame = encode_packet(
			MessageType::AuthenticateResponse,
			"",
			"",
			&pb::AuthenticateResponse { response: 9 },
			DEFAULT_MAX_FRAME_SIZE,
		)
		.expect("encode");
		let header = decode_header(single_frame(&frame)).expect("header");
		assert_eq!(decode_auth_response(&header).expect("resp"), AuthResponse::Denied);
	}
}
