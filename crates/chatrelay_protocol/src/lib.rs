#![forbid(unsafe_code)]

pub mod codec;
pub mod framing;

/// Wire messages generated from `proto/chatrelay.proto`.
pub mod pb {
	include!(concat!(env!("OUT_DIR"), "/chatrelay.v1.rs"));
}

pub use codec::{
	CodecError, Header, decode_auth_response, decode_authenticate, decode_chat, decode_event, decode_header,
	encode_auth_response, encode_authenticate, encode_chat, encode_event, encode_packet,
};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, MAX_FRAME_SIZE_LIMIT, READ_CHUNK_SIZE, encode_frame};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version.
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
