#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// Size of the fixed read buffer used by stream readers.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Length prefix size (u32, big endian).
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a u32 length prefix can describe.
pub const MAX_FRAME_SIZE_LIMIT: usize = u32::MAX as usize;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let prefix = u32::try_from(payload_len).map_err(|_| FramingError::FrameTooLarge {
		len: payload_len,
		max: MAX_FRAME_SIZE_LIMIT,
	})?;

	let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + payload_len);
	out.put_u32(prefix);
	msg.encode(&mut out)?;
	Ok(out)
}

fn peek_len(src: &[u8], max_frame_size: usize) -> Result<usize, FramingError> {
	if src.len() < LENGTH_PREFIX_LEN {
		return Err(FramingError::InsufficientData {
			need: LENGTH_PREFIX_LEN,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(len)
}

/// Reassembles length-prefixed frames from arbitrary stream reads.
///
/// A single transport read may carry a partial frame, exactly one frame, or several.
/// Bytes are appended with [`FrameBuffer::extend`] and complete payloads are taken
/// out with [`FrameBuffer::next_frame`] until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameBuffer {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameBuffer {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
			max_frame_size,
		}
	}

	pub fn extend(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Buffered bytes not yet returned as a frame.
	pub fn pending(&self) -> usize {
		self.buf.len()
	}

	/// Take the next complete frame payload (without its length prefix).
	///
	/// An oversized length prefix is unrecoverable: the stream cannot be resynchronised.
	pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
		let len = match peek_len(&self.buf, self.max_frame_size) {
			Ok(len) => len,
			Err(FramingError::InsufficientData { .. }) => return Ok(None),
			Err(e) => return Err(e),
		};

		if self.buf.len() < LENGTH_PREFIX_LEN + len {
			return Ok(None);
		}

		self.buf.advance(LENGTH_PREFIX_LEN);
		Ok(Some(self.buf.split_to(len).freeze()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	#[test]
	fn frame_buffer_waits_for_full_prefix_and_payload() {
		let msg = TestMsg {
			s: "hello".to_string(),
			n: 99,
		};
		let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
		fb.extend(&frame[..2]);
		assert!(fb.next_frame().expect("ok").is_none());

		fb.extend(&frame[2..6]);
		assert!(fb.next_frame().expect("ok").is_none());

		fb.extend(&frame[6..]);
		let payload = fb.next_frame().expect("ok").expect("frame");
		assert_eq!(TestMsg::decode(payload).expect("decode"), msg);
		assert_eq!(fb.pending(), 0);
	}

	#[test]
	fn frame_buffer_splits_coalesced_frames() {
		let a = encode_frame(&TestMsg { s: "a".into(), n: 1 }, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let b = encode_frame(&TestMsg { s: "b".into(), n: 2 }, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
		fb.extend(&[a.as_slice(), b.as_slice()].concat());

		let first = TestMsg::decode(fb.next_frame().expect("ok").expect("first")).expect("decode");
		let second = TestMsg::decode(fb.next_frame().expect("ok").expect("second")).expect("decode");
		assert_eq!(first.n, 1);
		assert_eq!(second.n, 2);
		assert!(fb.next_frame().expect("ok").is_none());
	}

	#[test]
	fn frame_buffer_rejects_oversized_prefix() {
		let mut fb = FrameBuffer::new(8);
		fb.extend(&9u32.to_be_bytes());
		assert!(matches!(fb.next_frame(), Err(FramingError::FrameTooLarge { len: 9, max: 8 })));
	}

	#[test]
	fn empty_payload_is_a_valid_frame() {
		let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
		fb.extend(&0u32.to_be_bytes());
		let payload = fb.next_frame().expect("ok").expect("frame");
		assert!(payload.is_empty());
	}
}
