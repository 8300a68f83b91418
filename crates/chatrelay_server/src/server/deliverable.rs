#![forbid(unsafe_code)]

use bytes::Bytes;
use chatrelay_domain::{ChannelSet, IdentityId, MessageId};
use chatrelay_protocol::pb::{self, MessageType};
use chatrelay_protocol::{FramingError, encode_chat, encode_event};

use crate::server::connection::Binding;

/// Type-specific body of a routed message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
	Chat(pb::Chat),
	Event(pb::Event),
}

/// Authenticated, type-tagged message eligible for fan-out.
///
/// Author fields always come from the sending connection's binding; client-supplied
/// header values are never copied in.
#[derive(Debug, Clone, PartialEq)]
pub struct Deliverable {
	id: MessageId,
	author: IdentityId,
	author_hostname: String,
	targets: ChannelSet,
	payload: Payload,
}

impl Deliverable {
	pub fn new(binding: &Binding, targets: ChannelSet, payload: Payload) -> Self {
		Self {
			id: MessageId::new_v4(),
			author: binding.identity_id.clone(),
			author_hostname: binding.hostname.clone(),
			targets,
			payload,
		}
	}

	pub fn chat(binding: &Binding, targets: ChannelSet, chat: pb::Chat) -> Self {
		Self::new(binding, targets, Payload::Chat(chat))
	}

	pub fn event(binding: &Binding, targets: ChannelSet, event: pb::Event) -> Self {
		Self::new(binding, targets, Payload::Event(event))
	}

	pub fn id(&self) -> MessageId {
		self.id
	}

	pub fn author(&self) -> &IdentityId {
		&self.author
	}

	pub fn author_hostname(&self) -> &str {
		&self.author_hostname
	}

	/// Channels this message was published to.
	pub fn targets(&self) -> &ChannelSet {
		&self.targets
	}

	pub fn payload(&self) -> &Payload {
		&self.payload
	}

	pub fn kind(&self) -> MessageType {
		match self.payload {
			Payload::Chat(_) => MessageType::Chat,
			Payload::Event(_) => MessageType::Event,
		}
	}

	/// Text the content filter runs against.
	pub fn content(&self) -> &str {
		match &self.payload {
			Payload::Chat(c) => &c.message,
			Payload::Event(e) => &e.data,
		}
	}

	/// Encode as a complete wire frame for mailbox delivery.
	pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, FramingError> {
		let frame = match &self.payload {
			Payload::Chat(c) => encode_chat(self.author.as_str(), &self.author_hostname, c, max_frame_size)?,
			Payload::Event(e) => encode_event(self.author.as_str(), &self.author_hostname, e, max_frame_size)?,
		};
		Ok(Bytes::from(frame))
	}
}
