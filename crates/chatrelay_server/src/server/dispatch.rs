#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use chatrelay_protocol::pb::MessageType;
use chatrelay_protocol::{decode_authenticate, decode_chat, decode_event, decode_header};
use tracing::{debug, warn};

use crate::server::connection::Connection;
use crate::server::deliverable::Deliverable;
use crate::server::relay::Relay;

/// What the receive loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
	Continue,
	Disconnect,
}

/// Decode one frame payload and route it to authentication or the router.
pub async fn handle_packet(relay: &Arc<Relay>, conn: &Arc<Connection>, payload: Bytes) -> Dispatch {
	let conn_id = conn.id();

	// Removed connections route nothing, including frames already buffered.
	if conn.is_closed() {
		debug!(conn_id, "dropping frame from closed connection");
		return Dispatch::Disconnect;
	}

	let header = match decode_header(payload) {
		Ok(header) => header,
		Err(e) if conn.is_authenticated() => return violation(conn_id, "undecodable packet header", &e),
		Err(e) => {
			debug!(conn_id, error = %e, "discarding undecodable frame from unauthenticated client");
			return Dispatch::Continue;
		}
	};

	let kind = header.message_type();

	if kind == Some(MessageType::Authenticate) {
		let request = match decode_authenticate(&header) {
			Ok(request) => request,
			Err(e) => {
				debug!(conn_id, error = %e, "undecodable authenticate body; treating as empty");
				Default::default()
			}
		};
		relay
			.authenticator()
			.authenticate(conn, &request.token, &request.hostname)
			.await;

		// The response itself may have overflowed the mailbox.
		if conn.is_closed() {
			return Dispatch::Disconnect;
		}
		return Dispatch::Continue;
	}

	let Some(binding) = conn.binding() else {
		debug!(conn_id, kind = header.kind, "discarding frame from unauthenticated client");
		return Dispatch::Continue;
	};

	let message = match kind {
		Some(MessageType::Chat) => match decode_chat(&header) {
			Ok(chat) => Deliverable::chat(binding, relay.target_channels(binding).await, chat),
			Err(e) => return violation(conn_id, "undecodable chat body", &e),
		},
		Some(MessageType::Event) => match decode_event(&header) {
			Ok(event) => Deliverable::event(binding, relay.target_channels(binding).await, event),
			Err(e) => return violation(conn_id, "undecodable event body", &e),
		},
		_ => {
			metrics::counter!("chatrelay_protocol_violations_total").increment(1);
			warn!(conn_id, kind = header.kind, identity = %binding.identity_id, "unexpected message type; disconnecting");
			return Dispatch::Disconnect;
		}
	};

	debug!(conn_id, message_id = %message.id(), kind = message.kind().as_str_name(), "submitting message to router");
	relay.submit(message).await;

	Dispatch::Continue
}

fn violation(conn_id: u64, reason: &str, error: &dyn std::fmt::Display) -> Dispatch {
	metrics::counter!("chatrelay_protocol_violations_total").increment(1);
	warn!(conn_id, error = %error, "{reason}; disconnecting");
	Dispatch::Disconnect
}

#[cfg(test)]
mod tests {
	use std::net::SocketAddr;
	use std::time::Duration;

	use chatrelay_protocol::pb;
	use chatrelay_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_authenticate, encode_chat};
	use tokio::time::timeout;

	use super::*;
	use crate::server::bridge::BridgeLink;
	use crate::server::filter::TermFilter;
	use crate::server::identity::InMemoryIdentityStore;
	use crate::server::relay::RelaySettings;

	fn payload(frame: Vec<u8>) -> Bytes {
		Bytes::from(frame).slice(4..)
	}

	fn chat_payload(text: &str) -> Bytes {
		let chat = pb::Chat {
			message: text.into(),
			..Default::default()
		};
		payload(encode_chat("spoofed", "spoofed", &chat, DEFAULT_MAX_FRAME_SIZE).expect("encode"))
	}

	#[tokio::test]
	async fn removed_connection_routes_nothing() {
		let (bridge, mut bridge_rx) = BridgeLink::channel(8);
		let (relay, _router) = Relay::start(
			RelaySettings::default(),
			Arc::new(InMemoryIdentityStore::new()),
			Arc::new(TermFilter::default()),
			bridge,
		);

		let addr: SocketAddr = "127.0.0.1:1".parse().expect("addr");
		let (conn, _mailbox) = Connection::new(relay.next_conn_id(), addr, 8);
		relay.registry().insert(Arc::clone(&conn)).await;

		let auth = payload(encode_authenticate("tok1", "srvA", DEFAULT_MAX_FRAME_SIZE).expect("encode"));
		assert_eq!(handle_packet(&relay, &conn, auth).await, Dispatch::Continue);

		assert_eq!(handle_packet(&relay, &conn, chat_payload("before")).await, Dispatch::Continue);
		let bridged = timeout(Duration::from_secs(2), bridge_rx.recv())
			.await
			.expect("bridged in time")
			.expect("bridge open");
		assert_eq!(bridged.content(), "before");

		assert!(relay.registry().remove(&conn).await);
		assert_eq!(handle_packet(&relay, &conn, chat_payload("after")).await, Dispatch::Disconnect);
		assert!(
			timeout(Duration::from_millis(200), bridge_rx.recv()).await.is_err(),
			"closed connection's frame reached the bridge"
		);
	}
}
