#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chatrelay_domain::IdentityId;
use chatrelay_protocol::{FrameBuffer, READ_CHUNK_SIZE};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::dispatch::{Dispatch, handle_packet};
use crate::server::relay::Relay;

/// Identity bound to a connection by a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
	pub identity_id: IdentityId,
	pub hostname: String,
}

/// Why a mailbox enqueue did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
	/// The send loop is behind and the queue is at capacity.
	Full,
	/// The mailbox was closed by removal.
	Closed,
}

/// Bounded outbound queue of encoded frames.
///
/// Producers only ever `try_enqueue`; the single consumer is the connection's send loop.
/// Closing drops the sender so the consumer observes end-of-stream.
#[derive(Debug)]
pub struct Mailbox {
	tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl Mailbox {
	pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self { tx: Mutex::new(Some(tx)) }, rx)
	}

	pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
		let guard = self.tx.lock();
		let Some(tx) = guard.as_ref() else {
			return Err(EnqueueError::Closed);
		};
		tx.try_send(frame).map_err(|e| match e {
			mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
			mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
		})
	}

	/// Returns `true` if this call closed an open mailbox.
	pub fn close(&self) -> bool {
		self.tx.lock().take().is_some()
	}

	#[cfg(test)]
	pub fn is_closed(&self) -> bool {
		self.tx.lock().as_ref().is_none_or(|tx| tx.is_closed())
	}
}

/// One accepted client: outbound mailbox, identity binding and close signal.
///
/// The transport itself is split between the receive and send loops, which
/// each own their half exclusively.
#[derive(Debug)]
pub struct Connection {
	id: u64,
	remote: SocketAddr,
	mailbox: Mailbox,
	binding: OnceLock<Binding>,
	closed: watch::Sender<bool>,
}

impl Connection {
	/// Build a connection and the receiving end of its mailbox.
	pub fn new(id: u64, remote: SocketAddr, mailbox_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
		let (mailbox, rx) = Mailbox::channel(mailbox_capacity);
		let (closed, _) = watch::channel(false);
		let conn = Arc::new(Self {
			id,
			remote,
			mailbox,
			binding: OnceLock::new(),
			closed,
		});
		(conn, rx)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	pub fn mailbox(&self) -> &Mailbox {
		&self.mailbox
	}

	pub fn binding(&self) -> Option<&Binding> {
		self.binding.get()
	}

	pub fn is_authenticated(&self) -> bool {
		self.binding.get().is_some()
	}

	/// Bind an identity. A connection is bound at most once; the existing binding wins.
	pub fn bind(&self, binding: Binding) -> Result<(), Binding> {
		self.binding.set(binding)
	}

	/// Close the mailbox and signal both loops to stop. Idempotent.
	pub fn close(&self) {
		self.mailbox.close();
		self.closed.send_replace(true);
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.borrow()
	}

	fn closed_signal(&self) -> watch::Receiver<bool> {
		self.closed.subscribe()
	}
}

/// Register an accepted stream and start its receive and send loops.
pub async fn spawn_connection(relay: &Arc<Relay>, stream: TcpStream, remote: SocketAddr) -> Arc<Connection> {
	if let Err(e) = stream.set_nodelay(true) {
		debug!(%remote, error = %e, "failed to set TCP_NODELAY");
	}

	let conn_id = relay.next_conn_id();
	let (conn, mailbox_rx) = Connection::new(conn_id, remote, relay.settings().mailbox_capacity);
	relay.registry().insert(Arc::clone(&conn)).await;

	metrics::counter!("chatrelay_connections_total").increment(1);
	info!(conn_id, %remote, "a client connected");

	let (reader, writer) = stream.into_split();

	tokio::spawn(receive_loop(Arc::clone(relay), Arc::clone(&conn), reader));
	tokio::spawn(send_loop(Arc::clone(relay), Arc::clone(&conn), writer, mailbox_rx));

	conn
}

async fn receive_loop(relay: Arc<Relay>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
	let conn_id = conn.id();
	let mut frames = FrameBuffer::new(relay.settings().max_frame_bytes);
	let mut chunk = [0u8; READ_CHUNK_SIZE];
	let mut closed = conn.closed_signal();

	'read: loop {
		let n = tokio::select! {
			biased;
			_ = closed.wait_for(|c| *c) => {
				debug!(conn_id, "receive loop stopping (connection closed)");
				break 'read;
			}
			res = reader.read(&mut chunk) => match res {
				Ok(0) => {
					info!(conn_id, "client disconnected");
					break 'read;
				}
				Ok(n) => n,
				Err(e) => {
					debug!(conn_id, error = %e, "client read failed");
					break 'read;
				}
			},
		};

		frames.extend(&chunk[..n]);

		loop {
			match frames.next_frame() {
				Ok(Some(payload)) => {
					metrics::counter!("chatrelay_frames_in_total").increment(1);
					if handle_packet(&relay, &conn, payload).await == Dispatch::Disconnect {
						break 'read;
					}
				}
				Ok(None) => break,
				Err(e) => {
					metrics::counter!("chatrelay_protocol_violations_total").increment(1);
					warn!(conn_id, error = %e, "unrecoverable framing error; disconnecting");
					break 'read;
				}
			}
		}
	}

	if frames.pending() > 0 {
		debug!(conn_id, discarded = frames.pending(), "dropping partial frame bytes");
	}
	relay.registry().remove(&conn).await;
}

async fn send_loop(relay: Arc<Relay>, conn: Arc<Connection>, mut writer: OwnedWriteHalf, mut mailbox: mpsc::Receiver<Bytes>) {
	let conn_id = conn.id();
	let mut closed = conn.closed_signal();

	loop {
		let frame = tokio::select! {
			biased;
			_ = closed.wait_for(|c| *c) => break,
			frame = mailbox.recv() => match frame {
				Some(frame) => frame,
				None => break,
			},
		};

		let written = tokio::select! {
			biased;
			_ = closed.wait_for(|c| *c) => break,
			res = writer.write_all(&frame) => res,
		};

		if let Err(e) = written {
			debug!(conn_id, error = %e, "client write failed");
			relay.registry().remove(&conn).await;
			break;
		}
	}

	if let Err(e) = writer.shutdown().await {
		debug!(conn_id, error = %e, "transport shutdown failed");
	}
	debug!(conn_id, "send loop exited");
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr() -> SocketAddr {
		"127.0.0.1:1".parse().expect("addr")
	}

	fn binding(id: &str) -> Binding {
		Binding {
			identity_id: IdentityId::new(id).expect("id"),
			hostname: "srv".to_string(),
		}
	}

	#[test]
	fn mailbox_reports_full_then_closed() {
		let (conn, _rx) = Connection::new(1, addr(), 1);
		assert_eq!(conn.mailbox().try_enqueue(Bytes::from_static(b"a")), Ok(()));
		assert_eq!(conn.mailbox().try_enqueue(Bytes::from_static(b"b")), Err(EnqueueError::Full));

		conn.close();
		assert!(conn.is_closed());
		assert!(conn.mailbox().is_closed());
		assert_eq!(conn.mailbox().try_enqueue(Bytes::from_static(b"c")), Err(EnqueueError::Closed));
	}

	#[tokio::test]
	async fn closing_mailbox_ends_consumer_after_queued_frames() {
		let (conn, mut rx) = Connection::new(1, addr(), 4);
		conn.mailbox().try_enqueue(Bytes::from_static(b"a")).expect("enqueue");
		assert!(conn.mailbox().close());
		assert!(!conn.mailbox().close(), "second close is a no-op");

		assert_eq!(rx.recv().await.as_deref(), Some(&b"a"[..]));
		assert!(rx.recv().await.is_none());
	}

	#[test]
	fn binding_is_set_once() {
		let (conn, _rx) = Connection::new(1, addr(), 1);
		assert!(!conn.is_authenticated());

		conn.bind(binding("tok1")).expect("first bind");
		assert!(conn.bind(binding("tok2")).is_err());
		assert_eq!(conn.binding().map(|b| b.identity_id.as_str()), Some("tok1"));
	}
}
