#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::server::connection::{Connection, EnqueueError};

/// Live connection set. All reads and writes serialise on one lock.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
	inner: Arc<Mutex<HashMap<u64, Arc<Connection>>>>,
}

/// Result of a mailbox delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Delivered,
	/// Mailbox was full; the connection has been removed.
	Evicted,
	/// Connection was already closed.
	Closed,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn insert(&self, conn: Arc<Connection>) {
		let mut inner = self.inner.lock().await;
		if inner.insert(conn.id(), conn).is_none() {
			metrics::gauge!("chatrelay_active_connections").increment(1.0);
		}
	}

	/// Remove a connection and close it. Removing a non-member is a no-op.
	pub async fn remove(&self, conn: &Connection) -> bool {
		let removed = {
			let mut inner = self.inner.lock().await;
			inner.remove(&conn.id()).is_some()
		};

		if removed {
			conn.close();
			metrics::gauge!("chatrelay_active_connections").decrement(1.0);
			debug!(conn_id = conn.id(), "connection removed from registry");
		}
		removed
	}

	#[cfg(test)]
	pub async fn contains(&self, conn_id: u64) -> bool {
		self.inner.lock().await.contains_key(&conn_id)
	}

	#[cfg(test)]
	pub async fn len(&self) -> usize {
		self.inner.lock().await.len()
	}

	#[cfg(test)]
	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Current members. Iteration order carries no meaning.
	pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
		self.inner.lock().await.values().cloned().collect()
	}

	/// Non-blocking enqueue; a full mailbox evicts the connection.
	pub async fn deliver(&self, conn: &Connection, frame: Bytes) -> Delivery {
		match conn.mailbox().try_enqueue(frame) {
			Ok(()) => Delivery::Delivered,
			Err(EnqueueError::Full) => {
				metrics::counter!("chatrelay_mailbox_overflow_total").increment(1);
				warn!(conn_id = conn.id(), remote = %conn.remote(), "mailbox full; disconnecting slow client");
				self.remove(conn).await;
				Delivery::Evicted
			}
			Err(EnqueueError::Closed) => Delivery::Closed,
		}
	}

	/// Remove and close every connection (shutdown).
	pub async fn close_all(&self) -> usize {
		let drained: Vec<Arc<Connection>> = {
			let mut inner = self.inner.lock().await;
			inner.drain().map(|(_, c)| c).collect()
		};

		for conn in &drained {
			conn.close();
			metrics::gauge!("chatrelay_active_connections").decrement(1.0);
		}
		drained.len()
	}
}

#[cfg(test)]
mod tests {
	use std::net::SocketAddr;

	use super::*;

	fn conn(id: u64, capacity: usize) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<Bytes>) {
		let addr: SocketAddr = "127.0.0.1:1".parse().expect("addr");
		Connection::new(id, addr, capacity)
	}

	#[tokio::test]
	async fn remove_is_idempotent_and_closes_mailbox() {
		let registry = ConnectionRegistry::new();
		let (c, _rx) = conn(1, 4);
		registry.insert(Arc::clone(&c)).await;
		assert!(registry.contains(1).await);

		assert!(registry.remove(&c).await);
		assert!(c.is_closed());
		assert!(!registry.contains(1).await);

		assert!(!registry.remove(&c).await);
		assert!(registry.is_empty().await);
	}

	#[tokio::test]
	async fn removing_non_member_leaves_it_open() {
		let registry = ConnectionRegistry::new();
		let (c, _rx) = conn(7, 4);
		assert!(!registry.remove(&c).await);
		assert!(!c.is_closed());
	}

	#[tokio::test]
	async fn full_mailbox_evicts_on_delivery() {
		let registry = ConnectionRegistry::new();
		let (c, _rx) = conn(1, 1);
		registry.insert(Arc::clone(&c)).await;

		assert_eq!(registry.deliver(&c, Bytes::from_static(b"1")).await, Delivery::Delivered);
		assert_eq!(registry.deliver(&c, Bytes::from_static(b"2")).await, Delivery::Evicted);
		assert!(!registry.contains(1).await);
		assert_eq!(registry.deliver(&c, Bytes::from_static(b"3")).await, Delivery::Closed);
	}

	#[tokio::test]
	async fn close_all_empties_registry() {
		let registry = ConnectionRegistry::new();
		let (a, _ra) = conn(1, 1);
		let (b, _rb) = conn(2, 1);
		registry.insert(Arc::clone(&a)).await;
		registry.insert(Arc::clone(&b)).await;

		assert_eq!(registry.snapshot().await.len(), 2);
		assert_eq!(registry.close_all().await, 2);
		assert!(registry.is_empty().await);
		assert!(a.is_closed() && b.is_closed());
	}
}
