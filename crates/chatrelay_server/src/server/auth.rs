#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use chatrelay_domain::{IdentityId, IdentityRecord};
use chatrelay_protocol::encode_auth_response;
use chatrelay_protocol::pb::AuthResponse;
use tracing::{debug, info, warn};

use crate::server::connection::{Binding, Connection};
use crate::server::identity::{IdentityStore, StoreError};
use crate::server::registry::ConnectionRegistry;

/// Validates token/hostname pairs against the identity store and binds connections.
pub struct Authenticator {
	store: Arc<dyn IdentityStore>,
	registry: ConnectionRegistry,
	max_frame_bytes: usize,
}

impl std::fmt::Debug for Authenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Authenticator")
			.field("max_frame_bytes", &self.max_frame_bytes)
			.finish_non_exhaustive()
	}
}

impl Authenticator {
	pub fn new(store: Arc<dyn IdentityStore>, registry: ConnectionRegistry, max_frame_bytes: usize) -> Self {
		Self {
			store,
			registry,
			max_frame_bytes,
		}
	}

	/// Run the handshake and enqueue the response on the connection's mailbox.
	pub async fn authenticate(&self, conn: &Connection, token: &str, hostname: &str) -> AuthResponse {
		let response = self.resolve(conn, token, hostname).await;

		match response {
			AuthResponse::Success => metrics::counter!("chatrelay_auth_success_total").increment(1),
			AuthResponse::Denied => metrics::counter!("chatrelay_auth_denied_total").increment(1),
		}

		match encode_auth_response(response, self.max_frame_bytes) {
			Ok(frame) => {
				self.registry.deliver(conn, Bytes::from(frame)).await;
			}
			Err(e) => warn!(conn_id = conn.id(), error = %e, "failed to encode auth response"),
		}

		response
	}

	async fn resolve(&self, conn: &Connection, token: &str, hostname: &str) -> AuthResponse {
		let conn_id = conn.id();

		if token.is_empty() || hostname.is_empty() {
			debug!(conn_id, "authentication rejected: empty token or hostname");
			return AuthResponse::Denied;
		}

		let Ok(id) = IdentityId::new(token) else {
			return AuthResponse::Denied;
		};

		if let Some(bound) = conn.binding().filter(|b| b.identity_id != id) {
			warn!(conn_id, bound = %bound.identity_id, "re-authentication with a different identity rejected");
			return AuthResponse::Denied;
		}

		let record = match self.store.get(&id).await {
			Ok(record) => record,
			Err(StoreError::NotFound) => {
				let record = IdentityRecord::new(id.clone());
				if let Err(e) = self.store.insert(&record).await {
					warn!(conn_id, identity = %id, error = %e, "failed to create identity record; connection stays unauthenticated");
					return AuthResponse::Denied;
				}
				info!(conn_id, identity = %id, "created identity record");
				record
			}
			Err(e) => {
				warn!(conn_id, identity = %id, error = %e, "identity lookup failed; continuing with a bare record");
				IdentityRecord::new(id.clone())
			}
		};

		if let Err(e) = self.store.set_display_name(&record, hostname).await {
			warn!(conn_id, identity = %id, error = %e, "failed to update display name");
		}

		// Bindings are immutable: a same-token re-auth refreshes the stored display
		// name, but messages from this connection keep the hostname bound first.
		let bound = conn.bind(Binding {
			identity_id: id.clone(),
			hostname: hostname.to_string(),
		});
		if bound.is_err()
			&& let Some(kept) = conn.binding().filter(|b| b.hostname != hostname)
		{
			debug!(conn_id, identity = %id, bound = %kept.hostname, hostname, "re-auth hostname differs; binding unchanged");
		}

		info!(conn_id, identity = %id, hostname, "client authenticated");
		AuthResponse::Success
	}
}
