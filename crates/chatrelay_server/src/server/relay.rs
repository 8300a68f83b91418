#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chatrelay_domain::ChannelSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::server::auth::Authenticator;
use crate::server::bridge::BridgeLink;
use crate::server::connection::Binding;
use crate::server::deliverable::Deliverable;
use crate::server::filter::ContentFilter;
use crate::server::identity::IdentityStore;
use crate::server::registry::ConnectionRegistry;
use crate::server::router::{Router, RouterConfig, spawn_router};

/// Sizing knobs shared by the relay components.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub mailbox_capacity: usize,
	pub router_queue_capacity: usize,
	pub max_frame_bytes: usize,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			mailbox_capacity: 64,
			router_queue_capacity: 256,
			max_frame_bytes: chatrelay_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Context object built once at startup and handed to every component.
pub struct Relay {
	settings: RelaySettings,
	registry: ConnectionRegistry,
	store: Arc<dyn IdentityStore>,
	authenticator: Authenticator,
	router_tx: mpsc::Sender<Deliverable>,
	next_conn_id: AtomicU64,
}

impl std::fmt::Debug for Relay {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Relay")
			.field("settings", &self.settings)
			.field("registry", &self.registry)
			.finish_non_exhaustive()
	}
}

impl Relay {
	/// Build the relay and spawn its router task.
	pub fn start(
		settings: RelaySettings,
		store: Arc<dyn IdentityStore>,
		filter: Arc<dyn ContentFilter>,
		bridge: BridgeLink,
	) -> (Arc<Self>, JoinHandle<()>) {
		let registry = ConnectionRegistry::new();
		let (router_tx, router_rx) = mpsc::channel(settings.router_queue_capacity.max(1));

		let router = Router::new(
			registry.clone(),
			Arc::clone(&store),
			filter,
			bridge,
			RouterConfig {
				max_frame_bytes: settings.max_frame_bytes,
				..RouterConfig::default()
			},
		);
		let router_handle = spawn_router(router, router_rx);

		let authenticator = Authenticator::new(Arc::clone(&store), registry.clone(), settings.max_frame_bytes);

		let relay = Arc::new(Self {
			settings,
			registry,
			store,
			authenticator,
			router_tx,
			next_conn_id: AtomicU64::new(1),
		});
		(relay, router_handle)
	}

	pub fn settings(&self) -> &RelaySettings {
		&self.settings
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	pub fn authenticator(&self) -> &Authenticator {
		&self.authenticator
	}

	pub fn next_conn_id(&self) -> u64 {
		self.next_conn_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Channels a message from this binding is published to.
	///
	/// Read from the author's identity record at dispatch time; a failed lookup
	/// yields an empty set, so the message reaches no clients but still reaches the bridge.
	pub async fn target_channels(&self, binding: &Binding) -> ChannelSet {
		match self.store.get(&binding.identity_id).await {
			Ok(record) => record.send_channels,
			Err(e) => {
				warn!(identity = %binding.identity_id, error = %e, "author lookup failed; message has no target channels");
				ChannelSet::new()
			}
		}
	}

	/// Queue a message for the router. Waits while the router queue is full.
	pub async fn submit(&self, message: Deliverable) {
		if let Err(e) = self.router_tx.send(message).await {
			warn!(message_id = %e.0.id(), "router is gone; message dropped");
		}
	}

	/// Remove every live connection.
	pub async fn shutdown(&self) {
		let closed = self.registry.close_all().await;
		info!(closed, "closed all client connections");
	}
}
