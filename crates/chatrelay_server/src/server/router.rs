#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chatrelay_domain::IdentityId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::bridge::BridgeLink;
use crate::server::deliverable::Deliverable;
use crate::server::filter::ContentFilter;
use crate::server::identity::IdentityStore;
use crate::server::registry::{ConnectionRegistry, Delivery};

/// Settings for the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	pub max_frame_bytes: usize,

	pub debug_log_messages: bool,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			max_frame_bytes: chatrelay_protocol::DEFAULT_MAX_FRAME_SIZE,
			debug_log_messages: false,
		}
	}
}

/// What happened to one routed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
	pub filtered: bool,
	pub delivered: usize,
	pub evicted: usize,
}

/// Single dispatcher for all post-auth messages.
pub struct Router {
	cfg: RouterConfig,
	registry: ConnectionRegistry,
	store: Arc<dyn IdentityStore>,
	filter: Arc<dyn ContentFilter>,
	bridge: BridgeLink,
}

impl Router {
	pub fn new(
		registry: ConnectionRegistry,
		store: Arc<dyn IdentityStore>,
		filter: Arc<dyn ContentFilter>,
		bridge: BridgeLink,
		cfg: RouterConfig,
	) -> Self {
		Self {
			cfg,
			registry,
			store,
			filter,
			bridge,
		}
	}

	/// Process submissions one at a time until every sender is dropped.
	pub async fn run(self, mut rx: mpsc::Receiver<Deliverable>) {
		info!("router started");
		while let Some(message) = rx.recv().await {
			let outcome = self.route(message).await;
			if self.cfg.debug_log_messages {
				debug!(
					filtered = outcome.filtered,
					delivered = outcome.delivered,
					evicted = outcome.evicted,
					"routed message"
				);
			}
		}
		info!("router exiting (submission queue closed)");
	}

	/// Filter, fan out to eligible recipients, then hand off to the bridge.
	pub async fn route(&self, message: Deliverable) -> RouteOutcome {
		let mut outcome = RouteOutcome::default();

		if self.filter.matches(message.content()) {
			metrics::counter!("chatrelay_messages_filtered_total").increment(1);
			debug!(message_id = %message.id(), author = %message.author(), "message dropped by content filter");
			outcome.filtered = true;
			return outcome;
		}

		let frame = match message.encode(self.cfg.max_frame_bytes) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(message_id = %message.id(), error = %e, "failed to encode message; dropping");
				return outcome;
			}
		};

		let mut receives: HashMap<IdentityId, bool> = HashMap::new();

		for conn in self.registry.snapshot().await {
			let Some(binding) = conn.binding() else {
				continue;
			};
			if &binding.identity_id == message.author() {
				continue;
			}

			let eligible = match receives.get(&binding.identity_id) {
				Some(eligible) => *eligible,
				None => {
					let eligible = match self.store.get(&binding.identity_id).await {
						Ok(record) => record.receives_any_of(message.targets()),
						Err(e) => {
							warn!(identity = %binding.identity_id, error = %e, "recipient lookup failed; skipping");
							false
						}
					};
					receives.insert(binding.identity_id.clone(), eligible);
					eligible
				}
			};
			if !eligible {
				continue;
			}

			match self.registry.deliver(&conn, frame.clone()).await {
				Delivery::Delivered => outcome.delivered += 1,
				Delivery::Evicted => outcome.evicted += 1,
				Delivery::Closed => {}
			}
		}

		metrics::counter!("chatrelay_messages_routed_total").increment(1);
		metrics::counter!("chatrelay_deliveries_total").increment(outcome.delivered as u64);

		self.bridge.submit(Arc::new(message)).await;
		outcome
	}
}

/// Spawn the router task.
pub fn spawn_router(router: Router, rx: mpsc::Receiver<Deliverable>) -> JoinHandle<()> {
	tokio::spawn(router.run(rx))
}
