#![forbid(unsafe_code)]

use std::sync::Arc;

use chatrelay_domain::ChannelSet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::deliverable::{Deliverable, Payload};

/// Hand-off point from the router to the external bridge consumer.
///
/// Submission waits when the queue is full. A disabled link or a departed
/// consumer turns submission into a no-op.
#[derive(Debug, Clone)]
pub struct BridgeLink {
	tx: Option<mpsc::Sender<Arc<Deliverable>>>,
}

impl BridgeLink {
	pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<Deliverable>>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self { tx: Some(tx) }, rx)
	}

	pub fn disabled() -> Self {
		Self { tx: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.tx.is_some()
	}

	pub async fn submit(&self, message: Arc<Deliverable>) {
		let Some(tx) = &self.tx else {
			return;
		};

		let message_id = message.id();
		if tx.send(message).await.is_err() {
			warn!(%message_id, "bridge consumer is gone; message not forwarded");
			return;
		}
		metrics::counter!("chatrelay_bridge_submitted_total").increment(1);
	}
}

/// One external channel and the relay channels it mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRoute {
	pub external_id: String,
	pub receive_channels: ChannelSet,
}

/// Destination platform for bridged messages.
#[async_trait::async_trait]
pub trait BridgeSink: Send + Sync {
	async fn publish(&self, external_id: &str, message: &Deliverable) -> anyhow::Result<()>;
}

/// Sink that writes each publish as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl BridgeSink for LogSink {
	async fn publish(&self, external_id: &str, message: &Deliverable) -> anyhow::Result<()> {
		match message.payload() {
			Payload::Chat(chat) => info!(
				external_id,
				message_id = %message.id(),
				hostname = message.author_hostname(),
				username = %chat.username,
				text = %chat.message,
				"bridge chat"
			),
			Payload::Event(event) => info!(
				external_id,
				message_id = %message.id(),
				hostname = message.author_hostname(),
				event = %event.event,
				data = %event.data,
				"bridge event"
			),
		}
		Ok(())
	}
}

/// Drains the bridge queue and republishes to mapped external channels.
pub struct BridgeConsumer {
	routes: Vec<BridgeRoute>,
	sink: Arc<dyn BridgeSink>,
}

impl BridgeConsumer {
	pub fn new(routes: Vec<BridgeRoute>, sink: Arc<dyn BridgeSink>) -> Self {
		Self { routes, sink }
	}

	/// Publish one message to every route whose channels intersect its targets.
	/// Returns how many publishes succeeded.
	pub async fn publish_one(&self, message: &Deliverable) -> usize {
		let mut published = 0;
		for route in self.routes.iter().filter(|r| r.receive_channels.intersects(message.targets())) {
			match self.sink.publish(&route.external_id, message).await {
				Ok(()) => published += 1,
				Err(e) => warn!(
					external_id = %route.external_id,
					message_id = %message.id(),
					error = %e,
					"bridge publish failed"
				),
			}
		}
		published
	}

	/// Run until every link sender is dropped.
	pub async fn run(self, mut rx: mpsc::Receiver<Arc<Deliverable>>) {
		info!(routes = self.routes.len(), "bridge consumer started");
		while let Some(message) = rx.recv().await {
			let published = self.publish_one(&message).await;
			debug!(message_id = %message.id(), published, "bridged message");
		}
		info!("bridge consumer exiting (link closed)");
	}
}

pub fn spawn_bridge_consumer(consumer: BridgeConsumer, rx: mpsc::Receiver<Arc<Deliverable>>) -> JoinHandle<()> {
	tokio::spawn(consumer.run(rx))
}

#[cfg(test)]
mod tests {
	use chatrelay_domain::IdentityId;
	use chatrelay_protocol::pb;
	use parking_lot::Mutex;

	use super::*;
	use crate::server::connection::Binding;

	#[derive(Default)]
	struct RecordingSink {
		published: Mutex<Vec<String>>,
	}

	#[async_trait::async_trait]
	impl BridgeSink for RecordingSink {
		async fn publish(&self, external_id: &str, _message: &Deliverable) -> anyhow::Result<()> {
			if external_id == "broken" {
				anyhow::bail!("platform rejected the message");
			}
			self.published.lock().push(external_id.to_string());
			Ok(())
		}
	}

	fn message(targets: &[u32]) -> Deliverable {
		let binding = Binding {
			identity_id: IdentityId::new("tok1").expect("id"),
			hostname: "srvA".into(),
		};
		let chat = pb::Chat {
			message: "hello".into(),
			..Default::default()
		};
		Deliverable::chat(&binding, targets.iter().copied().collect(), chat)
	}

	fn route(id: &str, channels: &[u32]) -> BridgeRoute {
		BridgeRoute {
			external_id: id.into(),
			receive_channels: channels.iter().copied().collect(),
		}
	}

	#[tokio::test]
	async fn publishes_only_to_intersecting_routes() {
		let sink = Arc::new(RecordingSink::default());
		let consumer = BridgeConsumer::new(vec![route("a", &[1]), route("b", &[2, 3]), route("c", &[9])], sink.clone());

		assert_eq!(consumer.publish_one(&message(&[1, 3])).await, 2);
		assert_eq!(*sink.published.lock(), vec!["a".to_string(), "b".to_string()]);
	}

	#[tokio::test]
	async fn failed_publish_does_not_stop_other_routes() {
		let sink = Arc::new(RecordingSink::default());
		let consumer = BridgeConsumer::new(vec![route("broken", &[1]), route("ok", &[1])], sink.clone());

		assert_eq!(consumer.publish_one(&message(&[1])).await, 1);
		assert_eq!(*sink.published.lock(), vec!["ok".to_string()]);
	}

	#[tokio::test]
	async fn consumer_drains_link_until_closed() {
		let sink = Arc::new(RecordingSink::default());
		let consumer = BridgeConsumer::new(vec![route("a", &[1])], sink.clone());
		let (link, rx) = BridgeLink::channel(4);
		let handle = spawn_bridge_consumer(consumer, rx);

		link.submit(Arc::new(message(&[1]))).await;
		link.submit(Arc::new(message(&[2]))).await;
		drop(link);

		tokio::time::timeout(std::time::Duration::from_secs(2), handle)
			.await
			.expect("consumer exits")
			.expect("join");
		assert_eq!(sink.published.lock().len(), 1);
	}

	#[tokio::test]
	async fn disabled_or_orphaned_link_is_a_no_op() {
		BridgeLink::disabled().submit(Arc::new(message(&[1]))).await;

		let (link, rx) = BridgeLink::channel(1);
		drop(rx);
		link.submit(Arc::new(message(&[1]))).await;
		assert!(link.is_enabled());
	}
}
