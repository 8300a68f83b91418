#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chatrelay_protocol::version::PROTOCOL_VERSION_U32;
use chatrelay_util::endpoint::TcpEndpoint;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::acceptor;
use crate::server::bridge::{BridgeConsumer, BridgeLink, LogSink, spawn_bridge_consumer};
use crate::server::filter::TermFilter;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::identity::{IdentityStore, InMemoryIdentityStore, SqlIdentityStore, StoreError};
use crate::server::relay::{Relay, RelaySettings};

/// How long shutdown waits for the router and bridge to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chatrelay_server [--bind tcp://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://0.0.0.0:57452)\n\
\t         Format: tcp://host:port, host:port, :port or port\n\
\t--config  Config file (default: ~/.chatrelay/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<TcpEndpoint>,
	config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config_path: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let endpoint = TcpEndpoint::parse(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				args.bind = Some(endpoint);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatrelay_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("chatrelay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_identity_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn IdentityStore>> {
	if !cfg.persistence.enabled {
		info!(seeded = cfg.identities.len(), "identity store: in-memory");
		return Ok(Arc::new(InMemoryIdentityStore::with_records(cfg.identities.iter().cloned())));
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
	};
	let store = SqlIdentityStore::connect(database_url).await?;

	for seed in &cfg.identities {
		match store.get(&seed.id).await {
			Ok(_) => {}
			Err(StoreError::NotFound) => {
				store
					.insert(seed)
					.await
					.with_context(|| format!("seed identity {}", seed.id))?;
			}
			Err(e) => return Err(anyhow::Error::new(e).context(format!("look up seed identity {}", seed.id))),
		}
		store
			.set_channels(&seed.id, &seed.receive_channels, &seed.send_channels)
			.await?;
	}

	info!(seeded = cfg.identities.len(), "identity store: sql");
	Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = build_identity_store(&server_cfg).await?;

	let filter = Arc::new(TermFilter::new(&server_cfg.filter.terms));
	if !filter.is_empty() {
		info!(terms = filter.len(), "content filter enabled");
	}

	let (bridge, bridge_handle) = if server_cfg.bridge.enabled {
		let (link, rx) = BridgeLink::channel(server_cfg.server.bridge_queue_capacity);
		let consumer = BridgeConsumer::new(server_cfg.bridge.routes.clone(), Arc::new(LogSink));
		(link, Some(spawn_bridge_consumer(consumer, rx)))
	} else {
		(BridgeLink::disabled(), None)
	};

	info!(enabled = bridge.is_enabled(), routes = server_cfg.bridge.routes.len(), "bridge link configured");

	let settings = RelaySettings {
		mailbox_capacity: server_cfg.server.mailbox_capacity,
		router_queue_capacity: server_cfg.server.router_queue_capacity,
		max_frame_bytes: server_cfg.server.max_frame_bytes,
	};
	let (relay, router_handle) = Relay::start(settings, store, filter, bridge);

	let bind = args
		.bind
		.unwrap_or_else(|| TcpEndpoint::new(server_cfg.server.bind_host.clone(), server_cfg.server.port));
	let listener = TcpListener::bind(bind.hostport())
		.await
		.with_context(|| format!("bind relay listener on {}", bind.hostport()))?;
	info!(
		bind = %bind.hostport(),
		protocol_version = PROTOCOL_VERSION_U32,
		"chatrelay_server: TCP listener ready"
	);

	health_state.mark_ready();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let accept_handle = tokio::spawn(acceptor::serve(listener, Arc::clone(&relay), shutdown_rx));
	let accept_watch = tokio::spawn(async move {
		match accept_handle.await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => warn!(error = ?e, "listener failed; existing connections keep running until Ctrl-C"),
			Err(e) => warn!(error = %e, "accept task panicked"),
		}
	});

	tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
	info!("shutdown requested");

	health_state.mark_not_ready();
	shutdown_tx.send_replace(true);
	let _ = accept_watch.await;

	relay.shutdown().await;
	drop(relay);

	if tokio::time::timeout(DRAIN_TIMEOUT, router_handle).await.is_err() {
		warn!("router did not drain before timeout");
	}
	if let Some(handle) = bridge_handle
		&& tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err()
	{
		warn!("bridge consumer did not drain before timeout");
	}

	info!("chatrelay_server stopped");
	Ok(())
}
