#![forbid(unsafe_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::server::connection::spawn_connection;
use crate::server::relay::Relay;

/// Source of accepted client streams.
#[async_trait::async_trait]
pub trait Accept: Send {
	async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;

	fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait::async_trait]
impl Accept for TcpListener {
	async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
		TcpListener::accept(self).await
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		TcpListener::local_addr(self)
	}
}

/// Accept connections until shutdown is signalled or the listener fails.
///
/// An accept error is fatal for the listener only; connections already
/// spawned keep running.
pub async fn serve<L: Accept>(mut listener: L, relay: Arc<Relay>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
	if let Ok(addr) = listener.local_addr() {
		info!(%addr, "relay listener accepting connections");
	}

	loop {
		let (stream, remote) = tokio::select! {
			res = listener.accept() => match res {
				Ok(accepted) => accepted,
				Err(e) => {
					warn!(error = %e, "accept failed; listener stopped");
					return Err(e).context("accept relay connection");
				}
			},
			_ = shutdown.wait_for(|s| *s) => {
				info!("listener shutting down");
				return Ok(());
			}
		};

		spawn_connection(&relay, stream, remote).await;
	}
}
