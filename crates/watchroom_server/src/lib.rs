#![forbid(unsafe_code)]

pub mod config;
pub mod server;
pub mod util;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::warn;

use crate::server::auth::TokenVerifier;
use crate::server::router::EventRouter;

/// Accept loop: one task per inbound TCP connection, each driven through the
/// full upgrade/auth/pump lifecycle. Runs until the listener fails.
pub async fn serve(listener: TcpListener, router: EventRouter, verifier: Arc<dyn TokenVerifier>) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("watchroom_server_connections_total").increment(1);
		tracing::debug!(conn_id, %remote, "accepted tcp connection");

		let router = router.clone();
		let verifier = Arc::clone(&verifier);
		tokio::spawn(async move {
			if let Err(e) = crate::server::connection::handle_connection(conn_id, stream, router, verifier).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}
