#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::{debug, info};

use crate::server::registry::Outbound;
use crate::server::router::EventRouter;

/// Default probe interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
	pub pinged: usize,
	pub reaped: usize,
}

/// One probe pass over every registered connection.
///
/// A handle whose liveness flag is still clear from the previous sweep gets
/// the full teardown (close queued, registry entry removed, departure
/// announced). Everyone else has the flag cleared and a Ping queued; only a
/// Pong sets it again before the next pass.
pub async fn sweep(router: &EventRouter) -> SweepStats {
	let mut stats = SweepStats::default();

	for handle in router.service().handles().await {
		if !handle.is_alive() {
			info!(conn_id = handle.conn_id, user = %handle.identity.username, "heartbeat timeout; terminating connection");
			metrics::counter!("watchroom_server_heartbeat_reaps_total").increment(1);

			handle.try_send(Outbound::Close {
				code: 1001,
				reason: "heartbeat timeout",
			});
			router.handle_disconnect(handle.conn_id).await;
			// A vanished peer never delivers the close handshake, so the
			// connection task must be told to stop reading and drop the socket.
			handle.request_shutdown();
			stats.reaped += 1;
			continue;
		}

		handle.clear_alive();
		handle.try_send(Outbound::Ping);
		stats.pinged += 1;
	}

	stats
}

/// Spawn the periodic sweep task.
pub fn spawn_heartbeat(router: EventRouter, interval: Duration) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		// First tick fires immediately; skip it so fresh connections get a
		// full interval before their first probe.
		ticker.tick().await;

		loop {
			ticker.tick().await;
			let stats = sweep(&router).await;
			if stats.reaped > 0 {
				debug!(pinged = stats.pinged, reaped = stats.reaped, "heartbeat sweep");
			}
		}
	})
}
