#![forbid(unsafe_code)]

//! Reconnection bridge between a session and a cache-driven UI.
//!
//! The bridge owns the connect/join/read loop and translates server events
//! into cache invalidations; the UI refetches through its normal query layer
//! instead of patching state from frame payloads.

use std::time::Duration;

use tracing::{info, warn};
use watchroom_domain::RoomId;
use watchroom_protocol::{EventBody, ServerEvent};

use crate::{ClientConfig, ClientCoreError, Session};

/// Delay between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Connection lifecycle as observed by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
	Disconnected,
	Connecting,
	/// Session is up and the room has been rejoined; caches may be stale.
	Syncing,
	Connected,
}

/// One cache region to refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
	/// Chat history of a room.
	Messages(RoomId),
	/// A single room's detail view.
	Room(RoomId),
	/// The room directory.
	RoomList,
}

/// Cache regions invalidated by one server event.
///
/// Chat only touches the message list; roster and room-shape changes touch
/// the room detail and the directory. Playback sync is applied directly to
/// the player and invalidates nothing.
pub fn invalidations_for(event: &ServerEvent) -> Vec<Invalidation> {
	let Some(room) = event.room_id.clone() else {
		return Vec::new();
	};

	match &event.body {
		EventBody::Chat(_) => vec![Invalidation::Messages(room)],
		EventBody::VideoSync(_) => Vec::new(),
		EventBody::UserJoined(_)
		| EventBody::UserLeft(_)
		| EventBody::ModeChanged(_)
		| EventBody::OwnershipTransferred(_)
		| EventBody::RoomUpdated(_)
		| EventBody::PlaylistUpdated(_) => {
			vec![Invalidation::Room(room), Invalidation::RoomList]
		}
	}
}

/// Everything that may have gone stale across a connection gap.
fn gap_invalidations(room: &RoomId) -> Vec<Invalidation> {
	vec![
		Invalidation::Messages(room.clone()),
		Invalidation::Room(room.clone()),
		Invalidation::RoomList,
	]
}

/// Drive a session for one room, reconnecting forever with a fixed delay.
///
/// Auth rejections (close codes 4001/4002) are terminal; a stale token will
/// not become valid by retrying. Every other failure schedules a reconnect.
pub async fn run_with_reconnect(
	cfg: ClientConfig,
	room: RoomId,
	mut on_state: impl FnMut(BridgeState),
	mut on_event: impl FnMut(ServerEvent),
	mut on_invalidate: impl FnMut(Invalidation),
) -> Result<(), ClientCoreError> {
	loop {
		on_state(BridgeState::Connecting);

		let mut session = match Session::connect(&cfg).await {
			Ok(session) => session,
			Err(e) => {
				warn!(error = %e, delay = ?RECONNECT_DELAY, "connect failed; retrying");
				on_state(BridgeState::Disconnected);
				tokio::time::sleep(RECONNECT_DELAY).await;
				continue;
			}
		};

		on_state(BridgeState::Syncing);
		if let Err(e) = session.join_room(&room).await {
			warn!(error = %e, room = %room, "rejoin failed; retrying");
			on_state(BridgeState::Disconnected);
			tokio::time::sleep(RECONNECT_DELAY).await;
			continue;
		}

		// Anything could have happened while we were away.
		for invalidation in gap_invalidations(&room) {
			on_invalidate(invalidation);
		}
		on_state(BridgeState::Connected);

		loop {
			match session.next_event().await {
				Ok(Some(event)) => {
					for invalidation in invalidations_for(&event) {
						on_invalidate(invalidation);
					}
					on_event(event);
				}
				Ok(None) => {
					info!("session ended; reconnecting");
					break;
				}
				Err(ClientCoreError::Closed {
					code: Some(code @ (4001 | 4002)),
					reason,
				}) => {
					return Err(ClientCoreError::Closed {
						code: Some(code),
						reason,
					});
				}
				Err(e) => {
					warn!(error = %e, "session error; reconnecting");
					break;
				}
			}
		}

		on_state(BridgeState::Disconnected);
		tokio::time::sleep(RECONNECT_DELAY).await;
	}
}
