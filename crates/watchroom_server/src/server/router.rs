#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, warn};
use watchroom_domain::{MessageId, RoomId, UserRef};
use watchroom_protocol::{
	ClientEvent, DEFAULT_MAX_TEXT_FRAME, EventBody, PresencePayload, ServerEvent, encode_server_event, parse_client_event,
};

use crate::server::history::{MessageHistory, StoredMessage};
use crate::server::registry::{ConnectionHandle, JoinOutcome, RoomService};
use crate::util::time::rfc3339_now;

/// Configuration for `EventRouter`.
#[derive(Debug, Clone)]
pub struct RouterConfig {
	/// Maximum inbound/outbound text frame size.
	pub max_frame_bytes: usize,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_TEXT_FRAME,
		}
	}
}

/// Routes inbound client events to room broadcasts.
///
/// Holds its collaborators by injection; one router instance is shared by
/// every connection task.
#[derive(Debug, Clone)]
pub struct EventRouter {
	service: RoomService,
	history: MessageHistory,
	cfg: RouterConfig,
}

impl EventRouter {
	pub fn new(service: RoomService, history: MessageHistory, cfg: RouterConfig) -> Self {
		Self { service, history, cfg }
	}

	pub fn service(&self) -> &RoomService {
		&self.service
	}

	pub fn history(&self) -> &MessageHistory {
		&self.history
	}

	pub fn max_frame_bytes(&self) -> usize {
		self.cfg.max_frame_bytes
	}

	/// Route one inbound text frame from `conn`.
	///
	/// Malformed frames and unknown kinds are dropped without closing the
	/// connection. Events other than join/leave are dropped silently unless
	/// the sender is in a room.
	pub async fn dispatch(&self, conn: &Arc<ConnectionHandle>, text: &str) {
		let event = match parse_client_event(text, self.cfg.max_frame_bytes) {
			Ok(Some(event)) => event,
			Ok(None) => {
				debug!(conn_id = conn.conn_id, "ignoring unknown event kind");
				return;
			}
			Err(e) => {
				metrics::counter!("watchroom_server_malformed_frames_total").increment(1);
				debug!(conn_id = conn.conn_id, error = %e, "dropping malformed frame");
				return;
			}
		};

		metrics::counter!("watchroom_server_events_in_total", "kind" => event.kind()).increment(1);

		match event {
			ClientEvent::JoinRoom { room_id } => self.handle_join(conn, room_id).await,
			ClientEvent::LeaveRoom { room_id } => self.handle_leave(conn, room_id).await,
			ClientEvent::Chat(chat) => {
				let Some(room) = self.service.room_of(conn.conn_id).await else {
					debug!(conn_id = conn.conn_id, "dropping message from connection outside any room");
					return;
				};

				let timestamp = rfc3339_now();
				self.history
					.record(
						&room,
						StoredMessage {
							id: MessageId::new_v4(),
							sender: conn.identity.clone(),
							content: chat.content.clone(),
							kind: chat.kind,
							gif_url: chat.gif_url.clone(),
							timestamp: timestamp.clone(),
						},
					)
					.await;

				self.announce(&room, EventBody::Chat(chat), Some(&conn.identity), timestamp, None)
					.await;
			}
			ClientEvent::VideoSync(sync) => {
				let Some(room) = self.service.room_of(conn.conn_id).await else {
					debug!(conn_id = conn.conn_id, "dropping video_sync from connection outside any room");
					return;
				};

				// Sender excluded: the owner's player already reflects this state.
				self.announce(
					&room,
					EventBody::VideoSync(sync),
					Some(&conn.identity),
					rfc3339_now(),
					Some(conn.conn_id),
				)
				.await;
			}
			ClientEvent::ModeChanged(mode) => {
				self.echo_to_room(conn, EventBody::ModeChanged(mode)).await;
			}
			ClientEvent::OwnershipTransferred(transfer) => {
				self.echo_to_room(conn, EventBody::OwnershipTransferred(transfer)).await;
			}
			ClientEvent::RoomUpdated(update) => {
				self.echo_to_room(conn, EventBody::RoomUpdated(update)).await;
			}
		}
	}

	/// Broadcast a server-originated event (no sender identity) into a room.
	/// Entry point for the REST mutation handlers, e.g. playlist updates.
	pub async fn broadcast_to_room(&self, room: &RoomId, body: EventBody) {
		self.announce(room, body, None, rfc3339_now(), None).await;
	}

	/// Full teardown for a closing connection: deregister and announce the
	/// departure to whatever room it occupied. Idempotent.
	pub async fn handle_disconnect(&self, conn_id: u64) {
		let Some(removed) = self.service.remove_conn(conn_id).await else {
			return;
		};

		if let Some(room) = removed.room {
			let presence = presence_of(&removed.handle.identity);
			self.announce(&room, EventBody::UserLeft(presence), None, rfc3339_now(), None).await;
		}
	}

	async fn handle_join(&self, conn: &Arc<ConnectionHandle>, room: RoomId) {
		match self.service.join_room(conn.conn_id, room.clone()).await {
			None => {}
			Some(JoinOutcome::AlreadyMember) => {
				debug!(conn_id = conn.conn_id, room = %room, "re-entrant join; no announcement");
			}
			Some(JoinOutcome::Joined { left }) => {
				if let Some(old_room) = left {
					let presence = presence_of(&conn.identity);
					self.announce(&old_room, EventBody::UserLeft(presence), None, rfc3339_now(), None)
						.await;
				}

				debug!(conn_id = conn.conn_id, room = %room, user = %conn.identity.username, "joined room");
				let presence = presence_of(&conn.identity);
				self.announce(
					&room,
					EventBody::UserJoined(presence),
					None,
					rfc3339_now(),
					Some(conn.conn_id),
				)
				.await;
			}
		}
	}

	async fn handle_leave(&self, conn: &Arc<ConnectionHandle>, room: RoomId) {
		if !self.service.leave_room(conn.conn_id, &room).await {
			debug!(conn_id = conn.conn_id, room = %room, "leave for a room the connection is not in");
			return;
		}

		debug!(conn_id = conn.conn_id, room = %room, user = %conn.identity.username, "left room");
		let presence = presence_of(&conn.identity);
		self.announce(&room, EventBody::UserLeft(presence), None, rfc3339_now(), None).await;
	}

	/// Echo an event back to the sender's room, sender included.
	async fn echo_to_room(&self, conn: &Arc<ConnectionHandle>, body: EventBody) {
		let Some(room) = self.service.room_of(conn.conn_id).await else {
			debug!(conn_id = conn.conn_id, kind = body.kind(), "dropping event from connection outside any room");
			return;
		};

		self.announce(&room, body, Some(&conn.identity), rfc3339_now(), None).await;
	}

	/// Stamp, serialize once, and fan out one event.
	async fn announce(&self, room: &RoomId, body: EventBody, sender: Option<&UserRef>, timestamp: String, exclude_conn: Option<u64>) {
		let kind = body.kind();
		let event = ServerEvent {
			body,
			room_id: Some(room.clone()),
			user_id: sender.map(|s| s.user_id.clone()),
			username: sender.map(|s| s.username.clone()),
			timestamp,
		};

		let frame: Arc<str> = match encode_server_event(&event, self.cfg.max_frame_bytes) {
			Ok(text) => Arc::from(text),
			Err(e) => {
				warn!(room = %room, kind, error = %e, "failed to encode outbound event");
				return;
			}
		};

		let delivered = self.service.broadcast(room, frame, exclude_conn).await;
		metrics::counter!("watchroom_server_events_out_total", "kind" => kind).increment(delivered as u64);
	}
}

fn presence_of(identity: &UserRef) -> PresencePayload {
	PresencePayload {
		user_id: identity.user_id.clone(),
		username: identity.username.clone(),
	}
}
