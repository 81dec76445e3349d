#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;
use watchroom_domain::{RoomId, UserRef};

/// Items queued to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
	/// One encoded JSON text frame, shared across recipients.
	Frame(Arc<str>),
	Ping,
	Pong(Bytes),
	Close {
		code: u16,
		reason: &'static str,
	},
}

/// Per-connection handle held by the registry and the connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
	pub conn_id: u64,
	pub identity: UserRef,
	tx: mpsc::Sender<Outbound>,
	alive: AtomicBool,
	shutdown: Notify,
}

impl ConnectionHandle {
	/// Queue an item without waiting. A full or closed queue drops the item;
	/// a slow receiver never stalls the caller.
	pub fn try_send(&self, item: Outbound) -> bool {
		self.tx.try_send(item).is_ok()
	}

	/// Set by the connection task when a Pong arrives.
	pub fn mark_alive(&self) {
		self.alive.store(true, Ordering::Relaxed);
	}

	pub fn clear_alive(&self) {
		self.alive.store(false, Ordering::Relaxed);
	}

	pub fn is_alive(&self) -> bool {
		self.alive.load(Ordering::Relaxed)
	}

	/// Tell the connection task to stop reading and drop the socket. A
	/// queued close frame alone is not enough for a vanished peer: the read
	/// half would park forever waiting for bytes that never come.
	pub fn request_shutdown(&self) {
		self.shutdown.notify_one();
	}

	/// Resolves once `request_shutdown` has been called.
	pub async fn shutdown_requested(&self) {
		self.shutdown.notified().await;
	}
}

/// Outcome of a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
	Joined {
		/// Room implicitly left to preserve the one-room-per-connection rule.
		left: Option<RoomId>,
	},
	/// Re-entrant join of the current room; nothing changed.
	AlreadyMember,
}

/// Result of tearing a connection out of the registry.
#[derive(Debug)]
pub struct RemovedConn {
	pub handle: Arc<ConnectionHandle>,
	/// Room the connection was in, if any.
	pub room: Option<RoomId>,
}

/// Configuration for `RoomService`.
#[derive(Debug, Clone)]
pub struct RoomServiceConfig {
	/// Maximum number of queued outbound items per connection.
	pub outbound_queue_capacity: usize,
}

impl Default for RoomServiceConfig {
	fn default() -> Self {
		Self {
			outbound_queue_capacity: 256,
		}
	}
}

/// Process-scoped connection registry and room membership index.
///
/// Cloneable service object; callers inject it where needed rather than
/// reaching for global state.
#[derive(Debug, Clone)]
pub struct RoomService {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomServiceConfig,
}

#[derive(Debug, Default)]
struct Inner {
	conns: HashMap<u64, Arc<ConnectionHandle>>,
	members: HashMap<RoomId, HashSet<u64>>,
	room_by_conn: HashMap<u64, RoomId>,
}

impl RoomService {
	pub fn new(cfg: RoomServiceConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Register an authenticated connection. Returns the shared handle and
	/// the receiving end for the connection's writer task.
	pub async fn register(&self, conn_id: u64, identity: UserRef) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
		let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_capacity);
		let handle = Arc::new(ConnectionHandle {
			conn_id,
			identity,
			tx,
			alive: AtomicBool::new(true),
			shutdown: Notify::new(),
		});

		let mut inner = self.inner.lock().await;
		inner.conns.insert(conn_id, Arc::clone(&handle));
		metrics::gauge!("watchroom_server_registered_connections").set(inner.conns.len() as f64);

		(handle, rx)
	}

	/// Put a connection into `room`, leaving its previous room if needed.
	///
	/// Joining the room the connection is already in is a no-op and reports
	/// `AlreadyMember` so the caller can skip the roster announcement.
	pub async fn join_room(&self, conn_id: u64, room: RoomId) -> Option<JoinOutcome> {
		let mut inner = self.inner.lock().await;
		if !inner.conns.contains_key(&conn_id) {
			return None;
		}

		if inner.room_by_conn.get(&conn_id) == Some(&room) {
			return Some(JoinOutcome::AlreadyMember);
		}

		let left = remove_membership(&mut inner, conn_id);

		inner.members.entry(room.clone()).or_default().insert(conn_id);
		inner.room_by_conn.insert(conn_id, room);
		metrics::gauge!("watchroom_server_active_rooms").set(inner.members.len() as f64);

		Some(JoinOutcome::Joined { left })
	}

	/// Remove a connection from `room`. Returns whether it was a member, so
	/// the caller can suppress `user_left` for no-op leaves.
	pub async fn leave_room(&self, conn_id: u64, room: &RoomId) -> bool {
		let mut inner = self.inner.lock().await;
		if inner.room_by_conn.get(&conn_id) != Some(room) {
			return false;
		}

		remove_membership(&mut inner, conn_id);
		metrics::gauge!("watchroom_server_active_rooms").set(inner.members.len() as f64);
		true
	}

	/// Drop a connection entirely. Reports the vacated room so the caller
	/// can announce the departure. Idempotent.
	pub async fn remove_conn(&self, conn_id: u64) -> Option<RemovedConn> {
		let mut inner = self.inner.lock().await;
		let handle = inner.conns.remove(&conn_id)?;
		let room = remove_membership(&mut inner, conn_id);

		metrics::gauge!("watchroom_server_registered_connections").set(inner.conns.len() as f64);
		metrics::gauge!("watchroom_server_active_rooms").set(inner.members.len() as f64);

		Some(RemovedConn { handle, room })
	}

	/// Room the connection currently occupies.
	pub async fn room_of(&self, conn_id: u64) -> Option<RoomId> {
		let inner = self.inner.lock().await;
		inner.room_by_conn.get(&conn_id).cloned()
	}

	/// Deliver one encoded frame to every member of `room`, optionally
	/// skipping the sender. Returns the number of queues the frame reached.
	///
	/// The frame is serialized once by the caller; delivery failures are
	/// isolated per recipient and cleaned up by that connection's own close
	/// path.
	pub async fn broadcast(&self, room: &RoomId, frame: Arc<str>, exclude_conn: Option<u64>) -> usize {
		let recipients = {
			let inner = self.inner.lock().await;
			let Some(members) = inner.members.get(room) else {
				return 0;
			};

			members
				.iter()
				.filter(|id| Some(**id) != exclude_conn)
				.filter_map(|id| inner.conns.get(id).cloned())
				.collect::<Vec<_>>()
		};

		let mut delivered = 0usize;
		for handle in recipients {
			if handle.try_send(Outbound::Frame(Arc::clone(&frame))) {
				delivered += 1;
			} else {
				metrics::counter!("watchroom_server_broadcast_drops_total").increment(1);
				debug!(conn_id = handle.conn_id, room = %room, "dropped frame; outbound queue full or closed");
			}
		}

		delivered
	}

	/// Snapshot of every registered handle, for the heartbeat sweep.
	pub async fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
		let inner = self.inner.lock().await;
		inner.conns.values().cloned().collect()
	}

	/// Snapshot of member handles of `room`.
	pub async fn members_of(&self, room: &RoomId) -> Vec<Arc<ConnectionHandle>> {
		let inner = self.inner.lock().await;
		let Some(members) = inner.members.get(room) else {
			return Vec::new();
		};
		members.iter().filter_map(|id| inner.conns.get(id).cloned()).collect()
	}

	/// `(rooms, connections)` counts for the status endpoint.
	pub async fn counts(&self) -> (usize, usize) {
		let inner = self.inner.lock().await;
		(inner.members.len(), inner.conns.len())
	}
}

/// Detach `conn_id` from its room, deleting the member set when it empties.
fn remove_membership(inner: &mut Inner, conn_id: u64) -> Option<RoomId> {
	let room = inner.room_by_conn.remove(&conn_id)?;
	if let Some(members) = inner.members.get_mut(&room) {
		members.remove(&conn_id);
		if members.is_empty() {
			inner.members.remove(&room);
		}
	}
	Some(room)
}
