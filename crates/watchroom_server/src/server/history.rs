#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use watchroom_domain::{MessageId, RoomId, UserRef};
use watchroom_protocol::ChatKind;

/// Default per-room history capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One enriched chat message as retained in history.
#[derive(Debug, Clone)]
pub struct StoredMessage {
	pub id: MessageId,
	pub sender: UserRef,
	pub content: String,
	pub kind: ChatKind,
	pub gif_url: Option<String>,
	/// RFC 3339 stamp assigned when the message was routed.
	pub timestamp: String,
}

/// In-memory per-room ring buffer of recent chat messages.
///
/// Read model for the room API; not part of the realtime contract and
/// does not survive a restart. Oldest entries are evicted at capacity.
#[derive(Debug, Clone)]
pub struct MessageHistory {
	inner: Arc<Mutex<HashMap<RoomId, VecDeque<StoredMessage>>>>,
	capacity: usize,
}

impl MessageHistory {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			capacity: capacity.max(1),
		}
	}

	pub async fn record(&self, room: &RoomId, message: StoredMessage) {
		let mut inner = self.inner.lock().await;
		let ring = inner.entry(room.clone()).or_default();
		if ring.len() == self.capacity {
			ring.pop_front();
		}
		ring.push_back(message);
	}

	/// Recent messages for `room`, oldest first.
	pub async fn recent(&self, room: &RoomId) -> Vec<StoredMessage> {
		let inner = self.inner.lock().await;
		inner.get(room).map(|ring| ring.iter().cloned().collect()).unwrap_or_default()
	}

	/// Drop a room's buffer, e.g. when the room is deleted upstream.
	pub async fn forget_room(&self, room: &RoomId) {
		let mut inner = self.inner.lock().await;
		inner.remove(room);
	}
}
