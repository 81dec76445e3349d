#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use watchroom_domain::{PlaybackAction, RoomId, RoomMode, UserId};

/// Default maximum size of a single JSON text frame, either direction.
pub const DEFAULT_MAX_TEXT_FRAME: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Chat message category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
	#[default]
	Text,
	Gif,
	System,
}

/// Chat message payload. `kind` serializes as `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
	pub content: String,
	#[serde(rename = "type", default)]
	pub kind: ChatKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gif_url: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub avatar_url: Option<String>,
}

/// Owner playback report: the action taken and the player position when it
/// was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSyncPayload {
	pub action: PlaybackAction,
	pub current_time: f64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub video_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeChangedPayload {
	pub mode: RoomMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipPayload {
	pub new_owner_id: UserId,
}

/// Roster change payload for `user_joined` / `user_left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
	pub user_id: UserId,
	pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomRef {
	room_id: RoomId,
}

/// Events a client may send. Closed union: anything else on the wire is
/// not an error, it is simply not a `ClientEvent`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
	JoinRoom {
		room_id: RoomId,
	},
	LeaveRoom {
		room_id: RoomId,
	},
	Chat(ChatPayload),
	VideoSync(VideoSyncPayload),
	ModeChanged(ModeChangedPayload),
	OwnershipTransferred(OwnershipPayload),
	RoomUpdated(Value),
}

impl ClientEvent {
	/// Wire kind string, matching the inbound `type` field.
	pub const fn kind(&self) -> &'static str {
		match self {
			ClientEvent::JoinRoom { .. } => "join_room",
			ClientEvent::LeaveRoom { .. } => "leave_room",
			ClientEvent::Chat(_) => "message",
			ClientEvent::VideoSync(_) => "video_sync",
			ClientEvent::ModeChanged(_) => "mode_changed",
			ClientEvent::OwnershipTransferred(_) => "ownership_transferred",
			ClientEvent::RoomUpdated(_) => "room_updated",
		}
	}
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	data: Value,
}

/// Parse one inbound text frame.
///
/// Returns `Ok(None)` for recognized-as-JSON frames whose `type` is not a
/// known client kind (silently ignored). Returns an error for frames over
/// `max_frame_size`, frames that are not a JSON envelope, or known kinds
/// with a malformed payload.
pub fn parse_client_event(text: &str, max_frame_size: usize) -> Result<Option<ClientEvent>, ProtocolError> {
	if text.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	let envelope: InboundEnvelope = serde_json::from_str(text)?;
	let event = match envelope.kind.as_str() {
		"join_room" => {
			let RoomRef { room_id } = serde_json::from_value(envelope.data)?;
			ClientEvent::JoinRoom { room_id }
		}
		"leave_room" => {
			let RoomRef { room_id } = serde_json::from_value(envelope.data)?;
			ClientEvent::LeaveRoom { room_id }
		}
		"message" => ClientEvent::Chat(serde_json::from_value(envelope.data)?),
		"video_sync" => ClientEvent::VideoSync(serde_json::from_value(envelope.data)?),
		"mode_changed" => ClientEvent::ModeChanged(serde_json::from_value(envelope.data)?),
		"ownership_transferred" => ClientEvent::OwnershipTransferred(serde_json::from_value(envelope.data)?),
		"room_updated" => ClientEvent::RoomUpdated(envelope.data),
		_ => return Ok(None),
	};

	Ok(Some(event))
}

/// Parse using `DEFAULT_MAX_TEXT_FRAME`.
pub fn parse_client_event_default(text: &str) -> Result<Option<ClientEvent>, ProtocolError> {
	parse_client_event(text, DEFAULT_MAX_TEXT_FRAME)
}

/// Kind + payload of an outbound event, serialized as the adjacent
/// `type`/`data` pair of the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
	UserJoined(PresencePayload),
	UserLeft(PresencePayload),
	#[serde(rename = "message")]
	Chat(ChatPayload),
	VideoSync(VideoSyncPayload),
	ModeChanged(ModeChangedPayload),
	OwnershipTransferred(OwnershipPayload),
	RoomUpdated(Value),
	PlaylistUpdated(Value),
}

impl EventBody {
	/// Wire kind string, matching the outbound `type` field.
	pub const fn kind(&self) -> &'static str {
		match self {
			EventBody::UserJoined(_) => "user_joined",
			EventBody::UserLeft(_) => "user_left",
			EventBody::Chat(_) => "message",
			EventBody::VideoSync(_) => "video_sync",
			EventBody::ModeChanged(_) => "mode_changed",
			EventBody::OwnershipTransferred(_) => "ownership_transferred",
			EventBody::RoomUpdated(_) => "room_updated",
			EventBody::PlaylistUpdated(_) => "playlist_updated",
		}
	}
}

/// One server-to-client frame: a body plus optional sender identity and the
/// server-generated timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
	#[serde(flatten)]
	pub body: EventBody,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<UserId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	/// RFC 3339, UTC, stamped at send time.
	pub timestamp: String,
}

/// Serialize a server event into one text frame, enforcing the size guard.
pub fn encode_server_event(event: &ServerEvent, max_frame_size: usize) -> Result<String, ProtocolError> {
	let text = serde_json::to_string(event)?;
	if text.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode using `DEFAULT_MAX_TEXT_FRAME`.
pub fn encode_server_event_default(event: &ServerEvent) -> Result<String, ProtocolError> {
	encode_server_event(event, DEFAULT_MAX_TEXT_FRAME)
}

/// Parse a server frame, for client-side use.
pub fn parse_server_event(text: &str, max_frame_size: usize) -> Result<ServerEvent, ProtocolError> {
	if text.len() > max_frame_size {
		return Err(ProtocolError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_join_room() {
		let event = parse_client_event_default(r#"{"type":"join_room","data":{"roomId":"r1"}}"#)
			.expect("parse")
			.expect("some");
		assert_eq!(
			event,
			ClientEvent::JoinRoom {
				room_id: "r1".parse().unwrap()
			}
		);
	}

	#[test]
	fn parses_video_sync_fields() {
		let event = parse_client_event_default(r#"{"type":"video_sync","data":{"action":"seek","currentTime":12.5}}"#)
			.expect("parse")
			.expect("some");
		match event {
			ClientEvent::VideoSync(sync) => {
				assert_eq!(sync.action, PlaybackAction::Seek);
				assert_eq!(sync.current_time, 12.5);
				assert!(sync.video_url.is_none());
			}
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn chat_kind_defaults_to_text() {
		let event = parse_client_event_default(r#"{"type":"message","data":{"content":"hi"}}"#)
			.expect("parse")
			.expect("some");
		match event {
			ClientEvent::Chat(chat) => assert_eq!(chat.kind, ChatKind::Text),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn unknown_kind_is_ignored() {
		let parsed = parse_client_event_default(r#"{"type":"telemetry","data":{"x":1}}"#).expect("parse");
		assert!(parsed.is_none());
	}

	#[test]
	fn malformed_known_kind_is_an_error() {
		assert!(parse_client_event_default(r#"{"type":"join_room","data":{}}"#).is_err());
		assert!(parse_client_event_default(r#"{"type":"mode_changed","data":{"mode":"radio"}}"#).is_err());
	}

	#[test]
	fn oversized_frame_is_rejected() {
		let frame = format!(r#"{{"type":"message","data":{{"content":"{}"}}}}"#, "a".repeat(64));
		let err = parse_client_event(&frame, 32).unwrap_err();
		match err {
			ProtocolError::FrameTooLarge { len, max } => assert!(len > max),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn server_event_wire_shape() {
		let event = ServerEvent {
			body: EventBody::UserJoined(PresencePayload {
				user_id: "u1".parse().unwrap(),
				username: "ana".to_string(),
			}),
			room_id: Some("r1".parse().unwrap()),
			user_id: None,
			username: None,
			timestamp: "2026-01-01T00:00:00.000Z".to_string(),
		};

		let text = encode_server_event_default(&event).expect("encode");
		let value: Value = serde_json::from_str(&text).unwrap();
		assert_eq!(value["type"], "user_joined");
		assert_eq!(value["data"]["userId"], "u1");
		assert_eq!(value["data"]["username"], "ana");
		assert_eq!(value["roomId"], "r1");
		assert_eq!(value["timestamp"], "2026-01-01T00:00:00.000Z");
		assert!(value.get("userId").is_none());
	}

	#[test]
	fn chat_body_uses_message_kind_on_the_wire() {
		let event = ServerEvent {
			body: EventBody::Chat(ChatPayload {
				content: "hello".to_string(),
				kind: ChatKind::Gif,
				gif_url: Some("https://example.com/g.gif".to_string()),
				avatar_url: None,
			}),
			room_id: None,
			user_id: Some("u1".parse().unwrap()),
			username: Some("ana".to_string()),
			timestamp: "2026-01-01T00:00:00.000Z".to_string(),
		};

		let value: Value = serde_json::from_str(&encode_server_event_default(&event).unwrap()).unwrap();
		assert_eq!(value["type"], "message");
		assert_eq!(value["data"]["type"], "gif");
		assert_eq!(value["data"]["gifUrl"], "https://example.com/g.gif");
		assert_eq!(value["userId"], "u1");
		assert_eq!(value["username"], "ana");
	}

	#[test]
	fn encode_rejects_too_large() {
		let event = ServerEvent {
			body: EventBody::RoomUpdated(Value::String("x".repeat(10_000))),
			room_id: None,
			user_id: None,
			username: None,
			timestamp: "2026-01-01T00:00:00.000Z".to_string(),
		};

		let err = encode_server_event(&event, 128).unwrap_err();
		match err {
			ProtocolError::FrameTooLarge { len, max } => assert!(len > max),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn server_event_roundtrips_through_parse() {
		let event = ServerEvent {
			body: EventBody::VideoSync(VideoSyncPayload {
				action: PlaybackAction::Play,
				current_time: 101.25,
				video_url: None,
			}),
			room_id: Some("r9".parse().unwrap()),
			user_id: Some("owner".parse().unwrap()),
			username: Some("bo".to_string()),
			timestamp: "2026-01-01T00:00:00.000Z".to_string(),
		};

		let text = encode_server_event_default(&event).expect("encode");
		let back = parse_server_event(&text, DEFAULT_MAX_TEXT_FRAME).expect("parse");
		assert_eq!(back, event);
	}
}
