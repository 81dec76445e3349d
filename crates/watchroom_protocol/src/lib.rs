#![forbid(unsafe_code)]

pub mod envelope;

pub use envelope::{
	ChatKind, ChatPayload, ClientEvent, DEFAULT_MAX_TEXT_FRAME, EventBody, ModeChangedPayload, OwnershipPayload,
	PresencePayload, ProtocolError, ServerEvent, VideoSyncPayload, encode_server_event, encode_server_event_default,
	parse_client_event, parse_client_event_default, parse_server_event,
};
