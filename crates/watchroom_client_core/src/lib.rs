#![forbid(unsafe_code)]

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use watchroom_domain::RoomId;
use watchroom_protocol::{
	ChatPayload, DEFAULT_MAX_TEXT_FRAME, ModeChangedPayload, OwnershipPayload, ProtocolError, ServerEvent,
	VideoSyncPayload, parse_server_event,
};
use watchroom_util::endpoint::WsEndpoint;

pub mod bridge;
pub mod playback;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server endpoint.
	pub endpoint: WsEndpoint,

	/// Access token presented in the upgrade request.
	pub token: String,

	/// Maximum inbound/outbound text frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + upgrade.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	pub fn new(endpoint: WsEndpoint, token: impl Into<String>) -> Self {
		Self {
			endpoint,
			token: token.into(),
			max_frame_bytes: DEFAULT_MAX_TEXT_FRAME,
			connect_timeout: Duration::from_secs(15),
		}
	}

	/// Convenience: create a config from `ws://host:port`.
	pub fn from_ws_endpoint(endpoint: &str, token: impl Into<String>) -> Result<Self, ClientCoreError> {
		let endpoint = WsEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Connect(format!("invalid endpoint (expected ws://host:port): {msg}")))?;
		Ok(Self::new(endpoint, token))
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Frame encoding/decoding error.
	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	/// Transport error after the session was established.
	#[error("websocket error: {0}")]
	Ws(#[from] tokio_tungstenite::tungstenite::Error),

	/// The server closed the session.
	#[error("server closed the session (code {code:?}: {reason})")]
	Closed { code: Option<u16>, reason: String },
}

/// One established realtime session.
pub struct Session {
	sink: SplitSink<WsStream, Message>,
	source: SplitStream<WsStream>,
	max_frame_bytes: usize,
}

impl Session {
	/// Connect and complete the websocket upgrade.
	pub async fn connect(cfg: &ClientConfig) -> Result<Self, ClientCoreError> {
		let url = cfg.endpoint.ws_url(&cfg.token);

		let (ws, _response) = tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(url))
			.await
			.map_err(|_| ClientCoreError::Connect(format!("connect timeout after {:?}", cfg.connect_timeout)))?
			.map_err(|e| ClientCoreError::Connect(format!("connect to {}: {e}", cfg.endpoint.hostport())))?;

		info!(endpoint = %cfg.endpoint.hostport(), "connected");

		let (sink, source) = ws.split();
		Ok(Self {
			sink,
			source,
			max_frame_bytes: cfg.max_frame_bytes,
		})
	}

	pub async fn join_room(&mut self, room: &RoomId) -> Result<(), ClientCoreError> {
		self.send_envelope("join_room", json!({ "roomId": room })).await
	}

	pub async fn leave_room(&mut self, room: &RoomId) -> Result<(), ClientCoreError> {
		self.send_envelope("leave_room", json!({ "roomId": room })).await
	}

	pub async fn send_chat(&mut self, chat: &ChatPayload) -> Result<(), ClientCoreError> {
		self.send_envelope("message", to_value(chat)?).await
	}

	pub async fn send_sync(&mut self, sync: &VideoSyncPayload) -> Result<(), ClientCoreError> {
		self.send_envelope("video_sync", to_value(sync)?).await
	}

	pub async fn send_mode_change(&mut self, mode: &ModeChangedPayload) -> Result<(), ClientCoreError> {
		self.send_envelope("mode_changed", to_value(mode)?).await
	}

	pub async fn transfer_ownership(&mut self, transfer: &OwnershipPayload) -> Result<(), ClientCoreError> {
		self.send_envelope("ownership_transferred", to_value(transfer)?).await
	}

	pub async fn send_room_update(&mut self, update: Value) -> Result<(), ClientCoreError> {
		self.send_envelope("room_updated", update).await
	}

	/// Escape hatch for event kinds without a dedicated helper.
	pub async fn send_event(&mut self, kind: &str, data: Value) -> Result<(), ClientCoreError> {
		self.send_envelope(kind, data).await
	}

	/// Next server event.
	///
	/// Frames with an unrecognized shape are skipped, transport pings are
	/// answered inline, and a server close surfaces as `Closed` so callers
	/// can inspect the application close code.
	pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ClientCoreError> {
		loop {
			let Some(msg) = self.source.next().await else {
				return Ok(None);
			};

			match msg? {
				Message::Text(text) => match parse_server_event(text.as_str(), self.max_frame_bytes) {
					Ok(event) => return Ok(Some(event)),
					Err(e @ ProtocolError::FrameTooLarge { .. }) => return Err(e.into()),
					Err(e) => {
						debug!(error = %e, "skipping unrecognized frame");
					}
				},
				Message::Ping(payload) => {
					self.sink.send(Message::Pong(payload)).await?;
				}
				Message::Close(frame) => {
					let (code, reason) = match frame {
						Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
						None => (None, String::new()),
					};
					return Err(ClientCoreError::Closed { code, reason });
				}
				Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
			}
		}
	}

	/// Drain server events into `on_event` until the session ends.
	pub async fn run_events_loop(&mut self, mut on_event: impl FnMut(ServerEvent)) -> Result<(), ClientCoreError> {
		while let Some(event) = self.next_event().await? {
			on_event(event);
		}
		Ok(())
	}

	/// Send a close frame and drop the session.
	pub async fn close(mut self) -> Result<(), ClientCoreError> {
		self.sink.send(Message::Close(None)).await?;
		Ok(())
	}

	async fn send_envelope(&mut self, kind: &str, data: Value) -> Result<(), ClientCoreError> {
		let frame = json!({ "type": kind, "data": data }).to_string();
		if frame.len() > self.max_frame_bytes {
			return Err(ProtocolError::FrameTooLarge {
				len: frame.len(),
				max: self.max_frame_bytes,
			}
			.into());
		}

		self.sink.send(Message::text(frame)).await?;
		Ok(())
	}
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ClientCoreError> {
	serde_json::to_value(value).map_err(|e| ClientCoreError::Protocol(ProtocolError::Json(e)))
}
