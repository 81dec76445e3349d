#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, info, warn};
use watchroom_domain::{UserId, UserRef};

use crate::server::auth::{CLOSE_AUTH_INVALID, CLOSE_AUTH_REQUIRED, TokenVerifier};
use crate::server::registry::Outbound;
use crate::server::router::EventRouter;

/// WebSocket upgrade path served by the realtime core.
pub const WS_PATH: &str = "/ws";

/// Serve one client connection end to end: upgrade, authenticate, pump
/// frames, tear down.
///
/// Auth failures complete the handshake so the application close code
/// (4001/4002) reaches the client, then close before the connection ever
/// registers.
pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	router: EventRouter,
	verifier: Arc<dyn TokenVerifier>,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("watchroom_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("watchroom_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let ws_config = WebSocketConfig::default()
		.max_message_size(Some(router.max_frame_bytes()))
		.max_frame_size(Some(router.max_frame_bytes()));

	let mut token: Option<String> = None;
	let callback = |req: &Request, resp: Response| {
		if req.uri().path() != WS_PATH {
			let mut not_found = ErrorResponse::new(None);
			*not_found.status_mut() = StatusCode::NOT_FOUND;
			return Err(not_found);
		}

		token = token_from_query(req.uri().query());
		Ok(resp)
	};

	let mut ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
		.await
		.context("websocket handshake")?;

	let Some(token) = token else {
		warn!(conn_id, "no token in upgrade request; closing");
		close_with(&mut ws, CLOSE_AUTH_REQUIRED, "authentication token required").await;
		return Ok(());
	};

	let identity = match verifier.verify(&token) {
		Ok(claims) => match UserId::new(claims.sub) {
			Ok(user_id) => UserRef {
				user_id,
				username: claims.username,
			},
			Err(_) => {
				warn!(conn_id, "token carries an empty subject; closing");
				close_with(&mut ws, CLOSE_AUTH_INVALID, "invalid authentication token").await;
				return Ok(());
			}
		},
		Err(e) => {
			warn!(conn_id, error = %e, "token rejected; closing");
			close_with(&mut ws, CLOSE_AUTH_INVALID, "invalid authentication token").await;
			return Ok(());
		}
	};

	info!(conn_id, user_id = %identity.user_id, username = %identity.username, "connection admitted");
	let (handle, mut outbound_rx) = router.service().register(conn_id, identity).await;

	let (mut sink, mut source) = ws.split();

	let writer = tokio::spawn(async move {
		while let Some(item) = outbound_rx.recv().await {
			let msg = match item {
				Outbound::Frame(text) => Message::text(&*text),
				Outbound::Ping => Message::Ping(Bytes::new()),
				Outbound::Pong(payload) => Message::Pong(payload),
				Outbound::Close { code, reason } => {
					// `from` maps standard codes (1001 -> Away) and keeps the
					// 4000-4999 range in Library.
					let _ = sink
						.send(Message::Close(Some(CloseFrame {
							code: CloseCode::from(code),
							reason: reason.into(),
						})))
						.await;
					break;
				}
			};

			if sink.send(msg).await.is_err() {
				break;
			}
		}

		let _ = sink.close().await;
	});

	loop {
		tokio::select! {
			// The heartbeat reaper fires this for peers that stopped
			// answering; without it the read half would park forever.
			_ = handle.shutdown_requested() => {
				debug!(conn_id, "shutdown requested; dropping socket");
				break;
			}
			msg = source.next() => {
				let Some(msg) = msg else { break };
				match msg {
					Ok(Message::Text(text)) => {
						metrics::counter!("watchroom_server_frames_in_total").increment(1);
						router.dispatch(&handle, text.as_str()).await;
					}
					// Only a Pong proves liveness; data frames do not reset the flag.
					Ok(Message::Pong(_)) => handle.mark_alive(),
					Ok(Message::Ping(payload)) => {
						handle.try_send(Outbound::Pong(payload));
					}
					Ok(Message::Close(frame)) => {
						debug!(conn_id, ?frame, "client closed");
						break;
					}
					Ok(Message::Binary(_)) => {
						debug!(conn_id, "ignoring binary frame");
					}
					Ok(Message::Frame(_)) => {}
					Err(e) => {
						debug!(conn_id, error = %e, "websocket read ended");
						break;
					}
				}
			}
		}
	}

	router.handle_disconnect(conn_id).await;

	// Dropping the last handle closes the outbound queue and lets the
	// writer flush and exit.
	drop(handle);
	let _ = writer.await;

	Ok(())
}

async fn close_with(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: &'static str) {
	let _ = ws
		.close(Some(CloseFrame {
			code: CloseCode::Library(code),
			reason: reason.into(),
		}))
		.await;
}

fn token_from_query(query: Option<&str>) -> Option<String> {
	query?
		.split('&')
		.find_map(|pair| pair.strip_prefix("token="))
		.filter(|v| !v.is_empty())
		.map(str::to_string)
}
