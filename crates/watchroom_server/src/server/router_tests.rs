#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use watchroom_domain::{RoomMode, UserRef};
use watchroom_protocol::{EventBody, ModeChangedPayload};

use crate::server::history::MessageHistory;
use crate::server::registry::{ConnectionHandle, Outbound, RoomService, RoomServiceConfig};
use crate::server::router::{EventRouter, RouterConfig};

fn make_router() -> EventRouter {
	EventRouter::new(
		RoomService::new(RoomServiceConfig::default()),
		MessageHistory::new(10),
		RouterConfig::default(),
	)
}

async fn admit(router: &EventRouter, conn_id: u64, name: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
	let identity = UserRef {
		user_id: format!("u-{name}").parse().unwrap(),
		username: name.to_string(),
	};
	router.service().register(conn_id, identity).await
}

async fn join(router: &EventRouter, conn: &Arc<ConnectionHandle>, room: &str) {
	let frame = format!(r#"{{"type":"join_room","data":{{"roomId":"{room}"}}}}"#);
	router.dispatch(conn, &frame).await;
}

async fn recv_event(rx: &mut mpsc::Receiver<Outbound>) -> Value {
	match timeout(Duration::from_millis(250), rx.recv()).await {
		Ok(Some(Outbound::Frame(text))) => serde_json::from_str(&text).expect("valid JSON frame"),
		other => panic!("expected a frame, got {other:?}"),
	}
}

async fn assert_silent(rx: &mut mpsc::Receiver<Outbound>) {
	if let Ok(item) = timeout(Duration::from_millis(100), rx.recv()).await {
		panic!("expected no delivery, got {item:?}");
	}
}

#[tokio::test]
async fn joining_announces_to_existing_members_but_not_the_joiner() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, mut rx_bob) = admit(&router, 2, "bob").await;

	join(&router, &ana, "movie-night").await;
	assert_silent(&mut rx_ana).await;

	join(&router, &bob, "movie-night").await;
	let event = recv_event(&mut rx_ana).await;
	assert_eq!(event["type"], "user_joined");
	assert_eq!(event["roomId"], "movie-night");
	assert_eq!(event["data"]["userId"], "u-bob");
	assert_eq!(event["data"]["username"], "bob");
	assert!(event["timestamp"].is_string());

	assert_silent(&mut rx_bob).await;
}

#[tokio::test]
async fn reentrant_join_announces_nothing() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, mut rx_bob) = admit(&router, 2, "bob").await;
	join(&router, &ana, "movie-night").await;
	join(&router, &bob, "movie-night").await;
	let _ = recv_event(&mut rx_ana).await;

	join(&router, &bob, "movie-night").await;
	assert_silent(&mut rx_ana).await;
	assert_silent(&mut rx_bob).await;
}

#[tokio::test]
async fn switching_rooms_announces_the_departure_to_the_old_room() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, _rx_bob) = admit(&router, 2, "bob").await;
	join(&router, &ana, "old").await;
	join(&router, &bob, "old").await;
	let _ = recv_event(&mut rx_ana).await;

	join(&router, &bob, "new").await;
	let event = recv_event(&mut rx_ana).await;
	assert_eq!(event["type"], "user_left");
	assert_eq!(event["roomId"], "old");
	assert_eq!(event["data"]["userId"], "u-bob");
}

#[tokio::test]
async fn chat_reaches_everyone_including_the_sender() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, mut rx_bob) = admit(&router, 2, "bob").await;
	join(&router, &ana, "movie-night").await;
	join(&router, &bob, "movie-night").await;
	let _ = recv_event(&mut rx_ana).await;

	router
		.dispatch(&ana, r#"{"type":"message","data":{"content":"hi there"}}"#)
		.await;

	for rx in [&mut rx_ana, &mut rx_bob] {
		let event = recv_event(rx).await;
		assert_eq!(event["type"], "message");
		assert_eq!(event["data"]["content"], "hi there");
		assert_eq!(event["userId"], "u-ana");
		assert_eq!(event["username"], "ana");
	}

	let room = "movie-night".parse().unwrap();
	let recent = router.history().recent(&room).await;
	assert_eq!(recent.len(), 1);
	assert_eq!(recent[0].content, "hi there");
	assert_eq!(recent[0].sender.username, "ana");
}

#[tokio::test]
async fn video_sync_excludes_the_sender() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, mut rx_bob) = admit(&router, 2, "bob").await;
	join(&router, &ana, "movie-night").await;
	join(&router, &bob, "movie-night").await;
	let _ = recv_event(&mut rx_ana).await;

	router
		.dispatch(&ana, r#"{"type":"video_sync","data":{"action":"seek","currentTime":42.5}}"#)
		.await;

	let event = recv_event(&mut rx_bob).await;
	assert_eq!(event["type"], "video_sync");
	assert_eq!(event["data"]["action"], "seek");
	assert_eq!(event["data"]["currentTime"], 42.5);
	assert_eq!(event["userId"], "u-ana");

	assert_silent(&mut rx_ana).await;
}

#[tokio::test]
async fn mode_change_echoes_back_to_the_sender_too() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	join(&router, &ana, "movie-night").await;

	router
		.dispatch(&ana, r#"{"type":"mode_changed","data":{"mode":"screen_share"}}"#)
		.await;

	let event = recv_event(&mut rx_ana).await;
	assert_eq!(event["type"], "mode_changed");
	assert_eq!(event["data"]["mode"], "screen_share");
	assert_eq!(event["username"], "ana");
}

#[tokio::test]
async fn events_from_outside_any_room_are_dropped() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;

	router.dispatch(&ana, r#"{"type":"message","data":{"content":"void"}}"#).await;
	router
		.dispatch(&ana, r#"{"type":"video_sync","data":{"action":"play","currentTime":0.0}}"#)
		.await;

	assert_silent(&mut rx_ana).await;
	let room = "movie-night".parse().unwrap();
	assert!(router.history().recent(&room).await.is_empty());
}

#[tokio::test]
async fn leaving_a_room_the_connection_is_not_in_announces_nothing() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, _rx_bob) = admit(&router, 2, "bob").await;
	join(&router, &ana, "movie-night").await;

	router
		.dispatch(&bob, r#"{"type":"leave_room","data":{"roomId":"movie-night"}}"#)
		.await;
	assert_silent(&mut rx_ana).await;
}

#[tokio::test]
async fn disconnect_announces_the_departure_once() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	let (bob, _rx_bob) = admit(&router, 2, "bob").await;
	join(&router, &ana, "movie-night").await;
	join(&router, &bob, "movie-night").await;
	let _ = recv_event(&mut rx_ana).await;

	router.handle_disconnect(2).await;
	let event = recv_event(&mut rx_ana).await;
	assert_eq!(event["type"], "user_left");
	assert_eq!(event["data"]["username"], "bob");

	// Second teardown for the same connection stays quiet.
	router.handle_disconnect(2).await;
	assert_silent(&mut rx_ana).await;
}

#[tokio::test]
async fn server_originated_broadcasts_carry_no_sender_identity() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	join(&router, &ana, "movie-night").await;

	let room = "movie-night".parse().unwrap();
	router
		.broadcast_to_room(&room, EventBody::ModeChanged(ModeChangedPayload { mode: RoomMode::Video }))
		.await;

	let event = recv_event(&mut rx_ana).await;
	assert_eq!(event["type"], "mode_changed");
	assert_eq!(event["roomId"], "movie-night");
	assert!(event.get("userId").is_none());
	assert!(event.get("username").is_none());
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_ignored() {
	let router = make_router();
	let (ana, mut rx_ana) = admit(&router, 1, "ana").await;
	join(&router, &ana, "movie-night").await;

	router.dispatch(&ana, "not json at all").await;
	router.dispatch(&ana, r#"{"type":"set_fire_to_the_room","data":{}}"#).await;

	assert_silent(&mut rx_ana).await;
	assert_eq!(router.service().room_of(1).await, Some("movie-night".parse().unwrap()));
}
