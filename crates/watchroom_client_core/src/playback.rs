#![forbid(unsafe_code)]

//! Owner-driven playback synchronization.
//!
//! One member drives; everyone else follows. The follower side reconciles
//! inbound sync events against the local player, and the owner side decides
//! which local player changes are worth putting on the wire.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use watchroom_domain::{PlaybackAction, PlaybackState};
use watchroom_protocol::VideoSyncPayload;

/// Tunables for playback reconciliation.
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
	/// Position difference past which a follower seeks instead of drifting.
	pub drift_threshold_secs: f64,
	/// Window after applying a remote command during which locally observed
	/// player changes are echoes, not user intent.
	pub sync_guard: Duration,
	/// Minimum spacing between emitted play events.
	pub play_debounce: Duration,
}

impl Default for PlaybackConfig {
	fn default() -> Self {
		Self {
			drift_threshold_secs: 2.0,
			sync_guard: Duration::from_millis(500),
			play_debounce: Duration::from_secs(1),
		}
	}
}

/// Command for the local player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerCommand {
	Play,
	Pause,
	SeekTo(f64),
}

/// Follower side: turns inbound sync events into local player commands.
#[derive(Debug, Default)]
pub struct PlaybackReconciler {
	cfg: PlaybackConfig,
	last_applied: Option<Instant>,
	last_state: Option<PlaybackState>,
}

impl PlaybackReconciler {
	pub fn new(cfg: PlaybackConfig) -> Self {
		Self {
			cfg,
			last_applied: None,
			last_state: None,
		}
	}

	/// Commands to bring the local player in line with one sync event.
	///
	/// Small position differences are tolerated while playing; a seek is
	/// issued only past the drift threshold, so followers are not constantly
	/// jumping.
	pub fn apply(&mut self, sync: &VideoSyncPayload, local_position_secs: f64, now: Instant) -> Vec<PlayerCommand> {
		let drifted = (local_position_secs - sync.current_time).abs() > self.cfg.drift_threshold_secs;

		let mut commands = Vec::new();
		match sync.action {
			PlaybackAction::Play => {
				if drifted {
					commands.push(PlayerCommand::SeekTo(sync.current_time));
				}
				commands.push(PlayerCommand::Play);
			}
			PlaybackAction::Pause => {
				if drifted {
					commands.push(PlayerCommand::SeekTo(sync.current_time));
				}
				commands.push(PlayerCommand::Pause);
			}
			PlaybackAction::Seek => {
				commands.push(PlayerCommand::SeekTo(sync.current_time));
			}
		}

		self.last_applied = Some(now);
		self.last_state = Some(PlaybackState {
			action: sync.action,
			position_secs: sync.current_time,
			updated_at_unix_ms: unix_ms_now(),
		});
		commands
	}

	/// Mirror of the last authoritative playback state, for the viewer UI.
	pub fn last_state(&self) -> Option<PlaybackState> {
		self.last_state
	}

	/// Whether local player changes at `now` are still echoes of the last
	/// applied remote command.
	pub fn in_guard(&self, now: Instant) -> bool {
		self.last_applied.is_some_and(|at| now < at + self.cfg.sync_guard)
	}
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_millis() as i64
}

/// Owner side: decides which local player changes go on the wire.
#[derive(Debug, Default)]
pub struct OwnerEmitter {
	cfg: PlaybackConfig,
	last_play_emit: Option<(Instant, f64)>,
	last_action: Option<PlaybackAction>,
	suppress_until: Option<Instant>,
}

impl OwnerEmitter {
	pub fn new(cfg: PlaybackConfig) -> Self {
		Self {
			cfg,
			last_play_emit: None,
			last_action: None,
			suppress_until: None,
		}
	}

	/// Mark that a remote command was just applied to the local player, so
	/// the resulting player callbacks are not re-emitted.
	pub fn note_remote_applied(&mut self, now: Instant) {
		self.suppress_until = Some(now + self.cfg.sync_guard);
	}

	/// Turn one local player state change into a sync event, or swallow it.
	///
	/// Play is debounced when it repeats at nearly the same position; some
	/// players fire rapid play/playing bursts when buffering resolves.
	/// Consecutive pauses collapse to one. Seek always passes.
	pub fn on_player_state(&mut self, action: PlaybackAction, position_secs: f64, now: Instant) -> Option<VideoSyncPayload> {
		if self.suppress_until.is_some_and(|until| now < until) {
			return None;
		}

		match action {
			PlaybackAction::Play => {
				let burst = self.last_play_emit.is_some_and(|(at, pos)| {
					now < at + self.cfg.play_debounce && (position_secs - pos).abs() <= 1.0
				});
				if burst {
					return None;
				}
				self.last_play_emit = Some((now, position_secs));
			}
			PlaybackAction::Pause => {
				if self.last_action == Some(PlaybackAction::Pause) {
					return None;
				}
			}
			PlaybackAction::Seek => {}
		}

		self.last_action = Some(action);
		Some(VideoSyncPayload {
			action,
			current_time: position_secs,
			video_url: None,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sync(action: PlaybackAction, at: f64) -> VideoSyncPayload {
		VideoSyncPayload {
			action,
			current_time: at,
			video_url: None,
		}
	}

	#[test]
	fn small_drift_plays_without_seeking() {
		let mut reconciler = PlaybackReconciler::new(PlaybackConfig::default());
		let commands = reconciler.apply(&sync(PlaybackAction::Play, 10.0), 11.0, Instant::now());
		assert_eq!(commands, vec![PlayerCommand::Play]);
	}

	#[test]
	fn large_drift_seeks_before_playing() {
		let mut reconciler = PlaybackReconciler::new(PlaybackConfig::default());
		let commands = reconciler.apply(&sync(PlaybackAction::Play, 10.0), 20.0, Instant::now());
		assert_eq!(commands, vec![PlayerCommand::SeekTo(10.0), PlayerCommand::Play]);
	}

	#[test]
	fn seek_always_moves_the_player() {
		let mut reconciler = PlaybackReconciler::new(PlaybackConfig::default());
		let commands = reconciler.apply(&sync(PlaybackAction::Seek, 42.0), 41.9, Instant::now());
		assert_eq!(commands, vec![PlayerCommand::SeekTo(42.0)]);
	}

	#[test]
	fn reconciler_mirrors_the_authoritative_state() {
		let mut reconciler = PlaybackReconciler::new(PlaybackConfig::default());
		assert!(reconciler.last_state().is_none());

		reconciler.apply(&sync(PlaybackAction::Pause, 12.5), 12.5, Instant::now());
		let state = reconciler.last_state().expect("state recorded");
		assert_eq!(state.action, PlaybackAction::Pause);
		assert_eq!(state.position_secs, 12.5);
		assert!(state.updated_at_unix_ms > 0);
	}

	#[test]
	fn guard_window_covers_echoes_of_the_applied_command() {
		let mut reconciler = PlaybackReconciler::new(PlaybackConfig::default());
		let base = Instant::now();

		reconciler.apply(&sync(PlaybackAction::Pause, 5.0), 5.0, base);
		assert!(reconciler.in_guard(base + Duration::from_millis(100)));
		assert!(!reconciler.in_guard(base + Duration::from_millis(600)));
	}

	#[test]
	fn rapid_play_bursts_emit_once() {
		let mut emitter = OwnerEmitter::new(PlaybackConfig::default());
		let base = Instant::now();

		assert!(emitter.on_player_state(PlaybackAction::Play, 1.0, base).is_some());
		assert!(emitter.on_player_state(PlaybackAction::Play, 1.1, base + Duration::from_millis(200)).is_none());
		assert!(emitter.on_player_state(PlaybackAction::Play, 2.5, base + Duration::from_millis(1500)).is_some());
	}

	#[test]
	fn a_quick_play_at_a_new_position_still_emits() {
		let mut emitter = OwnerEmitter::new(PlaybackConfig::default());
		let base = Instant::now();

		assert!(emitter.on_player_state(PlaybackAction::Play, 1.0, base).is_some());
		// A seek-then-play lands far from the last emit; not a burst.
		assert!(emitter.on_player_state(PlaybackAction::Play, 30.0, base + Duration::from_millis(200)).is_some());
	}

	#[test]
	fn consecutive_pauses_collapse_to_one() {
		let mut emitter = OwnerEmitter::new(PlaybackConfig::default());
		let base = Instant::now();

		assert!(emitter.on_player_state(PlaybackAction::Pause, 1.0, base).is_some());
		assert!(emitter.on_player_state(PlaybackAction::Pause, 1.0, base + Duration::from_millis(50)).is_none());

		// A play in between makes the next pause meaningful again.
		assert!(emitter.on_player_state(PlaybackAction::Play, 1.0, base + Duration::from_secs(2)).is_some());
		assert!(emitter.on_player_state(PlaybackAction::Pause, 3.0, base + Duration::from_secs(4)).is_some());
	}

	#[test]
	fn seek_is_never_debounced() {
		let mut emitter = OwnerEmitter::new(PlaybackConfig::default());
		let base = Instant::now();

		assert!(emitter.on_player_state(PlaybackAction::Seek, 9.0, base).is_some());
		assert!(emitter.on_player_state(PlaybackAction::Seek, 9.5, base + Duration::from_millis(10)).is_some());
	}

	#[test]
	fn echoes_inside_the_guard_window_are_swallowed() {
		let mut emitter = OwnerEmitter::new(PlaybackConfig::default());
		let base = Instant::now();

		emitter.note_remote_applied(base);
		assert!(emitter.on_player_state(PlaybackAction::Play, 1.0, base + Duration::from_millis(100)).is_none());
		assert!(emitter.on_player_state(PlaybackAction::Play, 1.6, base + Duration::from_millis(700)).is_some());
	}
}
