//! Drift controller (§4.7): invoked once per `ping`, decides whether to
//! nudge a client's playback rate or force a hard resync.
//!
//! This is an enrichment over the original service (whose minimal dispatcher
//! only echoes `ping`); built fresh here in the room/user idiom the rest of
//! this crate uses rather than as a separate actor, since it only needs
//! read/write access to one room's state plus one user's bookkeeping.

use watch_party_types::{ServerMessage, VideoFormat};

use crate::room::{PauseReason, Room};

const STALL_THRESHOLD_SECS: f64 = 0.05;
const STALL_COUNT_FOR_HARD_SYNC: u32 = 2;
const HARD_SYNC_DRIFT_SECS: f64 = 2.0;
const HARD_SYNC_COOLDOWN_SECS: f64 = 2.0;
const SEEK_DEBOUNCE_SECS: f64 = 1.0;
const SOFT_SYNC_COOLDOWN_SECS: f64 = 2.0;
const RECOVERY_COOLDOWN_SECS: f64 = 2.0;
const SOFT_DRIFT_THRESHOLD_SECS: f64 = 0.5;
const VOD_END_GUARD_SECS: f64 = 0.5;
const RATE_FAST: f64 = 1.03;
const RATE_SLOW: f64 = 0.97;
const RATE_NORMAL: f64 = 1.0;

/// Runs the drift algorithm for one `ping` from `user_id` reporting
/// `client_time`. `syncing` is the client's own self-reported mid-seek flag.
pub fn tick(room: &Room, user_id: &str, client_time: f64, syncing: bool, now: f64) {
    if syncing {
        let mut s = room.write_guard();
        if let Some(user) = s.users.get_mut(user_id) {
            user.last_client_time = client_time;
            user.stall_count = 0;
        }
        return;
    }

    let mut s = room.write_guard();
    if s.pause_reason == PauseReason::Seek {
        return;
    }

    if !s.is_playing {
        let reset_uid = s.users.get_mut(user_id).and_then(|user| {
            if user.last_rate_sent != RATE_NORMAL {
                user.last_rate_sent = RATE_NORMAL;
                Some(user.user_id.clone())
            } else {
                None
            }
        });
        drop(s);
        if let Some(uid) = reset_uid {
            room.send_to(&uid, &ServerMessage::SyncCorrection { rate: RATE_NORMAL }, now);
        }
        return;
    }

    if now - s.last_seek_time < SEEK_DEBOUNCE_SECS {
        if let Some(user) = s.users.get_mut(user_id) {
            user.last_client_time = client_time;
            user.stall_count = 0;
        }
        return;
    }

    // `s.users.get_mut` reborrows the whole write guard via `DerefMut`, so
    // every room-level field the rest of this tick needs has to be copied
    // out before `&mut user` is taken, not read alongside it.
    let current_time = s.current_time;
    let updated_at = s.updated_at;
    let last_recovery_time = s.last_recovery_time;
    let video_format = s.video_format;
    let video_duration = s.video_duration;
    let server_time = current_time + (now - updated_at);
    let drift = client_time - server_time;

    enum Action {
        HardSync(String),
        SoftSync(String, f64),
        None,
    }

    let action = {
        let Some(user) = s.users.get_mut(user_id) else { return };

        if (client_time - user.last_client_time).abs() < STALL_THRESHOLD_SECS {
            user.stall_count += 1;
        } else {
            user.stall_count = 0;
        }
        user.last_client_time = client_time;

        let stalled =
            user.stall_count >= STALL_COUNT_FOR_HARD_SYNC && now - user.last_sync_time > HARD_SYNC_COOLDOWN_SECS;
        let drifted = drift.abs() > HARD_SYNC_DRIFT_SECS && now - user.last_sync_time > HARD_SYNC_COOLDOWN_SECS;

        if stalled || drifted {
            user.last_sync_time = now;
            user.last_rate_sent = RATE_NORMAL;
            user.stall_count = 0;
            Action::HardSync(user.user_id.clone())
        } else if now - user.last_sync_time < SOFT_SYNC_COOLDOWN_SECS || now - last_recovery_time < RECOVERY_COOLDOWN_SECS {
            Action::None
        } else {
            let vod_at_end = video_format != VideoFormat::Hls
                && video_duration >= 1.0
                && server_time >= video_duration - VOD_END_GUARD_SECS;
            if vod_at_end || drift.abs() > HARD_SYNC_DRIFT_SECS {
                Action::None
            } else {
                let rate = if drift < -SOFT_DRIFT_THRESHOLD_SECS {
                    RATE_FAST
                } else if drift > SOFT_DRIFT_THRESHOLD_SECS {
                    RATE_SLOW
                } else {
                    RATE_NORMAL
                };
                if rate == user.last_rate_sent {
                    Action::None
                } else {
                    user.last_sync_time = now;
                    user.last_rate_sent = rate;
                    Action::SoftSync(user.user_id.clone(), rate)
                }
            }
        }
    };

    match action {
        Action::HardSync(uid) => {
            s.last_recovery_time = now;
            s.last_auto_resume_time = now;
            drop(s);
            room.send_to(
                &uid,
                &ServerMessage::Sync {
                    is_playing: true,
                    current_time: server_time,
                    force_seek: true,
                    seek_sync: None,
                    seek_epoch: None,
                    triggered_by: "System (Heartbeat Sync)".to_string(),
                },
                now,
            );
        }
        Action::SoftSync(uid, rate) => {
            drop(s);
            room.send_to(&uid, &ServerMessage::SyncCorrection { rate }, now);
        }
        Action::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::VideoFields;
    use crate::user::{Outbound, User};
    use std::sync::{Arc, Mutex};

    struct Recorder(Mutex<Vec<String>>);
    impl Outbound for Recorder {
        fn send(&self, payload: String) -> bool {
            self.0.lock().unwrap().push(payload);
            true
        }
    }

    fn setup() -> (Room, Arc<Recorder>) {
        let room = Room::new("ABCD".to_string(), 0.0);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        room.add_user(User::new("u1".to_string(), "Ada".to_string(), "🎬".to_string(), recorder.clone()));
        room.handle_play(0.0);
        (room, recorder)
    }

    #[test]
    fn small_positive_drift_yields_slow_rate() {
        let (room, recorder) = setup();
        // server_time at now=30.0 is 30.0 (current_time=0, updated_at=0, playing)
        tick(&room, "u1", 30.7, false, 30.0);
        let msgs = recorder.0.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("sync_correction"));
        assert!(msgs[0].contains("0.97"));
    }

    #[test]
    fn small_negative_drift_yields_fast_rate() {
        let (room, recorder) = setup();
        // clearly past the -0.5s threshold, avoiding the exact boundary
        tick(&room, "u1", 29.3, false, 30.0);
        let msgs = recorder.0.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("1.03"));
    }

    #[test]
    fn large_drift_after_cooldown_triggers_hard_sync() {
        let (room, recorder) = setup();
        // server_time at now=10.0 is 10.0 (current_time=0, updated_at=0);
        // client claims 13.0, drift +3.0, well past the hard-sync threshold.
        tick(&room, "u1", 13.0, false, 10.0);
        let msgs = recorder.0.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("\"type\":\"sync\""));
        assert!(msgs[0].contains("Heartbeat Sync"));
    }

    #[test]
    fn seek_barrier_suppresses_drift_control() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        room.add_user(User::new("u1".to_string(), "Ada".to_string(), "🎬".to_string(), recorder.clone()));
        room.handle_play(0.0);
        room.handle_seek(10.0, 1.0);
        tick(&room, "u1", 999.0, false, 2.0);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn not_playing_resets_rate_to_normal_once() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut user = User::new("u1".to_string(), "Ada".to_string(), "🎬".to_string(), recorder.clone());
        user.last_rate_sent = 0.97;
        room.add_user(user);
        tick(&room, "u1", 5.0, false, 5.0);
        let msgs = recorder.0.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("\"rate\":1.0"));
    }

    #[test]
    fn vod_end_guard_suppresses_soft_sync_near_duration() {
        let room = Room::new("ABCD".to_string(), 0.0);
        room.update_video(
            VideoFields {
                video_url: "https://x/v.mp4".to_string(),
                video_title: String::new(),
                video_format: VideoFormat::Mp4,
                video_duration: 30.0,
                subtitle_url: String::new(),
                user_agent: String::new(),
                referer: String::new(),
            },
            0.0,
        );
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        room.add_user(User::new("u1".to_string(), "Ada".to_string(), "🎬".to_string(), recorder.clone()));
        room.handle_play(0.0);
        tick(&room, "u1", 29.8, false, 29.8);
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
