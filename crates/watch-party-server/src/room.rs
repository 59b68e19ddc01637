//! The room state machine: playback timeline, barrier coordination, chat,
//! and presence. One `Room` per party; all fields live behind a single
//! read/write lock (`RoomState`), matching §3/§4.4-4.5/§4.8 of the design.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use watch_party_types::{ChatMessage, ServerMessage, UserSummary, VideoFormat};

use crate::user::User;

const CHAT_CAP: usize = 100;
const BUFFER_SPAM_LIMIT: u32 = 3;
const BUFFER_SPAM_WINDOW_SECS: f64 = 30.0;
const AUTO_RESUME_COOLDOWN_SECS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    None,
    Manual,
    Buffer,
    Seek,
}

impl Default for PauseReason {
    fn default() -> Self {
        PauseReason::None
    }
}

pub struct RoomState {
    pub video_url: String,
    pub video_title: String,
    pub video_format: VideoFormat,
    pub video_duration: f64,
    pub subtitle_url: String,
    pub user_agent: String,
    pub referer: String,

    pub current_time: f64,
    pub is_playing: bool,
    pub updated_at: f64,
    pub host_id: String,

    pub last_play_time: f64,
    pub last_pause_time: f64,
    pub last_seek_time: f64,
    pub last_auto_resume_time: f64,
    pub last_recovery_time: f64,

    pub users: HashMap<String, User>,
    pub chat_messages: VecDeque<ChatMessage>,
    pub buffering_users: HashSet<String>,
    pub buffer_start_time_by_user: HashMap<String, f64>,
    pub buffer_end_time_by_user: HashMap<String, f64>,

    pub pause_reason: PauseReason,
    pub seek_sync_epoch: u64,
    pub seek_sync_waiting_users: HashSet<String>,
    pub seek_sync_was_playing: bool,
    pub seek_sync_target_time: f64,
}

impl RoomState {
    fn new(now: f64) -> Self {
        Self {
            video_url: String::new(),
            video_title: String::new(),
            video_format: VideoFormat::Hls,
            video_duration: 0.0,
            subtitle_url: String::new(),
            user_agent: String::new(),
            referer: String::new(),

            current_time: 0.0,
            is_playing: false,
            updated_at: now,
            host_id: String::new(),

            last_play_time: 0.0,
            last_pause_time: 0.0,
            last_seek_time: 0.0,
            last_auto_resume_time: 0.0,
            last_recovery_time: 0.0,

            users: HashMap::new(),
            chat_messages: VecDeque::new(),
            buffering_users: HashSet::new(),
            buffer_start_time_by_user: HashMap::new(),
            buffer_end_time_by_user: HashMap::new(),

            pause_reason: PauseReason::None,
            seek_sync_epoch: 0,
            seek_sync_waiting_users: HashSet::new(),
            seek_sync_was_playing: false,
            seek_sync_target_time: 0.0,
        }
    }
}

/// Clamp a reported playback position per invariant 8: non-HLS videos with a
/// known duration never report past `duration - 0.25`.
fn clamp_live(value: f64, format: VideoFormat, duration: f64) -> f64 {
    let mut v = value.max(0.0);
    if format != VideoFormat::Hls && duration > 0.0 {
        let safe_end = (duration - 0.25).max(0.0);
        if v > safe_end {
            v = safe_end;
        }
    }
    v
}

fn live_time_locked(s: &RoomState, now: f64) -> f64 {
    let mut t = s.current_time;
    if s.is_playing {
        t += now - s.updated_at;
    }
    clamp_live(t, s.video_format, s.video_duration)
}

fn user_summaries_locked(s: &RoomState) -> Vec<UserSummary> {
    s.users
        .values()
        .map(|u| UserSummary {
            user_id: u.user_id.clone(),
            username: u.username.clone(),
            avatar: u.avatar.clone(),
            is_host: u.user_id == s.host_id,
        })
        .collect()
}

fn reset_all_rates(s: &mut RoomState) {
    for user in s.users.values_mut() {
        user.last_rate_sent = 1.0;
    }
}

pub struct Room {
    pub room_id: String,
    state: RwLock<RoomState>,
}

pub struct VideoFields {
    pub video_url: String,
    pub video_title: String,
    pub video_format: VideoFormat,
    pub video_duration: f64,
    pub subtitle_url: String,
    pub user_agent: String,
    pub referer: String,
}

impl Room {
    pub fn new(room_id: String, now: f64) -> Self {
        Self { room_id, state: RwLock::new(RoomState::new(now)) }
    }

    fn read(&self) -> RwLockReadGuard<'_, RoomState> {
        self.state.read().unwrap()
    }

    fn write(&self) -> RwLockWriteGuard<'_, RoomState> {
        self.state.write().unwrap()
    }

    // ---- 4.4 primitives -------------------------------------------------

    pub fn add_user(&self, user: User) {
        let mut s = self.write();
        if s.host_id.is_empty() {
            s.host_id = user.user_id.clone();
        }
        s.users.insert(user.user_id.clone(), user);
    }

    pub fn remove_user(&self, user_id: &str) {
        let mut s = self.write();
        s.users.remove(user_id);
        s.buffering_users.remove(user_id);
        s.buffer_start_time_by_user.remove(user_id);
        s.buffer_end_time_by_user.remove(user_id);
        s.seek_sync_waiting_users.remove(user_id);
    }

    pub fn user_count(&self) -> usize {
        self.read().users.len()
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.read().host_id == user_id
    }

    pub fn broadcast(&self, msg: &ServerMessage, exclude_user_id: Option<&str>, now: f64) {
        let s = self.read();
        for (id, user) in s.users.iter() {
            if Some(id.as_str()) == exclude_user_id {
                continue;
            }
            user.send(msg, now);
        }
    }

    pub fn send_to(&self, user_id: &str, msg: &ServerMessage, now: f64) {
        let s = self.read();
        if let Some(user) = s.users.get(user_id) {
            user.send(msg, now);
        }
    }

    pub fn user_summaries(&self) -> Vec<UserSummary> {
        user_summaries_locked(&self.read())
    }

    pub fn username(&self, user_id: &str) -> Option<String> {
        self.read().users.get(user_id).map(|u| u.username.clone())
    }

    pub fn user_identity(&self, user_id: &str) -> Option<(String, String)> {
        self.read().users.get(user_id).map(|u| (u.username.clone(), u.avatar.clone()))
    }

    pub fn get_state(&self, now: f64) -> watch_party_types::RoomState {
        let s = self.read();
        watch_party_types::RoomState {
            room_id: self.room_id.clone(),
            video_url: s.video_url.clone(),
            video_title: s.video_title.clone(),
            video_format: s.video_format,
            video_duration: s.video_duration,
            subtitle_url: s.subtitle_url.clone(),
            current_time: live_time_locked(&s, now),
            is_playing: s.is_playing,
            user_agent: s.user_agent.clone(),
            referer: s.referer.clone(),
            host_id: s.host_id.clone(),
            users: user_summaries_locked(&s),
            chat_messages: s.chat_messages.iter().cloned().collect(),
        }
    }

    pub fn snapshot_live(&self, now: f64) -> (bool, f64) {
        let s = self.read();
        (s.is_playing, live_time_locked(&s, now))
    }

    pub fn pause_reason(&self) -> PauseReason {
        self.read().pause_reason
    }

    pub fn push_chat(&self, chat: ChatMessage) {
        let mut s = self.write();
        s.chat_messages.push_back(chat);
        while s.chat_messages.len() > CHAT_CAP {
            s.chat_messages.pop_front();
        }
    }

    // ---- 4.5 verbs --------------------------------------------------------

    /// `Play`, folded together with the handler-level barrier-cancel policy
    /// from §4.9 so both happen under one lock acquisition. Returns `None`
    /// when already playing (no-op, per spec).
    pub fn handle_play(&self, now: f64) -> Option<f64> {
        let mut s = self.write();
        if s.is_playing {
            return None;
        }
        if s.pause_reason == PauseReason::Seek {
            s.seek_sync_waiting_users.clear();
            s.seek_sync_was_playing = false;
        }
        s.is_playing = true;
        s.updated_at = now;
        s.last_play_time = now;
        s.pause_reason = PauseReason::None;
        s.buffering_users.clear();
        reset_all_rates(&mut s);
        Some(s.current_time)
    }

    /// `Pause`, folded together with the handler-level "cancel any seek
    /// barrier" policy from §4.9 (clearing the waiting set and
    /// `seek_sync_was_playing` so a straggling `seek_ready` or the original
    /// timeout can't force an unwanted resume after a user explicitly
    /// paused — see the open-question resolution in `SPEC_FULL.md` §9).
    pub fn handle_pause(&self, now: f64) -> f64 {
        let mut s = self.write();
        if s.pause_reason == PauseReason::Seek {
            s.seek_sync_waiting_users.clear();
            s.seek_sync_was_playing = false;
        }
        if s.is_playing {
            s.current_time += now - s.updated_at;
        }
        s.is_playing = false;
        s.updated_at = now;
        s.last_pause_time = now;
        s.pause_reason = PauseReason::Manual;
        s.current_time
    }

    /// `Seek(room_id, target_time)`.
    pub fn handle_seek(&self, target_time: f64, now: f64) -> (u64, f64) {
        let mut s = self.write();
        let final_time = clamp_live(target_time.max(0.0), s.video_format, s.video_duration);

        s.seek_sync_epoch += 1;
        let epoch = s.seek_sync_epoch;
        s.seek_sync_waiting_users = s.users.keys().cloned().collect();

        if s.pause_reason != PauseReason::Seek {
            s.seek_sync_was_playing = s.is_playing;
        }

        s.seek_sync_target_time = final_time;
        s.is_playing = false;
        s.current_time = final_time;
        s.updated_at = now;
        s.last_seek_time = now;
        s.pause_reason = PauseReason::Seek;
        reset_all_rates(&mut s);

        (epoch, final_time)
    }

    /// `MarkSeekReady(room_id, user_id, epoch)`. `user_id == "system"` is the
    /// barrier-timeout sentinel and clears every waiter at once.
    pub fn mark_seek_ready(&self, user_id: &str, epoch: u64, now: f64) -> (bool, f64) {
        let mut s = self.write();
        if epoch != s.seek_sync_epoch {
            return (false, 0.0);
        }
        if user_id == "system" {
            s.seek_sync_waiting_users.clear();
        } else {
            s.seek_sync_waiting_users.remove(user_id);
        }
        if s.seek_sync_waiting_users.is_empty() && s.seek_sync_was_playing {
            s.is_playing = true;
            s.updated_at = now;
            s.pause_reason = PauseReason::None;
            s.seek_sync_was_playing = false;
            s.seek_sync_epoch += 1;
            reset_all_rates(&mut s);
            return (true, s.current_time);
        }
        (false, 0.0)
    }

    /// `UpdateVideo(room_id, fields...)`.
    pub fn update_video(&self, fields: VideoFields, now: f64) {
        let mut s = self.write();
        s.video_url = fields.video_url;
        s.video_title = fields.video_title;
        s.video_format = fields.video_format;
        s.video_duration = fields.video_duration;
        s.subtitle_url = fields.subtitle_url;
        s.user_agent = fields.user_agent;
        s.referer = fields.referer;
        s.current_time = 0.0;
        s.is_playing = false;
        s.updated_at = now;
    }

    // ---- 4.8 buffer handling ----------------------------------------------

    /// Records a `buffer_start` unless the per-user spam guard trips.
    /// Returns the start timestamp to hand to the delayed-pause task, or
    /// `None` if this event was ignored as spam.
    pub fn record_buffer_start(&self, user_id: &str, now: f64) -> Option<f64> {
        let mut s = self.write();
        let Some(user) = s.users.get_mut(user_id) else { return None };

        if now - user.last_buffer_trigger_time > BUFFER_SPAM_WINDOW_SECS {
            user.buffer_trigger_count = 0;
            user.last_buffer_trigger_time = now;
        }
        user.buffer_trigger_count += 1;
        if user.buffer_trigger_count > BUFFER_SPAM_LIMIT {
            return None;
        }

        s.buffer_start_time_by_user.insert(user_id.to_string(), now);
        s.buffering_users.insert(user_id.to_string());
        Some(now)
    }

    /// Re-checked by the delayed buffer-pause task after its 2s sleep.
    /// Transitions to a buffer pause only if nothing has changed since the
    /// triggering `buffer_start` (same-event check).
    pub fn try_buffer_pause(&self, user_id: &str, start_time: f64, now: f64) -> Option<f64> {
        let mut s = self.write();
        let still_buffering = s.buffering_users.contains(user_id);
        let same_event = s.buffer_start_time_by_user.get(user_id).copied() == Some(start_time);
        if !(still_buffering && same_event && s.is_playing && s.pause_reason != PauseReason::Seek) {
            return None;
        }
        s.current_time += now - s.updated_at;
        s.is_playing = false;
        s.updated_at = now;
        s.last_pause_time = now;
        s.pause_reason = PauseReason::Buffer;
        reset_all_rates(&mut s);
        Some(s.current_time)
    }

    pub fn record_buffer_end(&self, user_id: &str, now: f64) {
        let mut s = self.write();
        s.buffering_users.remove(user_id);
        s.buffer_end_time_by_user.insert(user_id.to_string(), now);
    }

    /// Resumes playback once nobody is buffering, subject to the 3s
    /// auto-resume cooldown.
    pub fn try_auto_resume(&self, now: f64) -> Option<f64> {
        let mut s = self.write();
        if s.pause_reason != PauseReason::Buffer {
            return None;
        }
        if !s.buffering_users.is_empty() {
            return None;
        }
        if now - s.last_auto_resume_time < AUTO_RESUME_COOLDOWN_SECS {
            return None;
        }
        s.is_playing = true;
        s.updated_at = now;
        s.last_auto_resume_time = now;
        s.pause_reason = PauseReason::None;
        reset_all_rates(&mut s);
        Some(s.current_time)
    }

    // ---- 4.6 sweeper --------------------------------------------------------

    /// Removes every user whose send has ever failed. Returns
    /// `(user_id, username)` for each reaped user, for the caller to
    /// broadcast `user_left` with.
    pub fn reap_dead(&self) -> Vec<(String, String)> {
        let mut s = self.write();
        let dead: Vec<String> = s
            .users
            .iter()
            .filter(|(_, u)| u.has_failed_send())
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::new();
        for id in dead {
            if let Some(user) = s.users.remove(&id) {
                s.buffering_users.remove(&id);
                s.buffer_start_time_by_user.remove(&id);
                s.buffer_end_time_by_user.remove(&id);
                s.seek_sync_waiting_users.remove(&id);
                reaped.push((id, user.username));
            }
        }

        if !reaped.is_empty() && reaped.iter().any(|(id, _)| *id == s.host_id) {
            s.host_id.clear();
        }
        if s.host_id.is_empty() {
            if let Some(new_host) = s.users.keys().next().cloned() {
                s.host_id = new_host;
            }
        }

        reaped
    }

    // For drift.rs, which needs direct read/write access to room-scoped
    // per-user fields alongside sibling room fields in one critical section.
    pub(crate) fn read_guard(&self) -> RwLockReadGuard<'_, RoomState> {
        self.read()
    }

    pub(crate) fn write_guard(&self) -> RwLockWriteGuard<'_, RoomState> {
        self.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Outbound;
    use std::sync::{Arc, Mutex};

    struct Recorder(Mutex<Vec<String>>);
    impl Outbound for Recorder {
        fn send(&self, payload: String) -> bool {
            self.0.lock().unwrap().push(payload);
            true
        }
    }

    fn make_user(id: &str, name: &str) -> (User, Arc<Recorder>) {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        (User::new(id.to_string(), name.to_string(), "🎬".to_string(), recorder.clone()), recorder)
    }

    #[test]
    fn add_user_elects_first_as_host() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (ada, _) = make_user("u1", "Ada");
        room.add_user(ada);
        assert!(room.is_host("u1"));
        let (bob, _) = make_user("u2", "Bob");
        room.add_user(bob);
        assert!(room.is_host("u1"));
        assert!(!room.is_host("u2"));
    }

    #[test]
    fn play_is_noop_when_already_playing() {
        let room = Room::new("ABCD".to_string(), 0.0);
        assert_eq!(room.handle_play(0.0), Some(0.0));
        assert_eq!(room.handle_play(5.0), None);
    }

    #[test]
    fn pause_then_play_preserves_current_time() {
        let room = Room::new("ABCD".to_string(), 0.0);
        room.handle_play(0.0);
        let paused_at = room.handle_pause(10.0);
        assert_eq!(paused_at, 10.0);
        let resumed_time = room.handle_play(10.0).unwrap();
        assert_eq!(resumed_time, 10.0);
    }

    #[test]
    fn seek_clamps_negative_to_zero() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (epoch, t) = room.handle_seek(-5.0, 0.0);
        assert_eq!(epoch, 1);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn seek_clamps_to_duration_for_mp4() {
        let room = Room::new("ABCD".to_string(), 0.0);
        room.update_video(
            VideoFields {
                video_url: "https://x/v.mp4".to_string(),
                video_title: String::new(),
                video_format: VideoFormat::Mp4,
                video_duration: 100.0,
                subtitle_url: String::new(),
                user_agent: String::new(),
                referer: String::new(),
            },
            0.0,
        );
        let (_, t) = room.handle_seek(999.0, 0.0);
        assert_eq!(t, 99.75);
    }

    #[test]
    fn two_successive_seeks_keep_original_was_playing() {
        let room = Room::new("ABCD".to_string(), 0.0);
        room.handle_play(0.0);
        let (epoch1, _) = room.handle_seek(10.0, 1.0);
        assert_eq!(epoch1, 1);
        let (epoch2, _) = room.handle_seek(20.0, 1.5);
        assert_eq!(epoch2, 2);
        // was_playing is still true (captured before the first seek), and
        // waiting users were rebuilt fresh for the second seek's epoch.
        let s = room.read_guard();
        assert!(s.seek_sync_was_playing);
        assert_eq!(s.seek_sync_epoch, 2);
    }

    #[test]
    fn stale_epoch_mark_seek_ready_is_noop() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (ada, _) = make_user("u1", "Ada");
        room.add_user(ada);
        let (epoch, _) = room.handle_seek(10.0, 0.0);
        let (resumed, t) = room.mark_seek_ready("u1", epoch - 1, 1.0);
        assert!(!resumed);
        assert_eq!(t, 0.0);
    }

    #[test]
    fn all_ready_resumes_and_bumps_epoch_again() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (ada, _) = make_user("u1", "Ada");
        let (bob, _) = make_user("u2", "Bob");
        room.add_user(ada);
        room.add_user(bob);
        room.handle_play(0.0);
        let (epoch, _) = room.handle_seek(10.0, 1.0);
        let (resumed1, _) = room.mark_seek_ready("u1", epoch, 2.0);
        assert!(!resumed1);
        let (resumed2, t) = room.mark_seek_ready("u2", epoch, 2.0);
        assert!(resumed2);
        assert_eq!(t, 10.0);

        // the timeout firing afterwards with the original epoch is a no-op
        let (resumed3, _) = room.mark_seek_ready("system", epoch, 10.0);
        assert!(!resumed3);
    }

    #[test]
    fn chat_is_capped_at_one_hundred() {
        let room = Room::new("ABCD".to_string(), 0.0);
        for i in 0..150 {
            room.push_chat(ChatMessage {
                username: "Ada".to_string(),
                avatar: "🎬".to_string(),
                message: format!("msg {i}"),
                timestamp: "t".to_string(),
                reply_to: None,
            });
        }
        let s = room.read_guard();
        assert_eq!(s.chat_messages.len(), CHAT_CAP);
        assert_eq!(s.chat_messages.front().unwrap().message, "msg 50");
        assert_eq!(s.chat_messages.back().unwrap().message, "msg 149");
    }

    #[test]
    fn buffer_spam_guard_ignores_fourth_trigger_within_window() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (ada, _) = make_user("u1", "Ada");
        room.add_user(ada);
        assert!(room.record_buffer_start("u1", 0.0).is_some());
        assert!(room.record_buffer_start("u1", 1.0).is_some());
        assert!(room.record_buffer_start("u1", 2.0).is_some());
        assert!(room.record_buffer_start("u1", 3.0).is_none());
    }

    #[test]
    fn buffer_pause_and_auto_resume_round_trip() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (ada, _) = make_user("u1", "Ada");
        room.add_user(ada);
        room.handle_play(0.0);
        let start = room.record_buffer_start("u1", 5.0).unwrap();
        let paused_at = room.try_buffer_pause("u1", start, 7.0).unwrap();
        assert_eq!(paused_at, 7.0);
        assert_eq!(room.pause_reason(), PauseReason::Buffer);

        room.record_buffer_end("u1", 8.0);
        // within cooldown from last_auto_resume_time (0.0) -> allowed since elapsed > 3.0
        let resumed_at = room.try_auto_resume(8.0).unwrap();
        assert_eq!(resumed_at, 7.0);
        assert_eq!(room.pause_reason(), PauseReason::None);
    }

    #[test]
    fn reap_dead_reassigns_host() {
        let room = Room::new("ABCD".to_string(), 0.0);
        let (ada, _) = make_user("u1", "Ada");
        let (bob, _) = make_user("u2", "Bob");
        room.add_user(ada);
        room.add_user(bob);
        {
            let s = room.read_guard();
            s.users.get("u1").unwrap().mark_send_failed(5.0);
        }
        let reaped = room.reap_dead();
        assert_eq!(reaped, vec![("u1".to_string(), "Ada".to_string())]);
        assert!(room.is_host("u2"));
    }
}
