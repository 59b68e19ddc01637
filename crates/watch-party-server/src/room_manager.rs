//! Registry of live rooms plus the 30s reaper sweep (§4.6).
//!
//! One `RoomManager` per process, shared behind an `Arc` as part of
//! `AppState`. Rooms are created lazily on first join and removed once
//! empty, mirroring the original service's in-memory `sync.Map` of rooms.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use watch_party_types::ServerMessage;

use crate::clock::Clock;
use crate::room::{Room, VideoFields};
use crate::user::User;

pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    clock: Arc<dyn Clock>,
}

impl RoomManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), clock }
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().unwrap().get(room_id).cloned()
    }

    pub fn get_or_create_room(&self, room_id: &str) -> Arc<Room> {
        if let Some(room) = self.get_room(room_id) {
            return room;
        }
        let mut rooms = self.rooms.write().unwrap();
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id.to_string(), self.clock.now())))
            .clone()
    }

    fn remove_room(&self, room_id: &str) {
        self.rooms.write().unwrap().remove(room_id);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    /// Adds `user` to `room_id` (creating the room if needed) and broadcasts
    /// `room_state` to the newcomer plus `user_joined` to everyone else.
    pub fn join(&self, room_id: &str, user: User) -> Arc<Room> {
        let room = self.get_or_create_room(room_id);
        let now = self.clock.now();
        let username = user.username.clone();
        let avatar = user.avatar.clone();
        let user_id = user.user_id.clone();
        let is_host = room.user_count() == 0;
        room.add_user(user);

        room.send_to(&user_id, &ServerMessage::RoomState(room.get_state(now)), now);
        room.broadcast(
            &ServerMessage::UserJoined {
                username,
                avatar,
                user_id: user_id.clone(),
                is_host,
                users: room.user_summaries(),
            },
            Some(&user_id),
            now,
        );
        room
    }

    /// Removes `user_id` from `room_id`, broadcasts `user_left`, and drops
    /// the room entirely once it has no users left.
    pub fn leave(&self, room_id: &str, user_id: &str, username: &str) {
        let Some(room) = self.get_room(room_id) else { return };
        room.remove_user(user_id);
        let now = self.clock.now();
        room.broadcast(
            &ServerMessage::UserLeft {
                user_id: user_id.to_string(),
                username: username.to_string(),
                users: room.user_summaries(),
            },
            None,
            now,
        );
        if room.user_count() == 0 {
            self.remove_room(room_id);
        }
    }

    /// `triggered_by` is the already-formatted display string, e.g.
    /// `"Ada (Play)"`, per the handler table (§4.9).
    pub fn play(&self, room_id: &str, triggered_by: String) {
        let Some(room) = self.get_room(room_id) else { return };
        let now = self.clock.now();
        if let Some(current_time) = room.handle_play(now) {
            room.broadcast(&ServerMessage::Sync {
                is_playing: true,
                current_time,
                force_seek: false,
                seek_sync: None,
                seek_epoch: None,
                triggered_by,
            }, None, now);
        }
    }

    pub fn pause(&self, room_id: &str, triggered_by: String) {
        let Some(room) = self.get_room(room_id) else { return };
        let now = self.clock.now();
        let current_time = room.handle_pause(now);
        room.broadcast(&ServerMessage::Sync {
            is_playing: false,
            current_time,
            force_seek: true,
            seek_sync: None,
            seek_epoch: None,
            triggered_by,
        }, None, now);
    }

    /// Performs the seek and returns `(room, epoch, target_time)` so the
    /// caller can schedule the barrier-timeout background task.
    pub fn seek(&self, room_id: &str, target_time: f64, triggered_by: String) -> Option<(Arc<Room>, u64, f64)> {
        let room = self.get_room(room_id)?;
        let now = self.clock.now();
        let (epoch, final_time) = room.handle_seek(target_time, now);
        room.broadcast(&ServerMessage::Sync {
            is_playing: false,
            current_time: final_time,
            force_seek: true,
            seek_sync: Some(true),
            seek_epoch: Some(epoch),
            triggered_by,
        }, None, now);
        Some((room, epoch, final_time))
    }

    /// Handles a `seek_ready` ack (or the barrier-timeout sentinel, for
    /// `user_id == "system"`) and broadcasts the resume if the barrier just
    /// cleared. `triggered_by` distinguishes a quorum-complete resume from a
    /// timeout-forced one, since both funnel through the same room verb.
    pub fn mark_seek_ready(&self, room_id: &str, user_id: &str, epoch: u64, triggered_by: &str) {
        let Some(room) = self.get_room(room_id) else { return };
        let now = self.clock.now();
        let (resumed, current_time) = room.mark_seek_ready(user_id, epoch, now);
        if resumed {
            room.broadcast(&ServerMessage::Sync {
                is_playing: true,
                current_time,
                force_seek: true,
                seek_sync: None,
                seek_epoch: None,
                triggered_by: triggered_by.to_string(),
            }, None, now);
        }
    }

    pub fn update_video(&self, room_id: &str, fields: VideoFields, changed_by: String) {
        let Some(room) = self.get_room(room_id) else { return };
        let now = self.clock.now();
        let url = fields.video_url.clone();
        let title = fields.video_title.clone();
        let format = fields.video_format;
        let duration = fields.video_duration;
        let subtitle_url = fields.subtitle_url.clone();
        let user_agent = fields.user_agent.clone();
        let referer = fields.referer.clone();
        room.update_video(fields, now);
        room.broadcast(&ServerMessage::VideoChanged {
            url,
            title,
            format,
            duration,
            user_agent,
            referer,
            subtitle_url,
            changed_by,
        }, None, now);
    }

    pub fn try_buffer_pause(&self, room_id: &str, user_id: &str, start_time: f64) {
        let Some(room) = self.get_room(room_id) else { return };
        let now = self.clock.now();
        if let Some(current_time) = room.try_buffer_pause(user_id, start_time, now) {
            room.broadcast(&ServerMessage::Sync {
                is_playing: false,
                current_time,
                force_seek: false,
                seek_sync: None,
                seek_epoch: None,
                triggered_by: "System (Buffer Pause)".to_string(),
            }, None, now);
        }
    }

    pub fn record_buffer_end_and_try_resume(&self, room_id: &str, user_id: &str) {
        let Some(room) = self.get_room(room_id) else { return };
        let now = self.clock.now();
        room.record_buffer_end(user_id, now);
        if let Some(current_time) = room.try_auto_resume(now) {
            room.broadcast(&ServerMessage::Sync {
                is_playing: true,
                current_time,
                force_seek: false,
                seek_sync: None,
                seek_epoch: None,
                triggered_by: "System (Auto Resume)".to_string(),
            }, None, now);
        }
    }

    /// Runs one reaper pass across every room: drops dead connections,
    /// broadcasts `user_left` for each, and removes rooms left empty.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let room_ids: Vec<String> = self.rooms.read().unwrap().keys().cloned().collect();
        for room_id in room_ids {
            let Some(room) = self.get_room(&room_id) else { continue };
            let reaped = room.reap_dead();
            for (user_id, username) in reaped {
                room.broadcast(
                    &ServerMessage::UserLeft { user_id, username, users: room.user_summaries() },
                    None,
                    now,
                );
            }
            if room.user_count() == 0 {
                self.remove_room(&room_id);
            }
        }
    }
}
