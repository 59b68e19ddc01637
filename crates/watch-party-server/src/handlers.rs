//! Per-message-type handler functions (§4.9).
//!
//! Each function takes the already-parsed JSON frame plus the identifiers
//! `ws.rs` has established (room, user) and drives `RoomManager`/`Room`.
//! Field access is defensive throughout: fields are read by key and
//! coerced rather than deserialised into a strict struct, mirroring the
//! original dispatcher's `map[string]interface{}` handling — a client
//! sending a string where a number is expected, or omitting an optional
//! field, must not crash the connection.

use std::sync::Arc;
use std::time::Duration;

use actix_web::web::Data;
use serde_json::Value;
use watch_party_types::{ChatMessage, ServerMessage, VideoFormat};

use crate::room::VideoFields;
use crate::state::AppState;
use crate::user::{Outbound, User};

/// Threshold past which a `pause` frame carrying a `time` is treated as a
/// seek-via-pause rather than a plain pause, matching the original
/// service's "Seek via Pause" path.
const SEEK_VIA_PAUSE_THRESHOLD_SECS: f64 = 2.0;
/// How long the seek barrier waits for every client's `seek_ready` before
/// the server forces the resume itself (§4.10). The original service used
/// 8s; this redesign shortens it to 5s.
const SEEK_TIMEOUT_SECS: u64 = 5;
const BUFFER_PAUSE_DELAY_SECS: f64 = 2.0;

pub fn get_str<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

pub fn get_f64(raw: &Value, key: &str) -> Option<f64> {
    match raw.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

pub fn get_u64(raw: &Value, key: &str) -> Option<u64> {
    match raw.get(key) {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0).round() as u64)),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Echoes `_ping_id` back unchanged except that a float is coerced to an
/// integer, matching clients that send `Date.now()`-style floats.
pub fn coerce_ping_id(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Number(n)) if n.is_f64() => n.as_f64().map(|f| Value::from(f.round() as i64)),
        Some(other) => Some(other.clone()),
        None => None,
    }
}

fn generate_user_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

/// Per §9's open-question resolution: `Misafir-XXXX` derived from the new
/// user's own id, not the room id the original service used.
fn default_username(user_id: &str) -> String {
    let tail = &user_id[..4.min(user_id.len())];
    format!("Misafir-{}", tail.to_uppercase())
}

fn username_of(room: &crate::room::Room, user_id: &str) -> String {
    room.username(user_id).unwrap_or_default()
}

pub fn handle_join(state: &Data<AppState>, room_id: &str, raw: &Value, sender: Arc<dyn Outbound>) -> String {
    let user_id = generate_user_id();
    let username = get_str(raw, "username")
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_username(&user_id));
    let avatar = get_str(raw, "avatar")
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "🎬".to_string());

    let user = User::new(user_id.clone(), username, avatar, sender);
    state.manager.join(room_id, user);
    user_id
}

pub fn handle_get_state(state: &Data<AppState>, room_id: &str, user_id: &str) {
    let Some(room) = state.manager.get_room(room_id) else { return };
    let now = state.now();
    room.send_to(user_id, &ServerMessage::RoomState(room.get_state(now)), now);
}

pub fn handle_play(state: &Data<AppState>, room_id: &str, user_id: &str) {
    let Some(room) = state.manager.get_room(room_id) else { return };
    let username = username_of(&room, user_id);
    state.manager.play(room_id, format!("{username} (Play)"));
}

/// A `pause` carrying a `time` far enough from the room's live position is
/// treated as a seek (the original service's "Seek via Pause" path) rather
/// than a plain pause.
pub fn handle_pause(state: &Data<AppState>, room_id: &str, user_id: &str, raw: &Value) {
    let Some(room) = state.manager.get_room(room_id) else { return };
    let username = username_of(&room, user_id);

    if let Some(target) = get_f64(raw, "time") {
        if target >= 0.0 {
            let now = state.now();
            let (is_playing, live_time) = room.snapshot_live(now);
            if is_playing && (target - live_time).abs() > SEEK_VIA_PAUSE_THRESHOLD_SECS {
                broadcast_seek(state, room_id, target, format!("{username} (Seek via Pause)"));
                return;
            }
        }
    }

    state.manager.pause(room_id, username);
}

pub fn handle_seek(state: &Data<AppState>, room_id: &str, user_id: &str, raw: &Value) {
    let Some(target) = get_f64(raw, "time") else { return };
    let Some(room) = state.manager.get_room(room_id) else { return };
    let username = username_of(&room, user_id);
    broadcast_seek(state, room_id, target, format!("{username} (Seek Sync)"));
}

/// Starts a seek barrier and schedules the timeout that forces a resume if
/// some client never acks (§4.10).
fn broadcast_seek(state: &Data<AppState>, room_id: &str, target_time: f64, triggered_by: String) {
    let Some((_, epoch, _)) = state.manager.seek(room_id, target_time, triggered_by) else { return };
    let state = state.clone();
    let room_id = room_id.to_string();
    actix_web::rt::spawn(async move {
        actix_web::rt::time::sleep(Duration::from_secs(SEEK_TIMEOUT_SECS)).await;
        state.manager.mark_seek_ready(&room_id, "system", epoch, "System (Seek Sync Timeout)");
    });
}

pub fn handle_seek_ready(state: &Data<AppState>, room_id: &str, user_id: &str, raw: &Value) {
    let Some(epoch) = get_u64(raw, "seek_epoch") else { return };
    state.manager.mark_seek_ready(room_id, user_id, epoch, "System (Seek Sync Complete)");
}

pub fn handle_chat(state: &Data<AppState>, room_id: &str, user_id: &str, raw: &Value) {
    let Some(message) = get_str(raw, "message").map(str::trim).filter(|s| !s.is_empty()) else { return };
    let Some(room) = state.manager.get_room(room_id) else { return };
    let Some((username, avatar)) = room.user_identity(user_id) else { return };
    let reply_to = raw.get("reply_to").cloned().filter(|v| !v.is_null());
    let timestamp = chrono::Utc::now().to_rfc3339();
    let now = state.now();

    room.push_chat(ChatMessage {
        username: username.clone(),
        avatar: avatar.clone(),
        message: message.to_string(),
        timestamp: timestamp.clone(),
        reply_to: reply_to.clone(),
    });
    room.broadcast(
        &ServerMessage::Chat { username, avatar, message: message.to_string(), timestamp, reply_to },
        None,
        now,
    );
}

pub fn handle_typing(state: &Data<AppState>, room_id: &str, user_id: &str) {
    let Some(room) = state.manager.get_room(room_id) else { return };
    let username = username_of(&room, user_id);
    let now = state.now();
    room.broadcast(&ServerMessage::Typing { username }, Some(user_id), now);
}

pub fn handle_buffer_start(state: &Data<AppState>, room_id: &str, user_id: &str) {
    let Some(room) = state.manager.get_room(room_id) else { return };
    let now = state.now();
    let Some(start_time) = room.record_buffer_start(user_id, now) else { return };

    let state = state.clone();
    let room_id = room_id.to_string();
    let user_id = user_id.to_string();
    actix_web::rt::spawn(async move {
        actix_web::rt::time::sleep(Duration::from_secs_f64(BUFFER_PAUSE_DELAY_SECS)).await;
        state.manager.try_buffer_pause(&room_id, &user_id, start_time);
    });
}

pub fn handle_buffer_end(state: &Data<AppState>, room_id: &str, user_id: &str) {
    state.manager.record_buffer_end_and_try_resume(room_id, user_id);
}

/// Kicks off an async extractor call and merges its result with any
/// client-supplied fields, which take precedence when present (§4.9,
/// §4.12). Runs detached so a slow or unreachable extractor never blocks
/// the WebSocket read loop.
pub fn handle_video_change(state: &Data<AppState>, room_id: &str, user_id: &str, raw: &Value) {
    let Some(url) = get_str(raw, "url").map(str::to_string).filter(|s| !s.is_empty()) else { return };
    let Some(room) = state.manager.get_room(room_id) else { return };
    let username = username_of(&room, user_id);

    let client_title = get_str(raw, "title").map(str::to_string).filter(|s| !s.is_empty());
    let client_user_agent = get_str(raw, "user_agent").map(str::to_string).filter(|s| !s.is_empty());
    let client_referer = get_str(raw, "referer").map(str::to_string).filter(|s| !s.is_empty());
    let client_subtitle = get_str(raw, "subtitle_url").map(str::to_string).filter(|s| !s.is_empty());
    let client_format = get_str(raw, "format").and_then(VideoFormat::parse);
    let client_duration = get_f64(raw, "duration").filter(|d| *d > 0.0);

    let state = state.clone();
    let room_id = room_id.to_string();
    actix_web::rt::spawn(async move {
        let (stream_url, title, format, duration, user_agent, referer) = match state.extractor.extract(&url).await {
            Ok(result) => (
                result.stream_url,
                client_title.unwrap_or(result.title),
                client_format.unwrap_or(result.format),
                client_duration.unwrap_or(result.duration),
                client_user_agent.unwrap_or(result.user_agent),
                client_referer.unwrap_or(result.referer),
            ),
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "video metadata extractor failed; falling back to the raw URL");
                (
                    url.clone(),
                    client_title.unwrap_or_default(),
                    client_format.unwrap_or_else(|| VideoFormat::guess_from_url(&url)),
                    client_duration.unwrap_or(0.0),
                    client_user_agent.unwrap_or_default(),
                    client_referer.unwrap_or_default(),
                )
            }
        };
        state.manager.update_video(
            &room_id,
            VideoFields {
                video_url: stream_url,
                video_title: title,
                video_format: format,
                video_duration: duration,
                subtitle_url: client_subtitle.unwrap_or_default(),
                user_agent,
                referer,
            },
            username,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_username_is_derived_from_user_id_not_room_id() {
        assert_eq!(default_username("ab12cd34"), "Misafir-AB12");
    }

    #[test]
    fn ping_id_float_is_coerced_to_integer() {
        let value = serde_json::json!(1700000000123.0_f64);
        assert_eq!(coerce_ping_id(Some(&value)), Some(Value::from(1700000000123_i64)));
    }

    #[test]
    fn ping_id_absent_stays_none() {
        assert_eq!(coerce_ping_id(None), None);
    }

    #[test]
    fn get_f64_coerces_numeric_strings() {
        let value = serde_json::json!({ "time": "12.5" });
        assert_eq!(get_f64(&value, "time"), Some(12.5));
    }

    #[test]
    fn get_u64_coerces_float_epoch() {
        let value = serde_json::json!({ "seek_epoch": 3.0 });
        assert_eq!(get_u64(&value, "seek_epoch"), Some(3));
    }
}
