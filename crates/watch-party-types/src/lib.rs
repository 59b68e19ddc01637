//! Wire-level DTOs shared between the watch-party server and its clients.
//!
//! Everything here is serialisation-only: no locking, no behaviour. The
//! server's internal room state is a superset of `RoomState` and is never
//! exposed directly, so these types can evolve independently of storage.

use serde::{Deserialize, Serialize};

/// Container format a room's current video is played back as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Hls,
    Mp4,
    Webm,
    Youtube,
}

impl Default for VideoFormat {
    fn default() -> Self {
        VideoFormat::Hls
    }
}

impl VideoFormat {
    /// Best-effort guess from a stream URL's suffix, used when the extractor
    /// can't be reached or doesn't report a format.
    pub fn guess_from_url(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.ends_with(".mp4") {
            VideoFormat::Mp4
        } else if lower.ends_with(".webm") {
            VideoFormat::Webm
        } else {
            VideoFormat::Hls
        }
    }

    /// Parses a client- or extractor-supplied format string, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "mp4" => Some(VideoFormat::Mp4),
            "webm" => Some(VideoFormat::Webm),
            "hls" | "m3u8" => Some(VideoFormat::Hls),
            "youtube" => Some(VideoFormat::Youtube),
            _ => None,
        }
    }
}

/// A single chat line, already timestamped by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub avatar: String,
    pub message: String,
    /// RFC 3339, UTC.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<serde_json::Value>,
}

/// Presence summary for the `users` array carried by `room_state`,
/// `user_joined` and `user_left`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: String,
    pub username: String,
    pub avatar: String,
    pub is_host: bool,
}

/// A fully reconstructed room snapshot, as handed back by `get_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomState {
    pub room_id: String,
    pub video_url: String,
    pub video_title: String,
    pub video_format: VideoFormat,
    pub video_duration: f64,
    pub subtitle_url: String,
    pub current_time: f64,
    pub is_playing: bool,
    pub user_agent: String,
    pub referer: String,
    pub host_id: String,
    pub users: Vec<UserSummary>,
    pub chat_messages: Vec<ChatMessage>,
}

/// Every message the server ever pushes down a connection.
///
/// Internally tagged so clients can dispatch on `"type"` without a second
/// parse pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomState(RoomState),
    UserJoined {
        username: String,
        avatar: String,
        user_id: String,
        is_host: bool,
        users: Vec<UserSummary>,
    },
    UserLeft {
        username: String,
        user_id: String,
        users: Vec<UserSummary>,
    },
    Sync {
        is_playing: bool,
        current_time: f64,
        force_seek: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_sync: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seek_epoch: Option<u64>,
        triggered_by: String,
    },
    SyncCorrection {
        rate: f64,
    },
    Pong {
        #[serde(rename = "_ping_id", skip_serializing_if = "Option::is_none")]
        ping_id: Option<serde_json::Value>,
    },
    Chat {
        username: String,
        avatar: String,
        message: String,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<serde_json::Value>,
    },
    Typing {
        username: String,
    },
    VideoChanged {
        url: String,
        title: String,
        format: VideoFormat,
        duration: f64,
        user_agent: String,
        referer: String,
        subtitle_url: String,
        changed_by: String,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_format_guess_from_url() {
        assert_eq!(VideoFormat::guess_from_url("https://x/video.MP4"), VideoFormat::Mp4);
        assert_eq!(VideoFormat::guess_from_url("https://x/video.webm"), VideoFormat::Webm);
        assert_eq!(VideoFormat::guess_from_url("https://x/playlist.m3u8"), VideoFormat::Hls);
    }

    #[test]
    fn sync_message_omits_absent_seek_fields() {
        let msg = ServerMessage::Sync {
            is_playing: true,
            current_time: 12.5,
            force_seek: false,
            seek_sync: None,
            seek_epoch: None,
            triggered_by: "Ada (Play)".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("seek_sync"));
        assert!(!json.contains("seek_epoch"));
        assert!(json.contains("\"type\":\"sync\""));
    }

    #[test]
    fn pong_serialises_ping_id_field_name() {
        let msg = ServerMessage::Pong { ping_id: Some(serde_json::json!(42)) };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"_ping_id\":42"));
    }
}
