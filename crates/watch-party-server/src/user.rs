//! Per-connection user state.
//!
//! A `User` is exclusively owned by its connection's handler for everything
//! except `last_send_failed_at`, which the sweeper and `Room::broadcast` read
//! and write while holding only the room's *read* lock (see `room.rs`). That
//! one field therefore needs interior mutability independent of whatever
//! lock happens to be held; everything else is a plain field mutated only
//! while the room's write lock is held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Abstraction over "push a JSON string to this connection".
///
/// Implemented for `actix::Recipient<WsOutbound>` in `ws.rs`; kept as a
/// trait here so `Room`/`User` don't need to depend on actix types, and so
/// tests can swap in an in-memory recorder.
pub trait Outbound: Send + Sync {
    /// Returns `false` when the payload could not be delivered (closed or
    /// full mailbox); the caller marks the user's send as failed in that case.
    fn send(&self, payload: String) -> bool;
}

pub struct User {
    pub user_id: String,
    pub username: String,
    pub avatar: String,

    pub last_client_time: f64,
    pub stall_count: u32,

    pub last_sync_time: f64,
    pub last_rate_sent: f64,

    pub last_buffer_trigger_time: f64,
    pub buffer_trigger_count: u32,

    last_send_failed_at_bits: AtomicU64,

    sender: Arc<dyn Outbound>,
}

impl User {
    pub fn new(user_id: String, username: String, avatar: String, sender: Arc<dyn Outbound>) -> Self {
        Self {
            user_id,
            username,
            avatar,
            last_client_time: 0.0,
            stall_count: 0,
            last_sync_time: 0.0,
            last_rate_sent: 1.0,
            last_buffer_trigger_time: 0.0,
            buffer_trigger_count: 0,
            last_send_failed_at_bits: AtomicU64::new(0.0_f64.to_bits()),
            sender,
        }
    }

    /// Serialises `payload` and hands it to the connection. A failed send
    /// (full or closed mailbox) is swallowed here and instead recorded as a
    /// timestamp the sweeper can act on (§4.3, §4.6).
    pub fn send(&self, payload: &watch_party_types::ServerMessage, now: f64) {
        match serde_json::to_string(payload) {
            Ok(text) => {
                if !self.sender.send(text) {
                    self.mark_send_failed(now);
                }
            }
            Err(err) => {
                tracing::warn!(user_id = %self.user_id, error = %err, "failed to serialise outbound message");
                self.mark_send_failed(now);
            }
        }
    }

    pub fn mark_send_failed(&self, now: f64) {
        self.last_send_failed_at_bits.store(now.to_bits(), Ordering::Relaxed);
    }

    pub fn has_failed_send(&self) -> bool {
        f64::from_bits(self.last_send_failed_at_bits.load(Ordering::Relaxed)) > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl Outbound for Recorder {
        fn send(&self, payload: String) -> bool {
            self.0.lock().unwrap().push(payload);
            true
        }
    }

    fn user() -> (User, Arc<Recorder>) {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let user = User::new(
            "u1".to_string(),
            "Ada".to_string(),
            "🎬".to_string(),
            recorder.clone(),
        );
        (user, recorder)
    }

    #[test]
    fn new_user_has_default_rate_and_no_failure() {
        let (user, _) = user();
        assert_eq!(user.last_rate_sent, 1.0);
        assert!(!user.has_failed_send());
    }

    #[test]
    fn send_forwards_serialised_payload() {
        let (user, recorder) = user();
        user.send(&watch_party_types::ServerMessage::Typing { username: "Ada".into() }, 1.0);
        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"type\":\"typing\""));
    }

    #[test]
    fn mark_send_failed_is_observable() {
        let (user, _) = user();
        assert!(!user.has_failed_send());
        user.mark_send_failed(42.0);
        assert!(user.has_failed_send());
    }
}
