//! WebSocket transport: the `/ws/{room_id}` upgrade route, the per-connection
//! actor, and the frame dispatch loop (§4.11, §5).
//!
//! Grounded on the teacher's `api/browser.rs`/`browser.rs` actor pair: an
//! actix actor owning the raw socket, a `Recipient<WsOutbound>` wrapped to
//! implement `Outbound` so the room/user layer never touches actix types
//! directly, and the same `Actor`/`StreamHandler`/`Handler` triad.

use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::Value;
use watch_party_types::ServerMessage;

use crate::handlers;
use crate::state::AppState;
use crate::user::Outbound;

/// Hard cap on a single inbound WebSocket frame (§4.11).
const MAX_FRAME_BYTES: usize = 512 * 1024;

#[derive(Message)]
#[rtype(result = "()")]
pub struct WsOutbound(pub String);

/// Bridges a plain `Recipient<WsOutbound>` to the transport-agnostic
/// `Outbound` trait `User`/`Room` depend on.
struct ActixOutbound(Recipient<WsOutbound>);

impl Outbound for ActixOutbound {
    fn send(&self, payload: String) -> bool {
        self.0.try_send(WsOutbound(payload)).is_ok()
    }
}

pub struct WatchPartySession {
    room_id: String,
    user_id: Option<String>,
    state: web::Data<AppState>,
    rate_limiter: crate::rate_limiter::RateLimiter,
}

impl WatchPartySession {
    fn new(room_id: String, state: web::Data<AppState>) -> Self {
        let now = state.now();
        Self { room_id, user_id: None, state, rate_limiter: crate::rate_limiter::RateLimiter::new(now) }
    }

    fn send_error(&self, message: &str) {
        let Some(user_id) = self.user_id.as_deref() else { return };
        let Some(room) = self.state.manager.get_room(&self.room_id) else { return };
        room.send_to(user_id, &ServerMessage::Error { message: message.to_string() }, self.state.now());
    }

    fn dispatch(&mut self, ctx: &mut ws::WebsocketContext<Self>, raw: Value) {
        let Some(msg_type) = raw.get("type").and_then(Value::as_str).map(str::to_string) else { return };
        let now = self.state.now();

        if !self.rate_limiter.check(&msg_type, now) {
            // High-freq types (ping/seek/seek_ready/buffer_*) are dropped
            // silently so a heartbeat or buffer storm can't amplify itself
            // into an error-frame storm (§4.2/§7).
            if !crate::rate_limiter::is_high_freq(&msg_type) {
                self.send_error("Çok hızlı işlem yapıyorsunuz");
            }
            return;
        }

        if msg_type == "ping" {
            let ping_id = handlers::coerce_ping_id(raw.get("_ping_id"));
            let reply = ServerMessage::Pong { ping_id };
            if let Ok(text) = serde_json::to_string(&reply) {
                ctx.text(text);
            }
            if let (Some(user_id), Some(room)) = (self.user_id.as_deref(), self.state.manager.get_room(&self.room_id)) {
                let client_time = handlers::get_f64(&raw, "current_time").unwrap_or(0.0);
                let syncing = raw.get("syncing").and_then(Value::as_bool).unwrap_or(false);
                crate::drift::tick(&room, user_id, client_time, syncing, now);
            }
            return;
        }

        if msg_type == "join" {
            if self.user_id.is_none() {
                let sender: Arc<dyn Outbound> = Arc::new(ActixOutbound(ctx.address().recipient()));
                let user_id = handlers::handle_join(&self.state, &self.room_id, &raw, sender);
                self.user_id = Some(user_id);
            }
            return;
        }

        let Some(user_id) = self.user_id.clone() else { return };
        match msg_type.as_str() {
            "get_state" => handlers::handle_get_state(&self.state, &self.room_id, &user_id),
            "play" => handlers::handle_play(&self.state, &self.room_id, &user_id),
            "pause" => handlers::handle_pause(&self.state, &self.room_id, &user_id, &raw),
            "seek" => handlers::handle_seek(&self.state, &self.room_id, &user_id, &raw),
            "seek_ready" => handlers::handle_seek_ready(&self.state, &self.room_id, &user_id, &raw),
            "chat" => handlers::handle_chat(&self.state, &self.room_id, &user_id, &raw),
            "typing" => handlers::handle_typing(&self.state, &self.room_id, &user_id),
            "buffer_start" => handlers::handle_buffer_start(&self.state, &self.room_id, &user_id),
            "buffer_end" => handlers::handle_buffer_end(&self.state, &self.room_id, &user_id),
            "video_change" => handlers::handle_video_change(&self.state, &self.room_id, &user_id, &raw),
            _ => {}
        }
    }
}

impl Actor for WatchPartySession {
    type Context = ws::WebsocketContext<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(user_id) = self.user_id.take() else { return };
        let Some(room) = self.state.manager.get_room(&self.room_id) else { return };
        let username = room.username(&user_id).unwrap_or_default();
        self.state.manager.leave(&self.room_id, &user_id, &username);
    }
}

impl Handler<WsOutbound> for WatchPartySession {
    type Result = ();

    fn handle(&mut self, msg: WsOutbound, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WatchPartySession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match item {
            Ok(msg) => msg,
            Err(_) => {
                ctx.stop();
                return;
            }
        };
        match msg {
            ws::Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    ctx.stop();
                    return;
                }
                match serde_json::from_str::<Value>(&text) {
                    Ok(raw) => self.dispatch(ctx, raw),
                    Err(_) => self.send_error("Geçersiz JSON formatı"),
                }
            }
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {}
            ws::Message::Close(_) => ctx.stop(),
            ws::Message::Binary(_) => {}
            ws::Message::Continuation(_) => ctx.stop(),
            ws::Message::Nop => {}
        }
    }
}

#[get("/ws/{room_id}")]
pub async fn room_ws(
    req: HttpRequest,
    path: web::Path<String>,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let room_id = path.into_inner().trim().to_uppercase();
    if room_id.is_empty() {
        return Err(actix_web::error::ErrorBadRequest("room id required"));
    }
    ws::WsResponseBuilder::new(WatchPartySession::new(room_id, state), &req, stream)
        .frame_size(MAX_FRAME_BYTES + 1024)
        .start()
}

/// Background loop: reaps dead connections every 30s (§4.6).
pub async fn run_sweeper(state: web::Data<AppState>) {
    loop {
        actix_web::rt::time::sleep(Duration::from_secs(30)).await;
        state.manager.sweep();
    }
}
