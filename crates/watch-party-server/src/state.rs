//! Shared application state handed to every WebSocket session and
//! background task (§4.13).

use std::sync::Arc;

use crate::clock::Clock;
use crate::extractor::Extractor;
use crate::room_manager::RoomManager;

pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub clock: Arc<dyn Clock>,
    pub extractor: Arc<Extractor>,
}

impl AppState {
    pub fn new(clock: Arc<dyn Clock>, extractor: Arc<Extractor>) -> Self {
        let manager = Arc::new(RoomManager::new(clock.clone()));
        Self { manager, clock, extractor }
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }
}
