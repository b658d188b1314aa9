use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::queue::{validate_video_id, JobPhase};

/// Event published to the live clients of one video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    Progress {
        phase: JobPhase,
        progress: u8,
    },
    Completed {
        transcript: String,
        summary: String,
    },
    Failed {
        error: String,
        /// Another attempt is scheduled
        retrying: bool,
    },
}

/// Fan-out of job events to subscribers grouped in per-video rooms.
///
/// Publishing never fails the caller: a room without subscribers simply
/// drops the event.
pub struct Notifier {
    rooms: RwLock<HashMap<String, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Room name for a video id, `None` when the id is not acceptable
    pub fn room_for(video_id: &str) -> Option<String> {
        validate_video_id(video_id)
            .ok()
            .map(|id| format!("video:{}", id))
    }

    /// Subscribe to a video's room
    pub fn subscribe(&self, video_id: &str) -> crate::error::Result<broadcast::Receiver<JobEvent>> {
        let id = validate_video_id(video_id)?;
        let room = format!("video:{}", id);

        let mut rooms = match self.rooms.write() {
            Ok(rooms) => rooms,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sender = rooms
            .entry(room)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }

    /// Publish an event; returns the number of subscribers reached
    pub fn notify(&self, video_id: &str, event: JobEvent) -> usize {
        let Some(room) = Self::room_for(video_id) else {
            warn!("Dropping event for invalid video id {:?}", video_id);
            return 0;
        };

        let rooms = match self.rooms.read() {
            Ok(rooms) => rooms,
            Err(poisoned) => poisoned.into_inner(),
        };
        match rooms.get(&room).map(|sender| sender.send(event)) {
            Some(Ok(delivered)) => {
                debug!("📣 Event delivered to {} subscribers of {}", delivered, room);
                delivered
            }
            _ => 0,
        }
    }

    /// Drop rooms nobody listens to any more
    pub fn prune_idle_rooms(&self) -> usize {
        let mut rooms = match self.rooms.write() {
            Ok(rooms) => rooms,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = rooms.len();
        rooms.retain(|_, sender| sender.receiver_count() > 0);
        before - rooms.len()
    }

    pub fn room_count(&self) -> usize {
        match self.rooms.read() {
            Ok(rooms) => rooms.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
