// Engine events for the rendering layer
use serde::Serialize;
use tokio::sync::broadcast;

use crate::library::Song;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the engine reports outward. Subscribers receive these over a
/// broadcast channel, so a slow or absent subscriber never stalls playback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    SongLoaded {
        song: Song,
    },
    Progress {
        position_ms: u64,
        duration_ms: u64,
    },
    /// Advisory snapshot taken after a drift correction has settled.
    CorrectionApplied {
        before: Vec<u64>,
        after: Vec<u64>,
    },
    PlayStateChanged {
        is_playing: bool,
    },
    StemVolumeChanged {
        label: String,
        volume: u8,
        muted: bool,
    },
    PlaybackBlocked,
    SourceUnavailable {
        path: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error for an embedded engine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
