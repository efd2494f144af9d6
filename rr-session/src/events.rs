use protocol::{ExecutionPoint, LoadedRegions, Message, NewSource};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Notifications produced for the UI/store layer. `Resumed` is always
/// observed strictly before the `Paused` that lands the same resume
/// operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Paused {
        point: ExecutionPoint,
        time: f64,
        has_frames: bool,
    },
    Resumed,
    NewSource(NewSource),
    ConsoleMessage(Message),
    LoadedRegionsChanged(LoadedRegions),
}

/// Broadcast fan-out for session events. Slow receivers lose the oldest
/// events rather than blocking the controller.
pub struct EventChannel {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
    }
}
