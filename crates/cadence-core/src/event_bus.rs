use tokio::sync::broadcast;

use cadence_types::ExecutionEvent;

/// An execution event tagged with the session it belongs to, for process-wide
/// fan-out alongside the per-request streams.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: ExecutionEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, session_id: &str, event: ExecutionEvent) {
        let _ = self.tx.send(SessionEvent {
            session_id: session_id.to_string(),
            event,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
