use std::sync::Arc;

use tokio::sync::broadcast;

use hiiapp_types::events::ChangeEvent;

/// Fans out commit notifications to every live subscription.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every listener sees every commit
    broadcast_tx: broadcast::Sender<ChangeEvent>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner { broadcast_tx }),
        }
    }

    /// Subscribe to change events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast a change to all listeners. Having none is not an error.
    pub fn broadcast(&self, event: ChangeEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.broadcast_tx.receiver_count()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
