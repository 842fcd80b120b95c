//! Change notification hub.
//!
//! Every successful mutation broadcasts the affected plugin id to all current
//! subscribers. There is no filtering and no replay: a receiver only sees ids
//! emitted after it subscribed. Unsubscribing is dropping the receiver.

use tokio::sync::broadcast;
use tracing::debug;

/// Default number of buffered notifications per lagging subscriber.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 64;

pub(crate) struct ChangeHub {
    tx: broadcast::Sender<String>,
}

impl ChangeHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn emit(&self, plugin: &str) {
        // No subscribers is not an error.
        let delivered = self.tx.send(plugin.to_string()).unwrap_or(0);
        debug!(plugin = %plugin, subscribers = delivered, "Settings changed");
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
