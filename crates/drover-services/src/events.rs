//! Event bus — the one-way channel subsystems publish observations on.
//!
//! A single tagged-variant event type with a single subscription API.
//! Emission never blocks: lagging subscribers drop events, senders never
//! await. Cross-subsystem observers see eventual consistency; there is
//! no global total order between subsystems.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use drover_core::PeerId;

/// Buffered events per subscriber before old ones are dropped.
const EVENT_BUFFER: usize = 1024;

/// Everything the manager announces about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "camelCase")]
pub enum ManagerEvent {
    /// The control loop completed a tick.
    Cycle { cycle: u64 },

    WorkerOnboarded {
        peer_id: PeerId,
        recipient: String,
    },
    WorkerConnected {
        peer_id: PeerId,
    },
    WorkerDisconnected {
        peer_id: PeerId,
    },

    TaskCreated {
        task_id: String,
    },
    TaskOffered {
        task_id: String,
        peer_id: PeerId,
    },
    TaskAccepted {
        task_id: String,
        peer_id: PeerId,
    },
    TaskRejected {
        task_id: String,
        peer_id: PeerId,
        reason: String,
    },
    TaskExpired {
        task_id: String,
        peer_id: PeerId,
    },
    TaskCompleted {
        task_id: String,
        peer_id: PeerId,
    },

    PaymentCreated {
        recipient: String,
        nonce: u64,
        amount: u64,
    },
    PaymentsSettled {
        recipient: String,
        min_nonce: u64,
        max_nonce: u64,
        amount: u64,
    },

    /// Graceful teardown announced; in-flight handlers get Cancelled.
    ManagerStop,
}

/// Broadcast bus. Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Emit an event. A send error only means nobody is listening.
    pub fn emit(&self, event: ManagerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
