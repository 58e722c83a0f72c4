//! Worker records.
//!
//! A worker is created on first successful onboarding and persists
//! across disconnects — re-onboarding is idempotent. Connection state
//! lives here; task assignment state lives on the task.

use serde::{Deserialize, Serialize};

use drover_core::wire::hex32;
use drover_core::{PeerId, Recipient};

/// Connection state of a worker.
///
/// `Connected ⇄ Busy` during operation; `Disconnected` on transport
/// drop. A worker is Busy iff some task in Offered or Accepted names it
/// as the assigned worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unknown,
    Registered,
    Connected,
    Busy,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub peer_id: PeerId,
    /// Settlement address — payments accrue here, not to the peer key.
    #[serde(with = "hex32")]
    pub recipient: Recipient,
    pub state: WorkerState,
    pub current_task_id: Option<String>,
    /// Unix ms of the most recent connect.
    pub connected_at: u64,
    /// Highest onboarding nonce accepted so far. Replay protection.
    pub last_nonce: u64,
}

impl Worker {
    pub fn recipient_hex(&self) -> String {
        hex::encode(self.recipient)
    }

    /// Eligible for dispatch: connected and not holding a task.
    pub fn is_eligible(&self) -> bool {
        self.state == WorkerState::Connected
    }

    /// Counts as reachable for recovery purposes.
    pub fn is_online(&self) -> bool {
        matches!(self.state, WorkerState::Connected | WorkerState::Busy)
    }
}
