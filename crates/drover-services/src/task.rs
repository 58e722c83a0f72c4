//! Task model — the record the engine's state machine runs over.
//!
//! State transitions:
//! - Pending -> Offered -> Accepted -> Completed (terminal)
//! - Offered -> Pending (acceptance timeout, worker disconnect)
//! - Offered -> Rejected -> Pending (rejecter blacklisted for a few cycles)
//! - Accepted -> Pending (worker disconnect)
//! - Pending/Offered -> Expired (terminal, graceful-stop cancellation)
//!
//! The event log is append-only and monotonically timestamped; it is
//! the durable history the payment outbox replays from.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use drover_core::{now_ms, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Offered,
    Accepted,
    Completed,
    Rejected,
    Expired,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Created,
    Offered,
    Accepted,
    Rejected,
    Submission,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    /// Unix ms. Non-decreasing within one task's log.
    pub timestamp: u64,
    /// Peer that caused the event; "manager" for sweep-driven ones.
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub template_id: String,
    pub title: String,
    pub reward: u64,
    pub provider_peer_id: PeerId,
    /// Opaque to the manager.
    pub payload: String,
    pub created_at: u64,

    pub state: TaskState,
    pub assigned_worker_peer_id: Option<PeerId>,
    pub offered_at: Option<u64>,
    pub deadline: Option<u64>,
    pub events: Vec<TaskEvent>,

    /// Rejecters mapped to the cycle at which re-offering them unlocks.
    /// Bookkeeping, not history — lives outside the event log.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub blacklist: HashMap<PeerId, u64>,

    /// Outbox marker: completion persisted, accrual not yet handed to
    /// the ledger. Replayed on restart.
    #[serde(default)]
    pub accrual_pending: bool,
}

impl Task {
    pub fn new(
        id: String,
        template_id: String,
        title: String,
        reward: u64,
        provider_peer_id: PeerId,
        payload: String,
    ) -> Self {
        let created_at = now_ms();
        let mut task = Self {
            id,
            template_id,
            title,
            reward,
            provider_peer_id: provider_peer_id.clone(),
            payload,
            created_at,
            state: TaskState::Pending,
            assigned_worker_peer_id: None,
            offered_at: None,
            deadline: None,
            events: Vec::new(),
            blacklist: HashMap::new(),
            accrual_pending: false,
        };
        task.append_event(TaskEventType::Created, &provider_peer_id, None);
        task
    }

    /// Append an event, clamping the timestamp so the log stays
    /// monotone even if the wall clock steps backwards.
    pub fn append_event(
        &mut self,
        event_type: TaskEventType,
        actor: &str,
        payload: Option<serde_json::Value>,
    ) {
        let floor = self.events.last().map(|e| e.timestamp).unwrap_or(0);
        self.events.push(TaskEvent {
            event_type,
            timestamp: now_ms().max(floor),
            actor: actor.to_string(),
            payload,
        });
    }

    /// The most recent submission payload, JSON-parsed. None before any
    /// submission or when the result is not valid JSON.
    pub fn latest_result(&self) -> Option<serde_json::Value> {
        self.events
            .iter()
            .rev()
            .find(|e| e.event_type == TaskEventType::Submission)
            .and_then(|e| e.payload.as_ref())
            .and_then(|p| p.get("result"))
            .and_then(|r| r.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// Whether this worker is currently blacklisted from offers.
    pub fn is_blacklisted(&self, peer_id: &PeerId, cycle: u64) -> bool {
        self.blacklist
            .get(peer_id)
            .map(|unlock| cycle < *unlock)
            .unwrap_or(false)
    }
}
