//! Worker registry — admission, connection state, dispatch ordering.
//!
//! Onboarding is gated on single-use access codes when the manager is
//! configured to require them, and on a strictly increasing per-peer
//! nonce to stop replays. The dispatch queue rotates round-robin so
//! every connected worker gets offers in deterministic order.
//!
//! The registry owns worker connection state exclusively. It never
//! touches tasks: a disconnect is observed by the task engine's sweep,
//! which recovers any task the worker held.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use drover_core::crypto::access_code_digest;
use drover_core::{now_ms, ManagerError, PeerId, Recipient};

use crate::events::{EventBus, ManagerEvent};
use crate::store::{prefix, KvStore};
use crate::worker::{Worker, WorkerState};

/// Consumed marker persisted per access code.
#[derive(Debug, Serialize, Deserialize)]
struct AccessCodeRecord {
    consumed: bool,
    consumed_by: Option<PeerId>,
    consumed_at: Option<u64>,
}

struct RegistryState {
    workers: HashMap<PeerId, Worker>,
    /// Round-robin dispatch queue. Only Connected workers rotate out of
    /// the front; Busy workers cycle to the back untouched.
    queue: VecDeque<PeerId>,
}

pub struct WorkerRegistry {
    store: Arc<dyn KvStore>,
    state: Mutex<RegistryState>,
    require_access_codes: bool,
    events: EventBus,
}

impl WorkerRegistry {
    /// Open the registry, reloading persisted worker records. Workers
    /// come back as Disconnected — the transport re-connects them.
    pub fn open(
        store: Arc<dyn KvStore>,
        require_access_codes: bool,
        events: EventBus,
    ) -> Result<Self, ManagerError> {
        let mut workers = HashMap::new();
        for (key, value) in store.list(prefix::WORKER)? {
            match serde_json::from_slice::<Worker>(&value) {
                Ok(mut worker) => {
                    worker.state = WorkerState::Disconnected;
                    worker.current_task_id = None;
                    workers.insert(worker.peer_id.clone(), worker);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping unreadable worker record");
                }
            }
        }
        tracing::info!(count = workers.len(), "worker registry loaded");
        Ok(Self {
            store,
            state: Mutex::new(RegistryState {
                workers,
                queue: VecDeque::new(),
            }),
            require_access_codes,
            events,
        })
    }

    /// Seed an access code into the whitelist. Codes are stored as
    /// BLAKE3 digests, never in the clear. Re-seeding a known code is a
    /// no-op, so a consumed code stays consumed across restarts.
    pub fn seed_access_code(&self, code: &str) -> Result<(), ManagerError> {
        let key = format!("{}{}", prefix::ACCESS_CODE, access_code_digest(code));
        if self.store.get(&key)?.is_some() {
            return Ok(());
        }
        let record = AccessCodeRecord {
            consumed: false,
            consumed_by: None,
            consumed_at: None,
        };
        self.store.put(&key, &serde_json::to_vec(&record).map_err(store_err)?)?;
        Ok(())
    }

    /// Onboard a worker.
    ///
    /// Nonce rules: a nonce equal to the last accepted one makes the
    /// call idempotent (Ok, no state change); a lower nonce is a
    /// replay; a higher nonce re-onboards a disconnected worker or
    /// registers a new one. A worker that is already connected cannot
    /// onboard again under a new nonce.
    pub fn onboard(
        &self,
        peer_id: &PeerId,
        recipient: Recipient,
        nonce: u64,
        access_code: Option<&str>,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.lock().expect("registry lock poisoned");

        if let Some(existing) = state.workers.get(peer_id) {
            if nonce == existing.last_nonce {
                // Idempotent re-onboard.
                return Ok(());
            }
            if nonce < existing.last_nonce {
                return Err(ManagerError::Replay(format!(
                    "nonce {nonce} not above {}",
                    existing.last_nonce
                )));
            }
            if existing.is_online() {
                return Err(ManagerError::Conflict(format!(
                    "worker {peer_id} already onboarded"
                )));
            }
        } else if self.require_access_codes {
            // Fresh workers must present a valid, unconsumed code.
            let code = access_code.ok_or_else(|| {
                ManagerError::Forbidden("access code required for onboarding".into())
            })?;
            self.consume_access_code(code, peer_id)?;
        }

        let worker = Worker {
            peer_id: peer_id.clone(),
            recipient,
            state: WorkerState::Connected,
            current_task_id: None,
            connected_at: now_ms(),
            last_nonce: nonce,
        };
        self.persist(&worker)?;

        state.workers.insert(peer_id.clone(), worker);
        if !state.queue.contains(peer_id) {
            state.queue.push_back(peer_id.clone());
        }
        drop(state);

        tracing::info!(peer = %peer_id, nonce, "worker onboarded");
        self.events.emit(ManagerEvent::WorkerOnboarded {
            peer_id: peer_id.clone(),
            recipient: hex::encode(recipient),
        });
        Ok(())
    }

    fn consume_access_code(&self, code: &str, peer_id: &PeerId) -> Result<(), ManagerError> {
        let key = format!("{}{}", prefix::ACCESS_CODE, access_code_digest(code));
        let Some(bytes) = self.store.get(&key)? else {
            return Err(ManagerError::Forbidden("unknown access code".into()));
        };
        let mut record: AccessCodeRecord = serde_json::from_slice(&bytes).map_err(store_err)?;
        if record.consumed {
            return Err(ManagerError::Forbidden("access code already used".into()));
        }
        record.consumed = true;
        record.consumed_by = Some(peer_id.clone());
        record.consumed_at = Some(now_ms());
        self.store.put(&key, &serde_json::to_vec(&record).map_err(store_err)?)?;
        Ok(())
    }

    pub fn get_worker(&self, peer_id: &PeerId) -> Option<Worker> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .workers
            .get(peer_id)
            .cloned()
    }

    pub fn is_registered(&self, peer_id: &PeerId) -> bool {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .workers
            .contains_key(peer_id)
    }

    /// Transport reconnect for a known worker. Unknown peers are a
    /// no-op: they must onboard first.
    pub fn connect(&self, peer_id: &PeerId) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let Some(worker) = state.workers.get_mut(peer_id) else {
            return;
        };
        worker.state = WorkerState::Connected;
        worker.connected_at = now_ms();
        worker.current_task_id = None;
        let snapshot = worker.clone();
        if !state.queue.contains(peer_id) {
            state.queue.push_back(peer_id.clone());
        }
        drop(state);

        if let Err(e) = self.persist(&snapshot) {
            tracing::warn!(peer = %peer_id, error = %e, "failed to persist worker connect");
        }
        self.events.emit(ManagerEvent::WorkerConnected {
            peer_id: peer_id.clone(),
        });
    }

    /// Transport drop. The durable record survives; the queue entry
    /// does not. Task recovery is the engine's job.
    pub fn disconnect(&self, peer_id: &PeerId) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let Some(worker) = state.workers.get_mut(peer_id) else {
            return;
        };
        worker.state = WorkerState::Disconnected;
        worker.current_task_id = None;
        let snapshot = worker.clone();
        state.queue.retain(|p| p != peer_id);
        drop(state);

        if let Err(e) = self.persist(&snapshot) {
            tracing::warn!(peer = %peer_id, error = %e, "failed to persist worker disconnect");
        }
        tracing::info!(peer = %peer_id, "worker disconnected");
        self.events.emit(ManagerEvent::WorkerDisconnected {
            peer_id: peer_id.clone(),
        });
    }

    /// Next worker to offer to, rotating the queue. Deterministic:
    /// workers come back in the order they were queued. Busy and stale
    /// entries rotate to the back without being returned.
    pub fn next_eligible(&self) -> Option<PeerId> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        for _ in 0..state.queue.len() {
            let Some(peer_id) = state.queue.pop_front() else {
                break;
            };
            match state.workers.get(&peer_id) {
                Some(worker) if worker.is_eligible() => {
                    state.queue.push_back(peer_id.clone());
                    return Some(peer_id);
                }
                Some(worker) if worker.state == WorkerState::Busy => {
                    state.queue.push_back(peer_id);
                }
                // Disconnected or unknown: drop from the queue.
                _ => {}
            }
        }
        None
    }

    pub fn mark_busy(&self, peer_id: &PeerId, task_id: &str) {
        self.update_state(peer_id, WorkerState::Busy, Some(task_id.to_string()));
    }

    pub fn mark_idle(&self, peer_id: &PeerId) {
        // Only flip Busy → Connected; a disconnected worker stays down.
        let mut state = self.state.lock().expect("registry lock poisoned");
        let Some(worker) = state.workers.get_mut(peer_id) else {
            return;
        };
        if worker.state != WorkerState::Busy {
            return;
        }
        worker.state = WorkerState::Connected;
        worker.current_task_id = None;
        let snapshot = worker.clone();
        drop(state);
        if let Err(e) = self.persist(&snapshot) {
            tracing::warn!(peer = %peer_id, error = %e, "failed to persist worker idle");
        }
    }

    fn update_state(&self, peer_id: &PeerId, new_state: WorkerState, task: Option<String>) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let Some(worker) = state.workers.get_mut(peer_id) else {
            return;
        };
        worker.state = new_state;
        worker.current_task_id = task;
        let snapshot = worker.clone();
        drop(state);
        if let Err(e) = self.persist(&snapshot) {
            tracing::warn!(peer = %peer_id, error = %e, "failed to persist worker state");
        }
    }

    /// Currently connected (including busy) peers, for the admin surface.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .workers
            .values()
            .filter(|w| w.is_online())
            .map(|w| w.peer_id.clone())
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().expect("registry lock poisoned").queue.len()
    }

    fn persist(&self, worker: &Worker) -> Result<(), ManagerError> {
        let key = format!("{}{}", prefix::WORKER, worker.peer_id);
        self.store
            .put(&key, &serde_json::to_vec(worker).map_err(store_err)?)?;
        Ok(())
    }
}

fn store_err(e: serde_json::Error) -> ManagerError {
    ManagerError::Store(e.to_string())
}
