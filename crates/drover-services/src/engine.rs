//! Task engine — admission, dispatch, and the lifecycle state machine.
//!
//! The engine owns task state exclusively. Workers are consulted
//! through the registry (engine → registry only, never the reverse);
//! completed tasks reach the payment ledger through the accrual outbox,
//! never by direct call. Mutations serialize through one lock; nothing
//! awaits while it is held.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use drover_core::wire::{self, Envelope, MessageType, Template};
use drover_core::{now_ms, ManagerError, PeerId, Recipient};

use crate::events::{EventBus, ManagerEvent};
use crate::registry::WorkerRegistry;
use crate::store::{prefix, KvStore};
use crate::task::{Task, TaskEventType, TaskState};
use crate::OutboundFrame;

/// Cycles a rejecting worker stays blacklisted for the task it refused.
pub const REJECT_BLACKLIST_CYCLES: u64 = 8;

/// Accrual handed to the ledger's inbox once a completion is durable.
#[derive(Debug, Clone)]
pub struct Accrual {
    pub task_id: String,
    pub recipient: Recipient,
    pub amount: u64,
}

/// Read-model row for the template task listing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub template_id: String,
    pub title: String,
    pub result: Option<serde_json::Value>,
}

struct EngineState {
    tasks: HashMap<String, Task>,
    /// Dispatch order for Pending tasks.
    pending: VecDeque<String>,
    templates: HashMap<String, Template>,
}

pub struct TaskEngine {
    store: Arc<dyn KvStore>,
    registry: Arc<WorkerRegistry>,
    state: Mutex<EngineState>,
    events: EventBus,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    accruals: mpsc::UnboundedSender<Accrual>,
    acceptance_ms: u64,
    auto_manage: bool,
    /// Flipped off by the graceful stop; new tasks are refused.
    accepting: AtomicBool,
    /// Current control-loop cycle, used by the rejection blacklist.
    cycle: AtomicU64,
}

impl TaskEngine {
    /// Open the engine, reloading persisted tasks and templates.
    /// Pending and Rejected tasks re-enter the dispatch queue; Offered
    /// and Accepted ones recover through the first sweep (their workers
    /// are all disconnected after a restart). Completions whose accrual
    /// never reached the ledger are replayed from the outbox marker.
    pub fn open(
        store: Arc<dyn KvStore>,
        registry: Arc<WorkerRegistry>,
        events: EventBus,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        accruals: mpsc::UnboundedSender<Accrual>,
        acceptance_ms: u64,
        auto_manage: bool,
    ) -> Result<Self, ManagerError> {
        let mut tasks = HashMap::new();
        let mut pending = VecDeque::new();
        for (key, value) in store.list(prefix::TASK)? {
            match serde_json::from_slice::<Task>(&value) {
                Ok(task) => {
                    if matches!(task.state, TaskState::Pending | TaskState::Rejected) {
                        pending.push_back(task.id.clone());
                    }
                    tasks.insert(task.id.clone(), task);
                }
                Err(e) => tracing::warn!(key, error = %e, "skipping unreadable task record"),
            }
        }

        let mut templates = HashMap::new();
        for (key, value) in store.list(prefix::TEMPLATE)? {
            match serde_json::from_slice::<Template>(&value) {
                Ok(t) => {
                    templates.insert(t.template_id.clone(), t);
                }
                Err(e) => tracing::warn!(key, error = %e, "skipping unreadable template record"),
            }
        }

        tracing::info!(
            tasks = tasks.len(),
            templates = templates.len(),
            "task engine loaded"
        );

        let engine = Self {
            store,
            registry,
            state: Mutex::new(EngineState {
                tasks,
                pending,
                templates,
            }),
            events,
            outbound,
            accruals,
            acceptance_ms,
            auto_manage,
            accepting: AtomicBool::new(true),
            cycle: AtomicU64::new(0),
        };
        engine.replay_outbox();
        Ok(engine)
    }

    // ── Templates ─────────────────────────────────────────────────────────────

    pub fn register_template(
        &self,
        mut template: Template,
        provider: &PeerId,
    ) -> Result<String, ManagerError> {
        if template.template_id.is_empty() || template.template_id.contains('/') {
            return Err(ManagerError::InvalidArgument(
                "template id must be non-empty and slash-free".into(),
            ));
        }
        let mut state = self.state.lock().expect("engine lock poisoned");
        if state.templates.contains_key(&template.template_id) {
            return Err(ManagerError::Conflict(format!(
                "template {} already registered",
                template.template_id
            )));
        }
        template.created_at = now_ms();
        self.store.put(
            &format!("{}{}", prefix::TEMPLATE, template.template_id),
            &serde_json::to_vec(&template).map_err(serde_err)?,
        )?;
        let id = template.template_id.clone();
        state.templates.insert(id.clone(), template);
        drop(state);

        tracing::info!(template = %id, provider = %provider, "template registered");
        Ok(id)
    }

    pub fn get_template(&self, template_id: &str) -> Option<Template> {
        self.state
            .lock()
            .expect("engine lock poisoned")
            .templates
            .get(template_id)
            .cloned()
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    pub fn create_task(
        &self,
        submit: wire::TaskSubmit,
        provider: &PeerId,
    ) -> Result<(), ManagerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ManagerError::Cancelled);
        }
        if submit.task_id.is_empty() || submit.task_id.contains('/') {
            return Err(ManagerError::InvalidArgument(
                "task id must be non-empty and slash-free".into(),
            ));
        }

        {
            let mut state = self.state.lock().expect("engine lock poisoned");
            if !state.templates.contains_key(&submit.template_id) {
                return Err(ManagerError::NotFound(format!(
                    "unknown template {}",
                    submit.template_id
                )));
            }
            if state.tasks.contains_key(&submit.task_id) {
                return Err(ManagerError::Conflict(format!(
                    "duplicate task {}",
                    submit.task_id
                )));
            }

            let task = Task::new(
                submit.task_id.clone(),
                submit.template_id,
                submit.title,
                submit.reward,
                provider.clone(),
                submit.payload,
            );
            self.persist(&task)?;
            state.pending.push_back(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }

        tracing::info!(task = %submit.task_id, provider = %provider, "task created");
        self.events.emit(ManagerEvent::TaskCreated {
            task_id: submit.task_id,
        });

        self.auto_dispatch();
        Ok(())
    }

    /// Dispatch when auto-manage is on. Event-driven call sites (task
    /// arrival, worker onboarding, worker going idle) use this; manual
    /// flows call `dispatch_step` directly.
    pub fn auto_dispatch(&self) {
        if self.auto_manage {
            self.dispatch_step();
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Offer pending tasks to eligible workers until either side runs
    /// out. Each pairing transitions the task and busies the worker
    /// atomically under the engine lock; the offer frame is enqueued
    /// after the lock drops.
    pub fn dispatch_step(&self) {
        loop {
            let Some((worker_id, offer)) = self.offer_one() else {
                break;
            };
            let envelope = match Envelope::new(MessageType::OFFER, &offer) {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode offer");
                    self.rollback_offer(&offer.task_id, &worker_id);
                    break;
                }
            };
            if self.outbound.send((worker_id.clone(), envelope)).is_err() {
                // Transport gone — put the task back and stop dispatching.
                self.rollback_offer(&offer.task_id, &worker_id);
                break;
            }
            self.events.emit(ManagerEvent::TaskOffered {
                task_id: offer.task_id.clone(),
                peer_id: worker_id,
            });
        }
    }

    /// Pair one pending task with one eligible worker. Returns the
    /// prepared offer, or None when either side is empty.
    fn offer_one(&self) -> Option<(PeerId, wire::TaskOffer)> {
        let cycle = self.cycle.load(Ordering::SeqCst);
        let mut state = self.state.lock().expect("engine lock poisoned");

        // Scan the pending queue once, rotating unplaceable tasks back.
        for _ in 0..state.pending.len() {
            let task_id = state.pending.pop_front()?;
            let Some(task) = state.tasks.get(&task_id) else {
                continue; // stale queue entry
            };
            if task.state != TaskState::Pending {
                continue;
            }

            // Find a worker the blacklist allows. Each probe rotates the
            // registry queue, preserving overall fairness.
            let mut chosen = None;
            let mut saw_worker = false;
            for _ in 0..self.registry.queue_len().max(1) {
                match self.registry.next_eligible() {
                    Some(peer) => {
                        saw_worker = true;
                        if !task.is_blacklisted(&peer, cycle) {
                            chosen = Some(peer);
                            break;
                        }
                    }
                    None => break,
                }
            }
            let Some(worker_id) = chosen else {
                state.pending.push_back(task_id);
                if saw_worker {
                    // Only the blacklist stood in the way — another
                    // pending task may still be placeable.
                    continue;
                }
                return None; // no eligible workers at all — stop
            };

            let now = now_ms();
            let task = state.tasks.get_mut(&task_id).expect("checked above");
            task.state = TaskState::Offered;
            task.assigned_worker_peer_id = Some(worker_id.clone());
            task.offered_at = Some(now);
            task.deadline = Some(now + self.acceptance_ms);
            task.append_event(TaskEventType::Offered, &worker_id, None);

            if let Err(e) = self.persist(task) {
                // Abort the transition: no event survives, task stays pending.
                tracing::warn!(task = %task_id, error = %e, "offer transition aborted");
                task.state = TaskState::Pending;
                task.assigned_worker_peer_id = None;
                task.offered_at = None;
                task.deadline = None;
                task.events.pop();
                state.pending.push_back(task_id);
                return None;
            }

            let offer = wire::TaskOffer {
                task_id: task.id.clone(),
                template_id: task.template_id.clone(),
                title: task.title.clone(),
                reward: task.reward,
                payload: task.payload.clone(),
                deadline: task.deadline.expect("set above"),
            };
            drop(state);

            self.registry.mark_busy(&worker_id, &offer.task_id);
            tracing::info!(task = %offer.task_id, worker = %worker_id, "task offered");
            return Some((worker_id, offer));
        }
        None
    }

    fn rollback_offer(&self, task_id: &str, worker_id: &PeerId) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if let Some(task) = state.tasks.get_mut(task_id) {
            if task.state == TaskState::Offered {
                task.state = TaskState::Pending;
                task.assigned_worker_peer_id = None;
                task.offered_at = None;
                task.deadline = None;
                task.events.pop();
                if let Err(e) = self.persist(task) {
                    tracing::warn!(task = %task_id, error = %e, "offer rollback persist failed");
                }
                state.pending.push_front(task_id.to_string());
            }
        }
        drop(state);
        self.registry.mark_idle(worker_id);
    }

    // ── Worker responses ──────────────────────────────────────────────────────

    pub fn process_task_acception(
        &self,
        task_id: &str,
        worker: &PeerId,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.lock().expect("engine lock poisoned");
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ManagerError::NotFound(format!("task {task_id}")))?;

        if task.state != TaskState::Offered {
            return Err(ManagerError::Conflict(format!(
                "task {task_id} is not offered"
            )));
        }
        if task.assigned_worker_peer_id.as_ref() != Some(worker) {
            return Err(ManagerError::Forbidden(format!(
                "task {task_id} is not offered to {worker}"
            )));
        }
        if now_ms() > task.deadline.unwrap_or(0) {
            // The sweep will reclaim it; the late accept gets a clear error.
            return Err(ManagerError::DeadlinePassed(format!(
                "acceptance window for {task_id} elapsed"
            )));
        }

        task.state = TaskState::Accepted;
        task.append_event(TaskEventType::Accepted, worker, None);
        self.persist(task)?;
        drop(state);

        tracing::info!(task = %task_id, worker = %worker, "task accepted");
        self.events.emit(ManagerEvent::TaskAccepted {
            task_id: task_id.to_string(),
            peer_id: worker.clone(),
        });
        Ok(())
    }

    pub fn process_task_rejection(
        &self,
        task_id: &str,
        worker: &PeerId,
        reason: &str,
    ) -> Result<(), ManagerError> {
        let cycle = self.cycle.load(Ordering::SeqCst);
        let mut state = self.state.lock().expect("engine lock poisoned");
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ManagerError::NotFound(format!("task {task_id}")))?;

        if task.state != TaskState::Offered {
            return Err(ManagerError::Conflict(format!(
                "task {task_id} is not offered"
            )));
        }
        if task.assigned_worker_peer_id.as_ref() != Some(worker) {
            return Err(ManagerError::Forbidden(format!(
                "task {task_id} is not offered to {worker}"
            )));
        }

        task.state = TaskState::Rejected;
        task.assigned_worker_peer_id = None;
        task.offered_at = None;
        task.deadline = None;
        task.append_event(
            TaskEventType::Rejected,
            worker,
            Some(serde_json::json!({ "reason": reason })),
        );
        task.blacklist
            .insert(worker.clone(), cycle + REJECT_BLACKLIST_CYCLES);
        self.persist(task)?;
        drop(state);

        self.registry.mark_idle(worker);
        tracing::info!(task = %task_id, worker = %worker, reason, "task rejected");
        self.events.emit(ManagerEvent::TaskRejected {
            task_id: task_id.to_string(),
            peer_id: worker.clone(),
            reason: reason.to_string(),
        });

        // The rejecter is idle again; other pending tasks may fit it.
        self.auto_dispatch();
        Ok(())
    }

    pub fn process_task_submission(
        &self,
        task_id: &str,
        worker: &PeerId,
        result: &str,
    ) -> Result<(), ManagerError> {
        let accrual;
        {
            let mut state = self.state.lock().expect("engine lock poisoned");
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ManagerError::NotFound(format!("task {task_id}")))?;

            // Not-Accepted covers double submission after a timeout put
            // the task back in rotation: the second submit is refused
            // even from the worker that originally accepted.
            if task.state != TaskState::Accepted {
                return Err(ManagerError::Conflict(format!(
                    "task {task_id} is not accepted"
                )));
            }
            if task.assigned_worker_peer_id.as_ref() != Some(worker) {
                return Err(ManagerError::Forbidden(format!(
                    "task {task_id} is not assigned to {worker}"
                )));
            }

            task.state = TaskState::Completed;
            task.append_event(
                TaskEventType::Submission,
                worker,
                Some(serde_json::json!({ "result": result })),
            );
            task.append_event(TaskEventType::Completed, worker, None);
            // Outbox: the completed transition (with its marker) is
            // durable before the ledger hears about it.
            task.accrual_pending = true;
            self.persist(task)?;

            accrual = self.registry.get_worker(worker).map(|w| Accrual {
                task_id: task_id.to_string(),
                recipient: w.recipient,
                amount: task.reward,
            });
        }

        self.registry.mark_idle(worker);
        tracing::info!(task = %task_id, worker = %worker, "task completed");
        self.events.emit(ManagerEvent::TaskCompleted {
            task_id: task_id.to_string(),
            peer_id: worker.clone(),
        });

        match accrual {
            Some(accrual) => {
                if self.accruals.send(accrual).is_err() {
                    tracing::warn!(task = %task_id, "ledger inbox closed; accrual stays in outbox");
                }
            }
            None => tracing::warn!(task = %task_id, worker = %worker, "no worker record for accrual"),
        }

        self.auto_dispatch();
        Ok(())
    }

    /// Ledger confirmation that an accrual is durable — clears the
    /// outbox marker.
    pub fn mark_accrued(&self, task_id: &str) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.accrual_pending = false;
            if let Err(e) = self.persist(task) {
                tracing::warn!(task = %task_id, error = %e, "failed to clear accrual marker");
            }
        }
    }

    fn replay_outbox(&self) {
        let state = self.state.lock().expect("engine lock poisoned");
        for task in state.tasks.values().filter(|t| t.accrual_pending) {
            let Some(worker_id) = task
                .events
                .iter()
                .rev()
                .find(|e| e.event_type == TaskEventType::Completed)
                .map(|e| e.actor.clone())
            else {
                continue;
            };
            let Some(worker) = self.registry.get_worker(&worker_id) else {
                tracing::warn!(task = %task.id, "outbox replay: worker record missing");
                continue;
            };
            tracing::info!(task = %task.id, "replaying unprocessed accrual");
            let _ = self.accruals.send(Accrual {
                task_id: task.id.clone(),
                recipient: worker.recipient,
                amount: task.reward,
            });
        }
    }

    // ── Sweep ─────────────────────────────────────────────────────────────────

    /// Reclaim stale offers and orphaned assignments, and requeue
    /// rejected tasks. Runs once per control-loop tick.
    pub fn sweep(&self, cycle: u64) {
        self.cycle.store(cycle, Ordering::SeqCst);
        let now = now_ms();
        let mut recovered: Vec<(String, PeerId)> = Vec::new();

        {
            let mut state = self.state.lock().expect("engine lock poisoned");
            let ids: Vec<String> = state.tasks.keys().cloned().collect();
            for id in ids {
                let task = state.tasks.get_mut(&id).expect("key from map");
                match task.state {
                    TaskState::Offered | TaskState::Accepted => {
                        let timed_out = task.state == TaskState::Offered
                            && task.deadline.map(|d| now > d).unwrap_or(false);
                        let worker_gone = task
                            .assigned_worker_peer_id
                            .as_ref()
                            .map(|w| {
                                self.registry
                                    .get_worker(w)
                                    .map(|rec| !rec.is_online())
                                    .unwrap_or(true)
                            })
                            .unwrap_or(true);
                        if !(timed_out || worker_gone) {
                            continue;
                        }

                        let prior_state = task.state;
                        let prior_offered_at = task.offered_at;
                        let prior_deadline = task.deadline;
                        let worker = task
                            .assigned_worker_peer_id
                            .take()
                            .unwrap_or_else(|| "unknown".to_string());
                        task.state = TaskState::Pending;
                        task.offered_at = None;
                        task.deadline = None;
                        task.append_event(TaskEventType::Expired, "manager", None);
                        if let Err(e) = self.persist(task) {
                            // Abort this recovery; retry next tick.
                            tracing::warn!(task = %id, error = %e, "sweep persist failed");
                            task.events.pop();
                            task.state = prior_state;
                            task.offered_at = prior_offered_at;
                            task.deadline = prior_deadline;
                            task.assigned_worker_peer_id = Some(worker);
                            continue;
                        }
                        state.pending.push_back(id.clone());
                        recovered.push((id, worker));
                    }
                    TaskState::Rejected => {
                        task.state = TaskState::Pending;
                        if let Err(e) = self.persist(task) {
                            tracing::warn!(task = %id, error = %e, "sweep persist failed");
                            task.state = TaskState::Rejected;
                            continue;
                        }
                        if !state.pending.contains(&id) {
                            state.pending.push_back(id.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        for (task_id, worker) in recovered {
            self.registry.mark_idle(&worker);
            tracing::info!(task = %task_id, worker = %worker, "task recovered to pending");
            self.events.emit(ManagerEvent::TaskExpired {
                task_id,
                peer_id: worker,
            });
        }
    }

    // ── Graceful stop ─────────────────────────────────────────────────────────

    /// Refuse new tasks from now on.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Tasks still in Accepted — the drain waits on these.
    pub fn inflight_accepted(&self) -> usize {
        self.state
            .lock()
            .expect("engine lock poisoned")
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Accepted)
            .count()
    }

    /// Hard-cancel everything still open. Called after the drain
    /// deadline; cancelled tasks end in the terminal Expired state.
    pub fn cancel_open_tasks(&self) {
        let mut state = self.state.lock().expect("engine lock poisoned");
        let mut idle = Vec::new();
        for task in state.tasks.values_mut() {
            if matches!(
                task.state,
                TaskState::Pending | TaskState::Offered | TaskState::Accepted | TaskState::Rejected
            ) {
                if let Some(worker) = task.assigned_worker_peer_id.take() {
                    idle.push(worker);
                }
                task.state = TaskState::Expired;
                task.deadline = None;
                task.append_event(TaskEventType::Expired, "manager", None);
                if let Err(e) = self.persist(task) {
                    tracing::warn!(task = %task.id, error = %e, "cancel persist failed");
                }
            }
        }
        state.pending.clear();
        drop(state);
        for worker in idle {
            self.registry.mark_idle(&worker);
        }
    }

    // ── Read models ───────────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state
            .lock()
            .expect("engine lock poisoned")
            .tasks
            .get(task_id)
            .cloned()
    }

    pub fn get_completed_tasks(&self, offset: usize, limit: usize) -> Vec<Task> {
        let state = self.state.lock().expect("engine lock poisoned");
        let mut completed: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Completed)
            .collect();
        completed.sort_by_key(|t| t.created_at);
        completed
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn tasks_for_template(&self, template_id: &str) -> Vec<TaskSummary> {
        let state = self.state.lock().expect("engine lock poisoned");
        let mut rows: Vec<TaskSummary> = state
            .tasks
            .values()
            .filter(|t| t.template_id == template_id)
            .map(|t| TaskSummary {
                task_id: t.id.clone(),
                template_id: t.template_id.clone(),
                title: t.title.clone(),
                result: t.latest_result(),
            })
            .collect();
        rows.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        rows
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("engine lock poisoned")
            .pending
            .len()
    }

    fn persist(&self, task: &Task) -> Result<(), ManagerError> {
        self.store.put(
            &format!("{}{}", prefix::TASK, task.id),
            &serde_json::to_vec(task).map_err(serde_err)?,
        )?;
        Ok(())
    }
}

fn serde_err(e: serde_json::Error) -> ManagerError {
    ManagerError::Store(e.to_string())
}
