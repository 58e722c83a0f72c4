//! Control loop — the cycle tick that pulses the manager forward.
//!
//! Each tick: run the engine's timeout sweep, run the dispatch step
//! (when auto-manage is on), then bump the cycle counter and announce
//! it. Pause suspends sweeps and dispatch while inbound messages keep
//! flowing; stop runs a graceful drain before teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::engine::TaskEngine;
use crate::events::{EventBus, ManagerEvent};

pub struct ControlLoop {
    engine: Arc<TaskEngine>,
    events: EventBus,
    cycle: AtomicU64,
    paused: AtomicBool,
    running: AtomicBool,
    tick_interval: Duration,
    drain_deadline: Duration,
    auto_manage: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl ControlLoop {
    pub fn new(
        engine: Arc<TaskEngine>,
        events: EventBus,
        tick_interval_ms: u64,
        drain_deadline_secs: u64,
        auto_manage: bool,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            events,
            cycle: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            tick_interval: Duration::from_millis(tick_interval_ms.max(10)),
            drain_deadline: Duration::from_secs(drain_deadline_secs),
            auto_manage,
            shutdown_tx,
        })
    }

    /// Spawn the tick task. Idempotent: a second start is a no-op.
    pub fn start(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let control = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(control.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        control.tick();
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("control loop shutting down");
                        break;
                    }
                }
            }
        }))
    }

    /// One cycle: sweep, dispatch, announce. Public so tests and manual
    /// flows can drive the manager without the timer.
    pub fn tick(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        self.engine.sweep(cycle);
        if self.auto_manage {
            self.engine.dispatch_step();
        }
        self.events.emit(ManagerEvent::Cycle { cycle });
        tracing::trace!(cycle, "cycle tick");
    }

    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Suspend sweeps and dispatch. Inbound messages keep being
    /// accepted and queue up as ordinary state changes.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("control loop paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("control loop resumed");
    }

    /// Graceful stop: refuse new tasks, let in-flight Accepted tasks
    /// finish up to the drain deadline, then hard-cancel the rest and
    /// announce `ManagerStop`.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("manager stopping — draining in-flight tasks");
        self.engine.set_accepting(false);

        let deadline = tokio::time::Instant::now() + self.drain_deadline;
        while self.engine.inflight_accepted() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.engine.inflight_accepted(),
                    "drain deadline reached — cancelling remaining tasks"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.engine.cancel_open_tasks();
        self.events.emit(ManagerEvent::ManagerStop);
        let _ = self.shutdown_tx.send(true);
    }
}
