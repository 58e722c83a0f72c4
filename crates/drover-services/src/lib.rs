//! drover-services — the Manager core.
//!
//! Three subsystems share state under one control loop: the worker
//! registry (admission + fair dispatch ordering), the task engine
//! (lifecycle state machine + dispatch), and the payment ledger
//! (accrual + proof-mediated payout). The message router maps wire
//! envelopes onto subsystem operations; the event bus publishes
//! observations one way so no subsystem reaches into another's state.

pub mod control;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod registry;
pub mod router;
pub mod store;
pub mod task;
pub mod worker;

pub use control::ControlLoop;
pub use engine::{Accrual, TaskEngine, TaskSummary};
pub use events::{EventBus, ManagerEvent};
pub use ledger::{PaymentLedger, PaymentRecord};
pub use registry::WorkerRegistry;
pub use router::{ManagerInfo, MessageRouter, RouterResponse};
pub use store::{FsStore, KvStore, MemoryStore};
pub use task::{Task, TaskEvent, TaskEventType, TaskState};
pub use worker::{Worker, WorkerState};

/// Outbound frame: an envelope destined for one peer. The transport
/// owns delivery; the core only enqueues.
pub type OutboundFrame = (drover_core::PeerId, drover_core::Envelope);
