//! End-to-end scenarios against the full manager core.
//!
//! The real subsystems run over a MemoryStore; the only substitution is
//! the transport, replaced by a captured outbound channel so tests can
//! observe offers exactly as a WebSocket peer would. Messages enter
//! through the router, the same path both transports use.

use std::sync::Arc;

use tokio::sync::mpsc;

use drover_core::crypto::{ManagerIdentity, ProofSignals, StructuralVerifier};
use drover_core::wire::{self, Envelope, MessageType};
use drover_core::{PeerId, Recipient};
use drover_services::{
    ControlLoop, EventBus, ManagerInfo, MessageRouter, OutboundFrame, PaymentLedger, TaskEngine,
    TaskEventType, TaskState, WorkerRegistry,
};

const R1: Recipient = [0xa1; 32];
const R2: Recipient = [0xb2; 32];

struct Manager {
    registry: Arc<WorkerRegistry>,
    engine: Arc<TaskEngine>,
    ledger: Arc<PaymentLedger>,
    control: Arc<ControlLoop>,
    router: MessageRouter,
    outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    accrual_rx: mpsc::UnboundedReceiver<drover_services::Accrual>,
}

/// Bring up a full manager core. `acceptance_ms` is short so timeout
/// scenarios run in test time.
fn manager(acceptance_ms: u64, batch_size: u64, auto_manage: bool) -> Manager {
    let store: Arc<dyn drover_services::KvStore> = Arc::new(drover_services::MemoryStore::new());
    let events = EventBus::new();
    let registry = Arc::new(WorkerRegistry::open(store.clone(), false, events.clone()).unwrap());

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (accrual_tx, accrual_rx) = mpsc::unbounded_channel();

    let engine = Arc::new(
        TaskEngine::open(
            store.clone(),
            registry.clone(),
            events.clone(),
            outbound_tx,
            accrual_tx,
            acceptance_ms,
            auto_manage,
        )
        .unwrap(),
    );

    let identity = Arc::new(ManagerIdentity::from_private(&[42u8; 32]));
    let public = identity.public;
    let ledger = Arc::new(
        PaymentLedger::open(
            store,
            events.clone(),
            identity,
            Arc::new(StructuralVerifier),
            batch_size,
            Some([0xfe; 32]),
        )
        .unwrap(),
    );

    let control = ControlLoop::new(engine.clone(), events, 1000, 1, auto_manage);
    let router = MessageRouter::new(
        registry.clone(),
        engine.clone(),
        ledger.clone(),
        ManagerInfo {
            peer_id: "manager".into(),
            require_access_codes: false,
            announced_addresses: vec![],
            public_key: public,
        },
    );

    Manager {
        registry,
        engine,
        ledger,
        control,
        router,
        outbound_rx,
        accrual_rx,
    }
}

impl Manager {
    /// Run the accrual drain by hand — the daemon task in miniature.
    fn drain_accruals(&mut self) {
        while let Ok(accrual) = self.accrual_rx.try_recv() {
            self.ledger
                .accrue(accrual.recipient, accrual.amount, Some(&accrual.task_id))
                .unwrap();
            self.engine.mark_accrued(&accrual.task_id);
        }
    }

    async fn onboard(&self, peer: &str, recipient: Recipient) {
        let reply = self
            .send(
                peer,
                MessageType::REQUEST_TO_WORK,
                &wire::RequestToWork {
                    recipient: hex::encode(recipient),
                    nonce: 0,
                    access_code: None,
                },
            )
            .await;
        assert_eq!(
            reply.message_type,
            MessageType::REQUEST_TO_WORK_RESPONSE,
            "onboarding failed: {:?}",
            reply.payload
        );
    }

    async fn send<T: serde::Serialize>(
        &self,
        peer: &str,
        message_type: &str,
        payload: &T,
    ) -> Envelope {
        let envelope = Envelope::new(message_type, payload).unwrap();
        self.router.handle(&peer.to_string(), envelope).await.reply
    }

    fn post_template(&self) {
        self.engine
            .register_template(
                wire::Template {
                    template_id: "tpl1".into(),
                    name: "unit-of-work".into(),
                    created_at: 0,
                    schema: None,
                },
                &"provider".to_string(),
            )
            .unwrap();
    }

    async fn post_task(&self, id: &str, reward: u64) {
        let reply = self
            .send(
                "provider",
                MessageType::TASK,
                &wire::TaskSubmit {
                    task_id: id.into(),
                    template_id: "tpl1".into(),
                    title: format!("work {id}"),
                    reward,
                    payload: "{}".into(),
                },
            )
            .await;
        assert_eq!(
            reply.message_type,
            MessageType::TASK_RESPONSE,
            "task post failed: {:?}",
            reply.payload
        );
    }

    fn next_offer(&mut self) -> (PeerId, wire::TaskOffer) {
        let (peer, envelope) = self
            .outbound_rx
            .try_recv()
            .expect("expected an offer on the transport");
        assert_eq!(envelope.message_type, MessageType::OFFER);
        (peer.clone(), envelope.decode_payload().unwrap())
    }
}

fn structural_proof(recipient: &Recipient, min: u64, max: u64, amount: u64) -> wire::RangeProof {
    wire::RangeProof {
        min_nonce: min,
        max_nonce: max,
        amount,
        recipient: hex::encode(recipient),
        proof: hex::encode(StructuralVerifier::prove(&ProofSignals {
            min_nonce: min,
            max_nonce: max,
            amount,
            recipient: *recipient,
        })),
    }
}

/// r8 as a correct worker computes it: commitment over the proof set
/// in ascending nonce order.
fn proof_set_r8(recipient: &Recipient, proofs: &[wire::RangeProof]) -> String {
    let mut sorted: Vec<&wire::RangeProof> = proofs.iter().collect();
    sorted.sort_by_key(|p| p.min_nonce);
    let signals: Vec<ProofSignals> = sorted
        .iter()
        .map(|p| ProofSignals {
            min_nonce: p.min_nonce,
            max_nonce: p.max_nonce,
            amount: p.amount,
            recipient: *recipient,
        })
        .collect();
    hex::encode(drover_core::crypto::proof_set_commitment(&signals))
}

// ── Scenario 1: happy path ────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_onboard_offer_accept_submit_accrue() {
    let mut m = manager(30_000, 4, true);
    m.post_template();
    m.onboard("w1", R1).await;
    m.post_task("t1", 5).await;

    // Within one cycle the offer reaches w1.
    m.control.tick();
    let (peer, offer) = m.next_offer();
    assert_eq!(peer, "w1");
    assert_eq!(offer.task_id, "t1");
    assert_eq!(offer.reward, 5);

    let reply = m
        .send(
            "w1",
            MessageType::TASK_ACCEPTED,
            &wire::TaskAccepted {
                task_id: "t1".into(),
            },
        )
        .await;
    assert_eq!(reply.message_type, MessageType::ACK);

    let reply = m
        .send(
            "w1",
            MessageType::TASK_COMPLETED,
            &wire::TaskCompleted {
                task_id: "t1".into(),
                result: "\"answer\"".into(),
            },
        )
        .await;
    assert_eq!(reply.message_type, MessageType::ACK);
    m.drain_accruals();

    // Exactly one payment record: {R1, nonce 0, amount 5}.
    let records = m.ledger.records_for(&R1).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].nonce, 0);
    assert_eq!(records[0].amount, 5);
    assert_eq!(records[0].recipient, R1);

    // Event log: created < offered < accepted < submission < completed.
    let task = m.engine.get_task("t1").unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.events.len(), 5);
    let kinds: Vec<TaskEventType> = task.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            TaskEventType::Created,
            TaskEventType::Offered,
            TaskEventType::Accepted,
            TaskEventType::Submission,
            TaskEventType::Completed,
        ]
    );
    let stamps: Vec<u64> = task.events.iter().map(|e| e.timestamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "monotone log");
}

// ── Scenario 2: acceptance timeout ────────────────────────────────────────────

#[tokio::test]
async fn acceptance_timeout_returns_task_and_offers_elsewhere() {
    let mut m = manager(50, 4, true);
    m.post_template();
    m.onboard("w1", R1).await;
    m.onboard("w2", R2).await;
    m.post_task("t1", 5).await;

    let (first, offer) = m.next_offer();
    assert_eq!(first, "w1");
    assert_eq!(offer.task_id, "t1");

    // w1 never answers.
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    m.control.tick();

    // Task recovered and w1 idle again.
    {
        let task = m.engine.get_task("t1").unwrap();
        assert!(
            task.events
                .iter()
                .any(|e| e.event_type == TaskEventType::Expired),
            "expired event appended"
        );
        let w1 = m.registry.get_worker(&"w1".to_string()).unwrap();
        assert_eq!(w1.state, drover_services::WorkerState::Connected);
    }

    // The same tick re-dispatched; the next eligible worker is w2.
    let (second, offer) = m.next_offer();
    assert_eq!(second, "w2");
    assert_eq!(offer.task_id, "t1");
}

// ── Scenario 3: disconnect mid-accept ─────────────────────────────────────────

#[tokio::test]
async fn disconnect_after_accept_recovers_without_payment() {
    let mut m = manager(30_000, 4, true);
    m.post_template();
    m.onboard("w1", R1).await;
    m.post_task("t1", 5).await;
    let _ = m.next_offer();

    m.send(
        "w1",
        MessageType::TASK_ACCEPTED,
        &wire::TaskAccepted {
            task_id: "t1".into(),
        },
    )
    .await;

    // Transport drops.
    m.registry.disconnect(&"w1".to_string());
    m.control.tick();
    m.drain_accruals();

    let task = m.engine.get_task("t1").unwrap();
    assert_eq!(task.state, TaskState::Pending);
    assert!(
        !task
            .events
            .iter()
            .any(|e| e.event_type == TaskEventType::Completed),
        "no completed event"
    );
    assert!(m.ledger.records_for(&R1).unwrap().is_empty(), "no payment");
}

// ── Scenario 4: forbidden proof ───────────────────────────────────────────────

#[tokio::test]
async fn proof_request_naming_foreign_recipient_is_forbidden() {
    let m = manager(30_000, 4, true);
    m.onboard("w1", R1).await;
    m.onboard("w2", R2).await;
    m.ledger.accrue(R1, 5, None).unwrap();

    // w2 (recipient R2) requests an authorization over R1's records.
    let reply = m
        .send(
            "w2",
            MessageType::PROOF_REQUEST,
            &wire::ProofRequest {
                payments: vec![wire::PaymentRef {
                    recipient: hex::encode(R1),
                    nonce: 0,
                    amount: 5,
                }],
            },
        )
        .await;
    assert_eq!(reply.message_type, MessageType::ERROR);
    assert_eq!(reply.payload["kind"], "forbidden");

    // No state change.
    assert!(m.ledger.last_settled_nonce(&R1).is_none());
    assert!(!m.ledger.records_for(&R1).unwrap()[0].settled);
}

// ── Scenario 5: bulk proof with a gap ─────────────────────────────────────────

#[tokio::test]
async fn bulk_proofs_with_nonce_gap_settle_nothing() {
    let m = manager(30_000, 4, true);
    m.onboard("w1", R1).await;
    for amount in [5, 7, 11, 13] {
        m.ledger.accrue(R1, amount, None).unwrap();
    }

    // {[0,1], [3,3]} skips nonce 2.
    let proofs = vec![
        structural_proof(&R1, 0, 1, 12),
        structural_proof(&R1, 3, 3, 13),
    ];
    let reply = m
        .send(
            "w1",
            MessageType::BULK_PROOF_REQUEST,
            &wire::BulkProofRequest {
                recipient: hex::encode(R1),
                r8: proof_set_r8(&R1, &proofs),
                proofs,
            },
        )
        .await;
    assert_eq!(reply.message_type, MessageType::ERROR);
    assert_eq!(reply.payload["kind"], "conflict");

    assert!(m.ledger.last_settled_nonce(&R1).is_none());
    assert!(m
        .ledger
        .records_for(&R1)
        .unwrap()
        .iter()
        .all(|r| !r.settled));
}

// ── Scenario 6: round-robin fairness ──────────────────────────────────────────

#[tokio::test]
async fn six_tasks_three_workers_two_offers_each() {
    let mut m = manager(30_000, 4, false);
    m.post_template();
    for (worker, recipient) in [("w1", R1), ("w2", R2), ("w3", [0xc3; 32])] {
        m.onboard(worker, recipient).await;
    }
    for i in 0..6 {
        m.post_task(&format!("t{i}"), 1).await;
    }

    // First dispatch round: one offer per worker, in queue order.
    m.engine.dispatch_step();
    let mut first_round = Vec::new();
    for _ in 0..3 {
        let (peer, offer) = m.next_offer();
        first_round.push(peer.clone());
        m.send(
            &peer,
            MessageType::TASK_ACCEPTED,
            &wire::TaskAccepted {
                task_id: offer.task_id.clone(),
            },
        )
        .await;
        m.send(
            &peer,
            MessageType::TASK_COMPLETED,
            &wire::TaskCompleted {
                task_id: offer.task_id,
                result: "\"ok\"".into(),
            },
        )
        .await;
    }
    assert_eq!(first_round, vec!["w1", "w2", "w3"], "queue rotation order");

    // Second round covers the remaining three.
    m.engine.dispatch_step();
    let mut counts = std::collections::HashMap::new();
    for peer in &first_round {
        *counts.entry(peer.clone()).or_insert(0usize) += 1;
    }
    for _ in 0..3 {
        let (peer, _) = m.next_offer();
        *counts.entry(peer).or_insert(0) += 1;
    }

    assert_eq!(counts.len(), 3);
    for (worker, count) in counts {
        assert_eq!(count, 2, "{worker} must receive exactly two offers");
    }
}

// ── Invariants ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exclusivity_no_worker_holds_two_tasks() {
    let mut m = manager(30_000, 4, true);
    m.post_template();
    m.onboard("w1", R1).await;
    m.post_task("t1", 1).await;
    m.post_task("t2", 1).await;

    m.control.tick();

    // Only one offer — the single worker cannot hold two tasks.
    let (_, offer) = m.next_offer();
    assert!(m.outbound_rx.try_recv().is_err());

    let offered: Vec<_> = ["t1", "t2"]
        .iter()
        .filter(|id| m.engine.get_task(id).unwrap().state == TaskState::Offered)
        .collect();
    assert_eq!(offered.len(), 1);
    assert_eq!(*offered[0], offer.task_id);
}

#[tokio::test]
async fn nonce_contiguity_across_many_completions() {
    let mut m = manager(30_000, 100, true);
    m.post_template();
    m.onboard("w1", R1).await;

    for i in 0..5 {
        m.post_task(&format!("t{i}"), i + 1).await;
        m.control.tick();
        let (peer, offer) = m.next_offer();
        m.send(
            &peer,
            MessageType::TASK_ACCEPTED,
            &wire::TaskAccepted {
                task_id: offer.task_id.clone(),
            },
        )
        .await;
        m.send(
            &peer,
            MessageType::TASK_COMPLETED,
            &wire::TaskCompleted {
                task_id: offer.task_id,
                result: "\"ok\"".into(),
            },
        )
        .await;
        m.drain_accruals();
    }

    let records = m.ledger.records_for(&R1).unwrap();
    let nonces: Vec<u64> = records.iter().map(|r| r.nonce).collect();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4], "no gaps, no reuse");
}

#[tokio::test]
async fn settled_batch_amount_matches_record_sum() {
    let m = manager(30_000, 100, true);
    m.onboard("w1", R1).await;
    let amounts = [5u64, 7, 11];
    for amount in amounts {
        m.ledger.accrue(R1, amount, None).unwrap();
    }

    let proofs = vec![structural_proof(&R1, 0, 2, 23)];
    let reply = m
        .send(
            "w1",
            MessageType::BULK_PROOF_REQUEST,
            &wire::BulkProofRequest {
                recipient: hex::encode(R1),
                r8: proof_set_r8(&R1, &proofs),
                proofs,
            },
        )
        .await;
    assert_eq!(
        reply.message_type,
        MessageType::BULK_PROOF_RESPONSE,
        "settlement failed: {:?}",
        reply.payload
    );
    let auth: wire::SignedAuthorization = reply.decode_payload().unwrap();
    assert_eq!(auth.amount, amounts.iter().sum::<u64>());
    assert_eq!((auth.min_nonce, auth.max_nonce), (0, 2));
}
