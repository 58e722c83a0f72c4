//! Message router — maps wire envelopes onto core operations.
//!
//! Every inbound envelope arrives with the transport-verified sender
//! peer id. The router enforces the identity rule centrally: a payload
//! that references a different peer's recipient is rejected before any
//! subsystem runs. Proof verification failures count against the
//! sender; past the limit the worker is disconnected for the session.

use dashmap::DashMap;
use std::sync::Arc;

use drover_core::wire::{self, Envelope, MessageType};
use drover_core::{ManagerError, PeerId, Recipient, PROTOCOL_VERSION};

use crate::engine::TaskEngine;
use crate::ledger::PaymentLedger;
use crate::registry::WorkerRegistry;

/// Proof failures tolerated per worker before the session is dropped.
pub const PROOF_FAILURE_LIMIT: u32 = 3;

/// Static manager facts baked into identify responses.
#[derive(Clone)]
pub struct ManagerInfo {
    pub peer_id: String,
    pub require_access_codes: bool,
    pub announced_addresses: Vec<String>,
    pub public_key: [u8; 32],
}

/// The router's verdict on one inbound envelope.
pub struct RouterResponse {
    pub reply: Envelope,
    /// Transport must drop the sender's session after replying.
    pub disconnect: bool,
}

impl RouterResponse {
    fn reply(reply: Envelope) -> Self {
        Self {
            reply,
            disconnect: false,
        }
    }
}

pub struct MessageRouter {
    registry: Arc<WorkerRegistry>,
    engine: Arc<TaskEngine>,
    ledger: Arc<PaymentLedger>,
    info: ManagerInfo,
    proof_failures: DashMap<PeerId, u32>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        engine: Arc<TaskEngine>,
        ledger: Arc<PaymentLedger>,
        info: ManagerInfo,
    ) -> Self {
        Self {
            registry,
            engine,
            ledger,
            info,
            proof_failures: DashMap::new(),
        }
    }

    /// Dispatch one envelope from `sender` and produce the reply.
    pub async fn handle(&self, sender: &PeerId, envelope: Envelope) -> RouterResponse {
        tracing::debug!(peer = %sender, message_type = %envelope.message_type, "inbound message");
        match envelope.message_type.as_str() {
            MessageType::IDENTIFY_REQUEST => self.identify(sender),
            MessageType::REQUEST_TO_WORK => self.request_to_work(sender, &envelope),
            MessageType::TASK => self.create_task(sender, &envelope),
            MessageType::TASK_ACCEPTED => self.task_accepted(sender, &envelope),
            MessageType::TASK_REJECTED => self.task_rejected(sender, &envelope),
            MessageType::TASK_COMPLETED => self.task_completed(sender, &envelope),
            MessageType::PROOF_REQUEST => self.proof_request(sender, &envelope),
            MessageType::BULK_PROOF_REQUEST => self.bulk_proof_request(sender, &envelope).await,
            MessageType::PAYOUT_REQUEST => self.payout_request(sender),
            MessageType::TEMPLATE_REQUEST => self.template_request(&envelope),
            other => RouterResponse::reply(Envelope::error(
                drover_core::error::ErrorKind::InvalidArgument,
                format!("unknown message type {other}"),
            )),
        }
    }

    // ── Identity & onboarding ─────────────────────────────────────────────────

    fn identify(&self, sender: &PeerId) -> RouterResponse {
        let response = wire::IdentifyResponse {
            peer_id: self.info.peer_id.clone(),
            version: PROTOCOL_VERSION,
            require_access_codes: self.info.require_access_codes,
            registered: self.registry.is_registered(sender),
            public_key: hex::encode(self.info.public_key),
            announced_addresses: self.info.announced_addresses.clone(),
        };
        self.encode(MessageType::IDENTIFY_RESPONSE, &response)
    }

    fn request_to_work(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let request: wire::RequestToWork = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => return Self::bad_payload(e),
        };
        let recipient = match decode_recipient(&request.recipient) {
            Ok(r) => r,
            Err(e) => return RouterResponse::reply(error_reply(&e)),
        };
        match self.registry.onboard(
            sender,
            recipient,
            request.nonce,
            request.access_code.as_deref(),
        ) {
            Ok(()) => {
                // A fresh worker makes dispatch worth re-running.
                self.engine.auto_dispatch();
                self.ack(MessageType::REQUEST_TO_WORK_RESPONSE)
            }
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    // ── Tasks ─────────────────────────────────────────────────────────────────

    fn create_task(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let submit: wire::TaskSubmit = match envelope.decode_payload() {
            Ok(s) => s,
            Err(e) => return Self::bad_payload(e),
        };
        match self.engine.create_task(submit, sender) {
            Ok(()) => self.ack(MessageType::TASK_RESPONSE),
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    fn task_accepted(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let accepted: wire::TaskAccepted = match envelope.decode_payload() {
            Ok(a) => a,
            Err(e) => return Self::bad_payload(e),
        };
        match self.engine.process_task_acception(&accepted.task_id, sender) {
            Ok(()) => self.ack(MessageType::ACK),
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    fn task_rejected(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let rejected: wire::TaskRejected = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => return Self::bad_payload(e),
        };
        match self
            .engine
            .process_task_rejection(&rejected.task_id, sender, &rejected.reason)
        {
            Ok(()) => self.ack(MessageType::ACK),
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    fn task_completed(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let completed: wire::TaskCompleted = match envelope.decode_payload() {
            Ok(c) => c,
            Err(e) => return Self::bad_payload(e),
        };
        match self
            .engine
            .process_task_submission(&completed.task_id, sender, &completed.result)
        {
            Ok(()) => self.ack(MessageType::ACK),
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    // ── Payments ──────────────────────────────────────────────────────────────

    /// Resolve the sender's registered recipient, the identity every
    /// payment operation is checked against.
    fn sender_recipient(&self, sender: &PeerId) -> Result<Recipient, ManagerError> {
        self.registry
            .get_worker(sender)
            .map(|w| w.recipient)
            .ok_or_else(|| ManagerError::Forbidden(format!("{sender} is not onboarded")))
    }

    fn proof_request(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let request: wire::ProofRequest = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => return Self::bad_payload(e),
        };
        let recipient = match self.sender_recipient(sender) {
            Ok(r) => r,
            Err(e) => return RouterResponse::reply(error_reply(&e)),
        };
        match self.ledger.process_proof_request(recipient, &request.payments) {
            Ok(auth) => self.encode(MessageType::PROOF_RESPONSE, &auth),
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    async fn bulk_proof_request(&self, sender: &PeerId, envelope: &Envelope) -> RouterResponse {
        let request: wire::BulkProofRequest = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => return Self::bad_payload(e),
        };
        let recipient = match self.sender_recipient(sender) {
            Ok(r) => r,
            Err(e) => return RouterResponse::reply(error_reply(&e)),
        };
        if request.recipient != hex::encode(recipient) {
            return RouterResponse::reply(error_reply(&ManagerError::Forbidden(
                "request recipient does not match the sender".into(),
            )));
        }

        // Proof verification is CPU-bound: off the subsystem actor.
        let ledger = self.ledger.clone();
        let r8 = request.r8;
        let proofs = request.proofs;
        let result = tokio::task::spawn_blocking(move || {
            ledger.bulk_payment_proofs(recipient, &r8, &proofs)
        })
        .await
        .unwrap_or_else(|e| Err(ManagerError::Transport(e.to_string())));

        match result {
            Ok(auth) => {
                self.proof_failures.remove(sender);
                self.encode(MessageType::BULK_PROOF_RESPONSE, &auth)
            }
            Err(e) => {
                let disconnect = matches!(e, ManagerError::ProofInvalid(_))
                    && self.record_proof_failure(sender);
                let mut response = RouterResponse::reply(error_reply(&e));
                response.disconnect = disconnect;
                response
            }
        }
    }

    fn payout_request(&self, sender: &PeerId) -> RouterResponse {
        let recipient = match self.sender_recipient(sender) {
            Ok(r) => r,
            Err(e) => return RouterResponse::reply(error_reply(&e)),
        };
        match self.ledger.process_payout_request(recipient) {
            Ok(auth) => self.encode(MessageType::PAYOUT_RESPONSE, &auth),
            Err(e) => RouterResponse::reply(error_reply(&e)),
        }
    }

    /// Count a failed proof. True = the limit is now exceeded and the
    /// worker must be disconnected for the rest of the session.
    fn record_proof_failure(&self, sender: &PeerId) -> bool {
        let mut count = self.proof_failures.entry(sender.clone()).or_insert(0);
        *count += 1;
        if *count >= PROOF_FAILURE_LIMIT {
            drop(count);
            tracing::warn!(peer = %sender, "proof failure limit exceeded — disconnecting");
            self.registry.disconnect(sender);
            self.proof_failures.remove(sender);
            true
        } else {
            false
        }
    }

    // ── Templates ─────────────────────────────────────────────────────────────

    fn template_request(&self, envelope: &Envelope) -> RouterResponse {
        let request: wire::TemplateRequest = match envelope.decode_payload() {
            Ok(r) => r,
            Err(e) => return Self::bad_payload(e),
        };
        match self.engine.get_template(&request.template_id) {
            Some(template) => self.encode(MessageType::TEMPLATE_RESPONSE, &template),
            None => RouterResponse::reply(error_reply(&ManagerError::NotFound(format!(
                "template {}",
                request.template_id
            )))),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn encode<T: serde::Serialize>(&self, message_type: &str, payload: &T) -> RouterResponse {
        match Envelope::new(message_type, payload) {
            Ok(env) => RouterResponse::reply(env),
            Err(e) => RouterResponse::reply(Envelope::error(
                drover_core::error::ErrorKind::TransportError,
                format!("failed to encode reply: {e}"),
            )),
        }
    }

    fn ack(&self, message_type: &str) -> RouterResponse {
        RouterResponse::reply(Envelope {
            message_type: message_type.to_string(),
            payload: serde_json::json!({ "status": "ok" }),
        })
    }

    fn bad_payload(e: serde_json::Error) -> RouterResponse {
        RouterResponse::reply(Envelope::error(
            drover_core::error::ErrorKind::InvalidArgument,
            format!("malformed payload: {e}"),
        ))
    }
}

fn error_reply(e: &ManagerError) -> Envelope {
    Envelope::error(e.kind(), e.to_string())
}

fn decode_recipient(hex_str: &str) -> Result<Recipient, ManagerError> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| ManagerError::InvalidArgument("recipient is not valid hex".into()))?;
    bytes
        .try_into()
        .map_err(|_| ManagerError::InvalidArgument("recipient must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryStore;
    use drover_core::crypto::{ManagerIdentity, StructuralVerifier};
    use tokio::sync::mpsc;

    struct Rig {
        router: MessageRouter,
        outbound_rx: mpsc::UnboundedReceiver<crate::OutboundFrame>,
    }

    fn rig(require_codes: bool) -> Rig {
        let store: Arc<dyn crate::store::KvStore> = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let registry = Arc::new(
            WorkerRegistry::open(store.clone(), require_codes, events.clone()).unwrap(),
        );
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (accrual_tx, _accrual_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(
            TaskEngine::open(
                store.clone(),
                registry.clone(),
                events.clone(),
                outbound_tx,
                accrual_tx,
                30_000,
                true,
            )
            .unwrap(),
        );
        let identity = Arc::new(ManagerIdentity::from_private(&[9u8; 32]));
        let public = identity.public;
        let ledger = Arc::new(
            PaymentLedger::open(
                store,
                events,
                identity,
                Arc::new(StructuralVerifier),
                100,
                Some([0xfe; 32]),
            )
            .unwrap(),
        );
        let router = MessageRouter::new(
            registry,
            engine,
            ledger,
            ManagerInfo {
                peer_id: "manager-1".into(),
                require_access_codes: require_codes,
                announced_addresses: vec!["ws://example:19955".into()],
                public_key: public,
            },
        );
        Rig {
            router,
            outbound_rx,
        }
    }

    fn envelope<T: serde::Serialize>(message_type: &str, payload: &T) -> Envelope {
        Envelope::new(message_type, payload).unwrap()
    }

    async fn onboard(rig: &Rig, peer: &str, recipient: [u8; 32]) {
        let response = rig
            .router
            .handle(
                &peer.to_string(),
                envelope(
                    MessageType::REQUEST_TO_WORK,
                    &wire::RequestToWork {
                        recipient: hex::encode(recipient),
                        nonce: 0,
                        access_code: None,
                    },
                ),
            )
            .await;
        assert_eq!(
            response.reply.message_type,
            MessageType::REQUEST_TO_WORK_RESPONSE,
            "onboard failed: {:?}",
            response.reply.payload
        );
    }

    #[tokio::test]
    async fn identify_reports_registration_state() {
        let rig = rig(false);
        let peer = "w1".to_string();

        let response = rig
            .router
            .handle(&peer, envelope(MessageType::IDENTIFY_REQUEST, &()))
            .await;
        let identify: wire::IdentifyResponse = response.reply.decode_payload().unwrap();
        assert_eq!(identify.peer_id, "manager-1");
        assert!(!identify.registered);
        assert_eq!(identify.version, PROTOCOL_VERSION);

        onboard(&rig, "w1", [1u8; 32]).await;

        let response = rig
            .router
            .handle(&peer, envelope(MessageType::IDENTIFY_REQUEST, &()))
            .await;
        let identify: wire::IdentifyResponse = response.reply.decode_payload().unwrap();
        assert!(identify.registered);
    }

    #[tokio::test]
    async fn unknown_message_type_is_rejected() {
        let rig = rig(false);
        let response = rig
            .router
            .handle(
                &"w1".to_string(),
                Envelope {
                    message_type: "mystery".into(),
                    payload: serde_json::json!({}),
                },
            )
            .await;
        assert_eq!(response.reply.message_type, MessageType::ERROR);
        assert_eq!(response.reply.payload["kind"], "invalidArgument");
    }

    #[tokio::test]
    async fn full_task_flow_over_the_router() {
        let mut rig = rig(false);
        onboard(&rig, "w1", [1u8; 32]).await;

        // Provider registers a template directly on the engine, then
        // posts a task over the wire.
        rig.router
            .engine
            .register_template(
                wire::Template {
                    template_id: "tpl1".into(),
                    name: "n".into(),
                    created_at: 0,
                    schema: None,
                },
                &"p1".to_string(),
            )
            .unwrap();

        let response = rig
            .router
            .handle(
                &"p1".to_string(),
                envelope(
                    MessageType::TASK,
                    &wire::TaskSubmit {
                        task_id: "t1".into(),
                        template_id: "tpl1".into(),
                        title: "t".into(),
                        reward: 5,
                        payload: "{}".into(),
                    },
                ),
            )
            .await;
        assert_eq!(response.reply.message_type, MessageType::TASK_RESPONSE);

        // The offer went out to w1.
        let (peer, offer_env) = rig.outbound_rx.try_recv().unwrap();
        assert_eq!(peer, "w1");
        let offer: wire::TaskOffer = offer_env.decode_payload().unwrap();

        let w1 = "w1".to_string();
        let response = rig
            .router
            .handle(
                &w1,
                envelope(
                    MessageType::TASK_ACCEPTED,
                    &wire::TaskAccepted {
                        task_id: offer.task_id.clone(),
                    },
                ),
            )
            .await;
        assert_eq!(response.reply.message_type, MessageType::ACK);

        let response = rig
            .router
            .handle(
                &w1,
                envelope(
                    MessageType::TASK_COMPLETED,
                    &wire::TaskCompleted {
                        task_id: offer.task_id,
                        result: "\"answer\"".into(),
                    },
                ),
            )
            .await;
        assert_eq!(response.reply.message_type, MessageType::ACK);
    }

    #[tokio::test]
    async fn proof_request_from_unonboarded_peer_is_forbidden() {
        let rig = rig(false);
        let response = rig
            .router
            .handle(
                &"ghost".to_string(),
                envelope(
                    MessageType::PROOF_REQUEST,
                    &wire::ProofRequest { payments: vec![] },
                ),
            )
            .await;
        assert_eq!(response.reply.payload["kind"], "forbidden");
    }

    #[tokio::test]
    async fn proof_request_for_another_recipient_is_forbidden() {
        let rig = rig(false);
        onboard(&rig, "w1", [0xaa; 32]).await;
        onboard(&rig, "w2", [0xbb; 32]).await;

        // w2 asks for w1's records.
        let response = rig
            .router
            .handle(
                &"w2".to_string(),
                envelope(
                    MessageType::PROOF_REQUEST,
                    &wire::ProofRequest {
                        payments: vec![wire::PaymentRef {
                            recipient: hex::encode([0xaa; 32]),
                            nonce: 0,
                            amount: 5,
                        }],
                    },
                ),
            )
            .await;
        assert_eq!(response.reply.message_type, MessageType::ERROR);
        assert_eq!(response.reply.payload["kind"], "forbidden");
    }

    #[tokio::test]
    async fn repeated_bad_bulk_proofs_disconnect_the_worker() {
        let rig = rig(false);
        onboard(&rig, "w1", [0xaa; 32]).await;
        rig.router
            .ledger
            .accrue([0xaa; 32], 5, None)
            .unwrap()
            .unwrap();

        let w1 = "w1".to_string();
        // Correct commitment, bad proof bytes: the failure counted is
        // the proof's, not the envelope's.
        let r8 = hex::encode(drover_core::crypto::proof_set_commitment(&[
            drover_core::crypto::ProofSignals {
                min_nonce: 0,
                max_nonce: 0,
                amount: 5,
                recipient: [0xaa; 32],
            },
        ]));
        let bad_request = envelope(
            MessageType::BULK_PROOF_REQUEST,
            &wire::BulkProofRequest {
                recipient: hex::encode([0xaa; 32]),
                r8,
                proofs: vec![wire::RangeProof {
                    min_nonce: 0,
                    max_nonce: 0,
                    amount: 5,
                    recipient: hex::encode([0xaa; 32]),
                    proof: hex::encode([0u8; 192]), // fails verification
                }],
            },
        );

        for attempt in 1..=PROOF_FAILURE_LIMIT {
            let response = rig.router.handle(&w1, bad_request.clone()).await;
            assert_eq!(response.reply.message_type, MessageType::ERROR);
            if attempt < PROOF_FAILURE_LIMIT {
                assert!(!response.disconnect, "attempt {attempt} should not disconnect");
            } else {
                assert!(response.disconnect, "final attempt should disconnect");
            }
        }

        // The registry saw the disconnect.
        let worker = rig.router.registry.get_worker(&w1).unwrap();
        assert_eq!(worker.state, crate::worker::WorkerState::Disconnected);
    }

    #[tokio::test]
    async fn template_request_round_trips() {
        let rig = rig(false);
        rig.router
            .engine
            .register_template(
                wire::Template {
                    template_id: "tpl1".into(),
                    name: "resize".into(),
                    created_at: 0,
                    schema: None,
                },
                &"p1".to_string(),
            )
            .unwrap();

        let response = rig
            .router
            .handle(
                &"w1".to_string(),
                envelope(
                    MessageType::TEMPLATE_REQUEST,
                    &wire::TemplateRequest {
                        template_id: "tpl1".into(),
                    },
                ),
            )
            .await;
        let template: wire::Template = response.reply.decode_payload().unwrap();
        assert_eq!(template.name, "resize");

        let response = rig
            .router
            .handle(
                &"w1".to_string(),
                envelope(
                    MessageType::TEMPLATE_REQUEST,
                    &wire::TemplateRequest {
                        template_id: "missing".into(),
                    },
                ),
            )
            .await;
        assert_eq!(response.reply.payload["kind"], "notFound");
    }
}
