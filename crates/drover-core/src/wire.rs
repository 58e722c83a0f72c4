//! Drover wire format — the JSON envelope and typed message set.
//!
//! Every frame on either transport is one `Envelope`: a `message_type`
//! discriminator plus a type-specific JSON payload. Receivers dispatch
//! on the discriminator and deserialize the payload according to the
//! type. The discriminator strings ARE the protocol — do not rename
//! them after release.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Serde adapter: `[u8; 32]` ⇄ hex string. Keeps persisted records and
/// wire payloads human-inspectable.
pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// JSON envelope — the frame format of both transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Discriminator, one of the `MessageType` strings.
    pub message_type: String,
    /// Type-specific content. Structure is defined by `message_type`.
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(message_type: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: message_type.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Typed error reply.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::ERROR.to_string(),
            payload: serde_json::json!({
                "kind": kind,
                "message": message.into(),
            }),
        }
    }

    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Well-known `message_type` strings.
pub struct MessageType;

impl MessageType {
    pub const IDENTIFY_REQUEST: &'static str = "identifyRequest";
    pub const IDENTIFY_RESPONSE: &'static str = "identifyResponse";
    pub const REQUEST_TO_WORK: &'static str = "requestToWork";
    pub const REQUEST_TO_WORK_RESPONSE: &'static str = "requestToWorkResponse";
    pub const TASK: &'static str = "task";
    pub const TASK_RESPONSE: &'static str = "taskResponse";
    pub const OFFER: &'static str = "offer";
    pub const TASK_ACCEPTED: &'static str = "taskAccepted";
    pub const TASK_COMPLETED: &'static str = "taskCompleted";
    pub const TASK_REJECTED: &'static str = "taskRejected";
    pub const PROOF_REQUEST: &'static str = "proofRequest";
    pub const PROOF_RESPONSE: &'static str = "proofResponse";
    pub const BULK_PROOF_REQUEST: &'static str = "bulkProofRequest";
    pub const BULK_PROOF_RESPONSE: &'static str = "bulkProofResponse";
    pub const PAYOUT_REQUEST: &'static str = "payoutRequest";
    pub const PAYOUT_RESPONSE: &'static str = "payoutResponse";
    pub const TEMPLATE_REQUEST: &'static str = "templateRequest";
    pub const TEMPLATE_RESPONSE: &'static str = "templateResponse";
    pub const ERROR: &'static str = "error";
    pub const ACK: &'static str = "ack";
}

// ── Message payloads ──────────────────────────────────────────────────────────

/// Answer to `identifyRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResponse {
    pub peer_id: String,
    pub version: u32,
    pub require_access_codes: bool,
    /// Whether the requesting peer already has a worker record.
    pub registered: bool,
    /// Manager's compressed signing public key, hex.
    pub public_key: String,
    pub announced_addresses: Vec<String>,
}

/// Onboarding request from a would-be worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestToWork {
    /// Settlement address, 32 hex-encoded bytes.
    pub recipient: String,
    /// Must exceed any nonce previously accepted for this peer.
    pub nonce: u64,
    pub access_code: Option<String>,
}

/// Task submitted by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmit {
    pub task_id: String,
    pub template_id: String,
    pub title: String,
    pub reward: u64,
    /// Opaque to the manager.
    pub payload: String,
}

/// Offer pushed to a worker. Acceptance must arrive before `deadline`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOffer {
    pub task_id: String,
    pub template_id: String,
    pub title: String,
    pub reward: u64,
    pub payload: String,
    /// Unix ms.
    pub deadline: u64,
}

/// Worker's answer to an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAccepted {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRejected {
    pub task_id: String,
    pub reason: String,
}

/// Result submission. The result string is opaque to the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleted {
    pub task_id: String,
    pub result: String,
}

/// One payment record as referenced in a proof request. Amounts are
/// informational — the ledger re-derives sums from its own records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRef {
    pub recipient: String,
    pub nonce: u64,
    pub amount: u64,
}

/// Request for a signed authorization over a set of the caller's records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofRequest {
    pub payments: Vec<PaymentRef>,
}

/// A single zero-knowledge proof over a contiguous nonce range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeProof {
    pub min_nonce: u64,
    pub max_nonce: u64,
    pub amount: u64,
    pub recipient: String,
    /// Serialized Groth16 proof, hex.
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkProofRequest {
    pub recipient: String,
    /// Caller's commitment over the ordered proof set, hex. The ledger
    /// recomputes it from the proofs' public signals and refuses a
    /// mismatch (see `crypto::proof_set_commitment`).
    pub r8: String,
    pub proofs: Vec<RangeProof>,
}

/// Signed payout authorization over one contiguous batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedAuthorization {
    pub recipient: String,
    pub min_nonce: u64,
    pub max_nonce: u64,
    pub amount: u64,
    /// Manager's signature over (recipient, minNonce, maxNonce, amount), hex.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRequest {
    pub template_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_id: String,
    pub name: String,
    pub created_at: u64,
    pub schema: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let offer = TaskOffer {
            task_id: "t1".into(),
            template_id: "tpl1".into(),
            title: "resize images".into(),
            reward: 5,
            payload: "{}".into(),
            deadline: 1234,
        };
        let env = Envelope::new(MessageType::OFFER, &offer).unwrap();
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.message_type, "offer");
        let decoded: TaskOffer = back.decode_payload().unwrap();
        assert_eq!(decoded.task_id, "t1");
        assert_eq!(decoded.deadline, 1234);
    }

    #[test]
    fn envelope_uses_camel_case_keys() {
        let env = Envelope::new(
            MessageType::TASK_ACCEPTED,
            &TaskAccepted {
                task_id: "t9".into(),
            },
        )
        .unwrap();
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"messageType\""));
        assert!(text.contains("\"taskId\""));
        assert!(!text.contains("taskID"));
    }

    #[test]
    fn error_envelope_carries_kind() {
        let env = Envelope::error(ErrorKind::Forbidden, "recipient mismatch");
        assert_eq!(env.message_type, "error");
        assert_eq!(env.payload["kind"], "forbidden");
        assert_eq!(env.payload["message"], "recipient mismatch");
    }

    #[test]
    fn proof_request_payload_decodes() {
        let env: Envelope = serde_json::from_str(
            r#"{"messageType":"proofRequest","payload":{"payments":[
                {"recipient":"aa","nonce":0,"amount":5},
                {"recipient":"aa","nonce":1,"amount":7}]}}"#,
        )
        .unwrap();
        let req: ProofRequest = env.decode_payload().unwrap();
        assert_eq!(req.payments.len(), 2);
        assert_eq!(req.payments[1].nonce, 1);
    }
}
