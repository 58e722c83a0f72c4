//! Payment ledger — accrual, batch formation, proof-mediated payout.
//!
//! Every completed task accrues one `PaymentRecord` owed to the
//! worker's recipient. Nonces are a strictly increasing per-recipient
//! counter with no gaps, so a contiguous `[min_nonce, max_nonce]` range
//! fully describes a batch. The ledger never trusts caller-supplied
//! amounts: sums are re-derived from its own records before anything is
//! signed, and settlement only advances contiguously from the last
//! settled nonce.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use drover_core::crypto::{proof_set_commitment, AuthorizationSigner, ProofSignals, ProofVerifier};
use drover_core::wire::{self, hex32, SignedAuthorization};
use drover_core::{now_ms, ManagerError, Recipient};

use crate::events::{EventBus, ManagerEvent};
use crate::store::{padded_nonce, prefix, KvStore};

/// One accrued payment. Persisted at `payment/<recipient>/<nonce>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub nonce: u64,
    #[serde(with = "hex32")]
    pub recipient: Recipient,
    pub amount: u64,
    pub created_at: u64,
    #[serde(default)]
    pub settled: bool,
    /// Task that produced this record; deduplicates outbox replays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

struct LedgerState {
    /// Next nonce to allocate, per recipient (hex key).
    next_nonce: HashMap<String, u64>,
    /// Highest settled nonce, per recipient. None = nothing settled.
    last_settled: HashMap<String, Option<u64>>,
    /// Tasks that already accrued, for outbox replay dedup.
    accrued_tasks: HashMap<String, u64>,
}

pub struct PaymentLedger {
    store: Arc<dyn KvStore>,
    state: Mutex<LedgerState>,
    events: EventBus,
    signer: Arc<dyn AuthorizationSigner>,
    verifier: Arc<dyn ProofVerifier>,
    batch_size: u64,
    /// None = payments disabled (no payment_account configured).
    payment_account: Option<Recipient>,
}

impl PaymentLedger {
    /// Open the ledger, rebuilding counters from persisted records.
    pub fn open(
        store: Arc<dyn KvStore>,
        events: EventBus,
        signer: Arc<dyn AuthorizationSigner>,
        verifier: Arc<dyn ProofVerifier>,
        batch_size: u64,
        payment_account: Option<Recipient>,
    ) -> Result<Self, ManagerError> {
        let mut next_nonce: HashMap<String, u64> = HashMap::new();
        let mut last_settled: HashMap<String, Option<u64>> = HashMap::new();
        let mut accrued_tasks = HashMap::new();

        for (key, value) in store.list(prefix::PAYMENT)? {
            let record: PaymentRecord = match serde_json::from_slice(&value) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(key, error = %e, "skipping unreadable payment record");
                    continue;
                }
            };
            let rkey = hex::encode(record.recipient);
            let next = next_nonce.entry(rkey.clone()).or_insert(0);
            *next = (*next).max(record.nonce + 1);
            let settled = last_settled.entry(rkey).or_insert(None);
            if record.settled {
                let cur = *settled;
                *settled = Some(cur.map_or(record.nonce, |s| s.max(record.nonce)));
            }
            if let Some(task_id) = &record.task_id {
                accrued_tasks.insert(task_id.clone(), record.nonce);
            }
        }

        if payment_account.is_none() {
            tracing::warn!("no payment account configured — payments disabled");
        }
        tracing::info!(recipients = next_nonce.len(), "payment ledger loaded");

        Ok(Self {
            store,
            state: Mutex::new(LedgerState {
                next_nonce,
                last_settled,
                accrued_tasks,
            }),
            events,
            signer,
            verifier,
            batch_size,
            payment_account,
        })
    }

    pub fn enabled(&self) -> bool {
        self.payment_account.is_some()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signer.public_key()
    }

    // ── Accrual ───────────────────────────────────────────────────────────────

    /// Record a payment owed to `recipient`. Allocates the next nonce
    /// and persists before emitting. `task_id` deduplicates replays of
    /// the completion outbox: a task accrues at most once.
    pub fn accrue(
        &self,
        recipient: Recipient,
        amount: u64,
        task_id: Option<&str>,
    ) -> Result<Option<PaymentRecord>, ManagerError> {
        if self.payment_account.is_none() {
            tracing::warn!("accrual skipped — payments disabled");
            return Ok(None);
        }

        let mut state = self.state.lock().expect("ledger lock poisoned");
        if let Some(task_id) = task_id {
            if state.accrued_tasks.contains_key(task_id) {
                tracing::debug!(task = %task_id, "accrual replayed, already recorded");
                return Ok(None);
            }
        }

        let rkey = hex::encode(recipient);
        let nonce = *state.next_nonce.get(&rkey).unwrap_or(&0);
        let record = PaymentRecord {
            nonce,
            recipient,
            amount,
            created_at: now_ms(),
            settled: false,
            task_id: task_id.map(str::to_string),
        };
        self.persist(&record)?;
        state.next_nonce.insert(rkey.clone(), nonce + 1);
        if let Some(task_id) = task_id {
            state.accrued_tasks.insert(task_id.to_string(), nonce);
        }
        drop(state);

        tracing::info!(recipient = %rkey, nonce, amount, "payment accrued");
        self.events.emit(ManagerEvent::PaymentCreated {
            recipient: rkey,
            nonce,
            amount,
        });
        Ok(Some(record))
    }

    // ── Proof request ─────────────────────────────────────────────────────────

    /// Sign an authorization over a set of the caller's records.
    ///
    /// `caller_recipient` is the recipient registered for the requesting
    /// peer — the router resolved it from the transport identity. The
    /// request is only valid if it matches `payments[0].recipient`; the
    /// batch sum is re-derived from the ledger's own records.
    pub fn process_proof_request(
        &self,
        caller_recipient: Recipient,
        payments: &[wire::PaymentRef],
    ) -> Result<SignedAuthorization, ManagerError> {
        let first = payments.first().ok_or_else(|| {
            ManagerError::InvalidArgument("proof request with no payments".into())
        })?;
        if first.recipient != hex::encode(caller_recipient) {
            return Err(ManagerError::Forbidden(
                "payments do not belong to the requesting recipient".into(),
            ));
        }

        let min_nonce = payments.iter().map(|p| p.nonce).min().expect("non-empty");
        let max_nonce = payments.iter().map(|p| p.nonce).max().expect("non-empty");
        let span = max_nonce - min_nonce + 1;
        if span > self.batch_size {
            return Err(ManagerError::BatchTooLarge(format!(
                "{span} records, maximum {}",
                self.batch_size
            )));
        }

        let total = self.sum_range(&caller_recipient, min_nonce, max_nonce)?;
        let signature =
            self.signer
                .sign_authorization(&caller_recipient, min_nonce, max_nonce, total);

        Ok(SignedAuthorization {
            recipient: hex::encode(caller_recipient),
            min_nonce,
            max_nonce,
            amount: total,
            signature: hex::encode(signature),
        })
    }

    // ── Bulk proof settlement ─────────────────────────────────────────────────

    /// Verify a set of range proofs and settle the covered records.
    ///
    /// Ranges must be disjoint and contiguous from the last settled
    /// nonce; `r8` must commit to the ordered proof set; each proof's
    /// declared amount must equal the ledger's own sum over its range.
    /// Nothing settles unless every proof passes.
    pub fn bulk_payment_proofs(
        &self,
        caller_recipient: Recipient,
        r8: &str,
        proofs: &[wire::RangeProof],
    ) -> Result<SignedAuthorization, ManagerError> {
        if proofs.is_empty() {
            return Err(ManagerError::InvalidArgument(
                "bulk proof request with no proofs".into(),
            ));
        }
        let rkey = hex::encode(caller_recipient);

        let mut sorted: Vec<&wire::RangeProof> = proofs.iter().collect();
        sorted.sort_by_key(|p| p.min_nonce);

        // Ranges must pick up exactly where settlement left off.
        let start = {
            let state = self.state.lock().expect("ledger lock poisoned");
            state
                .last_settled
                .get(&rkey)
                .copied()
                .flatten()
                .map(|n| n + 1)
                .unwrap_or(0)
        };

        let mut expected = start;
        for proof in &sorted {
            if proof.recipient != rkey {
                return Err(ManagerError::Forbidden(
                    "proof recipient does not match the requesting recipient".into(),
                ));
            }
            if proof.min_nonce != expected || proof.max_nonce < proof.min_nonce {
                return Err(ManagerError::Conflict(format!(
                    "range overlap: expected range starting at {expected}, got [{}, {}]",
                    proof.min_nonce, proof.max_nonce
                )));
            }
            expected = proof.max_nonce + 1;
        }

        // The commitment must cover exactly this proof set, in order.
        // Stops a relayed subset or splice of otherwise-valid proofs.
        let signals: Vec<ProofSignals> = sorted
            .iter()
            .map(|p| ProofSignals {
                min_nonce: p.min_nonce,
                max_nonce: p.max_nonce,
                amount: p.amount,
                recipient: caller_recipient,
            })
            .collect();
        let commitment = hex::decode(r8)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
            .ok_or_else(|| {
                ManagerError::ProofInvalid("r8 must be 32 hex-encoded bytes".into())
            })?;
        if commitment != proof_set_commitment(&signals) {
            return Err(ManagerError::ProofInvalid(
                "r8 does not commit to the submitted proof set".into(),
            ));
        }

        // Verify each proof against the ledger's own sums.
        for proof in &sorted {
            let ledger_sum = self.sum_range(&caller_recipient, proof.min_nonce, proof.max_nonce)?;
            if ledger_sum != proof.amount {
                return Err(ManagerError::ProofInvalid(format!(
                    "declared amount {} does not match accrued {} over [{}, {}]",
                    proof.amount, ledger_sum, proof.min_nonce, proof.max_nonce
                )));
            }

            let proof_bytes = hex::decode(&proof.proof)
                .map_err(|_| ManagerError::ProofInvalid("proof is not valid hex".into()))?;
            let signals = ProofSignals {
                min_nonce: proof.min_nonce,
                max_nonce: proof.max_nonce,
                amount: proof.amount,
                recipient: caller_recipient,
            };
            let valid = self
                .verifier
                .verify(&proof_bytes, &signals)
                .map_err(|e| ManagerError::ProofInvalid(e.to_string()))?;
            if !valid {
                return Err(ManagerError::ProofInvalid(format!(
                    "proof over [{}, {}] failed verification",
                    proof.min_nonce, proof.max_nonce
                )));
            }
        }

        // All proofs valid — settle the full span.
        let min_nonce = sorted.first().expect("non-empty").min_nonce;
        let max_nonce = sorted.last().expect("non-empty").max_nonce;
        let total = self.settle_range(&caller_recipient, min_nonce, max_nonce)?;

        let signature =
            self.signer
                .sign_authorization(&caller_recipient, min_nonce, max_nonce, total);
        tracing::info!(
            recipient = %rkey,
            min_nonce,
            max_nonce,
            total,
            "bulk proofs settled"
        );
        self.events.emit(ManagerEvent::PaymentsSettled {
            recipient: rkey,
            min_nonce,
            max_nonce,
            amount: total,
        });

        Ok(SignedAuthorization {
            recipient: hex::encode(caller_recipient),
            min_nonce,
            max_nonce,
            amount: total,
            signature: hex::encode(signature),
        })
    }

    // ── Payout flush ──────────────────────────────────────────────────────────

    /// Flush the current unsettled batch for a recipient: sign and
    /// settle everything accrued past the last settled nonce. Manual
    /// and test flows only — the proof path is the production route.
    pub fn process_payout_request(
        &self,
        recipient: Recipient,
    ) -> Result<SignedAuthorization, ManagerError> {
        let rkey = hex::encode(recipient);
        let (start, end) = {
            let state = self.state.lock().expect("ledger lock poisoned");
            let next = *state.next_nonce.get(&rkey).unwrap_or(&0);
            let start = state
                .last_settled
                .get(&rkey)
                .copied()
                .flatten()
                .map(|n| n + 1)
                .unwrap_or(0);
            if start >= next {
                return Err(ManagerError::NotFound(format!(
                    "no unsettled payments for {rkey}"
                )));
            }
            (start, next - 1)
        };

        let total = self.settle_range(&recipient, start, end)?;
        let signature = self.signer.sign_authorization(&recipient, start, end, total);

        tracing::info!(recipient = %rkey, start, end, total, "payout flushed");
        self.events.emit(ManagerEvent::PaymentsSettled {
            recipient: rkey.clone(),
            min_nonce: start,
            max_nonce: end,
            amount: total,
        });

        Ok(SignedAuthorization {
            recipient: rkey,
            min_nonce: start,
            max_nonce: end,
            amount: total,
            signature: hex::encode(signature),
        })
    }

    // ── Read models ───────────────────────────────────────────────────────────

    pub fn records_for(&self, recipient: &Recipient) -> Result<Vec<PaymentRecord>, ManagerError> {
        let key_prefix = format!("{}{}/", prefix::PAYMENT, hex::encode(recipient));
        let mut records = Vec::new();
        for (key, value) in self.store.list(&key_prefix)? {
            match serde_json::from_slice::<PaymentRecord>(&value) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(key, error = %e, "unreadable payment record"),
            }
        }
        records.sort_by_key(|r| r.nonce);
        Ok(records)
    }

    pub fn last_settled_nonce(&self, recipient: &Recipient) -> Option<u64> {
        self.state
            .lock()
            .expect("ledger lock poisoned")
            .last_settled
            .get(&hex::encode(recipient))
            .copied()
            .flatten()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Sum the ledger's own records over a nonce range. Every nonce in
    /// the range must exist.
    fn sum_range(
        &self,
        recipient: &Recipient,
        min_nonce: u64,
        max_nonce: u64,
    ) -> Result<u64, ManagerError> {
        let mut total: u64 = 0;
        for nonce in min_nonce..=max_nonce {
            let record = self.load_record(recipient, nonce)?.ok_or_else(|| {
                ManagerError::NotFound(format!(
                    "unknown nonce {nonce} for {}",
                    hex::encode(recipient)
                ))
            })?;
            total = total.saturating_add(record.amount);
        }
        Ok(total)
    }

    /// Mark a contiguous range settled and advance the settlement
    /// cursor. Returns the range total.
    fn settle_range(
        &self,
        recipient: &Recipient,
        min_nonce: u64,
        max_nonce: u64,
    ) -> Result<u64, ManagerError> {
        let mut total: u64 = 0;
        for nonce in min_nonce..=max_nonce {
            let mut record = self.load_record(recipient, nonce)?.ok_or_else(|| {
                ManagerError::NotFound(format!(
                    "unknown nonce {nonce} for {}",
                    hex::encode(recipient)
                ))
            })?;
            total = total.saturating_add(record.amount);
            record.settled = true;
            self.persist(&record)?;
        }
        let mut state = self.state.lock().expect("ledger lock poisoned");
        state
            .last_settled
            .insert(hex::encode(recipient), Some(max_nonce));
        Ok(total)
    }

    fn load_record(
        &self,
        recipient: &Recipient,
        nonce: u64,
    ) -> Result<Option<PaymentRecord>, ManagerError> {
        let key = format!(
            "{}{}/{}",
            prefix::PAYMENT,
            hex::encode(recipient),
            padded_nonce(nonce)
        );
        match self.store.get(&key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| ManagerError::Store(e.to_string()))?,
            )),
        }
    }

    fn persist(&self, record: &PaymentRecord) -> Result<(), ManagerError> {
        let key = format!(
            "{}{}/{}",
            prefix::PAYMENT,
            hex::encode(record.recipient),
            padded_nonce(record.nonce)
        );
        self.store.put(
            &key,
            &serde_json::to_vec(record).map_err(|e| ManagerError::Store(e.to_string()))?,
        )?;
        Ok(())
    }
}
