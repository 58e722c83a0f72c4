//! Cryptographic seams for Drover.
//!
//! Provides three things:
//!   1. BLAKE3 hashing — task id derivation, access-code digests
//!   2. The manager's signing identity — EdDSA payout authorizations
//!   3. The proof-verifier seam — Groth16 verification behind a trait
//!
//! The EdDSA and Groth16 primitives are external collaborators: the
//! ledger signs and verifies through the traits below and never touches
//! curve arithmetic. `Ed25519Signer` is the in-tree signer; a
//! BabyJubJub implementation plugs in at the same seam. Key material
//! derives ZeroizeOnDrop — wiped from memory when dropped. There is no
//! unsafe code in this module.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for task id derivation and access-code consumption markers.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Digest an access code for use as a store key. Codes are never
/// persisted in the clear.
pub fn access_code_digest(code: &str) -> String {
    hex::encode(hash(code.as_bytes()))
}

// ── Manager identity ──────────────────────────────────────────────────────────

/// The manager's long-term signing identity.
///
/// Derived once at startup from the first 32 bytes of the configured
/// private key file. The compressed public key is published in the
/// identify response; the private half never leaves this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ManagerIdentity {
    /// Seed bytes — zeroized on drop, never exposed directly.
    seed: Zeroizing<[u8; 32]>,
    /// Compressed public key — published to peers.
    pub public: [u8; 32],
}

impl ManagerIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_private(&seed)
    }

    /// Derive the identity from configured private key material.
    /// Only the first 32 bytes are used; longer keys are truncated.
    pub fn from_private(private: &[u8]) -> Self {
        let mut seed = [0u8; 32];
        let n = private.len().min(32);
        seed[..n].copy_from_slice(&private[..n]);
        let signing = SigningKey::from_bytes(&seed);
        let public = signing.verifying_key().to_bytes();
        Self {
            seed: Zeroizing::new(seed),
            public,
        }
    }

    /// Load the identity from a key file, generating one on first run.
    pub fn load_or_generate(path: &std::path::Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = std::fs::read(path).map_err(|e| CryptoError::KeyFile(path.into(), e))?;
            if bytes.len() < 32 {
                return Err(CryptoError::KeyTooShort(bytes.len()));
            }
            Ok(Self::from_private(&bytes))
        } else {
            let identity = Self::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CryptoError::KeyFile(path.into(), e))?;
            }
            std::fs::write(path, &*identity.seed)
                .map_err(|e| CryptoError::KeyFile(path.into(), e))?;
            Ok(identity)
        }
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.seed)
    }
}

// ── Authorization signing ─────────────────────────────────────────────────────

/// Seam for signing payout authorizations.
///
/// The ledger signs the canonical byte encoding of
/// `(recipient, min_nonce, max_nonce, amount)` — 56 bytes, fixed layout,
/// little-endian integers. Both sides of the settlement must agree on
/// this encoding.
pub trait AuthorizationSigner: Send + Sync {
    /// Sign a batch authorization. Returns the raw signature bytes.
    fn sign_authorization(
        &self,
        recipient: &[u8; 32],
        min_nonce: u64,
        max_nonce: u64,
        amount: u64,
    ) -> Vec<u8>;

    /// Compressed public key of the signer, for the identify response.
    fn public_key(&self) -> [u8; 32];
}

/// Canonical message bytes for a batch authorization.
pub fn authorization_message(
    recipient: &[u8; 32],
    min_nonce: u64,
    max_nonce: u64,
    amount: u64,
) -> [u8; 56] {
    let mut msg = [0u8; 56];
    msg[..32].copy_from_slice(recipient);
    msg[32..40].copy_from_slice(&min_nonce.to_le_bytes());
    msg[40..48].copy_from_slice(&max_nonce.to_le_bytes());
    msg[48..56].copy_from_slice(&amount.to_le_bytes());
    msg
}

impl AuthorizationSigner for ManagerIdentity {
    fn sign_authorization(
        &self,
        recipient: &[u8; 32],
        min_nonce: u64,
        max_nonce: u64,
        amount: u64,
    ) -> Vec<u8> {
        let msg = authorization_message(recipient, min_nonce, max_nonce, amount);
        self.signing_key().sign(&msg).to_bytes().to_vec()
    }

    fn public_key(&self) -> [u8; 32] {
        self.public
    }
}

/// Verify an authorization signature against a public key.
/// Counterpart of `AuthorizationSigner` for tests and tooling.
pub fn verify_authorization(
    public: &[u8; 32],
    recipient: &[u8; 32],
    min_nonce: u64,
    max_nonce: u64,
    amount: u64,
    signature: &[u8],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    let msg = authorization_message(recipient, min_nonce, max_nonce, amount);
    key.verify_strict(&msg, &sig).is_ok()
}

// ── Proof verification ────────────────────────────────────────────────────────

/// Public signals accompanying a range proof.
#[derive(Debug, Clone, Copy)]
pub struct ProofSignals {
    pub min_nonce: u64,
    pub max_nonce: u64,
    pub amount: u64,
    pub recipient: [u8; 32],
}

/// Seam for zero-knowledge proof verification.
///
/// Verification is CPU-bound; callers run it off the subsystem actor
/// (`tokio::task::spawn_blocking`). Implementations must be cheap to
/// clone behind an Arc and hold their verification key internally.
pub trait ProofVerifier: Send + Sync {
    /// Verify one proof against its public signals.
    ///
    /// Ok(true) = valid, Ok(false) = invalid, Err = verification could
    /// not run (malformed proof bytes, missing key).
    fn verify(&self, proof: &[u8], signals: &ProofSignals) -> Result<bool, CryptoError>;
}

/// Commitment over an ordered proof set.
///
/// A bulk settlement request carries `r8`, the caller's commitment to
/// the exact set and order of proofs it submits:
///
///   r8 = BLAKE3(signals_0 || signals_1 || … || signals_n)
///
/// where each `signals_i` is the 56-byte canonical encoding of that
/// proof's public signals, in ascending nonce order. The ledger
/// recomputes this and refuses a mismatch, so a relayed subset,
/// reordering, or splice of otherwise-valid proofs cannot settle.
pub fn proof_set_commitment(signals: &[ProofSignals]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for s in signals {
        hasher.update(&authorization_message(
            &s.recipient,
            s.min_nonce,
            s.max_nonce,
            s.amount,
        ));
    }
    *hasher.finalize().as_bytes()
}

/// Structural verifier — the default in-tree implementation.
///
/// Checks the proof's shape (Groth16 proofs for this circuit are 192
/// bytes: two G1 points and one G2 point, compressed) and binds it to
/// the public signals by requiring the proof to open with the BLAKE3
/// digest of the canonical signal encoding. A real pairing-based
/// verifier replaces this at the seam without protocol changes.
pub struct StructuralVerifier;

/// Expected serialized proof length.
pub const PROOF_LEN: usize = 192;

impl StructuralVerifier {
    /// Canonical signal encoding — shared with provers.
    pub fn signal_digest(signals: &ProofSignals) -> [u8; 32] {
        let msg = authorization_message(
            &signals.recipient,
            signals.min_nonce,
            signals.max_nonce,
            signals.amount,
        );
        hash(&msg)
    }

    /// Produce a structurally valid proof for the given signals.
    /// Test and development aid; a real prover replaces this.
    pub fn prove(signals: &ProofSignals) -> Vec<u8> {
        let mut proof = vec![0u8; PROOF_LEN];
        proof[..32].copy_from_slice(&Self::signal_digest(signals));
        proof
    }
}

impl ProofVerifier for StructuralVerifier {
    fn verify(&self, proof: &[u8], signals: &ProofSignals) -> Result<bool, CryptoError> {
        if proof.len() != PROOF_LEN {
            return Ok(false);
        }
        Ok(proof[..32] == Self::signal_digest(signals))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to access key file {0}: {1}")]
    KeyFile(std::path::PathBuf, std::io::Error),

    #[error("private key too short: {0} bytes, need at least 32")]
    KeyTooShort(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"drover"), hash(b"drover"));
        assert_ne!(hash(b"drover"), hash(b"Drover"));
    }

    #[test]
    fn identity_derivation_is_deterministic() {
        let seed = [7u8; 32];
        let a = ManagerIdentity::from_private(&seed);
        let b = ManagerIdentity::from_private(&seed);
        assert_eq!(a.public, b.public);
    }

    #[test]
    fn identity_uses_first_32_bytes_only() {
        let long = [9u8; 64];
        let a = ManagerIdentity::from_private(&long);
        let b = ManagerIdentity::from_private(&long[..32]);
        assert_eq!(a.public, b.public);
    }

    #[test]
    fn load_or_generate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");

        let first = ManagerIdentity::load_or_generate(&path).unwrap();
        let second = ManagerIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.public, second.public);
    }

    #[test]
    fn authorization_signature_verifies() {
        let identity = ManagerIdentity::generate();
        let recipient = [3u8; 32];
        let sig = identity.sign_authorization(&recipient, 0, 3, 42);

        assert!(verify_authorization(
            &identity.public,
            &recipient,
            0,
            3,
            42,
            &sig
        ));
        // Any field change must break the signature
        assert!(!verify_authorization(
            &identity.public,
            &recipient,
            0,
            3,
            43,
            &sig
        ));
        assert!(!verify_authorization(
            &identity.public,
            &recipient,
            1,
            3,
            42,
            &sig
        ));
    }

    #[test]
    fn structural_verifier_accepts_own_proofs() {
        let signals = ProofSignals {
            min_nonce: 0,
            max_nonce: 3,
            amount: 17,
            recipient: [5u8; 32],
        };
        let proof = StructuralVerifier::prove(&signals);
        assert!(StructuralVerifier.verify(&proof, &signals).unwrap());
    }

    #[test]
    fn structural_verifier_rejects_signal_mismatch() {
        let signals = ProofSignals {
            min_nonce: 0,
            max_nonce: 3,
            amount: 17,
            recipient: [5u8; 32],
        };
        let proof = StructuralVerifier::prove(&signals);

        let tampered = ProofSignals {
            amount: 18,
            ..signals
        };
        assert!(!StructuralVerifier.verify(&proof, &tampered).unwrap());
    }

    #[test]
    fn structural_verifier_rejects_wrong_length() {
        let signals = ProofSignals {
            min_nonce: 0,
            max_nonce: 0,
            amount: 1,
            recipient: [0u8; 32],
        };
        assert!(!StructuralVerifier.verify(&[0u8; 64], &signals).unwrap());
    }

    #[test]
    fn proof_set_commitment_is_order_sensitive() {
        let a = ProofSignals {
            min_nonce: 0,
            max_nonce: 1,
            amount: 12,
            recipient: [5u8; 32],
        };
        let b = ProofSignals {
            min_nonce: 2,
            max_nonce: 3,
            amount: 24,
            recipient: [5u8; 32],
        };

        assert_eq!(proof_set_commitment(&[a, b]), proof_set_commitment(&[a, b]));
        assert_ne!(proof_set_commitment(&[a, b]), proof_set_commitment(&[b, a]));
        // A subset commits to something different than the full set.
        assert_ne!(proof_set_commitment(&[a]), proof_set_commitment(&[a, b]));
    }
}
