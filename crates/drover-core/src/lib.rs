//! drover-core — shared types, wire envelope, and cryptographic seams.
//! All other Drover crates depend on this one.

pub mod config;
pub mod crypto;
pub mod error;
pub mod wire;

pub use error::ManagerError;
pub use wire::{Envelope, MessageType};

/// Protocol version advertised in identify responses.
pub const PROTOCOL_VERSION: u32 = 1;

/// A worker or provider peer identity as carried by the transport.
///
/// Opaque to the core — the transport guarantees the sender really is
/// who this string says. Hex-encoded public keys in practice.
pub type PeerId = String;

/// A 32-byte settlement address. Distinct from the peer identity:
/// payments are owed to the recipient, not to the peer key.
pub type Recipient = [u8; 32];

/// Unix milliseconds. All timestamps in the event log use this.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
