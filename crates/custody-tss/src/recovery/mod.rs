//! Recovery signing without the custodian
//!
//! Given only the user's and backup's stored key material, produces a
//! standard ECDSA signature over an arbitrary digest. Material is decrypted
//! and classified once, then one of two strategies runs: the legacy shares
//! through the full 2-party pipeline in `sign`, or the reduced shares
//! through their own compact round protocol.

mod material;
mod orchestrator;
mod reduced;

pub use material::{EncryptedKeyMaterial, SigningMaterial};
pub use orchestrator::{
    base_address, BalanceProvider, LegacySigner, RecoveryOrchestrator, ThresholdSigner,
};
pub use reduced::{parse_signature_string, ReducedKeyShare, ReducedShareSigner};
