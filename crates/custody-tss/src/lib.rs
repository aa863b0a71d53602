//! # Custody TSS
//!
//! Threshold-ECDSA core for a multi-party custody wallet: the private key
//! exists only as distributed shares across a user client, a backup client,
//! and a custodian service, and any two of the three can jointly produce a
//! valid signature or public key without reconstructing the full key.
//!
//! Two protocols are provided:
//! - Three-party distributed key generation, a resumable three-round state
//!   machine driven custodian-side by [`keygen::KeyGenRoundOrchestrator`]
//!   and client-side by [`keygen::OvcParty`]
//! - Two-party recovery signing with the custodian deliberately excluded,
//!   driven by [`recovery::RecoveryOrchestrator`] over either the legacy
//!   share layout or the reduced 2-party-only layout
//!
//! ## Example
//!
//! ```rust,ignore
//! use custody_tss::recovery::{EncryptedKeyMaterial, RecoveryOrchestrator};
//!
//! let orchestrator =
//!     RecoveryOrchestrator::from_encrypted(&user_material, &backup_material, passphrase)?;
//! let signature = orchestrator.sign("m/0/0", &digest).await?;
//! ```

pub mod challenge;
pub mod combine;
pub mod error;
pub mod keygen;
pub mod recovery;
pub mod sign;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    CommonKeychain, KeychainRecord, KeychainSource, PartyIdx, SessionId, Signature,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Signing quorum for the 3-party setup
pub const THRESHOLD: usize = 2;

/// Number of parties participating in key generation
pub const PARTIES: usize = 3;
