//! Three-party distributed key generation
//!
//! A resumable round protocol between two offline vault clients (OVC1,
//! OVC2) and the custodian. Three rounds of broadcast and sealed
//! point-to-point messages produce one shared public key without any party
//! learning another's private share. The custodian side is driven by
//! [`KeyGenRoundOrchestrator`]; the client side by [`OvcParty`].

mod custodian;
mod payloads;
mod party;
mod store;

pub use custodian::KeyGenRoundOrchestrator;
pub use party::OvcParty;
pub use payloads::{
    KeygenBroadcast, KeychainAnnouncement, KeychainUpload, Round1Output, Round1Payload,
    Round2Output, Round2Payload, Round2PartyData, Round3Output, Round3Payload, SealedMessage,
};
pub use store::{KeychainStore, MemoryKeychainStore};

use serde::{Deserialize, Serialize};

/// Wire-level state of the key generation session
///
/// Ordered and monotonic; the payload's `state` field is the sole source of
/// truth for which round handler may legally process it. Handlers reject
/// any payload whose state is not the exact expected value before touching
/// cryptographic material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeygenState {
    WaitingForOvc1Round1Data,
    WaitingForOvc2Round1Data,
    WaitingForCustodianRound1Data,
    WaitingForOvc1Round2Data,
    WaitingForOvc2Round2Data,
    WaitingForCustodianRound2Data,
    WaitingForOvc1Round3aData,
    WaitingForOvc2Round3Data,
    WaitingForOvc1Round3bData,
    WaitingForCustodianRound3Data,
    WaitingForOvc1GenerateKey,
    WaitingForOvc2GenerateKey,
    KeyGenerationComplete,
}

impl KeygenState {
    /// Exact-match state assertion used by every round handler
    pub(crate) fn expect(self, expected: KeygenState) -> crate::Result<()> {
        if self != expected {
            return Err(crate::Error::InvalidState {
                expected: format!("{expected:?}"),
                actual: format!("{self:?}"),
            });
        }
        Ok(())
    }
}
