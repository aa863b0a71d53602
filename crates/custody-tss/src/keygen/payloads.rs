//! Key generation wire types
//!
//! Round payloads are immutable values: each assembly step consumes the
//! previous payload and returns a new one with the advanced state, so a
//! handler always observes a fully, explicitly constructed value.
//! Point-to-point messages are sealed with ChaCha20-Poly1305 under a key
//! bound to the session and the endpoints' exchanged gpg identities;
//! broadcasts are sent in the clear and self-authenticating through the
//! commitments they carry.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::KeygenState;
use crate::types::{point_vec_serde, SessionId};
use crate::{Error, KeychainSource, PartyIdx, Result};

/// Self-authenticating broadcast sent by each party in round 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenBroadcast {
    pub from: PartyIdx,
    /// Feldman commitments to the sender's polynomial, compressed
    #[serde(with = "point_vec_serde")]
    pub commitments: Vec<[u8; 33]>,
    /// gpg-wrapped public key used to address sealed messages to the sender
    pub gpg_key: String,
}

/// Authenticated-encrypted message addressed to one recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMessage {
    pub from: PartyIdx,
    pub to: PartyIdx,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Public keychain announcement broadcast in round 3
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainAnnouncement {
    pub from: PartyIdx,
    /// Compressed joint public key, hex
    pub public_key: String,
}

/// A client's derived common keychain, uploaded for cross-validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainUpload {
    pub session_id: SessionId,
    pub source: KeychainSource,
    /// Hex `<public key || chain code>`
    pub common_keychain: String,
}

/// Round 1 payload: both clients' initial broadcasts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1Payload {
    pub state: KeygenState,
    pub session_id: SessionId,
    pub ovc1: Option<KeygenBroadcast>,
    pub ovc2: Option<KeygenBroadcast>,
}

impl Round1Payload {
    pub fn awaiting(session_id: SessionId) -> Self {
        Self {
            state: KeygenState::WaitingForOvc1Round1Data,
            session_id,
            ovc1: None,
            ovc2: None,
        }
    }

    pub fn with_ovc1(self, broadcast: KeygenBroadcast) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc1Round1Data)?;
        Ok(Self {
            state: KeygenState::WaitingForOvc2Round1Data,
            ovc1: Some(broadcast),
            ..self
        })
    }

    pub fn with_ovc2(self, broadcast: KeygenBroadcast) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc2Round1Data)?;
        Ok(Self {
            state: KeygenState::WaitingForCustodianRound1Data,
            ovc2: Some(broadcast),
            ..self
        })
    }
}

/// Custodian output of round 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1Output {
    pub state: KeygenState,
    pub broadcast: KeygenBroadcast,
    /// One sealed share per client
    pub p2p: Vec<SealedMessage>,
}

/// One client's round 2 data: sealed shares for the custodian and the peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round2PartyData {
    pub to_custodian: SealedMessage,
    pub to_peer: SealedMessage,
}

/// Round 2 payload: both clients' point-to-point replies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round2Payload {
    pub state: KeygenState,
    pub session_id: SessionId,
    pub ovc1: Option<Round2PartyData>,
    pub ovc2: Option<Round2PartyData>,
}

impl Round2Payload {
    pub fn awaiting(session_id: SessionId) -> Self {
        Self {
            state: KeygenState::WaitingForOvc1Round2Data,
            session_id,
            ovc1: None,
            ovc2: None,
        }
    }

    pub fn with_ovc1(self, data: Round2PartyData) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc1Round2Data)?;
        Ok(Self {
            state: KeygenState::WaitingForOvc2Round2Data,
            ovc1: Some(data),
            ..self
        })
    }

    pub fn with_ovc2(self, data: Round2PartyData) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc2Round2Data)?;
        Ok(Self {
            state: KeygenState::WaitingForCustodianRound2Data,
            ovc2: Some(data),
            ..self
        })
    }
}

/// Custodian output of round 2
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round2Output {
    pub state: KeygenState,
    /// Fresh commitment over the session transcript so far
    pub commitment: [u8; 32],
    /// Client-to-client messages relayed onward
    pub relayed: Vec<SealedMessage>,
}

/// Round 3 payload: final point-to-point and broadcast messages
///
/// OVC1 contributes twice: its sealed keychain reveal first (3a), its
/// public announcement after OVC2's turn (3b).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round3Payload {
    pub state: KeygenState,
    pub session_id: SessionId,
    pub ovc1_reveal: Option<SealedMessage>,
    pub ovc2_reveal: Option<SealedMessage>,
    pub ovc2_announcement: Option<KeychainAnnouncement>,
    pub ovc1_announcement: Option<KeychainAnnouncement>,
}

impl Round3Payload {
    pub fn awaiting(session_id: SessionId) -> Self {
        Self {
            state: KeygenState::WaitingForOvc1Round3aData,
            session_id,
            ovc1_reveal: None,
            ovc2_reveal: None,
            ovc2_announcement: None,
            ovc1_announcement: None,
        }
    }

    pub fn with_ovc1_reveal(self, reveal: SealedMessage) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc1Round3aData)?;
        Ok(Self {
            state: KeygenState::WaitingForOvc2Round3Data,
            ovc1_reveal: Some(reveal),
            ..self
        })
    }

    pub fn with_ovc2(
        self,
        reveal: SealedMessage,
        announcement: KeychainAnnouncement,
    ) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc2Round3Data)?;
        Ok(Self {
            state: KeygenState::WaitingForOvc1Round3bData,
            ovc2_reveal: Some(reveal),
            ovc2_announcement: Some(announcement),
            ..self
        })
    }

    pub fn with_ovc1_announcement(self, announcement: KeychainAnnouncement) -> Result<Self> {
        self.state.expect(KeygenState::WaitingForOvc1Round3bData)?;
        Ok(Self {
            state: KeygenState::WaitingForCustodianRound3Data,
            ovc1_announcement: Some(announcement),
            ..self
        })
    }
}

/// Custodian output of round 3
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round3Output {
    pub state: KeygenState,
    /// Custodian's final broadcast
    pub announcement: KeychainAnnouncement,
    /// The persisted custodian-side keychain record
    pub record: crate::KeychainRecord,
}

/// Derive the pairwise transport key from the session and the endpoints'
/// exchanged gpg identities
fn transport_key(session_id: &SessionId, from_gpg: &str, to_gpg: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"keygen-p2p-v1");
    hasher.update(session_id);
    hasher.update(from_gpg.as_bytes());
    hasher.update(to_gpg.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Seal a point-to-point payload for one recipient
pub(crate) fn seal(
    session_id: &SessionId,
    from: PartyIdx,
    to: PartyIdx,
    from_gpg: &str,
    to_gpg: &str,
    plaintext: &[u8],
) -> Result<SealedMessage> {
    let key = transport_key(session_id, from_gpg, to_gpg);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("Failed to seal point-to-point message".into()))?;
    Ok(SealedMessage {
        from,
        to,
        nonce,
        ciphertext,
    })
}

/// Open a sealed message addressed to `to`
pub(crate) fn open(
    message: &SealedMessage,
    session_id: &SessionId,
    to: PartyIdx,
    from_gpg: &str,
    to_gpg: &str,
) -> Result<Vec<u8>> {
    if message.to != to {
        return Err(Error::InvalidShare(format!(
            "Sealed message addressed to party {}, opened by party {to}",
            message.to
        )));
    }
    let key = transport_key(session_id, from_gpg, to_gpg);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&message.nonce), message.ciphertext.as_ref())
        .map_err(|_| Error::Decryption)
}
