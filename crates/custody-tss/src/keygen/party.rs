//! Client (OVC) side of distributed key generation

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::payloads::{
    open, seal, KeychainAnnouncement, KeychainUpload, KeygenBroadcast, Round1Output, Round2Output,
    Round2PartyData, SealedMessage,
};
use crate::combine::{combine, KeyCombined, NShare, PShare};
use crate::types::{SessionId, BACKUP, CUSTODIAN, USER};
use crate::{Error, KeychainSource, PartyIdx, Result};

/// One offline vault client participating in key generation
///
/// Holds the party's polynomial share and accumulates the N-shares received
/// from the custodian (round 1 output) and the peer client (round 2 relay).
pub struct OvcParty {
    idx: PartyIdx,
    session_id: SessionId,
    gpg_key: String,
    p_share: PShare,
    custodian_gpg: Option<String>,
    peer_gpg: Option<String>,
    received: Vec<NShare>,
}

impl OvcParty {
    /// Create a client for `idx` (user or backup)
    pub fn new(idx: PartyIdx, session_id: SessionId, gpg_key: impl Into<String>) -> Result<Self> {
        if idx != USER && idx != BACKUP {
            return Err(Error::InvalidShare(format!(
                "Party {idx} is not an offline vault client"
            )));
        }
        Ok(Self {
            idx,
            session_id,
            gpg_key: gpg_key.into(),
            p_share: PShare::create(idx),
            custodian_gpg: None,
            peer_gpg: None,
            received: Vec::new(),
        })
    }

    pub fn idx(&self) -> PartyIdx {
        self.idx
    }

    fn peer(&self) -> PartyIdx {
        if self.idx == USER {
            BACKUP
        } else {
            USER
        }
    }

    /// Round 1: broadcast polynomial commitments and the gpg identity
    pub fn round1_broadcast(&self) -> KeygenBroadcast {
        KeygenBroadcast {
            from: self.idx,
            commitments: self.p_share.commitments.clone(),
            gpg_key: self.gpg_key.clone(),
        }
    }

    /// Round 2: open the custodian's sealed share and produce this client's
    /// sealed shares for the custodian and the peer client
    #[instrument(skip_all, fields(idx = self.idx))]
    pub fn round2_data(
        &mut self,
        round1: &Round1Output,
        peer_broadcast: &KeygenBroadcast,
    ) -> Result<Round2PartyData> {
        if peer_broadcast.from != self.peer() {
            return Err(Error::InvalidShare(format!(
                "Expected broadcast from party {}, got party {}",
                self.peer(),
                peer_broadcast.from
            )));
        }

        let custodian_gpg = round1.broadcast.gpg_key.clone();
        let sealed = round1
            .p2p
            .iter()
            .find(|m| m.to == self.idx)
            .ok_or_else(|| {
                Error::InvalidShare(format!("No custodian share addressed to party {}", self.idx))
            })?;
        let share = open_n_share(sealed, &self.session_id, self.idx, &custodian_gpg, &self.gpg_key)?;
        if share.i != CUSTODIAN {
            return Err(Error::InvalidShare(format!(
                "Round 1 share must originate from the custodian, got party {}",
                share.i
            )));
        }
        self.received.push(share);

        let to_custodian = seal_n_share(
            &self.p_share.n_share_for(CUSTODIAN)?,
            &self.session_id,
            self.idx,
            CUSTODIAN,
            &self.gpg_key,
            &custodian_gpg,
        )?;
        let to_peer = seal_n_share(
            &self.p_share.n_share_for(self.peer())?,
            &self.session_id,
            self.idx,
            self.peer(),
            &self.gpg_key,
            &peer_broadcast.gpg_key,
        )?;

        self.custodian_gpg = Some(custodian_gpg);
        self.peer_gpg = Some(peer_broadcast.gpg_key.clone());

        debug!("Prepared round 2 shares");
        Ok(Round2PartyData {
            to_custodian,
            to_peer,
        })
    }

    /// Open the peer share relayed through the custodian in round 2
    #[instrument(skip_all, fields(idx = self.idx))]
    pub fn absorb_relay(&mut self, round2: &Round2Output) -> Result<()> {
        let peer_gpg = self
            .peer_gpg
            .as_deref()
            .ok_or_else(|| Error::Internal("Round 2 relay received before round 2 data".into()))?;
        let sealed = round2
            .relayed
            .iter()
            .find(|m| m.to == self.idx)
            .ok_or_else(|| {
                Error::InvalidShare(format!("No relayed share addressed to party {}", self.idx))
            })?;
        let share = open_n_share(sealed, &self.session_id, self.idx, peer_gpg, &self.gpg_key)?;
        if share.i != self.peer() {
            return Err(Error::InvalidShare(format!(
                "Relayed share must originate from party {}, got party {}",
                self.peer(),
                share.i
            )));
        }
        self.received.push(share);
        Ok(())
    }

    /// Combine this client's shares into its signing key
    pub fn combined(&self) -> Result<KeyCombined> {
        combine(&self.p_share, &self.received)
    }

    /// Round 3: sealed keychain reveal for the custodian plus the public
    /// announcement
    pub fn round3_messages(&self) -> Result<(SealedMessage, KeychainAnnouncement)> {
        let custodian_gpg = self
            .custodian_gpg
            .as_deref()
            .ok_or_else(|| Error::Internal("Round 3 reached before round 2".into()))?;
        let keychain = self.combined()?.common_keychain();

        let mut reveal_bytes = Vec::with_capacity(65);
        reveal_bytes.extend_from_slice(&keychain.public_key);
        reveal_bytes.extend_from_slice(&keychain.chain_code);
        let reveal = seal(
            &self.session_id,
            self.idx,
            CUSTODIAN,
            &self.gpg_key,
            custodian_gpg,
            &reveal_bytes,
        )?;

        Ok((
            reveal,
            KeychainAnnouncement {
                from: self.idx,
                public_key: hex::encode(keychain.public_key),
            },
        ))
    }

    /// Final client-side step: derive the key and build the keychain upload
    /// for custodian cross-validation
    pub fn generate_key(&self) -> Result<(KeyCombined, KeychainUpload)> {
        let combined = self.combined()?;
        let source = if self.idx == USER {
            KeychainSource::User
        } else {
            KeychainSource::Backup
        };
        let upload = KeychainUpload {
            session_id: self.session_id,
            source,
            common_keychain: combined.common_keychain().to_hex(),
        };
        Ok((combined, upload))
    }

    /// The client's long-term polynomial share, exported for key-card storage
    pub fn p_share(&self) -> &PShare {
        &self.p_share
    }

    /// The N-shares this client received during the rounds
    pub fn received_shares(&self) -> &[NShare] {
        &self.received
    }
}

#[derive(Serialize, Deserialize)]
struct SealedShare {
    share: NShare,
}

pub(super) fn seal_n_share(
    share: &NShare,
    session_id: &SessionId,
    from: PartyIdx,
    to: PartyIdx,
    from_gpg: &str,
    to_gpg: &str,
) -> Result<SealedMessage> {
    let bytes = serde_json::to_vec(&SealedShare {
        share: share.clone(),
    })?;
    seal(session_id, from, to, from_gpg, to_gpg, &bytes)
}

pub(super) fn open_n_share(
    message: &SealedMessage,
    session_id: &SessionId,
    to: PartyIdx,
    from_gpg: &str,
    to_gpg: &str,
) -> Result<NShare> {
    let bytes = open(message, session_id, to, from_gpg, to_gpg)?;
    let sealed: SealedShare =
        serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
    Ok(sealed.share)
}
