//! Custodian side of distributed key generation
//!
//! Drives the three-round state machine: validates each payload's state,
//! combines round inputs, emits round outputs, and persists the custodian
//! keychain record at round 3. Handlers are pure functions of
//! `(state, payload)`: retrying a completed round with identical inputs
//! returns the cached output, retrying with different inputs is rejected.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, instrument};

use super::payloads::{
    KeychainAnnouncement, KeychainUpload, KeygenBroadcast, Round1Output, Round1Payload,
    Round2Output, Round2Payload, Round3Output, Round3Payload,
};
use super::party::{open_n_share, seal_n_share};
use super::store::KeychainStore;
use super::KeygenState;
use crate::combine::{combine, NShare, PShare};
use crate::types::{SessionId, BACKUP, CUSTODIAN, USER};
use crate::{
    CommonKeychain, Error, KeychainRecord, KeychainSource, PartyIdx, Result,
};

/// Round numbers used for the idempotence memo
const ROUND1: u8 = 1;
const ROUND2: u8 = 2;
const ROUND3: u8 = 3;
const UPLOAD_USER: u8 = 4;
const UPLOAD_BACKUP: u8 = 5;

struct RoundMemo {
    fingerprint: [u8; 32],
    output: Vec<u8>,
}

/// Custodian-side orchestrator for one key generation session
pub struct KeyGenRoundOrchestrator<S: KeychainStore> {
    session_id: SessionId,
    state: KeygenState,
    p_share: PShare,
    gpg_key: String,
    store: S,
    ovc_gpg: BTreeMap<PartyIdx, String>,
    received: Vec<NShare>,
    transcript: blake3::Hasher,
    keychain: Option<CommonKeychain>,
    memos: BTreeMap<u8, RoundMemo>,
}

impl<S: KeychainStore> KeyGenRoundOrchestrator<S> {
    pub fn new(session_id: SessionId, gpg_key: impl Into<String>, store: S) -> Self {
        let mut transcript = blake3::Hasher::new();
        transcript.update(b"keygen-transcript-v1");
        transcript.update(&session_id);
        Self {
            session_id,
            state: KeygenState::WaitingForOvc1Round1Data,
            p_share: PShare::create(CUSTODIAN),
            gpg_key: gpg_key.into(),
            store,
            ovc_gpg: BTreeMap::new(),
            received: Vec::new(),
            transcript,
            keychain: None,
            memos: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> KeygenState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Round 1: accept both clients' broadcasts, return the custodian's
    /// broadcast plus one sealed share per client
    #[instrument(skip_all, fields(session = %hex::encode(&self.session_id[..4])))]
    pub fn round1(&mut self, payload: Round1Payload) -> Result<Round1Output> {
        let fingerprint = fingerprint(&payload)?;
        if let Some(cached) = self.replay(ROUND1, fingerprint)? {
            return Ok(cached);
        }
        self.state.expect(KeygenState::WaitingForOvc1Round1Data)?;
        payload
            .state
            .expect(KeygenState::WaitingForCustodianRound1Data)?;
        self.check_session(&payload.session_id)?;

        let ovc1 = require_broadcast(payload.ovc1.as_ref(), USER)?;
        let ovc2 = require_broadcast(payload.ovc2.as_ref(), BACKUP)?;

        let mut p2p = Vec::with_capacity(2);
        for broadcast in [ovc1, ovc2] {
            let sealed = seal_n_share(
                &self.p_share.n_share_for(broadcast.from)?,
                &self.session_id,
                CUSTODIAN,
                broadcast.from,
                &self.gpg_key,
                &broadcast.gpg_key,
            )?;
            p2p.push(sealed);
        }

        for broadcast in [ovc1, ovc2] {
            self.transcript.update(&serde_json::to_vec(broadcast)?);
            self.ovc_gpg
                .insert(broadcast.from, broadcast.gpg_key.clone());
        }

        let output = Round1Output {
            state: KeygenState::WaitingForOvc1Round2Data,
            broadcast: KeygenBroadcast {
                from: CUSTODIAN,
                commitments: self.p_share.commitments.clone(),
                gpg_key: self.gpg_key.clone(),
            },
            p2p,
        };
        self.complete_round(ROUND1, fingerprint, KeygenState::WaitingForOvc1Round2Data, &output)?;
        debug!("Round 1 complete");
        Ok(output)
    }

    /// Round 2: accept both clients' sealed replies, return a fresh
    /// transcript commitment plus the client-to-client messages to relay
    #[instrument(skip_all, fields(session = %hex::encode(&self.session_id[..4])))]
    pub fn round2(&mut self, payload: Round2Payload) -> Result<Round2Output> {
        let fingerprint = fingerprint(&payload)?;
        if let Some(cached) = self.replay(ROUND2, fingerprint)? {
            return Ok(cached);
        }
        self.state.expect(KeygenState::WaitingForOvc1Round2Data)?;
        payload
            .state
            .expect(KeygenState::WaitingForCustodianRound2Data)?;
        self.check_session(&payload.session_id)?;

        let ovc1 = payload
            .ovc1
            .as_ref()
            .ok_or_else(|| incomplete_payload("OVC1 round 2 data"))?;
        let ovc2 = payload
            .ovc2
            .as_ref()
            .ok_or_else(|| incomplete_payload("OVC2 round 2 data"))?;

        let mut incoming = Vec::with_capacity(2);
        for (from, data) in [(USER, ovc1), (BACKUP, ovc2)] {
            let gpg = self
                .ovc_gpg
                .get(&from)
                .ok_or_else(|| Error::Internal("Round 1 gpg keys missing".into()))?;
            let share = open_n_share(
                &data.to_custodian,
                &self.session_id,
                CUSTODIAN,
                gpg,
                &self.gpg_key,
            )?;
            if share.i != from {
                return Err(Error::InvalidShare(format!(
                    "Round 2 share from party {} arrived in party {from}'s slot",
                    share.i
                )));
            }
            incoming.push(share);
            self.transcript.update(&data.to_custodian.ciphertext);
        }

        self.received.extend(incoming);

        let output = Round2Output {
            state: KeygenState::WaitingForOvc1Round3aData,
            commitment: *self.transcript.finalize().as_bytes(),
            relayed: vec![ovc1.to_peer.clone(), ovc2.to_peer.clone()],
        };
        self.complete_round(
            ROUND2,
            fingerprint,
            KeygenState::WaitingForOvc1Round3aData,
            &output,
        )?;
        debug!("Round 2 complete");
        Ok(output)
    }

    /// Round 3: accept both clients' reveals and announcements, compute the
    /// joint keychain, persist the custodian record, and return the final
    /// broadcast
    ///
    /// Persisting the keychain record is the only persistent side effect in
    /// the protocol; it happens after every validation has passed.
    #[instrument(skip_all, fields(session = %hex::encode(&self.session_id[..4])))]
    pub async fn round3(&mut self, payload: Round3Payload) -> Result<Round3Output> {
        let fingerprint = fingerprint(&payload)?;
        if let Some(cached) = self.replay(ROUND3, fingerprint)? {
            return Ok(cached);
        }
        self.state.expect(KeygenState::WaitingForOvc1Round3aData)?;
        payload
            .state
            .expect(KeygenState::WaitingForCustodianRound3Data)?;
        self.check_session(&payload.session_id)?;

        let combined = combine(&self.p_share, &self.received)?;
        let keychain = combined.common_keychain();

        for (from, reveal) in [
            (USER, payload.ovc1_reveal.as_ref()),
            (BACKUP, payload.ovc2_reveal.as_ref()),
        ] {
            let reveal = reveal.ok_or_else(|| incomplete_payload("round 3 reveal"))?;
            let gpg = self
                .ovc_gpg
                .get(&from)
                .ok_or_else(|| Error::Internal("Round 1 gpg keys missing".into()))?;
            let bytes = super::payloads::open(reveal, &self.session_id, CUSTODIAN, gpg, &self.gpg_key)?;
            let revealed = parse_keychain_reveal(&bytes)?;
            if !keychain.ct_eq(&revealed) {
                return Err(Error::CommonKeychainMismatch(format!(
                    "Party {from} revealed a different keychain than the custodian derived"
                )));
            }
        }

        for announcement in [
            payload.ovc1_announcement.as_ref(),
            payload.ovc2_announcement.as_ref(),
        ] {
            let announcement = announcement.ok_or_else(|| incomplete_payload("round 3 announcement"))?;
            if announcement.public_key != hex::encode(keychain.public_key) {
                return Err(Error::CommonKeychainMismatch(format!(
                    "Party {} announced a different public key",
                    announcement.from
                )));
            }
        }

        let record = KeychainRecord::new(KeychainSource::Custodian, &keychain);
        self.store.put(record.clone()).await?;

        let output = Round3Output {
            state: KeygenState::WaitingForOvc1GenerateKey,
            announcement: KeychainAnnouncement {
                from: CUSTODIAN,
                public_key: hex::encode(keychain.public_key),
            },
            record,
        };
        self.keychain = Some(keychain);
        self.complete_round(
            ROUND3,
            fingerprint,
            KeygenState::WaitingForOvc1GenerateKey,
            &output,
        )?;
        info!(
            public_key = %output.announcement.public_key,
            "Key generation rounds complete, custodian keychain persisted"
        );
        Ok(output)
    }

    /// Accept a client's uploaded common keychain and cross-validate it
    /// against every keychain known so far (three-way equality)
    ///
    /// Like the round handlers, an identical retransmission of an accepted
    /// upload is a no-op and a divergent retry is rejected.
    #[instrument(skip_all, fields(source = ?upload.source))]
    pub async fn finalize_client_keychain(&mut self, upload: KeychainUpload) -> Result<()> {
        let fingerprint = fingerprint(&upload)?;
        let memo_key = match upload.source {
            KeychainSource::User => UPLOAD_USER,
            KeychainSource::Backup => UPLOAD_BACKUP,
            KeychainSource::Custodian => {
                return Err(Error::InvalidState {
                    expected: "upload from User or Backup".into(),
                    actual: "upload from Custodian".into(),
                })
            }
        };
        if self.replay::<()>(memo_key, fingerprint)?.is_some() {
            return Ok(());
        }
        let expected_source = match self.state {
            KeygenState::WaitingForOvc1GenerateKey => KeychainSource::User,
            KeygenState::WaitingForOvc2GenerateKey => KeychainSource::Backup,
            _ => {
                return Err(Error::InvalidState {
                    expected: "WaitingForOvc1GenerateKey or WaitingForOvc2GenerateKey".into(),
                    actual: format!("{:?}", self.state),
                })
            }
        };
        if upload.source != expected_source {
            return Err(Error::InvalidState {
                expected: format!("upload from {expected_source:?}"),
                actual: format!("upload from {:?}", upload.source),
            });
        }
        self.check_session(&upload.session_id)?;

        let uploaded = CommonKeychain::from_hex(&upload.common_keychain)?;
        let own = self
            .keychain
            .as_ref()
            .ok_or_else(|| Error::Internal("Keychain missing after round 3".into()))?;
        if !own.ct_eq(&uploaded) {
            return Err(Error::CommonKeychainMismatch(format!(
                "{:?} uploaded a keychain that differs from the custodian's",
                upload.source
            )));
        }
        // Three-way check: the upload must also match every record already
        // persisted, including the custodian's round 3 record.
        for source in [
            KeychainSource::Custodian,
            KeychainSource::User,
            KeychainSource::Backup,
        ] {
            if let Some(existing) = self.store.get(source).await? {
                if existing.common_keychain != upload.common_keychain {
                    return Err(Error::CommonKeychainMismatch(format!(
                        "{:?} upload disagrees with the persisted {source:?} record",
                        upload.source
                    )));
                }
            }
        }

        self.store
            .put(KeychainRecord {
                source: upload.source,
                key_type: "threshold".into(),
                common_keychain: upload.common_keychain,
            })
            .await?;

        let next = match upload.source {
            KeychainSource::User => KeygenState::WaitingForOvc2GenerateKey,
            _ => KeygenState::KeyGenerationComplete,
        };
        self.complete_round(memo_key, fingerprint, next, &())?;
        debug!("Client keychain validated and persisted");
        Ok(())
    }

    fn check_session(&self, session_id: &SessionId) -> Result<()> {
        if *session_id != self.session_id {
            return Err(Error::InvalidState {
                expected: format!("session {}", hex::encode(self.session_id)),
                actual: format!("session {}", hex::encode(session_id)),
            });
        }
        Ok(())
    }

    /// Return the cached output when a completed round is retried with
    /// identical inputs; reject a retry with different inputs
    fn replay<T: DeserializeOwned>(&self, round: u8, fingerprint: [u8; 32]) -> Result<Option<T>> {
        match self.memos.get(&round) {
            None => Ok(None),
            Some(memo) if memo.fingerprint == fingerprint => {
                debug!(round, "Returning cached round output for identical retry");
                Ok(Some(serde_json::from_slice(&memo.output)?))
            }
            Some(_) => Err(Error::InvalidState {
                expected: format!("identical retry of round {round}"),
                actual: "different payload for an already-completed round".into(),
            }),
        }
    }

    fn complete_round<T: Serialize>(
        &mut self,
        round: u8,
        fingerprint: [u8; 32],
        next: KeygenState,
        output: &T,
    ) -> Result<()> {
        self.memos.insert(
            round,
            RoundMemo {
                fingerprint,
                output: serde_json::to_vec(output)?,
            },
        );
        self.state = next;
        Ok(())
    }
}

fn fingerprint<T: Serialize>(payload: &T) -> Result<[u8; 32]> {
    Ok(*blake3::hash(&serde_json::to_vec(payload)?).as_bytes())
}

fn incomplete_payload(what: &str) -> Error {
    Error::InvalidState {
        expected: format!("payload carrying {what}"),
        actual: "incomplete payload".into(),
    }
}

fn require_broadcast<'a>(
    broadcast: Option<&'a KeygenBroadcast>,
    expected_from: PartyIdx,
) -> Result<&'a KeygenBroadcast> {
    let broadcast = broadcast.ok_or_else(|| incomplete_payload("round 1 broadcast"))?;
    if broadcast.from != expected_from {
        return Err(Error::InvalidShare(format!(
            "Broadcast from party {} arrived in party {expected_from}'s slot",
            broadcast.from
        )));
    }
    // A degree-(threshold - 1) polynomial commits to exactly `THRESHOLD`
    // coefficients.
    if broadcast.commitments.len() != crate::THRESHOLD {
        return Err(Error::InvalidShare(format!(
            "Expected {} polynomial commitments, got {}",
            crate::THRESHOLD,
            broadcast.commitments.len()
        )));
    }
    Ok(broadcast)
}

fn parse_keychain_reveal(bytes: &[u8]) -> Result<CommonKeychain> {
    if bytes.len() != 65 {
        return Err(Error::Deserialization(format!(
            "Keychain reveal must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let mut public_key = [0u8; 33];
    let mut chain_code = [0u8; 32];
    public_key.copy_from_slice(&bytes[..33]);
    chain_code.copy_from_slice(&bytes[33..]);
    Ok(CommonKeychain {
        public_key,
        chain_code,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keygen::{MemoryKeychainStore, OvcParty, Round1Payload, Round2Payload, Round3Payload};

    pub(crate) struct CompletedKeygen {
        pub ovc1: OvcParty,
        pub ovc2: OvcParty,
        pub orchestrator: KeyGenRoundOrchestrator<MemoryKeychainStore>,
    }

    /// Drive a full three-round session through both clients and the
    /// custodian, stopping before the client keychain uploads
    pub(crate) async fn run_rounds() -> CompletedKeygen {
        let session: SessionId = rand::random();
        let mut ovc1 = OvcParty::new(USER, session, "ovc1-gpg").unwrap();
        let mut ovc2 = OvcParty::new(BACKUP, session, "ovc2-gpg").unwrap();
        let mut orchestrator =
            KeyGenRoundOrchestrator::new(session, "custodian-gpg", MemoryKeychainStore::new());

        let payload = Round1Payload::awaiting(session)
            .with_ovc1(ovc1.round1_broadcast())
            .unwrap()
            .with_ovc2(ovc2.round1_broadcast())
            .unwrap();
        let round1 = orchestrator.round1(payload).unwrap();

        let ovc2_broadcast = ovc2.round1_broadcast();
        let ovc1_broadcast = ovc1.round1_broadcast();
        let payload = Round2Payload::awaiting(session)
            .with_ovc1(ovc1.round2_data(&round1, &ovc2_broadcast).unwrap())
            .unwrap()
            .with_ovc2(ovc2.round2_data(&round1, &ovc1_broadcast).unwrap())
            .unwrap();
        let round2 = orchestrator.round2(payload).unwrap();

        ovc1.absorb_relay(&round2).unwrap();
        ovc2.absorb_relay(&round2).unwrap();

        let (reveal1, announce1) = ovc1.round3_messages().unwrap();
        let (reveal2, announce2) = ovc2.round3_messages().unwrap();
        let payload = Round3Payload::awaiting(session)
            .with_ovc1_reveal(reveal1)
            .unwrap()
            .with_ovc2(reveal2, announce2)
            .unwrap()
            .with_ovc1_announcement(announce1)
            .unwrap();
        orchestrator.round3(payload).await.unwrap();

        CompletedKeygen {
            ovc1,
            ovc2,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn full_session_produces_three_matching_records() {
        let mut done = run_rounds().await;

        let (user_key, user_upload) = done.ovc1.generate_key().unwrap();
        let (backup_key, backup_upload) = done.ovc2.generate_key().unwrap();
        assert_eq!(
            user_key.common_keychain().to_hex(),
            backup_key.common_keychain().to_hex()
        );

        done.orchestrator
            .finalize_client_keychain(user_upload)
            .await
            .unwrap();
        done.orchestrator
            .finalize_client_keychain(backup_upload)
            .await
            .unwrap();
        assert_eq!(done.orchestrator.state(), KeygenState::KeyGenerationComplete);

        let store = done.orchestrator.store();
        assert_eq!(store.len().await, 3);
        let custodian = store.get(KeychainSource::Custodian).await.unwrap().unwrap();
        let user = store.get(KeychainSource::User).await.unwrap().unwrap();
        let backup = store.get(KeychainSource::Backup).await.unwrap().unwrap();
        assert_eq!(custodian.common_keychain, user.common_keychain);
        assert_eq!(user.common_keychain, backup.common_keychain);
        assert_eq!(custodian.key_type, "threshold");
    }

    #[tokio::test]
    async fn upload_retry_is_idempotent() {
        let mut done = run_rounds().await;

        let (_, user_upload) = done.ovc1.generate_key().unwrap();
        let (_, backup_upload) = done.ovc2.generate_key().unwrap();

        done.orchestrator
            .finalize_client_keychain(user_upload.clone())
            .await
            .unwrap();
        // A retransmitted user upload must be a no-op even though the
        // orchestrator has moved on to waiting for the backup.
        done.orchestrator
            .finalize_client_keychain(user_upload.clone())
            .await
            .unwrap();
        assert_eq!(
            done.orchestrator.state(),
            KeygenState::WaitingForOvc2GenerateKey
        );
        assert_eq!(done.orchestrator.store().len().await, 2);

        done.orchestrator
            .finalize_client_keychain(backup_upload.clone())
            .await
            .unwrap();
        done.orchestrator
            .finalize_client_keychain(backup_upload)
            .await
            .unwrap();
        assert_eq!(done.orchestrator.state(), KeygenState::KeyGenerationComplete);
        assert_eq!(done.orchestrator.store().len().await, 3);

        // Same source, different keychain: rejected.
        let mut tampered = user_upload;
        tampered.common_keychain.replace_range(..2, "00");
        let err = done
            .orchestrator
            .finalize_client_keychain(tampered)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn round2_payload_rejected_while_awaiting_round1() {
        let session: SessionId = rand::random();
        let mut orchestrator =
            KeyGenRoundOrchestrator::new(session, "custodian-gpg", MemoryKeychainStore::new());

        // A round-2 payload claiming readiness must fail the state
        // assertion before any share is touched.
        let mut payload = Round2Payload::awaiting(session);
        payload.state = KeygenState::WaitingForCustodianRound2Data;
        let err = orchestrator.round2(payload).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(orchestrator.store().len().await, 0);
        assert_eq!(orchestrator.state(), KeygenState::WaitingForOvc1Round1Data);
    }

    #[tokio::test]
    async fn round1_payload_with_wrong_state_rejected() {
        let session: SessionId = rand::random();
        let ovc1 = OvcParty::new(USER, session, "a").unwrap();
        let mut orchestrator =
            KeyGenRoundOrchestrator::new(session, "c", MemoryKeychainStore::new());

        // Partially assembled payload: state still mid-collection.
        let payload = Round1Payload::awaiting(session)
            .with_ovc1(ovc1.round1_broadcast())
            .unwrap();
        let err = orchestrator.round1(payload).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn round3_retry_is_idempotent() {
        let session: SessionId = rand::random();
        let mut ovc1 = OvcParty::new(USER, session, "ovc1-gpg").unwrap();
        let mut ovc2 = OvcParty::new(BACKUP, session, "ovc2-gpg").unwrap();
        let mut orchestrator =
            KeyGenRoundOrchestrator::new(session, "custodian-gpg", MemoryKeychainStore::new());

        let payload = Round1Payload::awaiting(session)
            .with_ovc1(ovc1.round1_broadcast())
            .unwrap()
            .with_ovc2(ovc2.round1_broadcast())
            .unwrap();
        let round1 = orchestrator.round1(payload).unwrap();

        let ovc2_broadcast = ovc2.round1_broadcast();
        let ovc1_broadcast = ovc1.round1_broadcast();
        let payload = Round2Payload::awaiting(session)
            .with_ovc1(ovc1.round2_data(&round1, &ovc2_broadcast).unwrap())
            .unwrap()
            .with_ovc2(ovc2.round2_data(&round1, &ovc1_broadcast).unwrap())
            .unwrap();
        let round2 = orchestrator.round2(payload).unwrap();
        ovc1.absorb_relay(&round2).unwrap();
        ovc2.absorb_relay(&round2).unwrap();

        let (reveal1, announce1) = ovc1.round3_messages().unwrap();
        let (reveal2, announce2) = ovc2.round3_messages().unwrap();
        let payload = Round3Payload::awaiting(session)
            .with_ovc1_reveal(reveal1)
            .unwrap()
            .with_ovc2(reveal2, announce2)
            .unwrap()
            .with_ovc1_announcement(announce1)
            .unwrap();

        let first = orchestrator.round3(payload.clone()).await.unwrap();
        let second = orchestrator.round3(payload.clone()).await.unwrap();
        assert_eq!(
            first.record.common_keychain,
            second.record.common_keychain
        );
        assert_eq!(orchestrator.store().len().await, 1);

        // Same state, different inputs: rejected.
        let mut tampered = payload;
        tampered.ovc1_announcement.as_mut().unwrap().public_key = "00".into();
        let err = orchestrator.round3(tampered).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn tampered_reveal_fails_keychain_comparison() {
        let session: SessionId = rand::random();
        let mut ovc1 = OvcParty::new(USER, session, "ovc1-gpg").unwrap();
        let mut ovc2 = OvcParty::new(BACKUP, session, "ovc2-gpg").unwrap();
        let mut orchestrator =
            KeyGenRoundOrchestrator::new(session, "custodian-gpg", MemoryKeychainStore::new());

        let payload = Round1Payload::awaiting(session)
            .with_ovc1(ovc1.round1_broadcast())
            .unwrap()
            .with_ovc2(ovc2.round1_broadcast())
            .unwrap();
        let round1 = orchestrator.round1(payload).unwrap();

        let ovc2_broadcast = ovc2.round1_broadcast();
        let ovc1_broadcast = ovc1.round1_broadcast();
        let payload = Round2Payload::awaiting(session)
            .with_ovc1(ovc1.round2_data(&round1, &ovc2_broadcast).unwrap())
            .unwrap()
            .with_ovc2(ovc2.round2_data(&round1, &ovc1_broadcast).unwrap())
            .unwrap();
        let round2 = orchestrator.round2(payload).unwrap();
        ovc1.absorb_relay(&round2).unwrap();
        ovc2.absorb_relay(&round2).unwrap();

        // Seal a reveal for a perturbed keychain: one flipped chain code
        // byte must abort round 3.
        let keychain = ovc1.combined().unwrap().common_keychain();
        let mut reveal_bytes = Vec::with_capacity(65);
        reveal_bytes.extend_from_slice(&keychain.public_key);
        let mut chain_code = keychain.chain_code;
        chain_code[0] ^= 1;
        reveal_bytes.extend_from_slice(&chain_code);
        let bad_reveal = crate::keygen::payloads::seal(
            &session,
            USER,
            CUSTODIAN,
            "ovc1-gpg",
            "custodian-gpg",
            &reveal_bytes,
        )
        .unwrap();

        let (_, announce1) = ovc1.round3_messages().unwrap();
        let (reveal2, announce2) = ovc2.round3_messages().unwrap();
        let payload = Round3Payload::awaiting(session)
            .with_ovc1_reveal(bad_reveal)
            .unwrap()
            .with_ovc2(reveal2, announce2)
            .unwrap()
            .with_ovc1_announcement(announce1)
            .unwrap();

        let err = orchestrator.round3(payload).await.unwrap_err();
        assert!(matches!(err, Error::CommonKeychainMismatch(_)));
        assert_eq!(orchestrator.store().len().await, 0);
        assert_eq!(
            orchestrator.state(),
            KeygenState::WaitingForOvc1Round3aData
        );
    }
}
