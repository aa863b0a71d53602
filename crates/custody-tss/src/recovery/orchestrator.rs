//! Recovery orchestration
//!
//! Decrypts stored user and backup key material, classifies it, and drives
//! the matching signing strategy: the legacy shares through the full
//! challenge/sign/convert/combine pipeline, the reduced shares through
//! their own round protocol. The destination address is always rebuilt from
//! the derived public key, never taken from the caller.

use async_trait::async_trait;
use tracing::{info, instrument};

use super::material::{EncryptedKeyMaterial, SigningMaterial};
use super::reduced::{parse_signature_string, ReducedShareSigner};
use crate::challenge::{
    append_challenge, append_challenge_y, generate_challenge_pair,
    generate_range_proof_challenge, AugmentedXShare, AugmentedYShare,
};
use crate::combine::{
    combine, derive_combined, verify_common_keychain, KeyCombined, NShare, PShare,
};
use crate::sign::{
    construct_signature, sign, sign_combine, sign_convert_step1, sign_convert_step2,
    sign_convert_step3, sign_share, SignIndex,
};
use crate::types::{decode_point, BACKUP, USER};
use crate::{Error, PartyIdx, Result, Signature};

/// Signing strategy selected once at key-material parse time
#[async_trait]
pub trait ThresholdSigner: Send + Sync {
    /// Compressed public key of the signing key derived at `path`
    fn derived_public_key(&self, path: &str) -> Result<[u8; 33]>;

    /// Produce a full signature over a prehashed digest
    async fn sign_digest(&self, path: &str, digest: &[u8; 32]) -> Result<Signature>;
}

/// Balance lookup collaborator; failures are surfaced unchanged
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Spendable balance for an address, in base units
    async fn balance(&self, address: &str) -> Result<u128>;
}

/// Legacy 3-party-capable key material driven in 2-party mode
#[derive(Debug)]
pub struct LegacySigner {
    user: KeyCombined,
    backup: KeyCombined,
}

impl LegacySigner {
    /// Combine both parties' stored shares and cross-check their keychains
    pub fn new(
        user_share: &PShare,
        user_n_shares: &[NShare],
        backup_share: &PShare,
        backup_n_shares: &[NShare],
    ) -> Result<Self> {
        if user_share.i != USER || backup_share.i != BACKUP {
            return Err(Error::InvalidShare(format!(
                "Recovery needs the user/backup share pair, got parties {} and {}",
                user_share.i, backup_share.i
            )));
        }
        let user = combine(user_share, user_n_shares)?;
        let backup = combine(backup_share, backup_n_shares)?;
        verify_common_keychain(&user, &backup)?;
        Ok(Self { user, backup })
    }

    fn derived(&self, source: &KeyCombined, path: &str) -> Result<KeyCombined> {
        let derived = derive_combined(source, path)?;
        Ok(KeyCombined {
            x_share: derived.x_share,
            y_shares: source.y_shares.clone(),
        })
    }
}

/// Bind fresh session challenges onto one party's own and peer shares
fn augment(
    combined: &KeyCombined,
    peer: PartyIdx,
    peer_modulus: &[u8],
) -> Result<(AugmentedXShare, AugmentedYShare)> {
    let (mut range_x, mut paillier_x) = generate_challenge_pair(peer_modulus)?;
    let (mut range_y, mut paillier_y) = generate_challenge_pair(peer_modulus)?;
    let x = append_challenge(&combined.x_share, &mut range_x, &mut paillier_x)?;
    let y_share = combined.y_shares.get(&peer).ok_or_else(|| {
        Error::InvalidShare(format!("Combined key is missing the Y-share for party {peer}"))
    })?;
    let y = append_challenge_y(y_share, &mut range_y, &mut paillier_y)?;
    Ok((x, y))
}

#[async_trait]
impl ThresholdSigner for LegacySigner {
    fn derived_public_key(&self, path: &str) -> Result<[u8; 33]> {
        Ok(derive_combined(&self.user, path)?.x_share.y)
    }

    #[instrument(skip(self, digest))]
    async fn sign_digest(&self, path: &str, digest: &[u8; 32]) -> Result<Signature> {
        let user = self.derived(&self.user, path)?;
        let backup = self.derived(&self.backup, path)?;
        verify_common_keychain(&user, &backup)?;

        // Each side publishes a modulus and challenges the other's.
        let user_modulus = generate_range_proof_challenge().ntilde;
        let backup_modulus = generate_range_proof_challenge().ntilde;
        let (user_x, user_y) = augment(&user, BACKUP, &backup_modulus)?;
        let (backup_x, backup_y) = augment(&backup, USER, &user_modulus)?;

        let (k_share, w_share) = sign_share(&user_x, &user_y)?;
        let (a_share, b_share) = sign_convert_step1(&backup_x, &backup_y, k_share)?;
        let (mu_share, user_g) = sign_convert_step2(a_share, w_share)?;
        let (backup_g, backup_index) = sign_convert_step3(mu_share, b_share)?;

        let user_index = SignIndex { i: USER, j: BACKUP };
        let (mut user_o, user_d) = sign_combine(user_g, user_index)?;
        let (mut backup_o, backup_d) = sign_combine(backup_g, backup_index)?;

        // One directional partial per side, each over the other's D-share.
        let sign_a = sign(digest, &mut user_o, &backup_d)?;
        let sign_b = sign(digest, &mut backup_o, &user_d)?;
        construct_signature(&[sign_a, sign_b])
    }
}

#[async_trait]
impl ThresholdSigner for ReducedShareSigner {
    fn derived_public_key(&self, path: &str) -> Result<[u8; 33]> {
        ReducedShareSigner::derived_public_key(self, path)
    }

    async fn sign_digest(&self, path: &str, digest: &[u8; 32]) -> Result<Signature> {
        let rendered = self.sign_to_string(path, digest)?;
        let (signature, y) = parse_signature_string(&rendered)?;
        if y != ReducedShareSigner::derived_public_key(self, path)? {
            return Err(Error::CommonKeychainMismatch(
                "Reduced-share signature is bound to an unexpected public key".into(),
            ));
        }
        Ok(signature)
    }
}

/// Rebuild the on-chain base address from a compressed public key
///
/// keccak256 over the uncompressed point, last 20 bytes.
pub fn base_address(public_key: &[u8; 33]) -> Result<String> {
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use tiny_keccak::{Hasher, Keccak};

    let point = decode_point(public_key)?;
    let encoded = point.to_affine().to_encoded_point(false);

    let mut keccak = Keccak::v256();
    keccak.update(&encoded.as_bytes()[1..]);
    let mut out = [0u8; 32];
    keccak.finalize(&mut out);

    Ok(format!("0x{}", hex::encode(&out[12..])))
}

/// Drives one recovery: decrypt, classify, derive, sign
pub struct RecoveryOrchestrator {
    signer: Box<dyn ThresholdSigner>,
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator").finish_non_exhaustive()
    }
}

impl RecoveryOrchestrator {
    /// Decrypt both parties' stored material and select the protocol variant
    #[instrument(skip_all)]
    pub fn from_encrypted(
        user: &EncryptedKeyMaterial,
        backup: &EncryptedKeyMaterial,
        passphrase: &str,
    ) -> Result<Self> {
        let user = SigningMaterial::classify(&user.decrypt(passphrase)?)?;
        let backup = SigningMaterial::classify(&backup.decrypt(passphrase)?)?;
        Self::from_materials(user, backup)
    }

    /// Select the signing strategy from already-classified material
    pub fn from_materials(user: SigningMaterial, backup: SigningMaterial) -> Result<Self> {
        let signer: Box<dyn ThresholdSigner> = match (user, backup) {
            (
                SigningMaterial::Legacy {
                    p_share: user_share,
                    n_shares: user_n,
                },
                SigningMaterial::Legacy {
                    p_share: backup_share,
                    n_shares: backup_n,
                },
            ) => Box::new(LegacySigner::new(
                &user_share,
                &user_n,
                &backup_share,
                &backup_n,
            )?),
            (SigningMaterial::ReducedShare(user), SigningMaterial::ReducedShare(backup)) => {
                Box::new(ReducedShareSigner::new(user, backup)?)
            }
            _ => {
                return Err(Error::Classification(
                    "User and backup key material use different share layouts".into(),
                ))
            }
        };
        Ok(Self { signer })
    }

    /// Wallet base address at `path`, rebuilt from the derived public key
    pub fn base_address(&self, path: &str) -> Result<String> {
        base_address(&self.signer.derived_public_key(path)?)
    }

    /// Look up the wallet balance and require at least `required` base units
    #[instrument(skip(self, provider))]
    pub async fn verify_funds(
        &self,
        path: &str,
        provider: &dyn BalanceProvider,
        required: u128,
    ) -> Result<u128> {
        let address = self.base_address(path)?;
        let balance = provider.balance(&address).await?;
        if balance < required {
            return Err(Error::InsufficientFunds {
                address,
                balance,
                required,
            });
        }
        Ok(balance)
    }

    /// Sign a prehashed digest under the key derived at `path`
    #[instrument(skip(self, digest))]
    pub async fn sign(&self, path: &str, digest: &[u8; 32]) -> Result<Signature> {
        let public_key = self.signer.derived_public_key(path)?;
        let signature = self.signer.sign_digest(path, digest).await?;
        signature.verify_prehash(digest, &public_key)?;
        info!(address = %base_address(&public_key)?, "Recovery signature produced");
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combine::tests::fixture;
    use crate::recovery::reduced::tests::fixture as reduced_fixture;

    fn legacy_materials() -> (SigningMaterial, SigningMaterial) {
        let (p_shares, inbox) = fixture();
        (
            SigningMaterial::Legacy {
                p_share: p_shares[0].clone(),
                n_shares: inbox[&USER].clone(),
            },
            SigningMaterial::Legacy {
                p_share: p_shares[1].clone(),
                n_shares: inbox[&BACKUP].clone(),
            },
        )
    }

    fn reduced_materials() -> (SigningMaterial, SigningMaterial) {
        let (user, backup) = reduced_fixture();
        (
            SigningMaterial::ReducedShare(user),
            SigningMaterial::ReducedShare(backup),
        )
    }

    #[tokio::test]
    async fn legacy_recovery_end_to_end() {
        let (user, backup) = legacy_materials();
        let sealed_user =
            EncryptedKeyMaterial::seal("correct horse", &user.to_json().unwrap()).unwrap();
        let sealed_backup =
            EncryptedKeyMaterial::seal("correct horse", &backup.to_json().unwrap()).unwrap();

        let orchestrator =
            RecoveryOrchestrator::from_encrypted(&sealed_user, &sealed_backup, "correct horse")
                .unwrap();

        let digest = [0x11u8; 32];
        let signature = orchestrator.sign("m/0/0", &digest).await.unwrap();
        let public_key = orchestrator.signer.derived_public_key("m/0/0").unwrap();
        signature.verify_prehash(&digest, &public_key).unwrap();
    }

    #[tokio::test]
    async fn reduced_recovery_end_to_end() {
        let (user, backup) = reduced_materials();
        let orchestrator = RecoveryOrchestrator::from_materials(user, backup).unwrap();

        let digest = [0x22u8; 32];
        let signature = orchestrator.sign("m/0/1", &digest).await.unwrap();
        let public_key = orchestrator.signer.derived_public_key("m/0/1").unwrap();
        signature.verify_prehash(&digest, &public_key).unwrap();
    }

    #[test]
    fn mixed_variants_fail_classification() {
        let (user, _) = legacy_materials();
        let (_, backup) = reduced_materials();
        let err = RecoveryOrchestrator::from_materials(user, backup).unwrap_err();
        assert!(matches!(err, Error::Classification(_)));
    }

    #[test]
    fn wrong_passphrase_is_a_decryption_error() {
        let (user, backup) = legacy_materials();
        let sealed_user =
            EncryptedKeyMaterial::seal("right", &user.to_json().unwrap()).unwrap();
        let sealed_backup =
            EncryptedKeyMaterial::seal("right", &backup.to_json().unwrap()).unwrap();
        let err = RecoveryOrchestrator::from_encrypted(&sealed_user, &sealed_backup, "wrong")
            .unwrap_err();
        assert!(matches!(err, Error::Decryption));
    }

    #[test]
    fn base_address_is_derived_from_the_public_key() {
        let (user, backup) = reduced_materials();
        let orchestrator = RecoveryOrchestrator::from_materials(user, backup).unwrap();

        let address = orchestrator.base_address("m/0/0").unwrap();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        // Different paths derive different keys, so different addresses.
        assert_ne!(address, orchestrator.base_address("m/0/1").unwrap());
    }

    struct FixedBalance(u128);

    #[async_trait]
    impl BalanceProvider for FixedBalance {
        async fn balance(&self, _address: &str) -> Result<u128> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn verify_funds_surfaces_insufficient_balance() {
        let (user, backup) = reduced_materials();
        let orchestrator = RecoveryOrchestrator::from_materials(user, backup).unwrap();

        let balance = orchestrator
            .verify_funds("m/0/0", &FixedBalance(1_000), 500)
            .await
            .unwrap();
        assert_eq!(balance, 1_000);

        let err = orchestrator
            .verify_funds("m/0/0", &FixedBalance(100), 500)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { required: 500, .. }));
    }
}
