//! Stored key material: passphrase decryption and variant classification
//!
//! Key material is stored as passphrase-encrypted JSON. Decryption either
//! yields the full plaintext or fails with [`Error::Decryption`]; no partial
//! key material is ever surfaced. The decrypted bytes are parsed up front
//! into a tagged [`SigningMaterial`] variant so downstream code matches
//! exhaustively instead of probing fields.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument};

use super::reduced::ReducedKeyShare;
use crate::combine::{NShare, PShare};
use crate::{Error, Result};

/// Domain constant for deriving the material key from a passphrase
const MATERIAL_KEY_CONTEXT: &[u8] = b"custody-key-material-v1";

/// Passphrase-encrypted key material as stored by the wallet layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyMaterial {
    /// Base64 ChaCha20-Poly1305 ciphertext
    pub ciphertext: String,
    pub nonce: [u8; 12],
}

impl EncryptedKeyMaterial {
    /// Encrypt serialized key material under a passphrase
    pub fn seal(passphrase: &str, plaintext: &[u8]) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&material_key(passphrase)?));
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("Failed to seal key material".into()))?;
        Ok(Self {
            ciphertext: BASE64.encode(ciphertext),
            nonce,
        })
    }

    /// Decrypt with the caller's passphrase
    ///
    /// A wrong passphrase and a corrupted ciphertext are indistinguishable;
    /// both fail with [`Error::Decryption`].
    #[instrument(skip_all)]
    pub fn decrypt(&self, passphrase: &str) -> Result<Vec<u8>> {
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| Error::Decryption)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&material_key(passphrase)?));
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), ciphertext.as_ref())
            .map_err(|_| Error::Decryption)
    }
}

fn material_key(passphrase: &str) -> Result<[u8; 32]> {
    // Qualified: `aead::KeyInit` is also in scope and carries its own
    // `new_from_slice`.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(MATERIAL_KEY_CONTEXT)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(passphrase.as_bytes());
    Ok(mac.finalize().into_bytes().into())
}

#[derive(Serialize, Deserialize)]
struct LegacyLayout {
    p_share: PShare,
    n_shares: Vec<NShare>,
}

/// Decrypted key material, classified into its protocol variant
#[derive(Debug, Clone)]
pub enum SigningMaterial {
    /// Legacy 3-party-capable material used in 2-party mode
    Legacy {
        p_share: PShare,
        n_shares: Vec<NShare>,
    },
    /// Newer 2-party-only reduced key share
    ReducedShare(ReducedKeyShare),
}

impl SigningMaterial {
    /// Parse decrypted bytes into one of the two share layouts
    ///
    /// The legacy layout is identified by its primary share plus named
    /// N-shares; anything else must parse as a reduced key share.
    pub fn classify(bytes: &[u8]) -> Result<Self> {
        if let Ok(layout) = serde_json::from_slice::<LegacyLayout>(bytes) {
            debug!("Classified key material as legacy layout");
            return Ok(Self::Legacy {
                p_share: layout.p_share,
                n_shares: layout.n_shares,
            });
        }
        if let Ok(share) = serde_json::from_slice::<ReducedKeyShare>(bytes) {
            debug!("Classified key material as reduced key share");
            return Ok(Self::ReducedShare(share));
        }
        Err(Error::Classification(
            "Key material matches neither the legacy p-share/n-shares layout \
             nor the reduced key share layout"
                .into(),
        ))
    }

    /// Serialize back into the stored JSON form
    pub fn to_json(&self) -> Result<Vec<u8>> {
        match self {
            Self::Legacy { p_share, n_shares } => Ok(serde_json::to_vec(&LegacyLayout {
                p_share: p_share.clone(),
                n_shares: n_shares.clone(),
            })?),
            Self::ReducedShare(share) => Ok(serde_json::to_vec(share)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_round_trip() {
        let sealed = EncryptedKeyMaterial::seal("hunter2", b"{\"key\":1}").unwrap();
        assert_eq!(sealed.decrypt("hunter2").unwrap(), b"{\"key\":1}");
    }

    #[test]
    fn wrong_passphrase_fails_closed() {
        let sealed = EncryptedKeyMaterial::seal("hunter2", b"secret").unwrap();
        assert!(matches!(
            sealed.decrypt("hunter3").unwrap_err(),
            Error::Decryption
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails_closed() {
        let mut sealed = EncryptedKeyMaterial::seal("hunter2", b"secret").unwrap();
        sealed.ciphertext = BASE64.encode(b"not the ciphertext");
        assert!(matches!(
            sealed.decrypt("hunter2").unwrap_err(),
            Error::Decryption
        ));
    }

    #[test]
    fn malformed_material_fails_classification() {
        let err = SigningMaterial::classify(b"{\"surprise\":true}").unwrap_err();
        assert!(matches!(err, Error::Classification(_)));
    }

    #[test]
    fn classification_round_trips_through_json() {
        let p_share = PShare::create(1);
        let n_shares = vec![PShare::create(2).n_share_for(1).unwrap()];
        let material = SigningMaterial::Legacy { p_share, n_shares };
        let parsed = SigningMaterial::classify(&material.to_json().unwrap()).unwrap();
        assert!(matches!(parsed, SigningMaterial::Legacy { .. }));
    }
}
