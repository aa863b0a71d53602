//! Reduced-share two-party signing
//!
//! The newer key-share format carries only an additive share of the joint
//! secret, with no polynomial or custodian material. Signing runs a compact
//! multiplicative-nonce round protocol between the user and backup shares
//! and renders the result as a `recid:r:s:y` string, the form the recovery
//! orchestrator parses back into a [`Signature`].

use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        scalar::IsHigh,
        sec1::ToEncodedPoint,
        Field,
    },
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::combine::derivation_tweak;
use crate::types::{
    decode_point, encode_point, point_serde, scalar_from_digest, scalar_serde, BACKUP, USER,
};
use crate::{Error, PartyIdx, Result, Signature};

/// Additive share of the joint secret in the 2-party-only format
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ReducedKeyShare {
    #[zeroize(skip)]
    pub i: PartyIdx,
    /// This party's additive share of the joint secret
    #[zeroize(skip)]
    #[serde(with = "scalar_serde")]
    pub(crate) x: Scalar,
    /// Joint public key, compressed
    #[zeroize(skip)]
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
    /// Joint chain code
    pub chain_code: [u8; 32],
}

impl ReducedKeyShare {
    /// Apply non-hardened derivation along `path`
    ///
    /// The user share absorbs the full child tweak and the backup share is
    /// left untouched, so the pair's sum shifts by exactly the tweak and
    /// both parties agree on the derived public key.
    pub fn derive(&self, path: &str) -> Result<ReducedKeyShare> {
        use derivation_path::{ChildIndex, DerivationPath};

        let derivation_path: DerivationPath = path
            .parse()
            .map_err(|e| Error::Derivation(format!("Invalid path: {e}")))?;

        let mut x = self.x;
        let mut y = decode_point(&self.y)?;
        let mut chain_code = self.chain_code;

        for child_index in derivation_path.into_iter() {
            let index = match child_index {
                ChildIndex::Normal(idx) => *idx,
                ChildIndex::Hardened(_) => {
                    return Err(Error::Derivation(
                        "Hardened derivation not supported in threshold setting".into(),
                    ));
                }
            };
            let (tweak, new_chain_code) =
                derivation_tweak(&encode_point(&y), &chain_code, index)?;
            if self.i == USER {
                x += tweak;
            }
            y += ProjectivePoint::GENERATOR * tweak;
            chain_code = new_chain_code;
        }

        Ok(ReducedKeyShare {
            i: self.i,
            x,
            y: encode_point(&y),
            chain_code,
        })
    }
}

/// Two-party signer over a pair of reduced key shares
#[derive(Debug)]
pub struct ReducedShareSigner {
    user: ReducedKeyShare,
    backup: ReducedKeyShare,
}

impl ReducedShareSigner {
    /// Pair the user and backup shares, rejecting inconsistent material
    pub fn new(user: ReducedKeyShare, backup: ReducedKeyShare) -> Result<Self> {
        if user.i != USER || backup.i != BACKUP {
            return Err(Error::InvalidShare(format!(
                "Reduced shares must be the user/backup pair, got parties {} and {}",
                user.i, backup.i
            )));
        }
        if user.y != backup.y || user.chain_code != backup.chain_code {
            return Err(Error::CommonKeychainMismatch(
                "User and backup reduced shares disagree on the joint keychain".into(),
            ));
        }
        let joint = ProjectivePoint::GENERATOR * (user.x + backup.x);
        if encode_point(&joint) != user.y {
            return Err(Error::InvalidShare(
                "Reduced share sum does not match the joint public key".into(),
            ));
        }
        Ok(Self { user, backup })
    }

    /// Joint public key of the key derived at `path`
    pub fn derived_public_key(&self, path: &str) -> Result<[u8; 33]> {
        Ok(self.user.derive(path)?.y)
    }

    /// Run the internal round protocol and render `recid:r:s:y`
    #[instrument(skip(self, digest))]
    pub fn sign_to_string(&self, path: &str, digest: &[u8; 32]) -> Result<String> {
        let user = self.user.derive(path)?;
        let backup = self.backup.derive(path)?;
        if user.y != backup.y {
            return Err(Error::CommonKeychainMismatch(
                "Derived reduced shares disagree on the joint public key".into(),
            ));
        }

        let mut rng = OsRng;

        // Round 1: the user opens the session with a blinded nonce point.
        let k_a = Scalar::random(&mut rng);
        let big_r_a = ProjectivePoint::GENERATOR * k_a;

        // Round 2: the backup completes the nonce R = k_b * (k_a * G),
        // reshares its cross product with the user's key share, and folds
        // in its own key share.
        let k_b = Scalar::random(&mut rng);
        let big_r = big_r_a * k_b;
        let r_encoded = big_r.to_affine().to_encoded_point(false);
        let r_coord: [u8; 32] = r_encoded.as_bytes()[1..33]
            .try_into()
            .map_err(|_| Error::Internal("Invalid nonce point encoding".into()))?;
        let r = <Scalar as Reduce<U256>>::reduce_bytes(&r_coord.into());
        let mut recid: u8 = if encode_point(&big_r)[0] == 0x03 { 1 } else { 0 };

        let k_b_inv = invert(&k_b)?;
        let (t_a, t_b) = reshare_product(k_b_inv * r, user.x);
        let m = scalar_from_digest(digest);
        let c_b = k_b_inv * (m + r * backup.x) + t_b;

        // Round 3: the user finishes the signature with its nonce inverse.
        let s_raw = invert(&k_a)? * (c_b + t_a);
        let mut s = s_raw;
        if bool::from(s.is_high()) {
            s = -s;
            recid ^= 1;
        }

        let signature = Signature::new(r.to_bytes().into(), s.to_bytes().into(), recid);
        signature.verify_prehash(digest, &user.y).map_err(|_| {
            Error::SignatureConstruction(
                "Reduced-share signature does not verify against the joint key".into(),
            )
        })?;

        debug!("Produced reduced-share signature");
        Ok(format!(
            "{recid}:{}:{}:{}",
            signature.r_hex(),
            signature.s_hex(),
            hex::encode(user.y)
        ))
    }
}

/// Reshare a two-factor product into additive halves
fn reshare_product(left: Scalar, right: Scalar) -> (Scalar, Scalar) {
    let t_b = Scalar::random(&mut OsRng);
    (left * right - t_b, t_b)
}

fn invert(scalar: &Scalar) -> Result<Scalar> {
    Option::<Scalar>::from(scalar.invert())
        .ok_or_else(|| Error::Crypto("Nonce share is not invertible".into()))
}

/// Parse a `recid:r:s:y` signature string
pub fn parse_signature_string(rendered: &str) -> Result<(Signature, [u8; 33])> {
    let parts: Vec<&str> = rendered.split(':').collect();
    let [recid, r, s, y] = parts.as_slice() else {
        return Err(Error::Deserialization(format!(
            "Signature string must have 4 segments, got {}",
            parts.len()
        )));
    };

    let recid: u8 = recid
        .parse()
        .map_err(|_| Error::Deserialization("Invalid recovery id segment".into()))?;
    if recid > 1 {
        return Err(Error::Deserialization(format!(
            "Recovery id must be 0 or 1, got {recid}"
        )));
    }
    let r = decode_fixed::<32>(r, "r")?;
    let s = decode_fixed::<32>(s, "s")?;
    let y = decode_fixed::<33>(y, "public key")?;

    Ok((Signature::new(r, s, recid), y))
}

fn decode_fixed<const N: usize>(hex_str: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str)
        .map_err(|_| Error::Deserialization(format!("Invalid {what} segment")))?;
    bytes
        .try_into()
        .map_err(|_| Error::Deserialization(format!("Invalid {what} length")))
}
