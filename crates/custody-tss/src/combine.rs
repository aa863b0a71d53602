//! Share combination and derivation
//!
//! Aggregates a party's own key share with the N-shares received from its
//! peers into a combined signing key, and applies non-hardened hierarchical
//! derivation to combined keys. Both operations are deterministic for fixed
//! inputs.

use std::collections::BTreeMap;

use k256::{ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{
    decode_point, encode_point, point_serde, point_vec_serde, scalar_serde, ALL_PARTIES,
};
use crate::{CommonKeychain, Error, PartyIdx, Result};

/// Degree-1 polynomial share for the 2-of-3 custody setup
///
/// Created once at key generation and never leaves its owning party.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PShare {
    /// Owning party index
    #[zeroize(skip)]
    pub i: PartyIdx,
    /// Constant term of the secret polynomial
    #[zeroize(skip)]
    #[serde(with = "scalar_serde")]
    u: Scalar,
    /// Degree-1 coefficient
    #[zeroize(skip)]
    #[serde(with = "scalar_serde")]
    c: Scalar,
    /// Feldman commitments to `[u, c]`, compressed
    #[zeroize(skip)]
    #[serde(with = "point_vec_serde")]
    pub commitments: Vec<[u8; 33]>,
    /// This party's chain code contribution
    pub chain_code: [u8; 32],
}

impl PShare {
    /// Sample a fresh share for party `i`
    pub fn create(i: PartyIdx) -> Self {
        use k256::elliptic_curve::Field;

        let mut rng = OsRng;
        let u = Scalar::random(&mut rng);
        let c = Scalar::random(&mut rng);
        let commitments = vec![
            encode_point(&(ProjectivePoint::GENERATOR * u)),
            encode_point(&(ProjectivePoint::GENERATOR * c)),
        ];
        let chain_code: [u8; 32] = rand::random();

        Self {
            i,
            u,
            c,
            commitments,
            chain_code,
        }
    }

    /// Polynomial evaluation at party index `j`
    fn evaluate(&self, j: PartyIdx) -> Scalar {
        self.u + self.c * Scalar::from(j as u64)
    }

    /// Produce the N-share this party sends to peer `j`
    pub fn n_share_for(&self, j: PartyIdx) -> Result<NShare> {
        if j == self.i {
            return Err(Error::InvalidShare(format!(
                "Party {} cannot issue an N-share to itself",
                self.i
            )));
        }
        Ok(NShare {
            i: self.i,
            j,
            value: self.evaluate(j),
            commitments: self.commitments.clone(),
            chain_code: self.chain_code,
        })
    }
}

/// Share sent from party `i` to party `j` during key generation
///
/// Consumed once by the receiving combine step.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct NShare {
    /// Source party index
    #[zeroize(skip)]
    pub i: PartyIdx,
    /// Destination party index
    #[zeroize(skip)]
    pub j: PartyIdx,
    /// Polynomial evaluation at `j`
    #[zeroize(skip)]
    #[serde(with = "scalar_serde")]
    pub value: Scalar,
    /// Source party's Feldman commitments
    #[zeroize(skip)]
    #[serde(with = "point_vec_serde")]
    pub commitments: Vec<[u8; 33]>,
    /// Source party's chain code contribution
    pub chain_code: [u8; 32],
}

impl NShare {
    /// Verify the evaluation against the sender's commitments
    fn verify(&self) -> Result<()> {
        let expected = ProjectivePoint::GENERATOR * self.value;

        let mut actual = ProjectivePoint::IDENTITY;
        let mut x_power = Scalar::ONE;
        let x = Scalar::from(self.j as u64);
        for commitment in &self.commitments {
            actual += decode_point(commitment)? * x_power;
            x_power *= x;
        }

        if expected != actual {
            return Err(Error::InvalidShare(format!(
                "N-share from party {} does not match its commitments",
                self.i
            )));
        }
        Ok(())
    }
}

/// A party's combined secret share plus the joint public components
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct XShare {
    #[zeroize(skip)]
    pub i: PartyIdx,
    /// Combined secret polynomial evaluation at `i`
    #[zeroize(skip)]
    #[serde(with = "scalar_serde")]
    pub x: Scalar,
    /// Joint public key, compressed
    #[zeroize(skip)]
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
    /// Combined chain code
    pub chain_code: [u8; 32],
}

impl XShare {
    pub(crate) fn secret(&self) -> Scalar {
        self.x
    }
}

/// Public share of a peer, kept alongside the combined key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YShare {
    /// Peer party index
    pub j: PartyIdx,
    /// Peer's public polynomial constant term, compressed
    #[serde(with = "point_serde")]
    pub public_share: [u8; 33],
}

/// A party's fully combined signing key
///
/// Derived fresh per signing session from stored shares; not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCombined {
    pub x_share: XShare,
    /// Peer public shares keyed by party index
    pub y_shares: BTreeMap<PartyIdx, YShare>,
}

impl KeyCombined {
    pub fn common_keychain(&self) -> CommonKeychain {
        CommonKeychain {
            public_key: self.x_share.y,
            chain_code: self.x_share.chain_code,
        }
    }
}

/// Output of hierarchical derivation on a combined key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedKeys {
    pub x_share: XShare,
    /// Re-derived public material handed to each peer for cross-checking
    pub n_shares: Vec<DerivedNShare>,
}

/// Public derivation result for one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedNShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    /// Derived joint public key, compressed
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
    /// Derived chain code
    pub chain_code: [u8; 32],
}

/// Aggregate a party's own share with N-shares from every other party
///
/// Fails with [`Error::InvalidShare`] if indices collide, a share is
/// addressed to the wrong party, or a required peer share is absent.
pub fn combine(own: &PShare, peers: &[NShare]) -> Result<KeyCombined> {
    let mut seen: BTreeMap<PartyIdx, &NShare> = BTreeMap::new();
    for share in peers {
        if share.j != own.i {
            return Err(Error::InvalidShare(format!(
                "N-share addressed to party {}, combining for party {}",
                share.j, own.i
            )));
        }
        if share.i == own.i {
            return Err(Error::InvalidShare(format!(
                "N-share claims to originate from combining party {}",
                own.i
            )));
        }
        if seen.insert(share.i, share).is_some() {
            return Err(Error::InvalidShare(format!(
                "Duplicate N-share from party {}",
                share.i
            )));
        }
    }
    for party in ALL_PARTIES {
        if party != own.i && !seen.contains_key(&party) {
            return Err(Error::InvalidShare(format!(
                "Missing N-share from party {party}"
            )));
        }
    }

    let mut x = own.evaluate(own.i);
    let mut y = decode_point(&own.commitments[0])?;
    let mut chain_code = own.chain_code;
    let mut y_shares = BTreeMap::new();

    for (&idx, share) in &seen {
        share.verify()?;
        x += share.value;
        let public_share_point = decode_point(&share.commitments[0])?;
        y += public_share_point;
        for (byte, contribution) in chain_code.iter_mut().zip(share.chain_code.iter()) {
            *byte ^= contribution;
        }
        y_shares.insert(
            idx,
            YShare {
                j: idx,
                public_share: encode_point(&public_share_point),
            },
        );
    }

    Ok(KeyCombined {
        x_share: XShare {
            i: own.i,
            x,
            y: encode_point(&y),
            chain_code,
        },
        y_shares,
    })
}

/// Combine and then apply non-hardened derivation along `path`
///
/// Every party deriving the same path from the same DKG session obtains the
/// same public key and chain code.
pub fn derive(own: &PShare, peers: &[NShare], path: &str) -> Result<DerivedKeys> {
    let combined = combine(own, peers)?;
    derive_combined(&combined, path)
}

/// Apply non-hardened derivation to an already-combined key
pub fn derive_combined(combined: &KeyCombined, path: &str) -> Result<DerivedKeys> {
    use derivation_path::{ChildIndex, DerivationPath};

    let derivation_path: DerivationPath = path
        .parse()
        .map_err(|e| Error::Derivation(format!("Invalid path: {e}")))?;

    let mut x = combined.x_share.secret();
    let mut y = decode_point(&combined.x_share.y)?;
    let mut chain_code = combined.x_share.chain_code;

    for child_index in derivation_path.into_iter() {
        let index = match child_index {
            ChildIndex::Normal(idx) => *idx,
            ChildIndex::Hardened(_) => {
                return Err(Error::Derivation(
                    "Hardened derivation not supported in threshold setting".into(),
                ));
            }
        };

        let (tweak, new_chain_code) = derivation_tweak(&encode_point(&y), &chain_code, index)?;
        // Lagrange weights over any signing pair sum to one, so adding the
        // full tweak to each party's evaluation shifts the joint secret by
        // exactly the tweak.
        x += tweak;
        y += ProjectivePoint::GENERATOR * tweak;
        chain_code = new_chain_code;
    }

    let x_share = XShare {
        i: combined.x_share.i,
        x,
        y: encode_point(&y),
        chain_code,
    };

    let n_shares = combined
        .y_shares
        .keys()
        .map(|&peer| DerivedNShare {
            i: combined.x_share.i,
            j: peer,
            y: x_share.y,
            chain_code,
        })
        .collect();

    Ok(DerivedKeys { x_share, n_shares })
}

/// HMAC-SHA512 child tweak for non-hardened derivation
pub(crate) fn derivation_tweak(
    public_key: &[u8; 33],
    chain_code: &[u8; 32],
    index: u32,
) -> Result<(Scalar, [u8; 32])> {
    use hmac::{Hmac, Mac};
    use k256::elliptic_curve::{bigint::U256, ops::Reduce};
    use sha2::Sha512;

    let mut hmac =
        Hmac::<Sha512>::new_from_slice(chain_code).map_err(|e| Error::Derivation(e.to_string()))?;
    hmac.update(public_key);
    hmac.update(&index.to_be_bytes());
    let result = hmac.finalize().into_bytes();

    let tweak_bytes: [u8; 32] = result[..32]
        .try_into()
        .map_err(|_| Error::Internal("HMAC output too short".into()))?;
    let tweak = <Scalar as Reduce<U256>>::reduce_bytes(&tweak_bytes.into());
    let new_chain_code: [u8; 32] = result[32..]
        .try_into()
        .map_err(|_| Error::Internal("HMAC output too short".into()))?;

    Ok((tweak, new_chain_code))
}

/// Byte-for-byte comparison of two independently combined keys
///
/// Mismatch signals tampering or a corrupted backup and must hard-fail.
pub fn verify_common_keychain(a: &KeyCombined, b: &KeyCombined) -> Result<()> {
    if !a.common_keychain().ct_eq(&b.common_keychain()) {
        return Err(Error::CommonKeychainMismatch(format!(
            "party {} and party {} derived different keychains",
            a.x_share.i, b.x_share.i
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{BACKUP, CUSTODIAN, USER};

    /// Build a full 3-party share set: (p_shares, n_shares addressed per party)
    pub(crate) fn fixture() -> (Vec<PShare>, BTreeMap<PartyIdx, Vec<NShare>>) {
        let p_shares: Vec<PShare> = ALL_PARTIES.iter().map(|&i| PShare::create(i)).collect();
        let mut inbox: BTreeMap<PartyIdx, Vec<NShare>> = BTreeMap::new();
        for p in &p_shares {
            for &j in &ALL_PARTIES {
                if j != p.i {
                    inbox.entry(j).or_default().push(p.n_share_for(j).unwrap());
                }
            }
        }
        (p_shares, inbox)
    }

    #[test]
    fn combine_is_deterministic() {
        let (p_shares, inbox) = fixture();
        let a = combine(&p_shares[0], &inbox[&USER]).unwrap();
        let b = combine(&p_shares[0], &inbox[&USER]).unwrap();
        assert_eq!(a.common_keychain().to_hex(), b.common_keychain().to_hex());
    }

    #[test]
    fn all_parties_combine_to_same_keychain() {
        let (p_shares, inbox) = fixture();
        let user = combine(&p_shares[0], &inbox[&USER]).unwrap();
        let backup = combine(&p_shares[1], &inbox[&BACKUP]).unwrap();
        let custodian = combine(&p_shares[2], &inbox[&CUSTODIAN]).unwrap();
        verify_common_keychain(&user, &backup).unwrap();
        verify_common_keychain(&backup, &custodian).unwrap();
    }

    #[test]
    fn perturbed_share_fails_verification() {
        let (p_shares, inbox) = fixture();
        let mut shares = inbox[&USER].clone();
        shares[0].chain_code[0] ^= 1;
        // Chain code perturbation slips past Feldman but must be caught by
        // the cross-party keychain comparison.
        let user = combine(&p_shares[0], &shares).unwrap();
        let backup = combine(&p_shares[1], &inbox[&BACKUP]).unwrap();
        let err = verify_common_keychain(&user, &backup).unwrap_err();
        assert!(matches!(err, Error::CommonKeychainMismatch(_)));

        let mut shares = inbox[&USER].clone();
        shares[0].value += Scalar::ONE;
        let err = combine(&p_shares[0], &shares).unwrap_err();
        assert!(matches!(err, Error::InvalidShare(_)));
    }

    #[test]
    fn combine_rejects_missing_and_mismatched_shares() {
        let (p_shares, inbox) = fixture();

        let only_one = &inbox[&USER][..1];
        assert!(matches!(
            combine(&p_shares[0], only_one).unwrap_err(),
            Error::InvalidShare(_)
        ));

        // Shares addressed to the backup must not combine for the user.
        assert!(matches!(
            combine(&p_shares[0], &inbox[&BACKUP]).unwrap_err(),
            Error::InvalidShare(_)
        ));

        let mut duplicated = inbox[&USER].clone();
        duplicated.push(duplicated[0].clone());
        assert!(matches!(
            combine(&p_shares[0], &duplicated).unwrap_err(),
            Error::InvalidShare(_)
        ));
    }

    #[test]
    fn independent_derivations_agree() {
        let (p_shares, inbox) = fixture();
        let user = derive(&p_shares[0], &inbox[&USER], "m/0/1/42").unwrap();
        let backup = derive(&p_shares[1], &inbox[&BACKUP], "m/0/1/42").unwrap();
        assert_eq!(user.x_share.y, backup.x_share.y);
        assert_eq!(user.x_share.chain_code, backup.x_share.chain_code);
        assert_eq!(user.n_shares.len(), 2);
    }

    #[test]
    fn derive_rejects_hardened_components() {
        let (p_shares, inbox) = fixture();
        let err = derive(&p_shares[0], &inbox[&USER], "m/0'/1").unwrap_err();
        assert!(matches!(err, Error::Derivation(_)));
    }

    #[test]
    fn derived_secret_matches_derived_public() {
        use crate::types::lagrange_coefficient;

        let (p_shares, inbox) = fixture();
        let user = derive(&p_shares[0], &inbox[&USER], "m/0/5").unwrap();
        let backup = derive(&p_shares[1], &inbox[&BACKUP], "m/0/5").unwrap();

        let signers = [USER, BACKUP];
        let secret = lagrange_coefficient(USER, &signers) * user.x_share.secret()
            + lagrange_coefficient(BACKUP, &signers) * backup.x_share.secret();
        let public = encode_point(&(ProjectivePoint::GENERATOR * secret));
        assert_eq!(public, user.x_share.y);
    }
}
