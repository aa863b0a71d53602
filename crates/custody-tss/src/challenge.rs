//! Signing-session challenges
//!
//! Range-proof and encryption-soundness setup data that must be bound to a
//! key share before the share may enter any multiplicative conversion step.
//! Challenges are single-use: binding one to a second share is rejected.

use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::combine::{XShare, YShare};
use crate::{Error, Result};

/// Byte length of the range-proof modulus (2048 bits)
pub const MODULUS_BYTES: usize = 256;

/// Number of soundness values derived per Paillier challenge
pub const PAILLIER_CHALLENGE_COUNT: usize = 16;

/// Range-proof setup bundle: modulus and two commitment bases
///
/// Generation is CPU-bound and should be kept off latency-sensitive paths;
/// callers in async contexts wrap it in `spawn_blocking`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeProofChallenge {
    pub ntilde: Vec<u8>,
    pub h1: Vec<u8>,
    pub h2: Vec<u8>,
    #[serde(default)]
    consumed: bool,
}

/// Soundness proof that a peer's public encryption modulus is well-formed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaillierChallenge {
    /// Values derived deterministically from the peer modulus
    pub p: Vec<Vec<u8>>,
    #[serde(default)]
    consumed: bool,
}

/// Produce a fresh range-proof setup bundle
#[instrument]
pub fn generate_range_proof_challenge() -> RangeProofChallenge {
    let mut rng = OsRng;

    let mut ntilde = vec![0u8; MODULUS_BYTES];
    rng.fill_bytes(&mut ntilde);
    // Force the modulus odd and full-width.
    ntilde[0] |= 0x80;
    ntilde[MODULUS_BYTES - 1] |= 0x01;

    let mut h1 = vec![0u8; MODULUS_BYTES];
    let mut h2 = vec![0u8; MODULUS_BYTES];
    rng.fill_bytes(&mut h1);
    rng.fill_bytes(&mut h2);

    debug!("Generated range proof challenge");
    RangeProofChallenge {
        ntilde,
        h1,
        h2,
        consumed: false,
    }
}

/// Produce a soundness challenge for a peer's encryption modulus
///
/// Deterministic in the peer modulus, so both sides can recompute and audit
/// the same challenge values.
#[instrument(skip(peer_modulus))]
pub fn generate_paillier_challenge(peer_modulus: &[u8]) -> Result<PaillierChallenge> {
    if peer_modulus.len() != MODULUS_BYTES {
        return Err(Error::Crypto(format!(
            "Peer modulus must be {MODULUS_BYTES} bytes, got {}",
            peer_modulus.len()
        )));
    }

    let seed: [u8; 32] = Sha256::digest(peer_modulus).into();
    let mut rng = ChaCha20Rng::from_seed(seed);

    let p = (0..PAILLIER_CHALLENGE_COUNT)
        .map(|_| {
            let mut value = vec![0u8; MODULUS_BYTES];
            rng.fill_bytes(&mut value);
            value
        })
        .collect();

    debug!("Generated paillier challenge");
    Ok(PaillierChallenge { p, consumed: false })
}

/// Generate both session challenges for one share
///
/// Runs the two generations in parallel when the `multi-thread` feature is
/// enabled.
pub fn generate_challenge_pair(
    peer_modulus: &[u8],
) -> Result<(RangeProofChallenge, PaillierChallenge)> {
    #[cfg(feature = "multi-thread")]
    {
        let (range, paillier) = rayon::join(
            generate_range_proof_challenge,
            || generate_paillier_challenge(peer_modulus),
        );
        Ok((range, paillier?))
    }
    #[cfg(not(feature = "multi-thread"))]
    {
        Ok((
            generate_range_proof_challenge(),
            generate_paillier_challenge(peer_modulus)?,
        ))
    }
}

/// A key share with its session challenges bound
///
/// Only augmented shares are accepted by the signing protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentedXShare {
    pub x_share: XShare,
    pub ntilde: Vec<u8>,
    pub h1: Vec<u8>,
    pub h2: Vec<u8>,
    pub p: Vec<Vec<u8>>,
}

/// A peer share with its session challenges bound
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentedYShare {
    pub y_share: YShare,
    pub ntilde: Vec<u8>,
    pub h1: Vec<u8>,
    pub h2: Vec<u8>,
    pub p: Vec<Vec<u8>>,
}

/// Bind both challenges onto a party's own combined share
///
/// Each challenge may be bound exactly once; a second bind fails with
/// [`Error::ShareReuse`].
pub fn append_challenge(
    x_share: &XShare,
    range: &mut RangeProofChallenge,
    paillier: &mut PaillierChallenge,
) -> Result<AugmentedXShare> {
    consume(&mut range.consumed, "range proof challenge")?;
    consume(&mut paillier.consumed, "paillier challenge")?;
    Ok(AugmentedXShare {
        x_share: x_share.clone(),
        ntilde: range.ntilde.clone(),
        h1: range.h1.clone(),
        h2: range.h2.clone(),
        p: paillier.p.clone(),
    })
}

/// Bind both challenges onto a peer share
pub fn append_challenge_y(
    y_share: &YShare,
    range: &mut RangeProofChallenge,
    paillier: &mut PaillierChallenge,
) -> Result<AugmentedYShare> {
    consume(&mut range.consumed, "range proof challenge")?;
    consume(&mut paillier.consumed, "paillier challenge")?;
    Ok(AugmentedYShare {
        y_share: y_share.clone(),
        ntilde: range.ntilde.clone(),
        h1: range.h1.clone(),
        h2: range.h2.clone(),
        p: paillier.p.clone(),
    })
}

fn consume(flag: &mut bool, what: &str) -> Result<()> {
    if *flag {
        return Err(Error::ShareReuse(format!("{what} already bound to a share")));
    }
    *flag = true;
    Ok(())
}
