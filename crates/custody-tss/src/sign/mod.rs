//! Two-party recovery signing
//!
//! Recovery deliberately excludes the custodian, so the signature is built
//! from a symmetric exchange between the user and backup shares: nonce
//! sharing, two multiplicative-to-additive conversion passes, share
//! combination, and final assembly. Every intermediate share is scoped to a
//! single session and a single message digest.

mod protocol;

pub use protocol::{
    construct_signature, sign, sign_combine, sign_convert_step1, sign_convert_step2,
    sign_convert_step3, sign_share,
};

use k256::Scalar;
use serde::{Deserialize, Serialize};

use crate::types::{point_serde, scalar_serde};
use crate::PartyIdx;

/// Index pair identifying which party originated which share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignIndex {
    /// Owning party
    pub i: PartyIdx,
    /// Counterparty
    pub j: PartyIdx,
}

/// Nonce share sent to the counterparty at the start of a conversion pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) k: Scalar,
    /// Commitment to the sender's nonce mask
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
}

/// Witness material kept by the party that produced a [`KShare`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) k: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) gamma: Scalar,
    /// Lagrange-weighted key share
    #[serde(with = "scalar_serde")]
    pub(crate) w: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
    /// Joint public key the session signs under
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
}

/// Conversion response returned to the nonce sharer
///
/// Carries the converter's additive contributions; never reveal the raw
/// values to any third party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) k: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
    #[serde(with = "scalar_serde")]
    pub(crate) alpha: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) mu: Scalar,
}

/// Conversion state kept by the converter between step 1 and step 3
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) k: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) gamma: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) w: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) beta: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) nu: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
    /// Nonce-mask commitment received from the sharer
    #[serde(with = "point_serde")]
    pub peer_gamma_point: [u8; 33],
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
}

/// Second conversion pass output, sent from the sharer back to the converter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) alpha: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) mu: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
}

/// Fully converted per-party share, ready for combination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) k: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) gamma: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) w: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) alpha: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) mu: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) beta: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) nu: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
    #[serde(with = "point_serde")]
    pub peer_gamma_point: [u8; 33],
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
}

/// Collapsed signing share kept by its owner for the final signing step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OShare {
    pub i: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) k: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) omicron: Scalar,
    #[serde(with = "scalar_serde")]
    pub(crate) delta: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
    /// Digest this share has been consumed for; signing under a second
    /// digest is rejected
    #[serde(default)]
    pub(crate) consumed_for: Option<[u8; 32]>,
}

/// Collapsed share sent to the counterparty for its final signing step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DShare {
    pub i: PartyIdx,
    pub j: PartyIdx,
    #[serde(with = "scalar_serde")]
    pub(crate) delta: Scalar,
    #[serde(with = "point_serde")]
    pub gamma_point: [u8; 33],
}

/// One directional half of the final signature, bound to a message digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSignature {
    pub i: PartyIdx,
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// Parity of the nonce point, before low-s normalization
    pub recid: u8,
    #[serde(with = "point_serde")]
    pub y: [u8; 33],
    pub digest: [u8; 32],
}
