//! Core types shared across key generation and recovery signing

use k256::{
    ecdsa,
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// One-based index of a party in the custody setup
pub type PartyIdx = usize;

/// The user-controlled offline vault client
pub const USER: PartyIdx = 1;
/// The backup offline vault client
pub const BACKUP: PartyIdx = 2;
/// The custodian service
pub const CUSTODIAN: PartyIdx = 3;

/// All parties participating in key generation
pub const ALL_PARTIES: [PartyIdx; crate::PARTIES] = [USER, BACKUP, CUSTODIAN];

/// Unique identifier for a keygen or signing session
pub type SessionId = [u8; 32];

/// Final ECDSA signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// R component
    pub r: [u8; 32],
    /// S component
    pub s: [u8; 32],
    /// Recovery ID (0 or 1)
    pub recid: u8,
}

impl Signature {
    pub fn new(r: [u8; 32], s: [u8; 32], recid: u8) -> Self {
        Self { r, s, recid }
    }

    /// Hex-encoded r component, as transaction encoders expect
    pub fn r_hex(&self) -> String {
        hex::encode(self.r)
    }

    /// Hex-encoded s component
    pub fn s_hex(&self) -> String {
        hex::encode(self.s)
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    /// Verify this signature over a prehashed digest against a compressed public key
    pub fn verify_prehash(&self, digest: &[u8; 32], public_key: &[u8]) -> Result<()> {
        use k256::ecdsa::signature::hazmat::PrehashVerifier;

        let verifying_key = ecdsa::VerifyingKey::from_sec1_bytes(public_key)
            .map_err(|e| Error::Crypto(format!("Invalid public key: {e}")))?;
        let sig = ecdsa::Signature::from_scalars(
            *k256::FieldBytes::from_slice(&self.r),
            *k256::FieldBytes::from_slice(&self.s),
        )
        .map_err(|e| Error::SignatureConstruction(e.to_string()))?;
        verifying_key
            .verify_prehash(digest, &sig)
            .map_err(|_| Error::SignatureConstruction("signature does not verify".into()))
    }
}

/// Joint public key plus chain code produced by distributed key generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonKeychain {
    /// Compressed public key bytes
    #[serde(with = "point_serde")]
    pub public_key: [u8; 33],
    /// BIP32-style chain code
    pub chain_code: [u8; 32],
}

impl CommonKeychain {
    /// Hex form `<public key || chain code>` used in persisted keychain records
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(130);
        out.push_str(&hex::encode(self.public_key));
        out.push_str(&hex::encode(self.chain_code));
        out
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Deserialization(e.to_string()))?;
        if bytes.len() != 65 {
            return Err(Error::Deserialization(format!(
                "Common keychain must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let mut public_key = [0u8; 33];
        let mut chain_code = [0u8; 32];
        public_key.copy_from_slice(&bytes[..33]);
        chain_code.copy_from_slice(&bytes[33..]);
        Ok(Self {
            public_key,
            chain_code,
        })
    }

    /// Constant-time equality over public key and chain code
    pub fn ct_eq(&self, other: &CommonKeychain) -> bool {
        let pk: bool = self.public_key.ct_eq(&other.public_key).into();
        let cc: bool = self.chain_code.ct_eq(&other.chain_code).into();
        pk && cc
    }
}

/// Which party a persisted keychain record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeychainSource {
    User,
    Backup,
    Custodian,
}

impl KeychainSource {
    pub fn party_idx(&self) -> PartyIdx {
        match self {
            KeychainSource::User => USER,
            KeychainSource::Backup => BACKUP,
            KeychainSource::Custodian => CUSTODIAN,
        }
    }
}

/// Persisted keychain record; all three parties' records must agree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainRecord {
    pub source: KeychainSource,
    /// Always "threshold" for records produced by this crate
    #[serde(rename = "type")]
    pub key_type: String,
    /// Hex `<public key || chain code>`
    pub common_keychain: String,
}

impl KeychainRecord {
    pub fn new(source: KeychainSource, keychain: &CommonKeychain) -> Self {
        Self {
            source,
            key_type: "threshold".into(),
            common_keychain: keychain.to_hex(),
        }
    }
}

/// Serde adapter for `k256::Scalar` fields
pub(crate) mod scalar_serde {
    use k256::{
        elliptic_curve::{bigint::U256, ops::Reduce},
        Scalar,
    };
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(scalar: &Scalar, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = scalar.to_bytes();
        serializer.serialize_bytes(bytes.as_slice())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Scalar, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid scalar length"))?;
        Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
    }
}

/// Serde adapter for compressed 33-byte point fields
///
/// serde's built-in array support stops at 32 elements, so point encodings
/// round-trip through a length-checked byte buffer.
pub(crate) mod point_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(point: &[u8; 33], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(point)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 33], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid point length"))
    }
}

/// Serde adapter for lists of compressed points (polynomial commitments)
pub(crate) mod point_vec_serde {
    use serde::{ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(points: &[[u8; 33]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(points.len()))?;
        for point in points {
            seq.serialize_element(&point[..])?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 33]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Vec<Vec<u8>> = Vec::deserialize(deserializer)?;
        raw.into_iter()
            .map(|bytes| {
                bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("Invalid point length"))
            })
            .collect()
    }
}

/// Decode a compressed SEC1 point
pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    let affine_opt = AffinePoint::from_encoded_point(&encoded);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::Deserialization("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Encode a point in compressed SEC1 form
pub(crate) fn encode_point(point: &ProjectivePoint) -> [u8; 33] {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Reduce a 32-byte digest into a scalar
pub(crate) fn scalar_from_digest(digest: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*digest).into())
}

/// Lagrange coefficient at zero for party `i` within the signing set
pub(crate) fn lagrange_coefficient(party: PartyIdx, signers: &[PartyIdx]) -> Scalar {
    let i = party as u64;
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &j_idx in signers {
        let j = j_idx as u64;
        if j != i {
            numerator *= Scalar::from(j);
            let diff = if j > i {
                Scalar::from(j - i)
            } else {
                -Scalar::from(i - j)
            };
            denominator *= diff;
        }
    }

    numerator * denominator.invert().unwrap_or(Scalar::ONE)
}
