//! Signing protocol operations
//!
//! The multi-round 2-party signature computation: nonce sharing, the three
//! conversion passes, share combination, directional signing, and final
//! signature assembly.

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
use tracing::{debug, instrument};

use super::{
    AShare, BShare, DShare, GShare, KShare, MuShare, OShare, PartialSignature, SignIndex, WShare,
};
use crate::challenge::{AugmentedXShare, AugmentedYShare};
use crate::types::{decode_point, encode_point, lagrange_coefficient, scalar_from_digest};
use crate::{Error, Result, Signature};

/// Produce this party's multiplicative nonce and witness shares
///
/// The returned [`KShare`] goes to the counterparty named by the Y-share;
/// the [`WShare`] stays with the caller for the second conversion pass.
#[instrument(skip_all, fields(i = x.x_share.i, j = y.y_share.j))]
pub fn sign_share(x: &AugmentedXShare, y: &AugmentedYShare) -> Result<(KShare, WShare)> {
    let i = x.x_share.i;
    let j = y.y_share.j;
    if i == j {
        return Err(Error::InvalidShare(format!(
            "Cannot open a signing session from party {i} to itself"
        )));
    }

    let mut rng = OsRng;
    let k = Scalar::random(&mut rng);
    let gamma = Scalar::random(&mut rng);
    let gamma_point = encode_point(&(ProjectivePoint::GENERATOR * gamma));
    let w = lagrange_coefficient(i, &[i, j]) * x.x_share.secret();

    debug!("Created nonce and witness shares");
    Ok((
        KShare {
            i,
            j,
            k,
            gamma_point,
        },
        WShare {
            i,
            j,
            k,
            gamma,
            w,
            gamma_point,
            y: x.x_share.y,
        },
    ))
}

/// First conversion pass, run by the party receiving a peer's [`KShare`]
///
/// Converts the peer's nonce against this party's key material, producing
/// the response returned to the peer and the state retained for step 3.
#[instrument(skip_all, fields(i = x.x_share.i, peer = k_share.i))]
pub fn sign_convert_step1(
    x: &AugmentedXShare,
    y: &AugmentedYShare,
    k_share: KShare,
) -> Result<(AShare, BShare)> {
    let i = x.x_share.i;
    let j = k_share.i;
    if k_share.j != i {
        return Err(Error::InvalidShare(format!(
            "K-share addressed to party {}, converting at party {i}",
            k_share.j
        )));
    }
    if y.y_share.j != j {
        return Err(Error::InvalidShare(format!(
            "K-share from party {j} does not match Y-share for party {}",
            y.y_share.j
        )));
    }

    let mut rng = OsRng;
    let k = Scalar::random(&mut rng);
    let gamma = Scalar::random(&mut rng);
    let gamma_point = encode_point(&(ProjectivePoint::GENERATOR * gamma));
    let w = lagrange_coefficient(i, &[i, j]) * x.x_share.secret();

    // Reshare the peer-nonce products additively: the peer receives the
    // masked sums, this party keeps the negated masks.
    let beta_tag = Scalar::random(&mut rng);
    let nu_tag = Scalar::random(&mut rng);
    let alpha = k_share.k * gamma + beta_tag;
    let mu = k_share.k * w + nu_tag;

    debug!("Converted peer nonce share");
    Ok((
        AShare {
            i,
            j,
            k,
            gamma_point,
            alpha,
            mu,
        },
        BShare {
            i,
            j,
            k,
            gamma,
            w,
            beta: -beta_tag,
            nu: -nu_tag,
            gamma_point,
            peer_gamma_point: k_share.gamma_point,
            y: x.x_share.y,
        },
    ))
}

/// Second conversion pass, run by the original nonce sharer
///
/// Folds the converter's response into this party's witness material and
/// produces the symmetric response for the converter, completing this
/// party's converted share.
#[instrument(skip_all, fields(i = w_share.i, peer = a_share.i))]
pub fn sign_convert_step2(a_share: AShare, w_share: WShare) -> Result<(MuShare, GShare)> {
    if a_share.j != w_share.i || a_share.i != w_share.j {
        return Err(Error::InvalidShare(format!(
            "A-share indices ({}, {}) do not pair with W-share indices ({}, {})",
            a_share.i, a_share.j, w_share.i, w_share.j
        )));
    }

    let mut rng = OsRng;
    let beta_tag = Scalar::random(&mut rng);
    let nu_tag = Scalar::random(&mut rng);
    let alpha = a_share.k * w_share.gamma + beta_tag;
    let mu = a_share.k * w_share.w + nu_tag;

    debug!("Folded converter response into witness");
    Ok((
        MuShare {
            i: w_share.i,
            j: a_share.i,
            alpha,
            mu,
            gamma_point: w_share.gamma_point,
        },
        GShare {
            i: w_share.i,
            j: a_share.i,
            k: w_share.k,
            gamma: w_share.gamma,
            w: w_share.w,
            alpha: a_share.alpha,
            mu: a_share.mu,
            beta: -beta_tag,
            nu: -nu_tag,
            gamma_point: w_share.gamma_point,
            peer_gamma_point: a_share.gamma_point,
            y: w_share.y,
        },
    ))
}

/// Third conversion pass, completing the converter's share
#[instrument(skip_all, fields(i = b_share.i, peer = mu_share.i))]
pub fn sign_convert_step3(mu_share: MuShare, b_share: BShare) -> Result<(GShare, SignIndex)> {
    if mu_share.j != b_share.i || mu_share.i != b_share.j {
        return Err(Error::InvalidShare(format!(
            "Mu-share indices ({}, {}) do not pair with B-share indices ({}, {})",
            mu_share.i, mu_share.j, b_share.i, b_share.j
        )));
    }
    if mu_share.gamma_point != b_share.peer_gamma_point {
        return Err(Error::InvalidShare(
            "Peer nonce-mask commitment changed between conversion passes".into(),
        ));
    }

    let sign_index = SignIndex {
        i: b_share.i,
        j: b_share.j,
    };
    Ok((
        GShare {
            i: b_share.i,
            j: b_share.j,
            k: b_share.k,
            gamma: b_share.gamma,
            w: b_share.w,
            alpha: mu_share.alpha,
            mu: mu_share.mu,
            beta: b_share.beta,
            nu: b_share.nu,
            gamma_point: b_share.gamma_point,
            peer_gamma_point: mu_share.gamma_point,
            y: b_share.y,
        },
        sign_index,
    ))
}

/// Collapse a converted share into the two values needed for final signing
pub fn sign_combine(g_share: GShare, sign_index: SignIndex) -> Result<(OShare, DShare)> {
    if g_share.i != sign_index.i || g_share.j != sign_index.j {
        return Err(Error::InvalidShare(format!(
            "G-share indices ({}, {}) do not match sign index ({}, {})",
            g_share.i, g_share.j, sign_index.i, sign_index.j
        )));
    }

    let delta = g_share.k * g_share.gamma + g_share.alpha + g_share.beta;
    let omicron = g_share.k * g_share.w + g_share.mu + g_share.nu;

    Ok((
        OShare {
            i: g_share.i,
            k: g_share.k,
            omicron,
            delta,
            gamma_point: g_share.gamma_point,
            y: g_share.y,
            consumed_for: None,
        },
        DShare {
            i: g_share.i,
            j: g_share.j,
            delta,
            gamma_point: g_share.gamma_point,
        },
    ))
}

/// Produce one directional partial signature over a message digest
///
/// Takes the caller's own [`OShare`] and the counterparty's [`DShare`].
/// An O-share already consumed for a different digest is rejected; the
/// nonce it carries must never cover two messages.
#[instrument(skip_all, fields(i = o_share.i))]
pub fn sign(
    digest: &[u8; 32],
    o_share: &mut OShare,
    d_share: &DShare,
) -> Result<PartialSignature> {
    if d_share.j != o_share.i {
        return Err(Error::InvalidShare(format!(
            "D-share addressed to party {}, signing at party {}",
            d_share.j, o_share.i
        )));
    }
    if let Some(prev) = o_share.consumed_for {
        if prev != *digest {
            return Err(Error::ShareReuse(format!(
                "O-share of party {} already consumed for a different digest",
                o_share.i
            )));
        }
    }
    o_share.consumed_for = Some(*digest);

    let delta = o_share.delta + d_share.delta;
    let delta_inv = Option::<Scalar>::from(delta.invert())
        .ok_or_else(|| Error::Crypto("Joint delta is not invertible".into()))?;

    let big_r = (decode_point(&o_share.gamma_point)? + decode_point(&d_share.gamma_point)?)
        * delta_inv;
    let r_encoded = big_r.to_affine().to_encoded_point(false);
    let r_coord: [u8; 32] = r_encoded.as_bytes()[1..33]
        .try_into()
        .map_err(|_| Error::Internal("Invalid nonce point encoding".into()))?;
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&r_coord.into());

    let recid = if encode_point(&big_r)[0] == 0x03 { 1 } else { 0 };

    let m = scalar_from_digest(digest);
    let s = m * o_share.k + r * o_share.omicron;

    debug!("Produced partial signature");
    Ok(PartialSignature {
        i: o_share.i,
        r: r.to_bytes().into(),
        s: s.to_bytes().into(),
        recid,
        y: o_share.y,
        digest: *digest,
    })
}

/// Deterministically combine the two directional halves into `(r, s, recid)`
///
/// The only step allowed to fail on an invalid combination; any
/// inconsistency yields [`Error::SignatureConstruction`] and no signature.
#[instrument(skip_all)]
pub fn construct_signature(partials: &[PartialSignature]) -> Result<Signature> {
    let [a, b] = partials else {
        return Err(Error::SignatureConstruction(format!(
            "Expected exactly 2 partial signatures, got {}",
            partials.len()
        )));
    };

    if a.i == b.i {
        return Err(Error::SignatureConstruction(
            "Both partial signatures originate from the same party".into(),
        ));
    }
    if a.r != b.r || a.recid != b.recid {
        return Err(Error::SignatureConstruction(
            "Partial signatures disagree on the nonce point".into(),
        ));
    }
    if a.y != b.y || a.digest != b.digest {
        return Err(Error::SignatureConstruction(
            "Partial signatures are bound to different keys or digests".into(),
        ));
    }

    let s_a = <Scalar as Reduce<U256>>::reduce_bytes(&a.s.into());
    let s_b = <Scalar as Reduce<U256>>::reduce_bytes(&b.s.into());
    let mut s = s_a + s_b;
    let mut recid = a.recid;
    if bool::from(s.is_high()) {
        s = -s;
        recid ^= 1;
    }

    let signature = Signature::new(a.r, s.to_bytes().into(), recid);
    signature.verify_prehash(&a.digest, &a.y).map_err(|_| {
        Error::SignatureConstruction("Combined signature does not verify against the joint key".into())
    })?;

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{append_challenge, append_challenge_y, generate_challenge_pair};
    use crate::combine::{combine, tests::fixture, KeyCombined};
    use crate::types::{BACKUP, USER};

    fn augmented(combined: &KeyCombined, peer: usize) -> (AugmentedXShare, AugmentedYShare) {
        let (mut range_x, mut paillier_x) =
            generate_challenge_pair(&crate::challenge::generate_range_proof_challenge().ntilde)
                .unwrap();
        let (mut range_y, mut paillier_y) =
            generate_challenge_pair(&crate::challenge::generate_range_proof_challenge().ntilde)
                .unwrap();
        let x = append_challenge(&combined.x_share, &mut range_x, &mut paillier_x).unwrap();
        let y =
            append_challenge_y(&combined.y_shares[&peer], &mut range_y, &mut paillier_y).unwrap();
        (x, y)
    }

    /// Full two-direction pipeline over `digest`, returning both O-shares
    /// and D-shares; mirrors the recovery flow.
    pub(crate) fn run_pipeline(
        user: &KeyCombined,
        backup: &KeyCombined,
    ) -> ((OShare, DShare), (OShare, DShare)) {
        let (user_x, user_y) = augmented(user, BACKUP);
        let (backup_x, backup_y) = augmented(backup, USER);

        let (k_share, w_share) = sign_share(&user_x, &user_y).unwrap();
        let (a_share, b_share) = sign_convert_step1(&backup_x, &backup_y, k_share).unwrap();
        let (mu_share, user_g) = sign_convert_step2(a_share, w_share).unwrap();
        let (backup_g, backup_index) = sign_convert_step3(mu_share, b_share).unwrap();

        let user_index = SignIndex { i: USER, j: BACKUP };
        let user_combined = sign_combine(user_g, user_index).unwrap();
        let backup_combined = sign_combine(backup_g, backup_index).unwrap();
        (user_combined, backup_combined)
    }

    #[test]
    fn end_to_end_signature_verifies() {
        let (p_shares, inbox) = fixture();
        let user = combine(&p_shares[0], &inbox[&USER]).unwrap();
        let backup = combine(&p_shares[1], &inbox[&BACKUP]).unwrap();

        let digest = [0x42u8; 32];
        let ((mut user_o, user_d), (mut backup_o, backup_d)) = run_pipeline(&user, &backup);

        let sign_a = sign(&digest, &mut user_o, &backup_d).unwrap();
        let sign_b = sign(&digest, &mut backup_o, &user_d).unwrap();
        let signature = construct_signature(&[sign_a, sign_b]).unwrap();

        signature
            .verify_prehash(&digest, &user.x_share.y)
            .unwrap();
    }

    #[test]
    fn o_share_rejects_second_digest() {
        let (p_shares, inbox) = fixture();
        let user = combine(&p_shares[0], &inbox[&USER]).unwrap();
        let backup = combine(&p_shares[1], &inbox[&BACKUP]).unwrap();

        let ((mut user_o, _), (_, backup_d)) = run_pipeline(&user, &backup);

        sign(&[1u8; 32], &mut user_o, &backup_d).unwrap();
        // Same digest again is a harmless retry.
        sign(&[1u8; 32], &mut user_o, &backup_d).unwrap();
        let err = sign(&[2u8; 32], &mut user_o, &backup_d).unwrap_err();
        assert!(matches!(err, Error::ShareReuse(_)));
    }

    #[test]
    fn convert_steps_reject_mismatched_indices() {
        let (p_shares, inbox) = fixture();
        let user = combine(&p_shares[0], &inbox[&USER]).unwrap();
        let backup = combine(&p_shares[1], &inbox[&BACKUP]).unwrap();

        let (user_x, user_y) = augmented(&user, BACKUP);
        let (backup_x, backup_y) = augmented(&backup, USER);

        let (k_share, w_share) = sign_share(&user_x, &user_y).unwrap();

        // A K-share addressed to the backup cannot be converted by the user.
        let err = sign_convert_step1(&user_x, &user_y, k_share.clone()).unwrap_err();
        assert!(matches!(err, Error::InvalidShare(_)));

        let (a_share, _) = sign_convert_step1(&backup_x, &backup_y, k_share).unwrap();
        let mut wrong = a_share;
        wrong.j = BACKUP;
        let err = sign_convert_step2(wrong, w_share).unwrap_err();
        assert!(matches!(err, Error::InvalidShare(_)));
    }

    #[test]
    fn construct_rejects_mismatched_partials() {
        let (p_shares, inbox) = fixture();
        let user = combine(&p_shares[0], &inbox[&USER]).unwrap();
        let backup = combine(&p_shares[1], &inbox[&BACKUP]).unwrap();

        let digest = [7u8; 32];
        let ((mut user_o, user_d), (mut backup_o, backup_d)) = run_pipeline(&user, &backup);
        let sign_a = sign(&digest, &mut user_o, &backup_d).unwrap();
        let sign_b = sign(&digest, &mut backup_o, &user_d).unwrap();

        assert!(matches!(
            construct_signature(&[sign_a.clone()]).unwrap_err(),
            Error::SignatureConstruction(_)
        ));
        assert!(matches!(
            construct_signature(&[sign_a.clone(), sign_a.clone()]).unwrap_err(),
            Error::SignatureConstruction(_)
        ));

        let mut corrupted = sign_b;
        corrupted.s[0] ^= 0xff;
        assert!(matches!(
            construct_signature(&[sign_a, corrupted]).unwrap_err(),
            Error::SignatureConstruction(_)
        ));
    }
}
