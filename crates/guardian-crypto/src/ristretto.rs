//! Ristretto255 implementation of the ceremony facade
//!
//! Protocol flow per guardian:
//! 1. Generate an election key pair and a secret polynomial f(x)
//! 2. Broadcast Feldman commitments C_k = a_k * G alongside the public key
//! 3. For every other guardian j, encrypt f(j) to that guardian's key
//! 4. On receipt, decrypt and check f(j) * G == Σ C_k * j^k
//! 5. Sum every a_0 * G into the joint election key

use crate::facade::CeremonyCrypto;
use crate::types::*;
use crate::{CryptoError, CryptoResult};
use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::Identity,
};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

const BACKUP_NONCE_DOMAIN: &[u8] = b"GUARDIAN-CEREMONY-RISTRETTO255-v1-backup-nonce";
const BACKUP_MASK_DOMAIN: &[u8] = b"GUARDIAN-CEREMONY-RISTRETTO255-v1-backup-mask";
const JOINT_KEY_DOMAIN: &[u8] = b"GUARDIAN-CEREMONY-RISTRETTO255-v1-joint-key";

/// Hash domain-separated input to a scalar
fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}

/// Compute Σ C_k * x^k for the given evaluation point
fn evaluate_commitments(
    commitments: &[CompressedRistretto],
    order: SequenceOrder,
) -> Option<RistrettoPoint> {
    let x = order.as_scalar();
    let mut x_power = Scalar::ONE;
    let mut result = RistrettoPoint::identity();

    for commitment in commitments {
        result += x_power * commitment.decompress()?;
        x_power *= x;
    }

    Some(result)
}

/// Ceremony cryptography over Ristretto255
#[derive(Debug, Clone, Copy, Default)]
pub struct RistrettoCrypto;

impl RistrettoCrypto {
    /// Create the facade
    pub fn new() -> Self {
        RistrettoCrypto
    }
}

impl CeremonyCrypto for RistrettoCrypto {
    fn generate_keypair(&self, rng: &mut dyn CryptoRngCore) -> ElectionKeyPair {
        let secret = SecretScalar::new(random_scalar(rng));
        let public = (secret.as_scalar() * RISTRETTO_BASEPOINT_POINT).compress();
        ElectionKeyPair::new(secret, public)
    }

    fn generate_polynomial(&self, degree: u32, rng: &mut dyn CryptoRngCore) -> Polynomial {
        Polynomial::random(degree, rng)
    }

    fn derive_public_share(
        &self,
        polynomial: &Polynomial,
        sequence_order: SequenceOrder,
        encryption_key: &CompressedRistretto,
    ) -> PublicShare {
        let commitments = polynomial
            .coefficients()
            .map(|a| (a * RISTRETTO_BASEPOINT_POINT).compress())
            .collect();

        PublicShare {
            sequence_order,
            encryption_key: *encryption_key,
            commitments,
        }
    }

    fn create_backup(
        &self,
        polynomial: &Polynomial,
        sender_order: SequenceOrder,
        target_order: SequenceOrder,
        target_public_key: &CompressedRistretto,
    ) -> CryptoResult<Backup> {
        let target_key = target_public_key
            .decompress()
            .ok_or(CryptoError::InvalidPoint("target public key"))?;

        // Ephemeral nonce is derived, so a retransmitted backup is byte-identical
        let mut a0 = polynomial.constant_term();
        let mut r = hash_to_scalar(
            BACKUP_NONCE_DOMAIN,
            &[
                a0.as_bytes(),
                &target_order.as_u32().to_le_bytes(),
                target_public_key.as_bytes(),
            ],
        );
        a0.zeroize();

        let shared = (r * target_key).compress();
        let mask = hash_to_scalar(BACKUP_MASK_DOMAIN, &[shared.as_bytes()]);
        let mut value = polynomial.evaluate(&target_order.as_scalar());
        let ciphertext = (value + mask).to_bytes();
        let ephemeral_key = (r * RISTRETTO_BASEPOINT_POINT).compress();
        value.zeroize();
        r.zeroize();

        let commitments = polynomial
            .coefficients()
            .map(|a| (a * RISTRETTO_BASEPOINT_POINT).compress())
            .collect();

        Ok(Backup {
            sender_order,
            target_order,
            commitments,
            ephemeral_key,
            ciphertext,
        })
    }

    fn verify_backup(&self, backup: &Backup, own_private_key: &SecretScalar) -> BackupVerification {
        let ephemeral = match backup.ephemeral_key.decompress() {
            Some(point) => point,
            None => return BackupVerification::Invalid,
        };

        let ciphertext = Scalar::from_canonical_bytes(backup.ciphertext);
        let ciphertext = match Option::<Scalar>::from(ciphertext) {
            Some(c) => c,
            None => return BackupVerification::Invalid,
        };

        let expected = match evaluate_commitments(&backup.commitments, backup.target_order) {
            Some(point) => point,
            None => return BackupVerification::Invalid,
        };

        let shared = (own_private_key.as_scalar() * ephemeral).compress();
        let mask = hash_to_scalar(BACKUP_MASK_DOMAIN, &[shared.as_bytes()]);
        let mut value = ciphertext - mask;
        let actual = value * RISTRETTO_BASEPOINT_POINT;
        value.zeroize();

        if actual == expected {
            BackupVerification::Verified
        } else {
            BackupVerification::Invalid
        }
    }

    fn combine_shares(&self, shares: &[PublicShare]) -> CryptoResult<JointKey> {
        if shares.is_empty() {
            return Err(CryptoError::EmptyShareSet);
        }

        // Point addition commutes; the hash input is put in canonical order
        let mut ordered: Vec<&PublicShare> = shares.iter().collect();
        ordered.sort_by_key(|share| share.sequence_order);

        let mut joint = RistrettoPoint::identity();
        let mut hasher = Sha256::new();
        hasher.update(JOINT_KEY_DOMAIN);

        for share in ordered {
            let order = share.sequence_order.as_u32();
            let key = share
                .election_public_key()
                .ok_or(CryptoError::MissingCommitments(order))?;
            joint += key
                .decompress()
                .ok_or(CryptoError::InvalidPoint("election public key"))?;

            hasher.update(order.to_le_bytes());
            for commitment in &share.commitments {
                hasher.update(commitment.as_bytes());
            }
        }

        Ok(JointKey {
            public_key: joint.compress(),
            commitment_hash: hasher.finalize().into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn order(n: u32) -> SequenceOrder {
        SequenceOrder::new(n).unwrap()
    }

    struct Guardian {
        order: SequenceOrder,
        keypair: ElectionKeyPair,
        polynomial: Polynomial,
        share: PublicShare,
    }

    fn guardians(n: u32, degree: u32) -> Vec<Guardian> {
        let crypto = RistrettoCrypto::new();
        (1..=n)
            .map(|i| {
                let keypair = crypto.generate_keypair(&mut OsRng);
                let polynomial = crypto.generate_polynomial(degree, &mut OsRng);
                let share = crypto.derive_public_share(&polynomial, order(i), keypair.public());
                Guardian {
                    order: order(i),
                    keypair,
                    polynomial,
                    share,
                }
            })
            .collect()
    }

    #[test]
    fn test_backups_verify_for_every_pair() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(3, 2);

        for sender in &all {
            for target in all.iter().filter(|g| g.order != sender.order) {
                let backup = crypto
                    .create_backup(
                        &sender.polynomial,
                        sender.order,
                        target.order,
                        target.keypair.public(),
                    )
                    .unwrap();
                assert_eq!(backup.commitments, sender.share.commitments);
                assert_eq!(
                    crypto.verify_backup(&backup, target.keypair.secret()),
                    BackupVerification::Verified
                );
            }
        }
    }

    #[test]
    fn test_backup_is_deterministic() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(2, 1);
        let make = || {
            crypto
                .create_backup(
                    &all[0].polynomial,
                    all[0].order,
                    all[1].order,
                    all[1].keypair.public(),
                )
                .unwrap()
        };
        assert_eq!(make(), make());
    }

    #[test]
    fn test_backup_rejected_with_wrong_key() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(3, 1);
        let backup = crypto
            .create_backup(&all[0].polynomial, all[0].order, all[1].order, all[1].keypair.public())
            .unwrap();

        assert_eq!(
            crypto.verify_backup(&backup, all[2].keypair.secret()),
            BackupVerification::Invalid
        );
    }

    #[test]
    fn test_tampered_backup_rejected() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(2, 1);
        let mut backup = crypto
            .create_backup(&all[0].polynomial, all[0].order, all[1].order, all[1].keypair.public())
            .unwrap();
        let tampered = Scalar::from_bytes_mod_order(backup.ciphertext) + Scalar::ONE;
        backup.ciphertext = tampered.to_bytes();

        assert_eq!(
            crypto.verify_backup(&backup, all[1].keypair.secret()),
            BackupVerification::Invalid
        );
    }

    #[test]
    fn test_backup_to_invalid_key_fails() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(2, 1);
        let bogus = CompressedRistretto([0xFF; 32]);
        let result = crypto.create_backup(&all[0].polynomial, all[0].order, all[1].order, &bogus);
        assert_eq!(result, Err(CryptoError::InvalidPoint("target public key")));
    }

    #[test]
    fn test_joint_key_is_order_independent() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(4, 2);
        let shares: Vec<PublicShare> = all.iter().map(|g| g.share.clone()).collect();
        let mut reversed = shares.clone();
        reversed.reverse();
        let mut rotated = shares.clone();
        rotated.rotate_left(2);

        let expected = crypto.combine_shares(&shares).unwrap();
        assert_eq!(crypto.combine_shares(&reversed).unwrap(), expected);
        assert_eq!(crypto.combine_shares(&rotated).unwrap(), expected);
    }

    #[test]
    fn test_joint_key_matches_secret_sum() {
        let crypto = RistrettoCrypto::new();
        let all = guardians(3, 1);
        let shares: Vec<PublicShare> = all.iter().map(|g| g.share.clone()).collect();

        let secret_sum: Scalar = all.iter().map(|g| g.polynomial.constant_term()).sum();
        let joint = crypto.combine_shares(&shares).unwrap();
        assert_eq!(joint.public_key, (secret_sum * RISTRETTO_BASEPOINT_POINT).compress());
    }

    #[test]
    fn test_combine_empty_fails() {
        assert_eq!(
            RistrettoCrypto::new().combine_shares(&[]),
            Err(CryptoError::EmptyShareSet)
        );
    }
}
