//! Deterministic facade for exercising ceremony logic
//!
//! Public values are the secret scalars' bytes and backups are unencrypted
//! polynomial evaluations. Useless as cryptography, but every result is
//! reproducible from a seeded RNG and easy to reason about in tests.

use crate::facade::CeremonyCrypto;
use crate::types::*;
use crate::{CryptoError, CryptoResult};
use curve25519_dalek::{ristretto::CompressedRistretto, scalar::Scalar};
use rand_core::CryptoRngCore;
use std::collections::BTreeSet;

fn as_scalar(point: &CompressedRistretto) -> Option<Scalar> {
    Option::from(Scalar::from_canonical_bytes(point.to_bytes()))
}

/// Transparent stand-in for [`crate::RistrettoCrypto`]
#[derive(Debug, Clone, Default)]
pub struct DeterministicCrypto {
    /// Backups from these senders always fail verification
    reject_from: BTreeSet<SequenceOrder>,
}

impl DeterministicCrypto {
    /// Facade that verifies every well-formed backup
    pub fn new() -> Self {
        Self::default()
    }

    /// Facade that reports backups from `sender` as invalid
    pub fn rejecting(sender: SequenceOrder) -> Self {
        DeterministicCrypto {
            reject_from: BTreeSet::from([sender]),
        }
    }
}

impl CeremonyCrypto for DeterministicCrypto {
    fn generate_keypair(&self, rng: &mut dyn CryptoRngCore) -> ElectionKeyPair {
        let secret = Scalar::from(rng.next_u64() % 1_000_000 + 1);
        ElectionKeyPair::new(SecretScalar::new(secret), CompressedRistretto(secret.to_bytes()))
    }

    fn generate_polynomial(&self, degree: u32, rng: &mut dyn CryptoRngCore) -> Polynomial {
        Polynomial::new(
            (0..=degree)
                .map(|_| Scalar::from(rng.next_u64() % 1_000))
                .collect(),
        )
    }

    fn derive_public_share(
        &self,
        polynomial: &Polynomial,
        sequence_order: SequenceOrder,
        encryption_key: &CompressedRistretto,
    ) -> PublicShare {
        PublicShare {
            sequence_order,
            encryption_key: *encryption_key,
            commitments: polynomial
                .coefficients()
                .map(|a| CompressedRistretto(a.to_bytes()))
                .collect(),
        }
    }

    fn create_backup(
        &self,
        polynomial: &Polynomial,
        sender_order: SequenceOrder,
        target_order: SequenceOrder,
        target_public_key: &CompressedRistretto,
    ) -> CryptoResult<Backup> {
        Ok(Backup {
            sender_order,
            target_order,
            commitments: polynomial
                .coefficients()
                .map(|a| CompressedRistretto(a.to_bytes()))
                .collect(),
            ephemeral_key: *target_public_key,
            ciphertext: polynomial.evaluate(&target_order.as_scalar()).to_bytes(),
        })
    }

    fn verify_backup(&self, backup: &Backup, own_private_key: &SecretScalar) -> BackupVerification {
        if self.reject_from.contains(&backup.sender_order) {
            return BackupVerification::Invalid;
        }
        if backup.ephemeral_key.to_bytes() != own_private_key.as_scalar().to_bytes() {
            return BackupVerification::Invalid;
        }

        let coefficients: Option<Vec<Scalar>> = backup.commitments.iter().map(as_scalar).collect();
        match coefficients {
            Some(coefficients) => {
                let expected =
                    Polynomial::new(coefficients).evaluate(&backup.target_order.as_scalar());
                if expected.to_bytes() == backup.ciphertext {
                    BackupVerification::Verified
                } else {
                    BackupVerification::Invalid
                }
            }
            None => BackupVerification::Invalid,
        }
    }

    fn combine_shares(&self, shares: &[PublicShare]) -> CryptoResult<JointKey> {
        if shares.is_empty() {
            return Err(CryptoError::EmptyShareSet);
        }

        let mut public_key = Scalar::ZERO;
        let mut digest = Scalar::ZERO;
        for share in shares {
            let order = share.sequence_order.as_u32();
            let key = share
                .election_public_key()
                .ok_or(CryptoError::MissingCommitments(order))?;
            public_key += as_scalar(key).ok_or(CryptoError::InvalidPoint("election public key"))?;
            for commitment in &share.commitments {
                let c = as_scalar(commitment).ok_or(CryptoError::InvalidPoint("commitment"))?;
                digest += c * share.sequence_order.as_scalar();
            }
        }

        Ok(JointKey {
            public_key: CompressedRistretto(public_key.to_bytes()),
            commitment_hash: digest.to_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_round_trip_and_rejection() {
        let mut rng = StdRng::seed_from_u64(7);
        let crypto = DeterministicCrypto::new();
        let sender = SequenceOrder::new(1).unwrap();
        let target = SequenceOrder::new(2).unwrap();

        let keypair = crypto.generate_keypair(&mut rng);
        let poly = crypto.generate_polynomial(1, &mut rng);
        let backup = crypto
            .create_backup(&poly, sender, target, keypair.public())
            .unwrap();

        assert!(crypto.verify_backup(&backup, keypair.secret()).is_verified());
        assert!(!DeterministicCrypto::rejecting(sender)
            .verify_backup(&backup, keypair.secret())
            .is_verified());
    }
}
