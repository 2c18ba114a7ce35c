//! Cryptographic capability consumed by the ceremony state machine
//!
//! Every operation is a function of its inputs. Randomness is passed in
//! explicitly, so an implementation carries no hidden state between calls.

use crate::types::*;
use crate::CryptoResult;
use curve25519_dalek::ristretto::CompressedRistretto;
use rand_core::CryptoRngCore;

/// Opaque ceremony cryptography
///
/// `combine_shares` must be commutative and associative: the joint key may
/// not depend on the order in which shares were received.
pub trait CeremonyCrypto: Send + Sync {
    /// Generate the key pair backups for this guardian are encrypted to
    fn generate_keypair(&self, rng: &mut dyn CryptoRngCore) -> ElectionKeyPair;

    /// Generate a secret polynomial of the given degree
    fn generate_polynomial(&self, degree: u32, rng: &mut dyn CryptoRngCore) -> Polynomial;

    /// Derive the broadcastable public share from a polynomial
    fn derive_public_share(
        &self,
        polynomial: &Polynomial,
        sequence_order: SequenceOrder,
        encryption_key: &CompressedRistretto,
    ) -> PublicShare;

    /// Create the backup for one target guardian
    fn create_backup(
        &self,
        polynomial: &Polynomial,
        sender_order: SequenceOrder,
        target_order: SequenceOrder,
        target_public_key: &CompressedRistretto,
    ) -> CryptoResult<Backup>;

    /// Decrypt a received backup and check it against its commitments
    fn verify_backup(&self, backup: &Backup, own_private_key: &SecretScalar) -> BackupVerification;

    /// Combine every guardian's public share into the joint key
    fn combine_shares(&self, shares: &[PublicShare]) -> CryptoResult<JointKey>;
}
