//! Core types for the guardian ceremony

use crate::encoding;
use curve25519_dalek::{ristretto::CompressedRistretto, scalar::Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Guardian sequence order (1-indexed), the evaluation point for its backups
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SequenceOrder(u32);

impl SequenceOrder {
    /// Create a new sequence order; zero is not a valid position
    pub fn new(order: u32) -> Option<Self> {
        if order > 0 {
            Some(SequenceOrder(order))
        } else {
            None
        }
    }

    /// Get the underlying u32 value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Convert to Scalar for polynomial evaluation
    pub fn as_scalar(&self) -> Scalar {
        Scalar::from(self.0)
    }
}

impl TryFrom<u32> for SequenceOrder {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        SequenceOrder::new(value).ok_or_else(|| "sequence order must be positive".to_string())
    }
}

impl From<SequenceOrder> for u32 {
    fn from(order: SequenceOrder) -> u32 {
        order.0
    }
}

impl fmt::Display for SequenceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secret scalar value (auto-zeroized on drop)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretScalar(pub(crate) Scalar);

impl SecretScalar {
    /// Create from a Scalar
    pub fn new(scalar: Scalar) -> Self {
        SecretScalar(scalar)
    }

    /// Get reference to inner scalar (use carefully)
    pub fn as_scalar(&self) -> &Scalar {
        &self.0
    }
}

impl fmt::Debug for SecretScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretScalar(..)")
    }
}

/// Sample a uniformly random scalar
pub(crate) fn random_scalar(rng: &mut dyn CryptoRngCore) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}

/// Guardian secret polynomial; never leaves the device
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Polynomial {
    /// Coefficients [a0, a1, ..., a_degree]
    pub(crate) coefficients: Vec<SecretScalar>,
}

impl Polynomial {
    /// Create a new polynomial with given coefficients
    pub fn new(coefficients: Vec<Scalar>) -> Self {
        Polynomial {
            coefficients: coefficients.into_iter().map(SecretScalar::new).collect(),
        }
    }

    /// Generate random polynomial of the given degree
    pub fn random(degree: u32, rng: &mut dyn CryptoRngCore) -> Self {
        let coefficients = (0..=degree)
            .map(|_| SecretScalar::new(random_scalar(rng)))
            .collect();
        Polynomial { coefficients }
    }

    /// Evaluate polynomial at given x using Horner's method
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coeff| acc * x + coeff.as_scalar())
    }

    /// Constant term a0, the guardian's election secret
    pub fn constant_term(&self) -> Scalar {
        self.coefficients
            .first()
            .map(|c| *c.as_scalar())
            .unwrap_or(Scalar::ZERO)
    }

    /// Get degree of polynomial
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Iterate over the coefficients
    pub fn coefficients(&self) -> impl Iterator<Item = &Scalar> {
        self.coefficients.iter().map(SecretScalar::as_scalar)
    }
}

impl fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polynomial(degree={})", self.degree())
    }
}

/// Key pair used to receive backups
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ElectionKeyPair {
    /// Private key x
    secret: SecretScalar,
    /// Public key X = x * G
    #[zeroize(skip)]
    public: CompressedRistretto,
}

impl ElectionKeyPair {
    /// Assemble a key pair
    pub fn new(secret: SecretScalar, public: CompressedRistretto) -> Self {
        ElectionKeyPair { secret, public }
    }

    /// Private half
    pub fn secret(&self) -> &SecretScalar {
        &self.secret
    }

    /// Public half
    pub fn public(&self) -> &CompressedRistretto {
        &self.public
    }
}

impl fmt::Debug for ElectionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElectionKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Public artifacts a guardian broadcasts in the key exchange round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicShare {
    /// Sender's sequence order
    pub sequence_order: SequenceOrder,
    /// Key that backups for this guardian are encrypted to
    #[serde(with = "encoding::point")]
    pub encryption_key: CompressedRistretto,
    /// Commitments C_k = a_k * G; the first is the election public key
    #[serde(with = "encoding::points")]
    pub commitments: Vec<CompressedRistretto>,
}

impl PublicShare {
    /// Election public key a0 * G
    pub fn election_public_key(&self) -> Option<&CompressedRistretto> {
        self.commitments.first()
    }
}

/// Encrypted partial key backup for exactly one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// Order of the guardian whose polynomial produced this backup
    pub sender_order: SequenceOrder,
    /// Order of the recipient; the polynomial evaluation point
    pub target_order: SequenceOrder,
    /// Sender's coefficient commitments
    #[serde(with = "encoding::points")]
    pub commitments: Vec<CompressedRistretto>,
    /// Ephemeral key R = r * G
    #[serde(with = "encoding::point")]
    pub ephemeral_key: CompressedRistretto,
    /// Masked evaluation f(j) + H(r * X)
    #[serde(with = "encoding::bytes32")]
    pub ciphertext: [u8; 32],
}

/// Outcome of verifying a received backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupVerification {
    /// Backup decrypts to a point on the sender's committed polynomial
    Verified,
    /// Backup is inconsistent or undecryptable
    Invalid,
}

impl BackupVerification {
    /// Whether verification succeeded
    pub fn is_verified(&self) -> bool {
        matches!(self, BackupVerification::Verified)
    }
}

/// Combined public key of all guardians
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointKey {
    /// Sum of every guardian's election public key
    #[serde(with = "encoding::point")]
    pub public_key: CompressedRistretto,
    /// Hash over all commitments, ordered by sequence order
    #[serde(with = "encoding::bytes32")]
    pub commitment_hash: [u8; 32],
}

impl fmt::Display for JointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.public_key.as_bytes()))
    }
}
