//! Cryptographic Operations for the Guardian Key Ceremony
//!
//! This crate provides the capabilities a guardian invokes while taking part
//! in a joint election key ceremony, using Ristretto255:
//! - Election key pairs used to receive encrypted backups
//! - Secret polynomials with Feldman commitments to their coefficients
//! - Partial key backups encrypted to a single recipient guardian
//! - Backup verification against the sender's commitments
//! - Order-independent combination of public shares into a joint key
//!
//! The ceremony logic only sees the [`CeremonyCrypto`] trait, so it can be
//! exercised against a deterministic facade (feature `testing`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod encoding;
pub mod facade;
pub mod ristretto;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use facade::CeremonyCrypto;
pub use ristretto::RistrettoCrypto;
pub use types::*;
pub use curve25519_dalek::ristretto::CompressedRistretto;

use thiserror::Error;

/// Ceremony cryptography errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A compressed point did not decode to a group element
    #[error("Invalid point encoding: {0}")]
    InvalidPoint(&'static str),

    /// A share carried no coefficient commitments
    #[error("Public share for sequence order {0} has no commitments")]
    MissingCommitments(u32),

    /// Nothing to combine
    #[error("Cannot combine an empty set of public shares")]
    EmptyShareSet,
}

/// Result type for ceremony cryptography
pub type CryptoResult<T> = Result<T, CryptoError>;
