//! Guardian Key Ceremony Coordination
//!
//! Drives a guardian device through a multi-party joint key ceremony over a
//! publish/subscribe bus:
//! - Identity derivation and a registry of known guardians
//! - Topic-addressed JSON message codec
//! - Round barriers with deduplication and future-round buffering
//! - A pure ceremony state machine with retransmission and abort handling
//! - A tokio runtime serialising transport events into the state machine
//!
//! Cryptography is consumed through [`guardian_crypto::CeremonyCrypto`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ceremony;
pub mod codec;
pub mod config;
pub mod identity;
pub mod registry;
pub mod round;
pub mod runtime;
pub mod transport;

pub use ceremony::{AbortReason, Action, Ceremony, CeremonyEvent, CeremonyStatus, Phase};
pub use codec::{decode, encode, AckResult, CeremonyMessage, DecodeError, OutboundMessage};
pub use config::{CeremonyConfig, ConfigError};
pub use identity::{ClientId, GuardianIdentity, HardwareId, InvalidClientId};
pub use registry::{GuardianRegistry, RegistryError};
pub use round::{MessageBuffer, RecordOutcome, Round, RoundState};
pub use runtime::{GuardianRuntime, RuntimeHandle};
pub use transport::{MemoryBroker, MemoryTransport, QoS, Transport, TransportError, TransportEvent};

use thiserror::Error;

/// Host-facing ceremony errors
#[derive(Error, Debug)]
pub enum CeremonyError {
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Ceremony ended without a joint key
    #[error("Ceremony aborted: {0}")]
    Aborted(AbortReason),

    /// Runtime task is gone
    #[error("Ceremony runtime stopped")]
    Stopped,
}

/// Result type for host-facing ceremony operations
pub type CeremonyResult<T> = Result<T, CeremonyError>;
