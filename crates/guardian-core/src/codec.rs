//! Ceremony message encoding and decoding
//!
//! # Wire Format
//!
//! Payloads are JSON objects. The message kind is determined by the topic,
//! not by a field in the payload:
//!
//! ```text
//! clients/{client_id}/register           {"registered": true}
//! clients/{client_id}/sequence_order     {"sequence_order": 2}
//! guardians/public_keys                  {"client_id": .., "public_share": {..}}
//! guardians/{target}/backups             {"sender": .., "backup": {..}}
//! guardians/{target}/backup_acks         {"sender": .., "target": .., "result": "ok"}
//! guardians/joint_key                    {"joint_key": {..}}
//! ```
//!
//! Unknown payload fields are ignored; missing required fields fail decoding.

use crate::identity::{ClientId, InvalidClientId};
use crate::round::Round;
use guardian_crypto::{Backup, BackupVerification, JointKey, PublicShare, SequenceOrder};
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic names shared with the coordinator and the other guardians
pub mod topics {
    use crate::identity::ClientId;

    /// Broadcast public key shares
    pub const PUBLIC_KEYS: &str = "guardians/public_keys";
    /// Broadcast joint key announcements
    pub const JOINT_KEY: &str = "guardians/joint_key";
    /// Every guardian's registration
    pub const ALL_REGISTRATIONS: &str = "clients/+/register";
    /// Every guardian's sequence assignment
    pub const ALL_SEQUENCE_ORDERS: &str = "clients/+/sequence_order";

    /// Registration topic of a guardian
    pub fn register(client_id: &ClientId) -> String {
        format!("clients/{}/register", client_id)
    }

    /// Sequence assignment topic of a guardian
    pub fn sequence_order(client_id: &ClientId) -> String {
        format!("clients/{}/sequence_order", client_id)
    }

    /// Backups addressed to a guardian
    pub fn backups(target: &ClientId) -> String {
        format!("guardians/{}/backups", target)
    }

    /// Acknowledgements of a guardian's backups
    pub fn backup_acks(target: &ClientId) -> String {
        format!("guardians/{}/backup_acks", target)
    }
}

/// Verification result carried by a backup acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckResult {
    /// Backup verified
    Ok,
    /// Backup failed verification
    Invalid,
}

impl From<BackupVerification> for AckResult {
    fn from(verification: BackupVerification) -> Self {
        match verification {
            BackupVerification::Verified => AckResult::Ok,
            BackupVerification::Invalid => AckResult::Invalid,
        }
    }
}

/// Typed ceremony message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CeremonyMessage {
    /// Guardian announces itself
    Registration {
        /// Announcing guardian
        client_id: ClientId,
        /// False would retract the registration
        registered: bool,
    },
    /// Coordinator assigns a sequence order
    SequenceAssignment {
        /// Guardian receiving the order
        client_id: ClientId,
        /// Assigned order
        sequence_order: SequenceOrder,
    },
    /// Guardian broadcasts its public share
    PublicKeyShare {
        /// Sending guardian
        client_id: ClientId,
        /// Public share
        public_share: PublicShare,
    },
    /// Backup for one guardian
    Backup {
        /// Recipient
        target: ClientId,
        /// Guardian that created the backup
        sender: ClientId,
        /// Encrypted backup
        backup: Backup,
    },
    /// Verification result for a backup
    BackupAck {
        /// Guardian that verified the backup
        sender: ClientId,
        /// Guardian whose backup was verified
        target: ClientId,
        /// Verification outcome
        result: AckResult,
    },
    /// Guardian publishes the joint key it computed
    JointKeyAnnouncement {
        /// Announcing guardian, if the payload names one
        sender: Option<ClientId>,
        /// Joint election key
        joint_key: JointKey,
    },
}

impl CeremonyMessage {
    /// Round the message belongs to
    pub fn round(&self) -> Round {
        match self {
            CeremonyMessage::Registration { .. } | CeremonyMessage::SequenceAssignment { .. } => {
                Round::Announcement
            }
            CeremonyMessage::PublicKeyShare { .. } => Round::KeyExchange,
            CeremonyMessage::Backup { .. } => Round::BackupExchange,
            CeremonyMessage::BackupAck { .. } => Round::Verification,
            CeremonyMessage::JointKeyAnnouncement { .. } => Round::Finalization,
        }
    }

    /// Guardian the message originates from (the addressee for assignments)
    pub fn sender(&self) -> Option<&ClientId> {
        match self {
            CeremonyMessage::Registration { client_id, .. }
            | CeremonyMessage::SequenceAssignment { client_id, .. }
            | CeremonyMessage::PublicKeyShare { client_id, .. } => Some(client_id),
            CeremonyMessage::Backup { sender, .. } | CeremonyMessage::BackupAck { sender, .. } => {
                Some(sender)
            }
            CeremonyMessage::JointKeyAnnouncement { sender, .. } => sender.as_ref(),
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            CeremonyMessage::Registration { .. } => "registration",
            CeremonyMessage::SequenceAssignment { .. } => "sequence assignment",
            CeremonyMessage::PublicKeyShare { .. } => "public key share",
            CeremonyMessage::Backup { .. } => "backup",
            CeremonyMessage::BackupAck { .. } => "backup ack",
            CeremonyMessage::JointKeyAnnouncement { .. } => "joint key announcement",
        }
    }
}

/// Encoded message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,
    /// JSON payload
    pub payload: Vec<u8>,
}

/// Errors that can occur while decoding an inbound message
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Topic does not name a ceremony message
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Client id embedded in the topic or payload is unusable
    #[error(transparent)]
    InvalidClientId(#[from] InvalidClientId),

    /// Payload is not the expected structure
    #[error("Malformed payload on {topic}: {source}")]
    Payload {
        /// Topic the payload arrived on
        topic: String,
        /// Parser error
        #[source]
        source: serde_json::Error,
    },

    /// Sequence order is not a positive 32-bit integer
    #[error("Invalid sequence order: {0}")]
    InvalidSequenceOrder(i64),

    /// Payload contradicts the topic it was published on
    #[error("Payload field {field} does not match topic {topic}")]
    TopicMismatch {
        /// Topic the payload arrived on
        topic: String,
        /// Conflicting field
        field: &'static str,
    },
}

#[derive(Serialize, Deserialize)]
struct RegistrationPayload {
    registered: bool,
}

/// Early device firmware published a bare `true`
#[derive(Deserialize)]
#[serde(untagged)]
enum RegistrationWire {
    Object(RegistrationPayload),
    Bare(bool),
}

#[derive(Serialize, Deserialize)]
struct SequenceOrderPayload {
    sequence_order: i64,
}

#[derive(Serialize, Deserialize)]
struct PublicKeyPayload {
    client_id: ClientId,
    public_share: PublicShare,
}

#[derive(Serialize, Deserialize)]
struct BackupPayload {
    sender: ClientId,
    backup: Backup,
}

#[derive(Serialize, Deserialize)]
struct BackupAckPayload {
    sender: ClientId,
    target: ClientId,
    result: AckResult,
}

#[derive(Serialize, Deserialize)]
struct JointKeyPayload {
    joint_key: JointKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<ClientId>,
}

fn to_payload<T: Serialize>(value: &T) -> Vec<u8> {
    // Payload types hold only strings, integers, booleans and lists of those
    serde_json::to_vec(value).unwrap_or_else(|e| {
        error!("Failed to serialize payload: {}", e);
        Vec::new()
    })
}

fn parse<'a, T: Deserialize<'a>>(topic: &str, payload: &'a [u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|source| DecodeError::Payload {
        topic: topic.to_string(),
        source,
    })
}

/// Encode a ceremony message to its topic and payload
pub fn encode(message: &CeremonyMessage) -> OutboundMessage {
    let (topic, payload) = match message {
        CeremonyMessage::Registration {
            client_id,
            registered,
        } => (
            topics::register(client_id),
            to_payload(&RegistrationPayload {
                registered: *registered,
            }),
        ),
        CeremonyMessage::SequenceAssignment {
            client_id,
            sequence_order,
        } => (
            topics::sequence_order(client_id),
            to_payload(&SequenceOrderPayload {
                sequence_order: i64::from(sequence_order.as_u32()),
            }),
        ),
        CeremonyMessage::PublicKeyShare {
            client_id,
            public_share,
        } => (
            topics::PUBLIC_KEYS.to_string(),
            to_payload(&PublicKeyPayload {
                client_id: client_id.clone(),
                public_share: public_share.clone(),
            }),
        ),
        CeremonyMessage::Backup {
            target,
            sender,
            backup,
        } => (
            topics::backups(target),
            to_payload(&BackupPayload {
                sender: sender.clone(),
                backup: backup.clone(),
            }),
        ),
        CeremonyMessage::BackupAck {
            sender,
            target,
            result,
        } => (
            topics::backup_acks(target),
            to_payload(&BackupAckPayload {
                sender: sender.clone(),
                target: target.clone(),
                result: *result,
            }),
        ),
        CeremonyMessage::JointKeyAnnouncement { sender, joint_key } => (
            topics::JOINT_KEY.to_string(),
            to_payload(&JointKeyPayload {
                joint_key: joint_key.clone(),
                sender: sender.clone(),
            }),
        ),
    };

    OutboundMessage { topic, payload }
}

/// Decode an inbound message from its topic and payload
pub fn decode(topic: &str, payload: &[u8]) -> Result<CeremonyMessage, DecodeError> {
    let levels: Vec<&str> = topic.split('/').collect();

    match levels.as_slice() {
        ["clients", client_id, "register"] => {
            let client_id = ClientId::new(*client_id)?;
            let registered = match parse::<RegistrationWire>(topic, payload)? {
                RegistrationWire::Object(p) => p.registered,
                RegistrationWire::Bare(registered) => registered,
            };
            Ok(CeremonyMessage::Registration {
                client_id,
                registered,
            })
        }
        ["clients", client_id, "sequence_order"] => {
            let client_id = ClientId::new(*client_id)?;
            let raw = parse::<SequenceOrderPayload>(topic, payload)?.sequence_order;
            let sequence_order = u32::try_from(raw)
                .ok()
                .and_then(SequenceOrder::new)
                .ok_or(DecodeError::InvalidSequenceOrder(raw))?;
            Ok(CeremonyMessage::SequenceAssignment {
                client_id,
                sequence_order,
            })
        }
        ["guardians", "public_keys"] => {
            let p: PublicKeyPayload = parse(topic, payload)?;
            Ok(CeremonyMessage::PublicKeyShare {
                client_id: p.client_id,
                public_share: p.public_share,
            })
        }
        ["guardians", "joint_key"] => {
            let p: JointKeyPayload = parse(topic, payload)?;
            Ok(CeremonyMessage::JointKeyAnnouncement {
                sender: p.sender,
                joint_key: p.joint_key,
            })
        }
        ["guardians", target, "backups"] => {
            let target = ClientId::new(*target)?;
            let p: BackupPayload = parse(topic, payload)?;
            Ok(CeremonyMessage::Backup {
                target,
                sender: p.sender,
                backup: p.backup,
            })
        }
        ["guardians", target, "backup_acks"] => {
            let addressed = ClientId::new(*target)?;
            let p: BackupAckPayload = parse(topic, payload)?;
            if p.target != addressed {
                return Err(DecodeError::TopicMismatch {
                    topic: topic.to_string(),
                    field: "target",
                });
            }
            Ok(CeremonyMessage::BackupAck {
                sender: p.sender,
                target: p.target,
                result: p.result,
            })
        }
        _ => Err(DecodeError::UnknownTopic(topic.to_string())),
    }
}
