//! Guardian identity derived from device hardware

use guardian_crypto::SequenceOrder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Client id rejected for use in topic names
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid client id: {0:?}")]
pub struct InvalidClientId(pub String);

/// Stable guardian identifier, safe to embed in a topic level
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Validate a client id; topic separators and wildcards are not allowed
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidClientId> {
        let id = id.into();
        if id.is_empty() || id.contains(&['/', '+', '#'][..]) {
            return Err(InvalidClientId(id));
        }
        Ok(ClientId(id))
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = InvalidClientId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ClientId::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> String {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware-unique device address (MAC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareId([u8; 6]);

impl HardwareId {
    /// Wrap raw address bytes
    pub fn new(bytes: [u8; 6]) -> Self {
        HardwareId(bytes)
    }

    /// Raw address bytes
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Derive the client id: `ESP_` plus the device-specific half of the address
    pub fn client_id(&self) -> ClientId {
        ClientId(format!(
            "ESP_{:02x}{:02x}{:02x}",
            self.0[3], self.0[4], self.0[5]
        ))
    }
}

impl FromStr for HardwareId {
    type Err = String;

    /// Parse `aa:bb:cc:dd:ee:ff`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| format!("too few octets in {s:?}"))?;
            *byte = u8::from_str_radix(part, 16).map_err(|e| format!("bad octet {part:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many octets in {s:?}"));
        }
        Ok(HardwareId(bytes))
    }
}

/// A guardian as known to the ceremony
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianIdentity {
    /// Stable identifier
    pub client_id: ClientId,
    /// Position assigned by the coordinator, set at most once
    pub sequence_order: Option<SequenceOrder>,
}

impl GuardianIdentity {
    /// Identity without an assigned position
    pub fn new(client_id: ClientId) -> Self {
        GuardianIdentity {
            client_id,
            sequence_order: None,
        }
    }
}
