//! Hex encodings for public artifacts
//!
//! Points and 32-byte values travel as lowercase hex strings so that ceremony
//! payloads stay readable JSON. Use with `#[serde(with = "...")]`.

use curve25519_dalek::ristretto::CompressedRistretto;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

fn decode_32<E: serde::de::Error>(text: &str) -> Result<[u8; 32], E> {
    let bytes = hex::decode(text).map_err(E::custom)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| E::invalid_length(b.len(), &"32 bytes"))
}

/// A 32-byte value as hex
pub mod bytes32 {
    use super::*;

    /// Serialize as hex
    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    /// Deserialize from hex
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        decode_32(&text)
    }
}

/// A compressed Ristretto point as hex
pub mod point {
    use super::*;

    /// Serialize as hex
    pub fn serialize<S: Serializer>(
        value: &CompressedRistretto,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value.as_bytes()))
    }

    /// Deserialize from hex
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<CompressedRistretto, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode_32(&text).map(CompressedRistretto)
    }
}

/// A list of compressed Ristretto points as hex strings
pub mod points {
    use super::*;
    use serde::ser::SerializeSeq;

    /// Serialize as a list of hex strings
    pub fn serialize<S: Serializer>(
        values: &[CompressedRistretto],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&hex::encode(value.as_bytes()))?;
        }
        seq.end()
    }

    /// Deserialize from a list of hex strings
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<CompressedRistretto>, D::Error> {
        let texts = Vec::<String>::deserialize(deserializer)?;
        if texts.is_empty() {
            return Err(D::Error::custom("expected at least one commitment"));
        }
        texts
            .iter()
            .map(|text| decode_32(text).map(CompressedRistretto))
            .collect()
    }
}
