//! Text encodings used on the wire.
//!
//! Keys and ciphertexts travel as base64, signatures and log fingerprints as
//! lowercase hex, and plaintexts as UTF-8.

use crate::Error;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Encodes bytes as lowercase hex.
pub fn to_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(bytes)
}

/// Decodes a hex string. Odd lengths and non-hex digits are rejected.
pub fn from_hex(text: &str) -> Result<Vec<u8>, Error> {
    hex::decode(text).map_err(|err| Error::MalformedPayload(format!("invalid hex: {err}")))
}

/// Encodes bytes as padded standard base64.
pub fn to_base64(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decodes padded standard base64.
pub fn from_base64(text: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(text)
        .map_err(|err| Error::MalformedPayload(format!("invalid base64: {err}")))
}

/// Interprets decrypted bytes as UTF-8 text.
pub fn from_utf8(bytes: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(bytes).map_err(|err| Error::MalformedPayload(format!("invalid utf-8: {err}")))
}

/// Decodes base64 into a fixed-size array, failing on any other length.
pub fn from_base64_array<const N: usize>(text: &str) -> Result<[u8; N], Error> {
    let bytes = from_base64(text)?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::MalformedPayload(format!("expected {N} bytes, got {}", bytes.len()))
    })
}

/// Serde adapter storing a byte vector as a base64 string.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(de::Error::custom)
    }
}
