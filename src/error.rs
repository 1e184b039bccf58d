/// Errors that can occur while establishing or running a session.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A handshake or key-rotation payload failed signature verification.
    #[error("Signature verification failed")]
    SignatureInvalid,

    /// Authenticated decryption of a message or backup blob failed.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Structurally invalid wire data.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A frame arrived from a user the directory does not know.
    #[error("Unknown peer: {0}")]
    PeerUnknown(String),

    /// The connection towards the relay is gone.
    #[error("Transport unavailable")]
    TransportUnavailable,

    /// An envelope asked for a chain position too far ahead of the cached links.
    #[error("Too many skipped messages (max: {max}, requested: {requested})")]
    TooManySkipped {
        /// Maximum number of links derived for one envelope.
        max: u32,
        /// Number of links the envelope would have required.
        requested: u32,
    },

    /// Session is missing or in a state that forbids the operation.
    #[error("Session state error: {0}")]
    Session(String),

    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(_: aes_gcm_siv::Error) -> Self {
        Self::DecryptionFailed
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedPayload(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}
