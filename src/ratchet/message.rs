use crate::frame::SignedPayload;
use crate::{Error, IdentityKey, IdentityPublicKey, X25519PublicKey, encoding};
use serde::{Deserialize, Serialize};

/// Wire form of one encrypted message.
///
/// `epoch` and `step` are the sender's send-chain coordinates, which are the
/// receiver's receive-chain coordinates for the same key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(rename = "content", with = "encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(rename = "content_iv", with = "encoding::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(rename = "x_ratchet")]
    pub epoch: u32,
    #[serde(rename = "y_ratchet")]
    pub step: u32,
    /// Milliseconds since the Unix epoch, as supplied by the sender.
    pub timestamp: u64,
}

impl EncryptedEnvelope {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Serde(err.to_string()))
    }
}

/// Which half of the rotation hand-off a [`KeyRotation`] carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStage {
    /// The sender switched to `public_key`.
    Announce,
    /// The sender adopted the receiver's `public_key`.
    Acknowledge,
}

#[derive(Serialize, Deserialize)]
struct RotationBody {
    public_key: String,
    sequence: u32,
    stage: RotationStage,
}

/// Signed notice exchanged in `change_publickey` frames.
///
/// Announcements are numbered per sender, so a replayed older one can be told
/// apart from a resend of the latest. An acknowledgement echoes the key and
/// number it confirms and is signed by the confirming side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRotation {
    public_key: X25519PublicKey,
    sequence: u32,
    stage: RotationStage,
    payload: SignedPayload,
}

impl KeyRotation {
    pub(crate) fn announce(
        identity: &IdentityKey,
        public_key: X25519PublicKey,
        sequence: u32,
    ) -> Result<Self, Error> {
        Self::sign(identity, public_key, sequence, RotationStage::Announce)
    }

    pub(crate) fn acknowledge(
        identity: &IdentityKey,
        public_key: X25519PublicKey,
        sequence: u32,
    ) -> Result<Self, Error> {
        Self::sign(identity, public_key, sequence, RotationStage::Acknowledge)
    }

    fn sign(
        identity: &IdentityKey,
        public_key: X25519PublicKey,
        sequence: u32,
        stage: RotationStage,
    ) -> Result<Self, Error> {
        let body = RotationBody {
            public_key: public_key.to_base64(),
            sequence,
            stage,
        };
        let data = serde_json::to_string(&body).map_err(|err| Error::Serde(err.to_string()))?;

        Ok(Self {
            public_key,
            sequence,
            stage,
            payload: SignedPayload::sign(identity, data),
        })
    }

    /// Parses a notice. The signature is not checked here.
    pub fn from_payload(payload: SignedPayload) -> Result<Self, Error> {
        let body: RotationBody = serde_json::from_str(&payload.data)?;

        Ok(Self {
            public_key: X25519PublicKey::from_base64(&body.public_key)?,
            sequence: body.sequence,
            stage: body.stage,
            payload,
        })
    }

    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public_key
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn stage(&self) -> RotationStage {
        self.stage
    }

    pub fn payload(&self) -> &SignedPayload {
        &self.payload
    }

    pub fn verify(&self, signer: &IdentityPublicKey) -> Result<(), Error> {
        self.payload.verify(signer)
    }
}
