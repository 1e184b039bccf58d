//! Relay wire frames.
//!
//! Every frame is a JSON object `{id, type, sender, receiver, data}`. The relay
//! only reads the routing fields; `data` is a type-specific JSON document
//! carried as a string, decoded here into [`Payload`].

use crate::ratchet::EncryptedEnvelope;
use crate::{Error, IdentityKey, IdentityPublicKey, encoding};
use serde::{Deserialize, Serialize};

/// The nine frame kinds understood by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// An encrypted chat message.
    Text,
    /// Delivery acknowledgement, echoing the acknowledged frame's id.
    EventConfirm,
    /// Signed handshake request.
    EventAddfriend,
    /// Handshake rejection.
    EventDenyfriend,
    /// Signed handshake reply.
    EventAllowfriend,
    /// Encrypted ratchet backup pushed to the relay.
    ChangeKeychain,
    /// Signed key-rotation announcement.
    ChangePublickey,
    /// Directory snapshot, or a request for one when sent to oneself.
    UpdateUserlist,
    /// Friend list with backups and stored messages.
    UpdateFriendlist,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub sender: String,
    pub receiver: String,
    #[serde(default)]
    pub data: String,
}

impl Frame {
    /// Builds an outbound frame. The relay assigns ids, so these start at 0.
    pub fn new(
        kind: FrameType,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            kind,
            sender: sender.into(),
            receiver: receiver.into(),
            data: data.into(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Serde(err.to_string()))
    }

    /// The `event_confirm` frame acknowledging this one.
    pub fn confirmation(&self) -> Self {
        Self {
            id: self.id,
            kind: FrameType::EventConfirm,
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            data: String::new(),
        }
    }

    /// Decodes `data` according to the frame kind.
    pub fn payload(&self) -> Result<Payload, Error> {
        Payload::parse(self.kind, &self.data)
    }
}

/// Typed content of a frame's `data` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(EncryptedEnvelope),
    Confirm(String),
    AddFriend(SignedPayload),
    DenyFriend,
    AllowFriend(SignedPayload),
    ChangeKeychain(ChainBackup),
    ChangePublickey(SignedPayload),
    UpdateUserlist(Vec<UserRecord>),
    UpdateFriendlist(Vec<FriendListEntry>),
}

impl Payload {
    pub fn parse(kind: FrameType, data: &str) -> Result<Self, Error> {
        let payload = match kind {
            FrameType::Text => Self::Text(EncryptedEnvelope::from_json(data)?),
            FrameType::EventConfirm => Self::Confirm(data.to_string()),
            FrameType::EventAddfriend => Self::AddFriend(serde_json::from_str(data)?),
            FrameType::EventDenyfriend => Self::DenyFriend,
            FrameType::EventAllowfriend => Self::AllowFriend(serde_json::from_str(data)?),
            FrameType::ChangeKeychain => Self::ChangeKeychain(serde_json::from_str(data)?),
            FrameType::ChangePublickey => Self::ChangePublickey(serde_json::from_str(data)?),
            FrameType::UpdateUserlist => Self::UpdateUserlist(serde_json::from_str(data)?),
            FrameType::UpdateFriendlist => Self::UpdateFriendlist(serde_json::from_str(data)?),
        };

        Ok(payload)
    }
}

/// A string payload with a hex Ed25519 signature over its UTF-8 bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub data: String,
    pub signature: String,
}

impl SignedPayload {
    pub fn sign(identity: &IdentityKey, data: String) -> Self {
        let signature = encoding::to_hex(identity.sign(data.as_bytes()).to_bytes());
        Self { data, signature }
    }

    /// Fails closed: a signature that is not even valid hex is reported the
    /// same way as a forged one.
    pub fn verify(&self, signer: &IdentityPublicKey) -> Result<(), Error> {
        let signature = encoding::from_hex(&self.signature).map_err(|_| Error::SignatureInvalid)?;
        signer.verify(self.data.as_bytes(), &signature)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Serde(err.to_string()))
    }
}

/// An encrypted ratchet backup as stored by the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBackup {
    #[serde(with = "encoding::base64_bytes")]
    pub chain_iv: Vec<u8>,
    #[serde(with = "encoding::base64_bytes")]
    pub chain_key: Vec<u8>,
}

impl ChainBackup {
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::Serde(err.to_string()))
    }
}

/// Directory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub uuid: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: String,
    /// Base64 identity public key.
    pub public_key: String,
}

/// A message as kept by the relay: the original frame's routing and data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub data: String,
    pub sender: String,
    pub receiver: String,
}

/// Friend-list entry, with the backup of the ratchet shared with that friend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendListEntry {
    pub uuid: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: String,
    pub public_key: String,
    #[serde(default, with = "encoding::base64_bytes")]
    pub chain_iv: Vec<u8>,
    #[serde(default, with = "encoding::base64_bytes")]
    pub chain_key: Vec<u8>,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

impl FriendListEntry {
    /// The stored backup, if the relay has one for this friend.
    pub fn backup(&self) -> Option<ChainBackup> {
        if self.chain_iv.is_empty() || self.chain_key.is_empty() {
            return None;
        }

        Some(ChainBackup {
            chain_iv: self.chain_iv.clone(),
            chain_key: self.chain_key.clone(),
        })
    }

    pub fn user(&self) -> UserRecord {
        UserRecord {
            uuid: self.uuid.clone(),
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
            public_key: self.public_key.clone(),
        }
    }
}
