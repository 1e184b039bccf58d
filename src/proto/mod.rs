//! Encrypted session backups.
//!
//! A session is encoded as a versioned protobuf message, sealed with the
//! password-derived secret and handed to the relay as a [`ChainBackup`]. The
//! configured protocol info is bound as associated data, so a blob is only
//! accepted by a client speaking the same protocol.

use crate::crypto::{
    Key, KEY_SIZE, PasswordDerivedSecret, aead_decrypt_with_ad, aead_encrypt_with_ad,
};
use crate::frame::ChainBackup;
use crate::ratchet::{
    ChainLink, DEFAULT_MAX_SKIP, EncryptedEnvelope, Epoch, RatchetSession, Role,
};
use crate::{Error, X25519PublicKey, X25519Secret};
use prost::Message;
use zeroize::Zeroize;

const SCHEMA_VERSION: u32 = 1;

#[allow(unused_qualifications)]
mod schema {
    include!(concat!(env!("OUT_DIR"), "/tandem.rs"));
}
pub use schema::*;

impl Zeroize for ChainLinkProto {
    fn zeroize(&mut self) {
        self.base_key.zeroize();
        self.salt_key.zeroize();
        self.output_key.zeroize();
        self.message_key.zeroize();
    }
}

impl Zeroize for EpochProto {
    fn zeroize(&mut self) {
        self.seed.zeroize();
        self.links.iter_mut().for_each(Zeroize::zeroize);
    }
}

impl Zeroize for SessionProto {
    fn zeroize(&mut self) {
        self.local_private.zeroize();
        self.root_chain.iter_mut().for_each(Zeroize::zeroize);
        self.send_chain.iter_mut().for_each(Zeroize::zeroize);
        self.recv_chain.iter_mut().for_each(Zeroize::zeroize);
    }
}

/// Seals a session into a backup blob.
pub fn encode(
    session: &RatchetSession,
    secret: &PasswordDerivedSecret,
    associated_data: &[u8],
) -> Result<ChainBackup, Error> {
    let mut session_proto = SessionProto {
        version: SCHEMA_VERSION,
        role: session.role.to_u32(),
        local_private: session.local_secret.to_bytes().to_vec(),
        remote_public: session.remote_public.to_bytes().to_vec(),
        root_chain: session.root_chain.iter().map(serialize_link).collect(),
        send_chain: session.send_chain.iter().map(serialize_epoch).collect(),
        recv_chain: session.recv_chain.iter().map(serialize_epoch).collect(),
        awaiting_ack: session.awaiting_ack.map(|key| key.to_bytes().to_vec()),
        local_rotations: session.local_rotations,
        remote_rotations: session.remote_rotations,
        held: session.held.iter().map(serialize_envelope).collect(),
    };

    let mut buf = session_proto.encode_to_vec();
    session_proto.zeroize();

    let sealed = aead_encrypt_with_ad(secret.key(), &buf, associated_data);
    buf.zeroize();
    let (chain_iv, chain_key) = sealed?;

    Ok(ChainBackup {
        chain_iv: chain_iv.to_vec(),
        chain_key,
    })
}

/// Opens a backup blob. Blobs sealed under another secret or protocol info,
/// tampered blobs and unknown schema versions are all rejected.
pub fn decode(
    backup: &ChainBackup,
    secret: &PasswordDerivedSecret,
    associated_data: &[u8],
) -> Result<RatchetSession, Error> {
    let mut plaintext = aead_decrypt_with_ad(
        secret.key(),
        &backup.chain_iv,
        &backup.chain_key,
        associated_data,
    )?;

    let decoded = SessionProto::decode(plaintext.as_slice());
    plaintext.zeroize();
    let mut session_proto =
        decoded.map_err(|err| Error::Serde(format!("Failed to decode session: {err:?}")))?;

    let session = deserialize_session(&session_proto);
    session_proto.zeroize();

    session
}

fn deserialize_session(session_proto: &SessionProto) -> Result<RatchetSession, Error> {
    if session_proto.version != SCHEMA_VERSION {
        return Err(Error::Serde(format!(
            "Unsupported schema version: {}",
            session_proto.version
        )));
    }

    let role = Role::try_from(session_proto.role)?;

    let mut local_private = to_key(&session_proto.local_private, "local private key")?;
    let local_secret = X25519Secret::from(local_private);
    local_private.zeroize();

    let remote_public =
        X25519PublicKey::from(to_key(&session_proto.remote_public, "remote public key")?);

    let root_chain = session_proto
        .root_chain
        .iter()
        .map(deserialize_link)
        .collect::<Result<Vec<_>, _>>()?;
    let send_chain = session_proto
        .send_chain
        .iter()
        .map(deserialize_epoch)
        .collect::<Result<Vec<_>, _>>()?;
    let recv_chain = session_proto
        .recv_chain
        .iter()
        .map(deserialize_epoch)
        .collect::<Result<Vec<_>, _>>()?;

    let awaiting_ack = match &session_proto.awaiting_ack {
        Some(bytes) => Some(X25519PublicKey::from(to_key(bytes, "awaited key")?)),
        None => None,
    };

    if root_chain.is_empty() {
        return Err(Error::Serde("Missing root chain".to_string()));
    }
    if send_chain.len().abs_diff(recv_chain.len()) > 1 {
        return Err(Error::Serde("Chain lengths out of balance".to_string()));
    }
    if role == Role::Unset && (!send_chain.is_empty() || !recv_chain.is_empty()) {
        return Err(Error::Serde("Chains present without a role".to_string()));
    }
    if awaiting_ack.is_some() && session_proto.local_rotations == 0 {
        return Err(Error::Serde("Awaited key without a rotation".to_string()));
    }
    if awaiting_ack.is_none() && !session_proto.held.is_empty() {
        return Err(Error::Serde("Held messages without a pending rotation".to_string()));
    }

    Ok(RatchetSession {
        role,
        local_secret,
        remote_public,
        root_chain,
        send_chain,
        recv_chain,
        awaiting_ack,
        local_rotations: session_proto.local_rotations,
        remote_rotations: session_proto.remote_rotations,
        held: session_proto
            .held
            .iter()
            .map(deserialize_envelope)
            .collect(),
        max_skip: DEFAULT_MAX_SKIP,
    })
}

fn serialize_link(link: &ChainLink) -> ChainLinkProto {
    ChainLinkProto {
        base_key: link.base_key.to_vec(),
        salt_key: link.salt_key.map(|key| key.to_vec()),
        output_key: link.output_key.to_vec(),
        message_key: link.message_key.to_vec(),
    }
}

fn deserialize_link(proto: &ChainLinkProto) -> Result<ChainLink, Error> {
    Ok(ChainLink {
        base_key: to_key(&proto.base_key, "base key")?,
        salt_key: match &proto.salt_key {
            Some(bytes) => Some(to_key(bytes, "salt key")?),
            None => None,
        },
        output_key: to_key(&proto.output_key, "output key")?,
        message_key: to_key(&proto.message_key, "message key")?,
    })
}

fn serialize_epoch(epoch: &Epoch) -> EpochProto {
    EpochProto {
        seed: epoch.seed.to_vec(),
        links: epoch.links.iter().map(serialize_link).collect(),
    }
}

fn deserialize_epoch(proto: &EpochProto) -> Result<Epoch, Error> {
    Ok(Epoch {
        seed: to_key(&proto.seed, "epoch seed")?,
        links: proto
            .links
            .iter()
            .map(deserialize_link)
            .collect::<Result<Vec<_>, _>>()?,
    })
}

fn serialize_envelope(envelope: &EncryptedEnvelope) -> EnvelopeProto {
    EnvelopeProto {
        ciphertext: envelope.ciphertext.clone(),
        iv: envelope.iv.clone(),
        epoch: envelope.epoch,
        step: envelope.step,
        timestamp: envelope.timestamp,
    }
}

fn deserialize_envelope(proto: &EnvelopeProto) -> EncryptedEnvelope {
    EncryptedEnvelope {
        ciphertext: proto.ciphertext.clone(),
        iv: proto.iv.clone(),
        epoch: proto.epoch,
        step: proto.step,
        timestamp: proto.timestamp,
    }
}

fn to_key(bytes: &[u8], what: &str) -> Result<Key, Error> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| Error::Serde(format!("Invalid {what} length")))
}
