//! Friend-request key agreement.
//!
//! The initiator generates a `base` and a `salt` ephemeral pair, seals both
//! private halves under its own password-derived secret and signs the bundle.
//! The responder answers with its own public halves and echoes the sealed
//! blobs unmodified, so the initiator recovers exactly the pairs it generated
//! without the responder ever holding them. Both sides then compute
//! `base_secret` and `salt_secret` and seed the same first root link.

use crate::crypto::PasswordDerivedSecret;
use crate::frame::SignedPayload;
use crate::ratchet::{ChainLink, RatchetSession};
use crate::{Error, IdentityKey, IdentityPublicKey, X25519PublicKey, X25519Secret, encoding};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroize;

/// Signed body of `event_addfriend` and `event_allowfriend`. All fields are
/// base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub base_public_key: String,
    pub base_private_iv: String,
    pub base_private_key: String,
    pub salt_public_key: String,
    pub salt_private_iv: String,
    pub salt_private_key: String,
}

impl KeyExchange {
    fn base_public(&self) -> Result<X25519PublicKey, Error> {
        X25519PublicKey::from_base64(&self.base_public_key)
    }

    fn salt_public(&self) -> Result<X25519PublicKey, Error> {
        X25519PublicKey::from_base64(&self.salt_public_key)
    }
}

pub struct Handshake;

impl Handshake {
    /// Builds the signed friend request.
    pub fn initiate(
        identity: &IdentityKey,
        secret: &PasswordDerivedSecret,
    ) -> Result<SignedPayload, Error> {
        let base = X25519Secret::generate()?;
        let salt = X25519Secret::generate()?;

        let (base_private_iv, base_private_key) = seal_secret(&base, secret)?;
        let (salt_private_iv, salt_private_key) = seal_secret(&salt, secret)?;

        let exchange = KeyExchange {
            base_public_key: base.public_key().to_base64(),
            base_private_iv,
            base_private_key,
            salt_public_key: salt.public_key().to_base64(),
            salt_private_iv,
            salt_private_key,
        };

        sign_exchange(identity, &exchange)
    }

    /// Checks a request or reply against the sender's published identity and
    /// parses its body.
    pub fn verify(payload: &SignedPayload, peer: &IdentityPublicKey) -> Result<KeyExchange, Error> {
        payload.verify(peer).inspect_err(|_| {
            warn!("Handshake signature verification failed");
        })?;

        Ok(serde_json::from_str(&payload.data)?)
    }

    /// Accepts a verified request: returns the signed reply and the session
    /// seeded on the responder side.
    pub fn respond(
        identity: &IdentityKey,
        request: &KeyExchange,
    ) -> Result<(SignedPayload, RatchetSession), Error> {
        let remote_base = request.base_public()?;
        let remote_salt = request.salt_public()?;

        let base = X25519Secret::generate()?;
        let salt = X25519Secret::generate()?;

        let reply = KeyExchange {
            base_public_key: base.public_key().to_base64(),
            base_private_iv: request.base_private_iv.clone(),
            base_private_key: request.base_private_key.clone(),
            salt_public_key: salt.public_key().to_base64(),
            salt_private_iv: request.salt_private_iv.clone(),
            salt_private_key: request.salt_private_key.clone(),
        };

        let session = seed_session(&base, &remote_base, salt, remote_salt)?;
        let payload = sign_exchange(identity, &reply)?;
        info!("Handshake answered");

        Ok((payload, session))
    }

    /// Finishes the handshake on the initiator side from a verified reply.
    pub fn complete(
        secret: &PasswordDerivedSecret,
        reply: &KeyExchange,
    ) -> Result<RatchetSession, Error> {
        let remote_base = reply.base_public()?;
        let remote_salt = reply.salt_public()?;

        let base = open_secret(&reply.base_private_iv, &reply.base_private_key, secret)?;
        let salt = open_secret(&reply.salt_private_iv, &reply.salt_private_key, secret)?;

        let session = seed_session(&base, &remote_base, salt, remote_salt)?;
        info!("Handshake completed");

        Ok(session)
    }
}

fn sign_exchange(identity: &IdentityKey, exchange: &KeyExchange) -> Result<SignedPayload, Error> {
    let data = serde_json::to_string(exchange).map_err(|err| Error::Serde(err.to_string()))?;
    Ok(SignedPayload::sign(identity, data))
}

fn seal_secret(
    key: &X25519Secret,
    secret: &PasswordDerivedSecret,
) -> Result<(String, String), Error> {
    let mut bytes = key.to_bytes();
    let sealed = secret.seal(&bytes);
    bytes.zeroize();

    let (iv, ciphertext) = sealed?;
    Ok((encoding::to_base64(iv), encoding::to_base64(ciphertext)))
}

fn open_secret(
    iv: &str,
    ciphertext: &str,
    secret: &PasswordDerivedSecret,
) -> Result<X25519Secret, Error> {
    let iv = encoding::from_base64(iv)?;
    let ciphertext = encoding::from_base64(ciphertext)?;

    let mut plaintext = secret.open(&iv, &ciphertext)?;
    let bytes = <[u8; 32]>::try_from(plaintext.as_slice());
    plaintext.zeroize();

    let mut bytes = bytes.map_err(|_| Error::DecryptionFailed)?;
    let key = X25519Secret::from(bytes);
    bytes.zeroize();

    Ok(key)
}

/// Seeds the first root link with `derive(base_secret, salt_secret)`. The salt
/// pair becomes the session's first ratchet key.
fn seed_session(
    local_base: &X25519Secret,
    remote_base: &X25519PublicKey,
    local_salt: X25519Secret,
    remote_salt: X25519PublicKey,
) -> Result<RatchetSession, Error> {
    let base_secret = local_base.agree(remote_base);
    let salt_secret = local_salt.agree(&remote_salt);
    let root = ChainLink::root(base_secret, salt_secret)?;

    Ok(RatchetSession::new(root, local_salt, remote_salt))
}
