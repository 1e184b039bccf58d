use crate::crypto::{PasswordDerivedSecret, generate_random_seed};
use crate::{Error, encoding};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Long-term signing identity of an account.
///
/// The private half never leaves the client unencrypted: it is stored only in
/// the form produced by [`IdentityKey::seal`]. The public half is published by
/// the directory and authenticates handshakes and key rotations.
#[derive(Clone)]
pub struct IdentityKey {
    signing_key: Box<SigningKey>,
}

impl IdentityKey {
    /// Creates a new identity key from the operating system RNG.
    pub fn new() -> Result<Self, Error> {
        let mut seed = generate_random_seed()?;
        let signing_key = Box::new(SigningKey::from_bytes(&seed));
        seed.zeroize();

        Ok(Self { signing_key })
    }

    /// Signs a message with the Ed25519 signing key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Returns the public half, as published by the directory.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing_key.verifying_key())
    }

    /// Serializes the 32-byte private seed.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Encrypts the private seed under the password-derived secret.
    pub fn seal(&self, secret: &PasswordDerivedSecret) -> Result<SealedIdentityKey, Error> {
        let mut bytes = self.to_bytes();
        let sealed = secret.seal(&bytes);
        bytes.zeroize();

        let (iv, ciphertext) = sealed?;
        Ok(SealedIdentityKey {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    /// Recovers an identity from its sealed form.
    pub fn unseal(
        sealed: &SealedIdentityKey,
        secret: &PasswordDerivedSecret,
    ) -> Result<Self, Error> {
        let mut plaintext = secret.open(&sealed.iv, &sealed.ciphertext)?;

        let bytes = <[u8; 32]>::try_from(plaintext.as_slice());
        plaintext.zeroize();

        let mut bytes = bytes.map_err(|_| Error::DecryptionFailed)?;
        let identity = Self::from(bytes);
        bytes.zeroize();

        Ok(identity)
    }
}

impl From<[u8; 32]> for IdentityKey {
    /// Deserializes an identity key from its 32-byte private seed.
    fn from(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: Box::new(SigningKey::from_bytes(&bytes)),
        }
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of an [`IdentityKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey(VerifyingKey);

impl IdentityPublicKey {
    /// Parses a raw 32-byte verifying key. Bytes that are not a valid curve
    /// point are rejected.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| Error::MalformedPayload("invalid identity public key".to_string()))
    }

    /// Parses the directory form: base64 of the raw 32 bytes.
    pub fn from_base64(text: &str) -> Result<Self, Error> {
        Self::from_bytes(&encoding::from_base64_array::<32>(text)?)
    }

    pub fn to_base64(&self) -> String {
        encoding::to_base64(self.0.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verifies a signature produced by the matching [`IdentityKey`].
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Error> {
        crate::crypto::verify(&self.0, signature, message)
    }
}

/// An [`IdentityKey`] encrypted under a [`PasswordDerivedSecret`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedIdentityKey {
    #[serde(with = "encoding::base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_and_verification() {
        let identity_key = IdentityKey::new().unwrap();
        let message = b"This is a test message";

        let signature = identity_key.sign(message).to_bytes();
        let public_key = identity_key.public_key();
        assert!(public_key.verify(message, &signature).is_ok());

        let modified_message = b"This is a modified message";
        assert_eq!(
            public_key.verify(modified_message, &signature),
            Err(Error::SignatureInvalid)
        );
        assert_eq!(
            public_key.verify(message, &signature[..10]),
            Err(Error::SignatureInvalid)
        );
    }

    #[test]
    fn test_other_identity_rejected() {
        let alice = IdentityKey::new().unwrap();
        let mallory = IdentityKey::new().unwrap();

        let signature = mallory.sign(b"payload").to_bytes();
        assert_eq!(
            alice.public_key().verify(b"payload", &signature),
            Err(Error::SignatureInvalid)
        );
    }

    #[test]
    fn test_serialization_deserialization() {
        let original_key = IdentityKey::new().unwrap();
        let deserialized_key = IdentityKey::from(original_key.to_bytes());

        assert_eq!(original_key.public_key(), deserialized_key.public_key());
    }

    #[test]
    fn test_public_key_base64() {
        let public_key = IdentityKey::new().unwrap().public_key();
        let parsed = IdentityPublicKey::from_base64(&public_key.to_base64()).unwrap();

        assert_eq!(parsed, public_key);
        assert!(IdentityPublicKey::from_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_seal_unseal() {
        let secret = PasswordDerivedSecret::derive("alice", "correct horse").unwrap();
        let identity_key = IdentityKey::new().unwrap();

        let sealed = identity_key.seal(&secret).unwrap();
        let restored = IdentityKey::unseal(&sealed, &secret).unwrap();
        assert_eq!(restored.public_key(), identity_key.public_key());

        let wrong = PasswordDerivedSecret::derive("alice", "battery staple").unwrap();
        assert_eq!(
            IdentityKey::unseal(&sealed, &wrong).map(|key| key.public_key()),
            Err(Error::DecryptionFailed)
        );
    }
}
