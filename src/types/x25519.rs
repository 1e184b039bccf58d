use crate::Error;
use crate::crypto::generate_random_seed;
use crate::encoding;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Public half of an X25519 agreement key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Wire form: base64 of the raw 32 bytes.
    pub fn to_base64(&self) -> String {
        encoding::to_base64(self.as_bytes())
    }

    pub fn from_base64(text: &str) -> Result<Self, Error> {
        encoding::from_base64_array::<32>(text).map(Self::from)
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(value: PublicKey) -> Self {
        Self(value)
    }
}

impl AsRef<PublicKey> for X25519PublicKey {
    fn as_ref(&self) -> &PublicKey {
        &self.0
    }
}

/// Private half of an X25519 agreement key pair.
///
/// Used both for the two ephemeral handshake pairs and for the ratchet key
/// a session currently holds.
#[derive(Clone)]
pub struct X25519Secret(StaticSecret);

impl X25519Secret {
    /// Generates a fresh key pair from the operating system RNG.
    pub fn generate() -> Result<Self, Error> {
        let mut seed = generate_random_seed()?;
        let secret = Self(StaticSecret::from(seed));
        seed.zeroize();
        Ok(secret)
    }

    /// Computes the 32-byte Diffie-Hellman shared secret with a peer key.
    pub fn agree(&self, public_key: &X25519PublicKey) -> [u8; 32] {
        self.0.diffie_hellman(public_key.as_ref()).to_bytes()
    }

    pub fn public_key(&self) -> X25519PublicKey {
        PublicKey::from(&self.0).into()
    }

    pub(crate) fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for X25519Secret {
    fn from(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }
}

impl std::fmt::Debug for X25519Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("X25519Secret").field(&self.public_key()).finish()
    }
}

impl Zeroize for X25519Secret {
    fn zeroize(&mut self) {
        self.0.zeroize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let alice = X25519Secret::generate().unwrap();
        let bob = X25519Secret::generate().unwrap();

        assert_eq!(alice.agree(&bob.public_key()), bob.agree(&alice.public_key()));
    }

    #[test]
    fn test_public_key_base64() {
        let secret = X25519Secret::generate().unwrap();
        let public = secret.public_key();

        let decoded = X25519PublicKey::from_base64(&public.to_base64()).unwrap();
        assert_eq!(decoded, public);
        assert!(X25519PublicKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_secret_bytes() {
        let secret = X25519Secret::generate().unwrap();
        let restored = X25519Secret::from(secret.to_bytes());

        assert_eq!(restored.public_key(), secret.public_key());
    }
}
