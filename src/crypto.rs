//! Primitive layer: randomness, key derivation and authenticated encryption.
//!
//! No protocol logic lives here. Everything is deterministic except seed and
//! IV generation, which draw from the operating system RNG.

use crate::Error;
use aes_gcm_siv::aead::{Aead, Payload};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Width of every symmetric key and DH output.
pub const KEY_SIZE: usize = 32;

/// AES-GCM-SIV uses 12-byte (96-bit) nonces
pub const NONCE_SIZE: usize = 12;

/// A 32-byte symmetric key.
pub type Key = [u8; KEY_SIZE];

/// Generates a cryptographically secure random 32-byte seed.
pub(crate) fn generate_random_seed() -> Result<[u8; 32], Error> {
    let mut seed = [0u8; 32];
    OsRng.try_fill_bytes(&mut seed).map_err(|_| Error::Random)?;
    Ok(seed)
}

fn generate_nonce() -> Result<[u8; NONCE_SIZE], Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.try_fill_bytes(&mut nonce).map_err(|_| Error::Random)?;
    Ok(nonce)
}

/// HKDF-SHA256 with empty info, expanded to twice the key width and split.
///
/// Returns `(left, right)`. In chain terms `left` is the output key that seeds
/// the next link and `right` the message key.
pub fn derive(input_key: &[u8], salt: &[u8]) -> Result<(Key, Key), Error> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), input_key);

    let mut okm = [0u8; 2 * KEY_SIZE];
    hkdf.expand(&[], &mut okm)
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;

    let mut left = [0u8; KEY_SIZE];
    let mut right = [0u8; KEY_SIZE];
    left.copy_from_slice(&okm[..KEY_SIZE]);
    right.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    Ok((left, right))
}

/// Encrypts `plaintext` under `key` with a fresh random IV.
pub fn aead_encrypt(key: &Key, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), Error> {
    aead_encrypt_with_ad(key, plaintext, &[])
}

/// Decrypts and authenticates. Any failure, including an IV of the wrong
/// length, is reported as [`Error::DecryptionFailed`].
pub fn aead_decrypt(key: &Key, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    aead_decrypt_with_ad(key, iv, ciphertext, &[])
}

pub(crate) fn aead_encrypt_with_ad(
    key: &Key,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>), Error> {
    let nonce_bytes = generate_nonce()?;

    let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key);
    let cipher = Aes256GcmSiv::new(key);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("Message encryption failed".to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

pub(crate) fn aead_decrypt_with_ad(
    key: &Key,
    iv: &[u8],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, Error> {
    if iv.len() != NONCE_SIZE {
        return Err(Error::DecryptionFailed);
    }

    let key = aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(key);
    let cipher = Aes256GcmSiv::new(key);

    let plaintext = cipher.decrypt(
        Nonce::from_slice(iv),
        Payload {
            msg: ciphertext,
            aad: associated_data,
        },
    )?;

    Ok(plaintext)
}

/// Strict Ed25519 verification. Malformed signatures and mismatches both
/// yield [`Error::SignatureInvalid`].
pub fn verify(public_key: &VerifyingKey, signature: &[u8], message: &[u8]) -> Result<(), Error> {
    let signature = Signature::from_slice(signature).map_err(|_| Error::SignatureInvalid)?;
    public_key
        .verify_strict(message, &signature)
        .map_err(|_| Error::SignatureInvalid)
}

/// Symmetric key derived from `(username, password)`.
///
/// It encrypts everything the client keeps about itself: the identity private
/// key, its own handshake ephemerals and the ratchet backups. It is recomputed
/// on login and never leaves the client.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PasswordDerivedSecret(Key);

impl PasswordDerivedSecret {
    /// Derives the secret as the left half of `derive(username, password)`.
    pub fn derive(username: &str, password: &str) -> Result<Self, Error> {
        let (left, mut right) = derive(username.as_bytes(), password.as_bytes())?;
        right.zeroize();
        Ok(Self(left))
    }

    pub(crate) fn key(&self) -> &Key {
        &self.0
    }

    /// Seals local material under this secret.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), Error> {
        aead_encrypt(&self.0, plaintext)
    }

    /// Opens material previously sealed with [`PasswordDerivedSecret::seal`].
    pub fn open(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        aead_decrypt(&self.0, iv, ciphertext)
    }
}

impl From<Key> for PasswordDerivedSecret {
    fn from(bytes: Key) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for PasswordDerivedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordDerivedSecret(..)")
    }
}
