mod chain;
mod message;
mod state;

pub use crate::ratchet::chain::{ChainLink, Epoch};
pub use crate::ratchet::message::{EncryptedEnvelope, KeyRotation, RotationStage};
pub use crate::ratchet::state::{Direction, Role};

use crate::crypto::{Key, aead_decrypt, aead_encrypt};
use crate::{Error, IdentityKey, IdentityPublicKey, X25519PublicKey, X25519Secret};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Upper bound on the links derived for a single envelope.
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Result of [`RatchetSession::encrypt`].
#[derive(Clone, Debug)]
pub struct Outgoing {
    /// Announcement that must reach the peer before `envelope`.
    pub rotation: Option<KeyRotation>,
    pub envelope: EncryptedEnvelope,
}

/// Result of [`RatchetSession::decrypt`].
#[derive(Clone, Debug)]
pub struct Incoming {
    pub plaintext: Vec<u8>,
    /// Announcement of the key this side rotated to after the DH step.
    pub rotation: Option<KeyRotation>,
}

/// Two-dimensional chain ratchet shared with one friend.
///
/// The root chain advances by one link per Diffie-Hellman step. Each root
/// link seeds one epoch of either the send or the receive chain, and every
/// message takes the next symmetric link of its epoch. Which side performs a
/// DH step is decided by the session role and by the parity of the send and
/// receive chain lengths, which never differ by more than one.
///
/// Every derived link is kept, so history can be decrypted again after a
/// backup restore.
#[derive(Clone)]
pub struct RatchetSession {
    pub(crate) role: Role,
    pub(crate) local_secret: X25519Secret,
    pub(crate) remote_public: X25519PublicKey,
    pub(crate) root_chain: Vec<ChainLink>,
    pub(crate) send_chain: Vec<Epoch>,
    pub(crate) recv_chain: Vec<Epoch>,
    // Local rotation key the peer has not confirmed yet.
    pub(crate) awaiting_ack: Option<X25519PublicKey>,
    // Sequence of the latest own announcement and of the latest one applied.
    pub(crate) local_rotations: u32,
    pub(crate) remote_rotations: u32,
    // Envelopes encrypted while `awaiting_ack` is set, oldest first.
    pub(crate) held: Vec<EncryptedEnvelope>,
    pub(crate) max_skip: u32,
}

impl RatchetSession {
    /// Starts a session from the first root link produced by the handshake.
    pub fn new(root: ChainLink, local_secret: X25519Secret, remote_public: X25519PublicKey) -> Self {
        Self {
            role: Role::Unset,
            local_secret,
            remote_public,
            root_chain: vec![root],
            send_chain: Vec::new(),
            recv_chain: Vec::new(),
            awaiting_ack: None,
            local_rotations: 0,
            remote_rotations: 0,
            held: Vec::new(),
            max_skip: DEFAULT_MAX_SKIP,
        }
    }

    pub fn set_max_skip(&mut self, max_skip: u32) {
        self.max_skip = max_skip;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_public(&self) -> X25519PublicKey {
        self.local_secret.public_key()
    }

    pub fn remote_public(&self) -> &X25519PublicKey {
        &self.remote_public
    }

    pub fn root_chain(&self) -> &[ChainLink] {
        &self.root_chain
    }

    pub fn send_chain(&self) -> &[Epoch] {
        &self.send_chain
    }

    pub fn recv_chain(&self) -> &[Epoch] {
        &self.recv_chain
    }

    /// The rotated local key the peer still has to confirm, if any.
    pub fn awaiting_ack(&self) -> Option<&X25519PublicKey> {
        self.awaiting_ack.as_ref()
    }

    /// Checks the peer's acknowledgement of our latest rotation. Returns
    /// `false` for acknowledgements of anything but the key awaiting
    /// confirmation, including stale ones.
    pub fn acknowledge(
        &mut self,
        acknowledgement: &KeyRotation,
        signer: &IdentityPublicKey,
    ) -> Result<bool, Error> {
        acknowledgement.verify(signer)?;
        if acknowledgement.stage() != RotationStage::Acknowledge {
            return Err(Error::MalformedPayload(
                "expected a rotation acknowledgement".to_string(),
            ));
        }

        if acknowledgement.sequence() != self.local_rotations
            || self.awaiting_ack.as_ref() != Some(acknowledgement.public_key())
        {
            return Ok(false);
        }

        self.awaiting_ack = None;
        info!(sequence = self.local_rotations, "Key rotation acknowledged");
        Ok(true)
    }

    /// Re-signs the announcement for the unconfirmed rotation, for resending
    /// after a reconnect.
    pub fn pending_rotation(&self, identity: &IdentityKey) -> Result<Option<KeyRotation>, Error> {
        self.awaiting_ack
            .map(|public_key| KeyRotation::announce(identity, public_key, self.local_rotations))
            .transpose()
    }

    /// Envelopes waiting for the peer to acknowledge our rotation.
    pub fn held(&self) -> &[EncryptedEnvelope] {
        &self.held
    }

    pub(crate) fn hold(&mut self, envelope: EncryptedEnvelope) {
        self.held.push(envelope);
    }

    pub(crate) fn take_held(&mut self) -> Vec<EncryptedEnvelope> {
        std::mem::take(&mut self.held)
    }

    /// Encrypts `plaintext`, performing a DH step first when one is due.
    ///
    /// A responder must own a fresh key before it can originate a send-side
    /// DH step, so it rotates first and returns the signed announcement in
    /// [`Outgoing::rotation`]. The caller must deliver it, and should wait for
    /// the peer's confirmation, before sending the envelope.
    pub fn encrypt(
        &mut self,
        identity: &IdentityKey,
        plaintext: &[u8],
        timestamp: u64,
    ) -> Result<Outgoing, Error> {
        let mut next = self.clone();
        let outgoing = next.encrypt_in_place(identity, plaintext, timestamp)?;
        *self = next;

        Ok(outgoing)
    }

    fn encrypt_in_place(
        &mut self,
        identity: &IdentityKey,
        plaintext: &[u8],
        timestamp: u64,
    ) -> Result<Outgoing, Error> {
        if self.role == Role::Unset {
            self.role = Role::Initiator;
            let seed = self.last_root()?.message_key;
            self.send_chain.push(Epoch::new(seed));
            debug!("Session role set to initiator");
        }

        let mut rotation = None;
        if self.send_step_due() {
            if self.role == Role::Responder {
                rotation = Some(self.rotate(identity)?);
            }

            let seed = self.advance_root()?;
            self.send_chain.push(Epoch::new(seed));
            debug!(epoch = self.send_chain.len() - 1, "Opened send epoch");
        }

        let epoch = self.send_chain.len() - 1;
        let (step, mut message_key) = self
            .send_chain
            .last_mut()
            .ok_or_else(|| Error::Session("send chain is empty".to_string()))?
            .advance()?;

        let sealed = aead_encrypt(&message_key, plaintext);
        message_key.zeroize();
        let (iv, ciphertext) = sealed?;

        let epoch =
            u32::try_from(epoch).map_err(|_| Error::Session("too many epochs".to_string()))?;
        debug!(epoch, step, "Encrypted message");

        Ok(Outgoing {
            rotation,
            envelope: EncryptedEnvelope {
                ciphertext,
                iv: iv.to_vec(),
                epoch,
                step,
                timestamp,
            },
        })
    }

    /// Decrypts an envelope from the peer.
    ///
    /// The session is left untouched when any step fails, including
    /// authentication of the ciphertext.
    pub fn decrypt(
        &mut self,
        identity: &IdentityKey,
        envelope: &EncryptedEnvelope,
    ) -> Result<Incoming, Error> {
        let mut next = self.clone();
        let incoming = next.decrypt_in_place(identity, envelope)?;
        *self = next;

        Ok(incoming)
    }

    fn decrypt_in_place(
        &mut self,
        identity: &IdentityKey,
        envelope: &EncryptedEnvelope,
    ) -> Result<Incoming, Error> {
        if self.role == Role::Unset {
            self.role = Role::Responder;
            let seed = self.last_root()?.message_key;
            self.recv_chain.push(Epoch::new(seed));
            debug!("Session role set to responder");
        }

        let epoch = envelope.epoch as usize;
        let mut rotation = None;

        // Existing epochs are resolved in place, so late deliveries still
        // decrypt after the peer has moved on.
        if epoch >= self.recv_chain.len() {
            if epoch != self.recv_chain.len() || !self.recv_step_due() {
                return Err(Error::MalformedPayload(format!(
                    "envelope references unknown epoch {epoch}"
                )));
            }

            let seed = self.advance_root()?;
            self.recv_chain.push(Epoch::new(seed));
            debug!(epoch, "Opened receive epoch");

            if self.role == Role::Initiator {
                rotation = Some(self.rotate(identity)?);
            }
        }

        let max_skip = self.max_skip;
        let mut message_key = self
            .recv_chain
            .get_mut(epoch)
            .ok_or_else(|| Error::Session("receive epoch missing".to_string()))?
            .resolve(envelope.step, max_skip)?;

        let plaintext = aead_decrypt(&message_key, &envelope.iv, &envelope.ciphertext);
        message_key.zeroize();
        let plaintext = plaintext?;

        debug!(epoch, step = envelope.step, "Decrypted message");

        Ok(Incoming {
            plaintext,
            rotation,
        })
    }

    /// Adopts the peer's announced key after checking its signature and
    /// returns the signed acknowledgement to send back.
    ///
    /// A resend of the latest announcement is acknowledged again without
    /// changing anything. Older announcements are rejected.
    pub fn apply_rotation(
        &mut self,
        identity: &IdentityKey,
        rotation: &KeyRotation,
        signer: &IdentityPublicKey,
    ) -> Result<KeyRotation, Error> {
        rotation.verify(signer)?;
        if rotation.stage() != RotationStage::Announce {
            return Err(Error::MalformedPayload(
                "expected a key announcement".to_string(),
            ));
        }

        let sequence = rotation.sequence();
        if sequence > self.remote_rotations {
            self.remote_public = *rotation.public_key();
            self.remote_rotations = sequence;
            info!(sequence, "Applied peer key rotation");
        } else if sequence == self.remote_rotations && rotation.public_key() == &self.remote_public {
            debug!(sequence, "Peer key rotation already applied");
        } else {
            warn!(sequence, latest = self.remote_rotations, "Rejected stale key rotation");
            return Err(Error::Session(format!("stale key rotation {sequence}")));
        }

        KeyRotation::acknowledge(identity, *rotation.public_key(), sequence)
    }

    /// Message key at `(epoch, step)` of one chain, deriving forward if the
    /// link is not cached yet. Used to decrypt stored history.
    pub fn message_key(
        &mut self,
        direction: Direction,
        epoch: u32,
        step: u32,
    ) -> Result<Key, Error> {
        let max_skip = self.max_skip;
        let chain = match direction {
            Direction::Send => &mut self.send_chain,
            Direction::Receive => &mut self.recv_chain,
        };

        chain
            .get_mut(epoch as usize)
            .ok_or_else(|| Error::MalformedPayload(format!("unknown epoch {epoch}")))?
            .resolve(step, max_skip)
    }

    fn last_root(&self) -> Result<&ChainLink, Error> {
        self.root_chain
            .last()
            .ok_or_else(|| Error::Session("root chain is empty".to_string()))
    }

    fn send_step_due(&self) -> bool {
        match self.role {
            Role::Initiator => self.send_chain.len() == self.recv_chain.len(),
            Role::Responder => self.send_chain.len() != self.recv_chain.len(),
            Role::Unset => false,
        }
    }

    fn recv_step_due(&self) -> bool {
        match self.role {
            Role::Initiator => self.send_chain.len() != self.recv_chain.len(),
            Role::Responder => self.send_chain.len() == self.recv_chain.len(),
            Role::Unset => false,
        }
    }

    /// Appends a root link mixing a fresh DH secret into the previous output
    /// and returns the seed for the new epoch.
    fn advance_root(&mut self) -> Result<Key, Error> {
        let mut shared_secret = self.local_secret.agree(&self.remote_public);
        let link = ChainLink::root(self.last_root()?.output_key, shared_secret);
        shared_secret.zeroize();

        let link = link?;
        let seed = link.message_key;
        self.root_chain.push(link);
        debug!(length = self.root_chain.len(), "Advanced root chain");

        Ok(seed)
    }

    fn rotate(&mut self, identity: &IdentityKey) -> Result<KeyRotation, Error> {
        let sequence = self
            .local_rotations
            .checked_add(1)
            .ok_or_else(|| Error::Session("rotation counter exhausted".to_string()))?;
        let fresh = X25519Secret::generate()?;
        let public_key = fresh.public_key();
        let rotation = KeyRotation::announce(identity, public_key, sequence)?;

        self.local_secret = fresh;
        self.local_rotations = sequence;
        self.awaiting_ack = Some(public_key);
        info!(sequence, "Rotated local ratchet key");

        Ok(rotation)
    }
}

impl PartialEq for RatchetSession {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.local_secret.to_bytes() == other.local_secret.to_bytes()
            && self.remote_public == other.remote_public
            && self.root_chain == other.root_chain
            && self.send_chain == other.send_chain
            && self.recv_chain == other.recv_chain
            && self.awaiting_ack == other.awaiting_ack
            && self.local_rotations == other.local_rotations
            && self.remote_rotations == other.remote_rotations
            && self.held == other.held
    }
}

impl Eq for RatchetSession {}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("role", &self.role)
            .field("root_chain", &self.root_chain.len())
            .field("send_chain", &self.send_chain.len())
            .field("recv_chain", &self.recv_chain.len())
            .field("awaiting_ack", &self.awaiting_ack.is_some())
            .field("held", &self.held.len())
            .finish_non_exhaustive()
    }
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.local_secret.zeroize();
    }
}
