use crate::Error;
use crate::crypto::{Key, derive};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// One derivation step of a chain.
///
/// `output_key` seeds the next link of the same chain and `message_key` is
/// the single-use key for one message. Root links also record the DH secret
/// that produced them in `salt_key`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChainLink {
    pub(crate) base_key: Key,
    pub(crate) salt_key: Option<Key>,
    pub(crate) output_key: Key,
    pub(crate) message_key: Key,
}

impl ChainLink {
    /// A root link mixing `salt` into `base`.
    pub(crate) fn root(base_key: Key, salt_key: Key) -> Result<Self, Error> {
        let (output_key, message_key) = derive(&base_key, &salt_key)?;

        Ok(Self {
            base_key,
            salt_key: Some(salt_key),
            output_key,
            message_key,
        })
    }

    /// A symmetric link derived from `base` alone.
    pub(crate) fn symmetric(base_key: Key) -> Result<Self, Error> {
        let (output_key, message_key) = derive(&base_key, &[])?;

        Ok(Self {
            base_key,
            salt_key: None,
            output_key,
            message_key,
        })
    }

    pub fn base_key(&self) -> &Key {
        &self.base_key
    }

    pub fn salt_key(&self) -> Option<&Key> {
        self.salt_key.as_ref()
    }

    pub fn output_key(&self) -> &Key {
        &self.output_key
    }

    pub fn message_key(&self) -> &Key {
        &self.message_key
    }
}

impl std::fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLink")
            .field("salted", &self.salt_key.is_some())
            .finish_non_exhaustive()
    }
}

/// The symmetric chain of one DH epoch.
///
/// Links are only ever appended. Step `y` is derived from step `y - 1`, or
/// from the epoch seed for `y = 0`, so asking for a step twice always
/// returns the same key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Epoch {
    pub(crate) seed: Key,
    pub(crate) links: Vec<ChainLink>,
}

impl Epoch {
    pub(crate) fn new(seed: Key) -> Self {
        Self {
            seed,
            links: Vec::new(),
        }
    }

    /// Number of links derived so far.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    fn next_base(&self) -> Key {
        match self.links.last() {
            Some(link) => link.output_key,
            None => self.seed,
        }
    }

    /// Derives the next link and returns its step index and message key.
    pub(crate) fn advance(&mut self) -> Result<(u32, Key), Error> {
        let step = u32::try_from(self.links.len())
            .map_err(|_| Error::Session("epoch exhausted".to_string()))?;
        let link = ChainLink::symmetric(self.next_base())?;
        let message_key = link.message_key;
        self.links.push(link);

        Ok((step, message_key))
    }

    /// Returns the message key at `step`, deriving every missing link up to
    /// it. At most `max_skip` links are derived in one call.
    pub(crate) fn resolve(&mut self, step: u32, max_skip: u32) -> Result<Key, Error> {
        let index = step as usize;
        if let Some(link) = self.links.get(index) {
            return Ok(link.message_key);
        }

        let requested = index + 1 - self.links.len();
        if requested > max_skip as usize {
            return Err(Error::TooManySkipped {
                max: max_skip,
                requested: u32::try_from(requested).unwrap_or(u32::MAX),
            });
        }

        let mut message_key = [0u8; 32];
        while self.links.len() <= index {
            (_, message_key) = self.advance()?;
        }

        Ok(message_key)
    }
}

impl std::fmt::Debug for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoch")
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}
