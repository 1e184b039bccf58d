use crate::frame::UserRecord;
use crate::{IdentityPublicKey, RatchetSession};
use std::collections::HashSet;

/// A decrypted chat message.
///
/// The `Debug` output omits the content.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub receiver: String,
    pub content: String,
    /// Sender-supplied milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl std::fmt::Debug for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatMessage")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("content_len", &self.content.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// A confirmed friend and the ratchet session shared with them.
#[derive(Debug)]
pub struct Friend {
    pub(crate) user: UserRecord,
    pub(crate) identity: IdentityPublicKey,
    pub(crate) session: Option<RatchetSession>,
    // Newest first.
    pub(crate) messages: Vec<ChatMessage>,
}

impl Friend {
    pub(crate) fn new(
        user: UserRecord,
        identity: IdentityPublicKey,
        session: Option<RatchetSession>,
    ) -> Self {
        Self {
            user,
            identity,
            session,
            messages: Vec::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.user.uuid
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn avatar_url(&self) -> &str {
        &self.user.avatar_url
    }

    pub fn identity(&self) -> &IdentityPublicKey {
        &self.identity
    }

    pub fn session(&self) -> Option<&RatchetSession> {
        self.session.as_ref()
    }

    /// Message log, newest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of outbound messages waiting for a rotation acknowledgement.
    pub fn held_messages(&self) -> usize {
        self.session.as_ref().map_or(0, |session| session.held().len())
    }

    pub(crate) fn record(&mut self, message: ChatMessage) {
        self.messages.insert(0, message);
    }

    /// Merges restored history into the log, dropping duplicates by
    /// `(sender, timestamp)` and keeping the newest message first.
    pub(crate) fn merge_history(&mut self, history: Vec<ChatMessage>) {
        let mut seen = HashSet::new();
        let mut merged: Vec<ChatMessage> = history
            .into_iter()
            .chain(self.messages.drain(..))
            .filter(|message| seen.insert((message.sender.clone(), message.timestamp)))
            .collect();

        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.messages = merged;
    }
}
