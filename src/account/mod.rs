mod config;
pub use config::*;
mod friend;
pub use friend::*;

use crate::crypto::{PasswordDerivedSecret, aead_decrypt};
use crate::frame::{
    Frame, FrameType, FriendListEntry, Payload, SignedPayload, StoredMessage, UserRecord,
};
use crate::handshake::{Handshake, KeyExchange};
use crate::ratchet::{Direction, EncryptedEnvelope, KeyRotation, RatchetSession, RotationStage};
use crate::{Error, IdentityKey, IdentityPublicKey, encoding, proto};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Inputs to [`Account::handle`].
#[derive(Clone, Debug)]
pub enum AccountEvent {
    /// A frame arrived from the relay.
    FrameReceived(Frame),
    /// The user wants to send a chat message.
    SendText {
        to: String,
        text: String,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },
    /// The user wants to befriend someone from the directory.
    AddFriend { uuid: String },
    /// The user accepted or rejected a pending friend request.
    AnswerFriendRequest { uuid: String, accept: bool },
    /// The connection to the relay was re-established.
    Reconnected,
}

/// Effects produced by [`Account::handle`] for the caller to carry out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountAction {
    /// Send a frame to the relay.
    Send(Frame),
    /// A chat message was decrypted.
    Deliver { from: String, message: ChatMessage },
    /// A verified friend request awaits an answer.
    FriendRequest { from: String },
    /// A handshake finished and the friend can be messaged.
    FriendAdded { uuid: String },
    /// The peer rejected our friend request.
    FriendRequestDenied { uuid: String },
    /// The friend list was replaced from the relay's copy.
    FriendListUpdated,
    /// Something failed. The account stays usable.
    Warning {
        peer: Option<String>,
        error: Error,
    },
}

/// Client-side state of one logged-in user.
///
/// The account does no I/O: frames and user intents go in through
/// [`Account::handle`], frames to send and notifications come out as
/// [`AccountAction`]s. Handling takes `&mut self`, so every mutation of a
/// session is serialized. A fresh backup of a session is emitted after each
/// change to it, ahead of the frames that depend on it.
pub struct Account {
    uuid: String,
    identity: IdentityKey,
    secret: PasswordDerivedSecret,
    config: AccountConfig,
    users: HashMap<String, UserRecord>,
    friends: HashMap<String, Friend>,
    // Verified incoming requests awaiting the user's answer.
    pending_requests: HashMap<String, KeyExchange>,
    // Peers we sent a request to.
    outstanding_requests: HashSet<String>,
}

impl Account {
    /// Creates an account from already unlocked credentials.
    ///
    /// If no configuration is provided, default values are used.
    pub fn new(
        uuid: impl Into<String>,
        identity: IdentityKey,
        secret: PasswordDerivedSecret,
        config: Option<AccountConfig>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            identity,
            secret,
            config: config.unwrap_or_default(),
            users: HashMap::new(),
            friends: HashMap::new(),
            pending_requests: HashMap::new(),
            outstanding_requests: HashSet::new(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        self.identity.public_key()
    }

    /// Returns the configuration for this account.
    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn user(&self, uuid: &str) -> Option<&UserRecord> {
        self.users.get(uuid)
    }

    pub fn friend(&self, uuid: &str) -> Option<&Friend> {
        self.friends.get(uuid)
    }

    pub fn friends(&self) -> impl Iterator<Item = &Friend> {
        self.friends.values()
    }

    /// Processes one event and returns the resulting actions in order.
    pub fn handle(&mut self, event: AccountEvent) -> Vec<AccountAction> {
        match event {
            AccountEvent::FrameReceived(frame) => self.handle_frame(frame),
            AccountEvent::SendText {
                to,
                text,
                timestamp,
            } => {
                let result = self.handle_send_text(&to, text, timestamp);
                self.settle(Some(to), None, result)
            }
            AccountEvent::AddFriend { uuid } => {
                let result = self.handle_add_friend(&uuid);
                self.settle(Some(uuid), None, result)
            }
            AccountEvent::AnswerFriendRequest { uuid, accept } => {
                let result = self.handle_answer(&uuid, accept);
                self.settle(Some(uuid), None, result)
            }
            AccountEvent::Reconnected => self.handle_reconnected(),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Vec<AccountAction> {
        let mut actions = Vec::new();
        if frame.kind != FrameType::EventConfirm {
            actions.push(AccountAction::Send(frame.confirmation()));
        }

        let result = self.process_frame(&frame);
        actions.extend(self.settle(Some(frame.sender.clone()), Some(frame.kind), result));

        actions
    }

    /// Turns a handler result into actions. Failures become warnings, and an
    /// unknown peer additionally triggers a directory refresh.
    fn settle(
        &self,
        peer: Option<String>,
        kind: Option<FrameType>,
        result: Result<Vec<AccountAction>, Error>,
    ) -> Vec<AccountAction> {
        let error = match result {
            Ok(actions) => return actions,
            Err(error) => error,
        };

        let mut actions = Vec::new();
        if let Error::PeerUnknown(uuid) = &error {
            warn!(peer = %uuid, "Frame from unknown peer, refreshing directory");
            actions.push(AccountAction::Send(Frame::new(
                FrameType::UpdateUserlist,
                &self.uuid,
                &self.uuid,
                "",
            )));

            if kind == Some(FrameType::EventAddfriend) {
                actions.push(AccountAction::Send(Frame::new(
                    FrameType::EventDenyfriend,
                    &self.uuid,
                    uuid,
                    "",
                )));
            }
        } else {
            warn!(peer = ?peer, %error, "Event failed");
        }

        actions.push(AccountAction::Warning { peer, error });
        actions
    }

    fn process_frame(&mut self, frame: &Frame) -> Result<Vec<AccountAction>, Error> {
        let sender = frame.sender.as_str();

        match frame.payload()? {
            Payload::Text(envelope) => self.handle_text(sender, &envelope),
            // Delivery receipts for the relay. Rotations are acknowledged
            // through `change_publickey`.
            Payload::Confirm(_) => Ok(Vec::new()),
            Payload::AddFriend(payload) => self.handle_friend_request(sender, &payload),
            Payload::DenyFriend => self.handle_denied(sender),
            Payload::AllowFriend(payload) => self.handle_accepted(sender, &payload),
            Payload::ChangeKeychain(_) => {
                debug!("Ignoring keychain frame addressed to the client");
                Ok(Vec::new())
            }
            Payload::ChangePublickey(payload) => self.handle_rotation(sender, payload),
            Payload::UpdateUserlist(users) => {
                self.users = users
                    .into_iter()
                    .map(|user| (user.uuid.clone(), user))
                    .collect();
                info!(users = self.users.len(), "Directory updated");
                Ok(Vec::new())
            }
            Payload::UpdateFriendlist(entries) => self.handle_friend_list(entries),
        }
    }

    fn peer_identity(&self, uuid: &str) -> Result<IdentityPublicKey, Error> {
        let user = self
            .users
            .get(uuid)
            .ok_or_else(|| Error::PeerUnknown(uuid.to_string()))?;
        IdentityPublicKey::from_base64(&user.public_key)
    }

    fn handle_send_text(
        &mut self,
        to: &str,
        text: String,
        timestamp: u64,
    ) -> Result<Vec<AccountAction>, Error> {
        let friend = self
            .friends
            .get_mut(to)
            .ok_or_else(|| Error::Session(format!("{to} is not a friend")))?;
        let session = friend
            .session
            .as_mut()
            .ok_or_else(|| Error::Session(format!("no session with {to}")))?;

        let outgoing = session.encrypt(&self.identity, text.as_bytes(), timestamp)?;
        let held = session.awaiting_ack().is_some();
        if held {
            debug!(peer = to, "Holding message until key rotation is acknowledged");
            session.hold(outgoing.envelope.clone());
        }

        // The backup carrying the new local secret goes out before anything
        // that depends on it.
        let mut actions = vec![AccountAction::Send(backup_frame(
            &self.uuid,
            to,
            session,
            &self.secret,
            &self.config,
        )?)];
        if let Some(rotation) = &outgoing.rotation {
            actions.push(AccountAction::Send(rotation_frame(&self.uuid, to, rotation)?));
        }
        if !held {
            actions.push(AccountAction::Send(text_frame(
                &self.uuid,
                to,
                &outgoing.envelope,
            )?));
        }

        friend.record(ChatMessage {
            sender: self.uuid.clone(),
            receiver: to.to_string(),
            content: text,
            timestamp,
        });

        Ok(actions)
    }

    fn handle_text(
        &mut self,
        sender: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<AccountAction>, Error> {
        self.peer_identity(sender)?;
        let friend = self
            .friends
            .get_mut(sender)
            .ok_or_else(|| Error::Session(format!("{sender} is not a friend")))?;
        let session = friend
            .session
            .as_mut()
            .ok_or_else(|| Error::Session(format!("no session with {sender}")))?;

        let incoming = session.decrypt(&self.identity, envelope)?;

        let mut actions = vec![AccountAction::Send(backup_frame(
            &self.uuid,
            sender,
            session,
            &self.secret,
            &self.config,
        )?)];
        if let Some(rotation) = &incoming.rotation {
            actions.push(AccountAction::Send(rotation_frame(&self.uuid, sender, rotation)?));
        }

        match encoding::from_utf8(incoming.plaintext) {
            Ok(content) => {
                let message = ChatMessage {
                    sender: sender.to_string(),
                    receiver: self.uuid.clone(),
                    content,
                    timestamp: envelope.timestamp,
                };
                friend.record(message.clone());
                actions.push(AccountAction::Deliver {
                    from: sender.to_string(),
                    message,
                });
            }
            Err(error) => actions.push(AccountAction::Warning {
                peer: Some(sender.to_string()),
                error,
            }),
        }

        Ok(actions)
    }

    fn handle_rotation(
        &mut self,
        sender: &str,
        payload: SignedPayload,
    ) -> Result<Vec<AccountAction>, Error> {
        self.peer_identity(sender)?;
        let rotation = KeyRotation::from_payload(payload)?;

        let friend = self
            .friends
            .get_mut(sender)
            .ok_or_else(|| Error::Session(format!("{sender} is not a friend")))?;
        let session = friend
            .session
            .as_mut()
            .ok_or_else(|| Error::Session(format!("no session with {sender}")))?;

        match rotation.stage() {
            RotationStage::Announce => {
                let ack = session.apply_rotation(&self.identity, &rotation, &friend.identity)?;

                Ok(vec![
                    AccountAction::Send(backup_frame(
                        &self.uuid,
                        sender,
                        session,
                        &self.secret,
                        &self.config,
                    )?),
                    AccountAction::Send(rotation_frame(&self.uuid, sender, &ack)?),
                ])
            }
            RotationStage::Acknowledge => {
                if !session.acknowledge(&rotation, &friend.identity)? {
                    debug!(peer = sender, "Ignoring stale rotation acknowledgement");
                    return Ok(Vec::new());
                }

                let released = session.take_held();
                info!(peer = sender, held = released.len(), "Releasing held messages");

                let mut actions = vec![AccountAction::Send(backup_frame(
                    &self.uuid,
                    sender,
                    session,
                    &self.secret,
                    &self.config,
                )?)];
                for envelope in &released {
                    actions.push(AccountAction::Send(text_frame(&self.uuid, sender, envelope)?));
                }

                Ok(actions)
            }
        }
    }

    fn handle_add_friend(&mut self, uuid: &str) -> Result<Vec<AccountAction>, Error> {
        self.peer_identity(uuid)?;

        let request = Handshake::initiate(&self.identity, &self.secret)?;
        self.outstanding_requests.insert(uuid.to_string());
        info!(peer = uuid, "Friend request sent");

        Ok(vec![AccountAction::Send(Frame::new(
            FrameType::EventAddfriend,
            &self.uuid,
            uuid,
            request.to_json()?,
        ))])
    }

    fn handle_friend_request(
        &mut self,
        sender: &str,
        payload: &SignedPayload,
    ) -> Result<Vec<AccountAction>, Error> {
        let identity = self.peer_identity(sender)?;
        let exchange = Handshake::verify(payload, &identity)?;

        self.pending_requests.insert(sender.to_string(), exchange);
        info!(peer = sender, "Friend request received");

        Ok(vec![AccountAction::FriendRequest {
            from: sender.to_string(),
        }])
    }

    fn handle_answer(&mut self, uuid: &str, accept: bool) -> Result<Vec<AccountAction>, Error> {
        let exchange = self
            .pending_requests
            .remove(uuid)
            .ok_or_else(|| Error::Session(format!("no pending request from {uuid}")))?;

        if !accept {
            info!(peer = uuid, "Friend request rejected");
            return Ok(vec![AccountAction::Send(Frame::new(
                FrameType::EventDenyfriend,
                &self.uuid,
                uuid,
                "",
            ))]);
        }

        let user = self
            .users
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::PeerUnknown(uuid.to_string()))?;
        let identity = IdentityPublicKey::from_base64(&user.public_key)?;

        let (reply, session) = Handshake::respond(&self.identity, &exchange)?;
        let reply = Frame::new(
            FrameType::EventAllowfriend,
            &self.uuid,
            uuid,
            reply.to_json()?,
        );

        self.add_friend(user, identity, session, vec![AccountAction::Send(reply)])
    }

    fn handle_accepted(
        &mut self,
        sender: &str,
        payload: &SignedPayload,
    ) -> Result<Vec<AccountAction>, Error> {
        let identity = self.peer_identity(sender)?;
        let answer = Handshake::verify(payload, &identity)?;

        if !self.outstanding_requests.contains(sender) {
            return Err(Error::Session(format!("unsolicited handshake reply from {sender}")));
        }

        let session = Handshake::complete(&self.secret, &answer)?;
        self.outstanding_requests.remove(sender);

        let user = self
            .users
            .get(sender)
            .cloned()
            .ok_or_else(|| Error::PeerUnknown(sender.to_string()))?;

        self.add_friend(user, identity, session, Vec::new())
    }

    fn handle_denied(&mut self, sender: &str) -> Result<Vec<AccountAction>, Error> {
        self.peer_identity(sender)?;

        if !self.outstanding_requests.remove(sender) {
            debug!(peer = sender, "Ignoring denial without a pending request");
            return Ok(Vec::new());
        }

        info!(peer = sender, "Friend request denied");
        Ok(vec![AccountAction::FriendRequestDenied {
            uuid: sender.to_string(),
        }])
    }

    fn add_friend(
        &mut self,
        user: UserRecord,
        identity: IdentityPublicKey,
        mut session: RatchetSession,
        mut actions: Vec<AccountAction>,
    ) -> Result<Vec<AccountAction>, Error> {
        session.set_max_skip(self.config.max_skipped_messages);

        let uuid = user.uuid.clone();
        let backup = backup_frame(&self.uuid, &uuid, &session, &self.secret, &self.config)?;

        self.friends
            .insert(uuid.clone(), Friend::new(user, identity, Some(session)));
        info!(peer = %uuid, "Friend added");

        actions.push(AccountAction::Send(backup));
        actions.push(AccountAction::FriendAdded { uuid });
        Ok(actions)
    }

    /// Replaces the friend list with the relay's copy, restoring each session
    /// from its backup and decrypting the stored history with it.
    fn handle_friend_list(
        &mut self,
        entries: Vec<FriendListEntry>,
    ) -> Result<Vec<AccountAction>, Error> {
        let mut actions = Vec::new();
        let mut friends = HashMap::with_capacity(entries.len());

        for entry in entries {
            let user = entry.user();
            self.users.insert(user.uuid.clone(), user.clone());

            let identity = match IdentityPublicKey::from_base64(&entry.public_key) {
                Ok(identity) => identity,
                Err(error) => {
                    actions.push(AccountAction::Warning {
                        peer: Some(entry.uuid.clone()),
                        error,
                    });
                    continue;
                }
            };

            let existing = self.friends.remove(&entry.uuid);
            let mut friend = Friend::new(user, identity, None);
            if let Some(existing) = existing {
                friend.session = existing.session;
                friend.messages = existing.messages;
            }

            if let Some(backup) = entry.backup() {
                match proto::decode(&backup, &self.secret, &self.config.protocol_info) {
                    Ok(mut session) => {
                        session.set_max_skip(self.config.max_skipped_messages);
                        let history =
                            self.replay_history(&mut session, &entry.messages, &mut actions);
                        friend.session = Some(session);
                        friend.merge_history(history);
                    }
                    Err(error) => {
                        warn!(peer = %entry.uuid, %error, "Session backup rejected");
                        actions.push(AccountAction::Warning {
                            peer: Some(entry.uuid.clone()),
                            error,
                        });
                    }
                }
            }

            friends.insert(entry.uuid, friend);
        }

        self.friends = friends;
        info!(friends = self.friends.len(), "Friend list restored");

        actions.push(AccountAction::FriendListUpdated);
        Ok(actions)
    }

    fn replay_history(
        &self,
        session: &mut RatchetSession,
        stored: &[StoredMessage],
        actions: &mut Vec<AccountAction>,
    ) -> Vec<ChatMessage> {
        let mut history = Vec::with_capacity(stored.len());

        for message in stored {
            if message.kind != FrameType::Text {
                continue;
            }

            match self.replay_message(session, message) {
                Ok(chat_message) => history.push(chat_message),
                Err(error) => {
                    debug!(%error, "Stored message could not be decrypted");
                    actions.push(AccountAction::Warning {
                        peer: Some(message.sender.clone()),
                        error,
                    });
                }
            }
        }

        history
    }

    fn replay_message(
        &self,
        session: &mut RatchetSession,
        message: &StoredMessage,
    ) -> Result<ChatMessage, Error> {
        let envelope = EncryptedEnvelope::from_json(&message.data)?;
        let direction = if message.sender == self.uuid {
            Direction::Send
        } else {
            Direction::Receive
        };

        let message_key = session.message_key(direction, envelope.epoch, envelope.step)?;
        let plaintext = aead_decrypt(&message_key, &envelope.iv, &envelope.ciphertext)?;

        Ok(ChatMessage {
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            content: encoding::from_utf8(plaintext)?,
            timestamp: envelope.timestamp,
        })
    }

    /// Re-announces every rotation the peer has not confirmed yet.
    fn handle_reconnected(&mut self) -> Vec<AccountAction> {
        let mut actions = Vec::new();

        for friend in self.friends.values() {
            let Some(session) = friend.session.as_ref() else {
                continue;
            };

            let frame = session
                .pending_rotation(&self.identity)
                .and_then(|rotation| {
                    rotation
                        .map(|rotation| rotation_frame(&self.uuid, friend.uuid(), &rotation))
                        .transpose()
                });
            match frame {
                Ok(None) => {}
                Ok(Some(frame)) => {
                    debug!(peer = friend.uuid(), "Resending key rotation");
                    actions.push(AccountAction::Send(frame));
                }
                Err(error) => actions.push(AccountAction::Warning {
                    peer: Some(friend.uuid().to_string()),
                    error,
                }),
            }
        }

        actions
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("uuid", &self.uuid)
            .field("friends", &self.friends.len())
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

fn rotation_frame(owner: &str, peer: &str, rotation: &KeyRotation) -> Result<Frame, Error> {
    Ok(Frame::new(
        FrameType::ChangePublickey,
        owner,
        peer,
        rotation.payload().to_json()?,
    ))
}

fn text_frame(owner: &str, peer: &str, envelope: &EncryptedEnvelope) -> Result<Frame, Error> {
    Ok(Frame::new(FrameType::Text, owner, peer, envelope.to_json()?))
}

fn backup_frame(
    owner: &str,
    peer: &str,
    session: &RatchetSession,
    secret: &PasswordDerivedSecret,
    config: &AccountConfig,
) -> Result<Frame, Error> {
    let backup = proto::encode(session, secret, &config.protocol_info)?;
    Ok(Frame::new(
        FrameType::ChangeKeychain,
        owner,
        peer,
        backup.to_json()?,
    ))
}
