#[cfg(test)]
mod integration_tests {
    use proptest::prelude::*;
    use std::collections::{HashMap, VecDeque};
    use tandem::{
        Account, AccountAction, AccountEvent, ChainBackup, Error, Frame, FrameType,
        FriendListEntry, Handshake, IdentityKey, PasswordDerivedSecret, StoredMessage,
        UserRecord, runtime,
    };
    use tokio::sync::mpsc;

    fn account(uuid: &str, identity: IdentityKey) -> Account {
        let secret = PasswordDerivedSecret::derive(uuid, "correct horse").unwrap();
        Account::new(uuid, identity, secret, None)
    }

    /// In-memory stand-in for the relay: routes frames, assigns ids, keeps
    /// backups and text history, and answers directory requests.
    struct Relay {
        accounts: HashMap<String, Account>,
        users: Vec<UserRecord>,
        next_id: u64,
        backups: HashMap<(String, String), ChainBackup>,
        history: Vec<StoredMessage>,
        queue: VecDeque<Frame>,
        outputs: HashMap<String, Vec<AccountAction>>,
    }

    impl Relay {
        fn new(accounts: Vec<Account>) -> Self {
            let users = accounts
                .iter()
                .map(|account| UserRecord {
                    uuid: account.uuid().to_string(),
                    username: account.uuid().to_uppercase(),
                    avatar_url: String::new(),
                    public_key: account.public_key().to_base64(),
                })
                .collect();

            Self {
                accounts: accounts
                    .into_iter()
                    .map(|account| (account.uuid().to_string(), account))
                    .collect(),
                users,
                next_id: 1,
                backups: HashMap::new(),
                history: Vec::new(),
                queue: VecDeque::new(),
                outputs: HashMap::new(),
            }
        }

        fn account(&self, uuid: &str) -> &Account {
            &self.accounts[uuid]
        }

        fn directory_frame(&self, receiver: &str) -> Frame {
            Frame::new(
                FrameType::UpdateUserlist,
                "relay",
                receiver,
                serde_json::to_string(&self.users).unwrap(),
            )
        }

        fn publish_directory(&mut self) {
            let uuids: Vec<String> = self.accounts.keys().cloned().collect();
            for uuid in uuids {
                let frame = self.directory_frame(&uuid);
                self.queue.push_back(frame);
            }
            self.pump();
        }

        /// Feeds a user event and routes everything it causes. Returns the
        /// actions the account emitted directly, before any routing.
        fn event(&mut self, uuid: &str, event: AccountEvent) -> Vec<AccountAction> {
            let actions = self.accounts.get_mut(uuid).unwrap().handle(event);
            self.collect(uuid, actions.clone());
            self.pump();
            actions
        }

        fn collect(&mut self, uuid: &str, actions: Vec<AccountAction>) {
            for action in actions {
                match action {
                    AccountAction::Send(frame) => self.route(frame),
                    other => self.outputs.entry(uuid.to_string()).or_default().push(other),
                }
            }
        }

        fn route(&mut self, mut frame: Frame) {
            match frame.kind {
                FrameType::ChangeKeychain => {
                    let backup: ChainBackup = serde_json::from_str(&frame.data).unwrap();
                    self.backups
                        .insert((frame.sender.clone(), frame.receiver.clone()), backup);
                }
                FrameType::UpdateUserlist if frame.sender == frame.receiver => {
                    let reply = self.directory_frame(&frame.sender);
                    self.queue.push_back(reply);
                }
                // Receipts stop at the relay.
                FrameType::EventConfirm => {}
                _ => {
                    if frame.kind == FrameType::Text {
                        self.history.push(StoredMessage {
                            kind: frame.kind,
                            data: frame.data.clone(),
                            sender: frame.sender.clone(),
                            receiver: frame.receiver.clone(),
                        });
                    }
                    frame.id = self.next_id;
                    self.next_id += 1;
                    self.queue.push_back(frame);
                }
            }
        }

        fn pump(&mut self) {
            while let Some(frame) = self.queue.pop_front() {
                let receiver = frame.receiver.clone();
                let Some(account) = self.accounts.get_mut(&receiver) else {
                    continue;
                };
                let actions = account.handle(AccountEvent::FrameReceived(frame));
                self.collect(&receiver, actions);
            }
        }

        fn take_outputs(&mut self, uuid: &str) -> Vec<AccountAction> {
            self.outputs.remove(uuid).unwrap_or_default()
        }

        fn friend_list(&self, owner: &str, friend: &str) -> Frame {
            let backup = self.backups[&(owner.to_string(), friend.to_string())].clone();
            let user = self
                .users
                .iter()
                .find(|user| user.uuid == friend)
                .cloned()
                .unwrap();
            let messages = self
                .history
                .iter()
                .filter(|message| {
                    (message.sender == owner && message.receiver == friend)
                        || (message.sender == friend && message.receiver == owner)
                })
                .cloned()
                .collect();

            let entries = vec![FriendListEntry {
                uuid: user.uuid,
                username: user.username,
                avatar_url: user.avatar_url,
                public_key: user.public_key,
                chain_iv: backup.chain_iv,
                chain_key: backup.chain_key,
                messages,
            }];

            Frame::new(
                FrameType::UpdateFriendlist,
                "relay",
                owner,
                serde_json::to_string(&entries).unwrap(),
            )
        }
    }

    fn delivered(actions: &[AccountAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|action| match action {
                AccountAction::Deliver { message, .. } => Some(message.content.clone()),
                _ => None,
            })
            .collect()
    }

    fn send_text(relay: &mut Relay, from: &str, to: &str, text: &str, timestamp: u64) {
        relay.event(
            from,
            AccountEvent::SendText {
                to: to.to_string(),
                text: text.to_string(),
                timestamp,
            },
        );
    }

    fn befriend(relay: &mut Relay, initiator: &str, responder: &str) {
        relay.publish_directory();
        relay.event(
            initiator,
            AccountEvent::AddFriend {
                uuid: responder.to_string(),
            },
        );
        assert!(
            relay
                .take_outputs(responder)
                .contains(&AccountAction::FriendRequest {
                    from: initiator.to_string()
                })
        );

        relay.event(
            responder,
            AccountEvent::AnswerFriendRequest {
                uuid: initiator.to_string(),
                accept: true,
            },
        );
        assert!(
            relay
                .take_outputs(initiator)
                .contains(&AccountAction::FriendAdded {
                    uuid: responder.to_string()
                })
        );
        relay.take_outputs(responder);
    }

    #[test]
    fn test_full_protocol_flow() {
        let mut relay = Relay::new(vec![
            account("alice", IdentityKey::new().unwrap()),
            account("bob", IdentityKey::new().unwrap()),
        ]);
        befriend(&mut relay, "alice", "bob");
        assert!(relay.account("alice").friend("bob").is_some());
        assert!(relay.account("bob").friend("alice").is_some());

        send_text(&mut relay, "alice", "bob", "hi", 1_000);
        assert_eq!(delivered(&relay.take_outputs("bob")), vec!["hi"]);

        // The responder's first reply needs a fresh key, so the text waits
        // for the peer to acknowledge it. The backup goes out first.
        let actions = relay.accounts.get_mut("bob").unwrap().handle(AccountEvent::SendText {
            to: "alice".to_string(),
            text: "hello".to_string(),
            timestamp: 2_000,
        });
        let kinds: Vec<FrameType> = actions
            .iter()
            .filter_map(|action| match action {
                AccountAction::Send(frame) => Some(frame.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![FrameType::ChangeKeychain, FrameType::ChangePublickey]);
        assert_eq!(relay.account("bob").friend("alice").unwrap().held_messages(), 1);

        relay.collect("bob", actions);
        relay.pump();
        assert_eq!(relay.account("bob").friend("alice").unwrap().held_messages(), 0);
        assert_eq!(delivered(&relay.take_outputs("alice")), vec!["hello"]);

        send_text(&mut relay, "alice", "bob", "how are you?", 3_000);
        send_text(&mut relay, "bob", "alice", "fine", 4_000);
        send_text(&mut relay, "bob", "alice", "and you?", 5_000);
        send_text(&mut relay, "alice", "bob", "great", 6_000);

        assert_eq!(
            delivered(&relay.take_outputs("bob")),
            vec!["how are you?", "great"]
        );
        assert_eq!(delivered(&relay.take_outputs("alice")), vec!["fine", "and you?"]);

        let alice_session = relay.account("alice").friend("bob").unwrap().session().unwrap();
        let bob_session = relay.account("bob").friend("alice").unwrap().session().unwrap();
        assert!(alice_session.send_chain().len().abs_diff(alice_session.recv_chain().len()) <= 1);
        assert_eq!(alice_session.root_chain().len(), bob_session.root_chain().len());
        assert!(alice_session.awaiting_ack().is_none());
        assert!(bob_session.awaiting_ack().is_none());

        let log: Vec<&str> = relay
            .account("alice")
            .friend("bob")
            .unwrap()
            .messages()
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(log, vec!["great", "and you?", "fine", "how are you?", "hello", "hi"]);
    }

    #[test]
    fn test_rotation_resent_after_reconnect() {
        let mut relay = Relay::new(vec![
            account("alice", IdentityKey::new().unwrap()),
            account("bob", IdentityKey::new().unwrap()),
        ]);
        befriend(&mut relay, "alice", "bob");
        send_text(&mut relay, "alice", "bob", "hi", 1_000);

        // The announcement is lost on the way to the relay.
        let bob = relay.accounts.get_mut("bob").unwrap();
        bob.handle(AccountEvent::SendText {
            to: "alice".to_string(),
            text: "hello".to_string(),
            timestamp: 2_000,
        });
        assert_eq!(bob.friend("alice").unwrap().held_messages(), 1);

        // A receipt naming the new key is not an acknowledgement.
        let pending = bob
            .friend("alice")
            .unwrap()
            .session()
            .unwrap()
            .awaiting_ack()
            .unwrap()
            .to_base64();
        bob.handle(AccountEvent::FrameReceived(Frame::new(
            FrameType::EventConfirm,
            "alice",
            "bob",
            pending,
        )));
        assert_eq!(bob.friend("alice").unwrap().held_messages(), 1);

        let actions = bob.handle(AccountEvent::Reconnected);
        assert!(matches!(
            actions.as_slice(),
            [AccountAction::Send(frame)] if frame.kind == FrameType::ChangePublickey
        ));

        relay.collect("bob", actions);
        relay.pump();
        assert_eq!(delivered(&relay.take_outputs("alice")), vec!["hello"]);
        let bob_friend = relay.account("bob").friend("alice").unwrap();
        assert_eq!(bob_friend.held_messages(), 0);
        assert!(bob_friend.session().unwrap().awaiting_ack().is_none());
    }

    #[test]
    fn test_held_messages_released_without_receipts() {
        let mut relay = Relay::new(vec![
            account("alice", IdentityKey::new().unwrap()),
            account("bob", IdentityKey::new().unwrap()),
        ]);
        befriend(&mut relay, "alice", "bob");

        send_text(&mut relay, "alice", "bob", "hi", 1_000);
        send_text(&mut relay, "bob", "alice", "hello", 2_000);
        send_text(&mut relay, "bob", "alice", "still there?", 3_000);
        relay.event("bob", AccountEvent::Reconnected);

        assert_eq!(relay.account("bob").friend("alice").unwrap().held_messages(), 0);
        assert_eq!(
            delivered(&relay.take_outputs("alice")),
            vec!["hello", "still there?"]
        );
        assert_eq!(relay.account("alice").friend("bob").unwrap().messages().len(), 3);
    }

    #[test]
    fn test_held_messages_survive_restore() {
        let bob_identity = IdentityKey::new().unwrap();
        let mut relay = Relay::new(vec![
            account("alice", IdentityKey::new().unwrap()),
            account("bob", bob_identity.clone()),
        ]);
        befriend(&mut relay, "alice", "bob");
        send_text(&mut relay, "alice", "bob", "hi", 1_000);
        relay.take_outputs("bob");

        // Only the backup reaches the relay before Bob goes offline.
        let actions = relay.accounts.get_mut("bob").unwrap().handle(AccountEvent::SendText {
            to: "alice".to_string(),
            text: "hello".to_string(),
            timestamp: 2_000,
        });
        for action in actions {
            if let AccountAction::Send(frame) = action {
                if frame.kind == FrameType::ChangeKeychain {
                    relay.route(frame);
                }
            }
        }
        relay.pump();

        let mut restored = account("bob", bob_identity);
        restored.handle(AccountEvent::FrameReceived(relay.directory_frame("bob")));
        let actions = restored.handle(AccountEvent::FrameReceived(
            relay.friend_list("bob", "alice"),
        ));
        assert!(actions.contains(&AccountAction::FriendListUpdated));
        assert_eq!(restored.friend("alice").unwrap().held_messages(), 1);

        relay.accounts.insert("bob".to_string(), restored);
        relay.event("bob", AccountEvent::Reconnected);

        assert_eq!(delivered(&relay.take_outputs("alice")), vec!["hello"]);
        let bob_friend = relay.account("bob").friend("alice").unwrap();
        assert_eq!(bob_friend.held_messages(), 0);
        assert!(bob_friend.session().unwrap().awaiting_ack().is_none());
    }

    #[test]
    fn test_friend_request_denied() {
        let mut relay = Relay::new(vec![
            account("alice", IdentityKey::new().unwrap()),
            account("bob", IdentityKey::new().unwrap()),
        ]);
        relay.publish_directory();

        relay.event(
            "alice",
            AccountEvent::AddFriend {
                uuid: "bob".to_string(),
            },
        );
        relay.event(
            "bob",
            AccountEvent::AnswerFriendRequest {
                uuid: "alice".to_string(),
                accept: false,
            },
        );

        assert!(
            relay
                .take_outputs("alice")
                .contains(&AccountAction::FriendRequestDenied {
                    uuid: "bob".to_string()
                })
        );
        assert!(relay.account("alice").friend("bob").is_none());
        assert!(relay.account("bob").friend("alice").is_none());
    }

    #[test]
    fn test_unknown_sender_refreshes_directory() {
        let mut relay = Relay::new(vec![
            account("alice", IdentityKey::new().unwrap()),
            account("bob", IdentityKey::new().unwrap()),
        ]);

        // Bob sends before Alice has ever seen a directory.
        let directory = relay.directory_frame("bob");
        relay.queue.push_back(directory);
        relay.pump();
        relay.event(
            "bob",
            AccountEvent::AddFriend {
                uuid: "alice".to_string(),
            },
        );

        let alice_outputs = relay.take_outputs("alice");
        assert!(alice_outputs.iter().any(|action| matches!(
            action,
            AccountAction::Warning {
                error: Error::PeerUnknown(_),
                ..
            }
        )));
        assert!(relay.account("alice").user("bob").is_some());
        assert!(
            relay
                .take_outputs("bob")
                .contains(&AccountAction::FriendRequestDenied {
                    uuid: "alice".to_string()
                })
        );
    }

    #[test]
    fn test_friend_list_restore() {
        let alice_identity = IdentityKey::new().unwrap();
        let mut relay = Relay::new(vec![
            account("alice", alice_identity.clone()),
            account("bob", IdentityKey::new().unwrap()),
        ]);
        befriend(&mut relay, "alice", "bob");

        send_text(&mut relay, "alice", "bob", "hi", 1_000);
        send_text(&mut relay, "bob", "alice", "hello", 2_000);
        send_text(&mut relay, "alice", "bob", "bye", 3_000);
        relay.take_outputs("alice");
        relay.take_outputs("bob");

        // A fresh login with the same credentials.
        let mut restored = account("alice", alice_identity);
        restored.handle(AccountEvent::FrameReceived(relay.directory_frame("alice")));
        let actions = restored.handle(AccountEvent::FrameReceived(
            relay.friend_list("alice", "bob"),
        ));
        assert!(actions.contains(&AccountAction::FriendListUpdated));
        assert!(
            !actions
                .iter()
                .any(|action| matches!(action, AccountAction::Warning { .. }))
        );

        let friend = restored.friend("bob").unwrap();
        assert_eq!(friend.username(), "BOB");
        assert_eq!(
            friend.session(),
            relay.account("alice").friend("bob").unwrap().session()
        );

        let log: Vec<(&str, &str)> = friend
            .messages()
            .iter()
            .map(|message| (message.sender.as_str(), message.content.as_str()))
            .collect();
        assert_eq!(
            log,
            vec![("alice", "bye"), ("bob", "hello"), ("alice", "hi")]
        );

        // The restored session keeps talking to the live peer.
        relay.accounts.insert("alice".to_string(), restored);
        send_text(&mut relay, "bob", "alice", "welcome back", 4_000);
        assert_eq!(delivered(&relay.take_outputs("alice")), vec!["welcome back"]);
    }

    #[test]
    fn test_backup_under_wrong_password_rejected() {
        let alice_identity = IdentityKey::new().unwrap();
        let mut relay = Relay::new(vec![
            account("alice", alice_identity.clone()),
            account("bob", IdentityKey::new().unwrap()),
        ]);
        befriend(&mut relay, "alice", "bob");
        send_text(&mut relay, "alice", "bob", "hi", 1_000);

        let secret = PasswordDerivedSecret::derive("alice", "wrong horse").unwrap();
        let mut impostor = Account::new("alice", alice_identity, secret, None);
        let actions = impostor.handle(AccountEvent::FrameReceived(
            relay.friend_list("alice", "bob"),
        ));

        assert!(actions.contains(&AccountAction::Warning {
            peer: Some("bob".to_string()),
            error: Error::DecryptionFailed,
        }));
        let friend = impostor.friend("bob").unwrap();
        assert!(friend.session().is_none());
        assert!(friend.messages().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_processes_events_in_order() {
        let alice = account("alice", IdentityKey::new().unwrap());
        let directory = Frame::new(
            FrameType::UpdateUserlist,
            "relay",
            "alice",
            serde_json::to_string(&vec![UserRecord {
                uuid: "bob".to_string(),
                username: "bob".to_string(),
                avatar_url: String::new(),
                public_key: IdentityKey::new().unwrap().public_key().to_base64(),
            }])
            .unwrap(),
        );

        let (event_tx, event_rx) = mpsc::channel(8);
        let (action_tx, mut action_rx) = mpsc::channel(8);
        event_tx
            .send(AccountEvent::FrameReceived(directory))
            .await
            .unwrap();
        event_tx
            .send(AccountEvent::AddFriend {
                uuid: "bob".to_string(),
            })
            .await
            .unwrap();
        drop(event_tx);

        let alice = runtime::run(alice, event_rx, action_tx).await.unwrap();
        assert!(alice.user("bob").is_some());

        let mut kinds = Vec::new();
        while let Some(action) = action_rx.recv().await {
            if let AccountAction::Send(frame) = action {
                kinds.push(frame.kind);
            }
        }
        assert_eq!(kinds, vec![FrameType::EventConfirm, FrameType::EventAddfriend]);
    }

    #[tokio::test]
    async fn test_runtime_stops_without_transport() {
        let alice = account("alice", IdentityKey::new().unwrap());
        let (event_tx, event_rx) = mpsc::channel(4);
        let (action_tx, action_rx) = mpsc::channel(4);
        drop(action_rx);

        // Befriending a stranger yields a warning, which has nowhere to go.
        event_tx
            .send(AccountEvent::AddFriend {
                uuid: "nobody".to_string(),
            })
            .await
            .unwrap();
        drop(event_tx);

        let result = runtime::run(alice, event_rx, action_tx).await;
        assert_eq!(result.map(|_| ()), Err(Error::TransportUnavailable));
    }

    proptest! {
        #[test]
        fn prop_out_of_order_delivery(order in (1usize..8)
            .prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()))
        {
            let alice = IdentityKey::new().unwrap();
            let bob = IdentityKey::new().unwrap();
            let alice_secret = PasswordDerivedSecret::derive("alice", "pw").unwrap();

            let request = Handshake::initiate(&alice, &alice_secret).unwrap();
            let exchange = Handshake::verify(&request, &alice.public_key()).unwrap();
            let (reply, mut bob_session) = Handshake::respond(&bob, &exchange).unwrap();
            let answer = Handshake::verify(&reply, &bob.public_key()).unwrap();
            let mut alice_session = Handshake::complete(&alice_secret, &answer).unwrap();

            let envelopes: Vec<_> = (0..order.len())
                .map(|i| {
                    alice_session
                        .encrypt(&alice, format!("message {i}").as_bytes(), i as u64)
                        .unwrap()
                        .envelope
                })
                .collect();

            for &i in &order {
                let incoming = bob_session.decrypt(&bob, &envelopes[i]).unwrap();
                prop_assert_eq!(incoming.plaintext, format!("message {i}").into_bytes());
                prop_assert!(incoming.rotation.is_none());
            }
        }

        #[test]
        fn prop_interleaved_conversation(turns in proptest::collection::vec(any::<bool>(), 1..24)) {
            let alice = IdentityKey::new().unwrap();
            let bob = IdentityKey::new().unwrap();
            let secret = PasswordDerivedSecret::derive("alice", "pw").unwrap();
            let aad = b"Tandem-E2E-v1";

            let request = Handshake::initiate(&alice, &secret).unwrap();
            let exchange = Handshake::verify(&request, &alice.public_key()).unwrap();
            let (reply, bob_session) = Handshake::respond(&bob, &exchange).unwrap();
            let answer = Handshake::verify(&reply, &bob.public_key()).unwrap();
            let alice_session = Handshake::complete(&secret, &answer).unwrap();

            let mut parties = [(alice, alice_session), (bob, bob_session)];
            for (turn, alice_sends) in turns.into_iter().enumerate() {
                let [first, second] = &mut parties;
                let ((sender, sender_session), (receiver, receiver_session)) = if alice_sends {
                    (first, second)
                } else {
                    (second, first)
                };
                let text = format!("turn {turn}");

                let outgoing = sender_session
                    .encrypt(sender, text.as_bytes(), turn as u64)
                    .unwrap();
                if let Some(rotation) = &outgoing.rotation {
                    let ack = receiver_session
                        .apply_rotation(receiver, rotation, &sender.public_key())
                        .unwrap();
                    prop_assert!(sender_session.acknowledge(&ack, &receiver.public_key()).unwrap());
                }

                let incoming = receiver_session.decrypt(receiver, &outgoing.envelope).unwrap();
                prop_assert_eq!(incoming.plaintext, text.into_bytes());
                if let Some(rotation) = &incoming.rotation {
                    let ack = sender_session
                        .apply_rotation(sender, rotation, &receiver.public_key())
                        .unwrap();
                    prop_assert!(receiver_session.acknowledge(&ack, &sender.public_key()).unwrap());
                }

                for session in [&*sender_session, &*receiver_session] {
                    prop_assert!(session.send_chain().len().abs_diff(session.recv_chain().len()) <= 1);
                    let backup = tandem::proto::encode(session, &secret, aad).unwrap();
                    let restored = tandem::proto::decode(&backup, &secret, aad).unwrap();
                    prop_assert_eq!(&restored, session);
                }
            }
        }
    }
}
