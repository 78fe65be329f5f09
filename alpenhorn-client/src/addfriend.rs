//! The client side of a contact-discovery round.
//!
//! Announcement-driven: every coordinator announcement maps to one local
//! action. The client emits exactly one onion per round whether or not a
//! real friend request is queued; the choice between a real introduction
//! and cover zeros is made with a constant-time copy, and state is
//! persisted at the same point of every round either way.

use std::convert::TryInto;

use futures::future::join_all;
use rayon::{iter::ParallelIterator, slice::ParallelSlice};
use subtle::Choice;
use tracing::{debug, info, warn};

use alpenhorn_core::{
    announce::Announcement,
    crypto::{
        BlsSignature,
        ByteObject,
        IbeIdentityPrivateKey,
        IbeMasterPublicKey,
        SealedBox,
        SharedSecret,
    },
    identity::{username_to_mailbox, Identity},
    keywheel::SECRET_LENGTH,
    message::{
        AddFriendMessage,
        EncryptedIntroduction,
        FromBytes,
        Introduction,
        ToBytes,
        ENCRYPTED_INTRODUCTION_LENGTH,
        INTRODUCTION_LENGTH,
    },
    onion,
    pkg::{
        extract_reply_message,
        extract_request_message,
        verify_pkg_settings,
        Attestation,
        ExtractRequest,
    },
    ServiceName,
};

use crate::{
    client::{Client, IncomingRequest},
    events::ClientEvent,
    traits::CoordinatorChannel,
};

/// How far past the latest known dialing round a fresh friendship is
/// anchored, leaving room for rounds already in flight.
const DIALING_ROUND_SLACK: u32 = 2;

impl Client {
    /// Handles one contact-discovery announcement.
    ///
    /// Failures never tear the client down: they surface as
    /// [`ClientEvent::Error`] and the client keeps participating in future
    /// rounds. A real friend request lost to a failed round stays in the
    /// outgoing queue, unchanged.
    pub async fn handle_addfriend(
        &self,
        announcement: Announcement,
        channel: &mut (dyn CoordinatorChannel + Send),
    ) -> Vec<ClientEvent> {
        match announcement {
            Announcement::NewRound { round, config_hash } => {
                self.addfriend_new_round(round, &config_hash).await
            }
            Announcement::Pkg {
                round,
                pkg_settings,
            } => self.addfriend_pkg(round, pkg_settings).await,
            Announcement::Mix {
                settings,
                signatures,
            } => self.addfriend_mix(settings, signatures, channel).await,
            Announcement::Mailbox {
                round,
                url,
                num_mailboxes,
            } => self.addfriend_mailbox(round, &url, num_mailboxes).await,
            Announcement::Error { round, description } => self.addfriend_error(round, description),
        }
    }

    async fn addfriend_new_round(&self, round: u32, config_hash: &str) -> Vec<ClientEvent> {
        let events = match self.ensure_config(ServiceName::AddFriend, config_hash).await {
            Ok(events) => events,
            Err(description) => {
                warn!("skipping round {}: {}", round, description);
                return vec![ClientEvent::Error {
                    service: ServiceName::AddFriend,
                    round,
                    description,
                }];
            }
        };

        let mut state = self.state.lock().unwrap();
        state.new_addfriend_round(round);
        debug!("created contact-discovery state for round {}", round);
        events
    }

    async fn addfriend_pkg(
        &self,
        round: u32,
        pkg_settings: alpenhorn_core::pkg::PkgSettings,
    ) -> Vec<ClientEvent> {
        // snapshot everything the extraction needs, then drop the lock for
        // the network round trips
        let (round_state, pkgs, username, login, long_term_key) = {
            let state = self.state.lock().unwrap();
            let round_state = match state.addfriend_rounds.get(&round) {
                Some(round_state) => round_state.clone(),
                None => {
                    warn!("ignoring PKG settings for unannounced round {}", round);
                    return Vec::new();
                }
            };
            (
                round_state,
                state.addfriend_inner.pkgs.clone(),
                state.persisted.username.clone(),
                state.persisted.login.clone(),
                state.persisted.long_term.public,
            )
        };

        let expected: Vec<_> = pkgs.iter().map(|entry| entry.key).collect();
        if let Err(e) = verify_pkg_settings(round, &pkg_settings, &expected) {
            warn!("round {} has invalid PKG settings: {}", round, e);
            return vec![ClientEvent::Error {
                service: ServiceName::AddFriend,
                round,
                description: format!("invalid PKG settings: {}", e),
            }];
        }

        // collect the revealed keys in configuration order
        let infos: Vec<_> = pkgs
            .iter()
            // unwrap safe: verification checked every configured PKG is present
            .map(|entry| pkg_settings.get(&entry.key.to_hex()).unwrap().clone())
            .collect();
        let master = IbeMasterPublicKey::aggregate(infos.iter().map(|i| &i.master_public_key));
        let return_public = {
            let mut round_state = round_state.lock().unwrap();
            round_state.bls_keys = infos.iter().map(|i| i.bls_public_key).collect();
            round_state.master = Some(master);
            round_state.return_keys.public
        };

        // unwrap safe: the client's own username was validated at construction
        let identity = Identity::from_username(&username).unwrap();
        let requests: Vec<ExtractRequest> = pkgs
            .iter()
            .map(|entry| {
                let message = extract_request_message(
                    &entry.key,
                    round,
                    &identity,
                    &return_public,
                    &long_term_key,
                );
                ExtractRequest {
                    round,
                    username: username.clone(),
                    return_key: return_public,
                    long_term_key,
                    signature: login.secret.sign_detached(&message),
                }
            })
            .collect();

        let calls = pkgs.iter().zip(requests).map(|(entry, request)| {
            let pkg = self.io.pkgs.connect(entry);
            async move { pkg.extract(request).await }
        });
        let replies = join_all(calls).await;

        let mut private_keys = Vec::with_capacity(pkgs.len());
        let mut attestations = Vec::with_capacity(pkgs.len());
        let return_secret = round_state.lock().unwrap().return_keys.secret.clone();
        for (i, (entry, reply)) in pkgs.iter().zip(replies).enumerate() {
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    if e.to_string().contains("not registered") {
                        info!("Username {:?} not registered with PKG {}", username, entry.address);
                    } else {
                        warn!("extraction failed at PKG {}: {}", entry.address, e);
                    }
                    return vec![ClientEvent::Error {
                        service: ServiceName::AddFriend,
                        round,
                        description: format!("extraction failed at PKG {}: {}", entry.address, e),
                    }];
                }
            };

            let verified = reply.round == round
                && entry.key.verify_detached(
                    &reply.signature,
                    &extract_reply_message(round, &identity, &reply.encrypted_private_key),
                );
            if !verified {
                warn!("PKG {} returned a bad extraction reply", entry.address);
                return vec![ClientEvent::Error {
                    service: ServiceName::AddFriend,
                    round,
                    description: format!("bad extraction reply from PKG {}", entry.address),
                }];
            }

            let private_key = SealedBox::open(&return_secret, &reply.encrypted_private_key)
                .ok()
                .and_then(|bytes| IbeIdentityPrivateKey::from_bytes(&bytes));
            let private_key = match private_key {
                Some(private_key) => private_key,
                None => {
                    warn!("PKG {} returned an unopenable private key", entry.address);
                    return vec![ClientEvent::Error {
                        service: ServiceName::AddFriend,
                        round,
                        description: format!("unopenable private key from PKG {}", entry.address),
                    }];
                }
            };

            let attestation = Attestation {
                bls_public: infos[i].bls_public_key,
                identity,
                long_term_key,
            };
            if !infos[i]
                .bls_public_key
                .verify(&reply.identity_sig, &attestation.to_bytes())
            {
                warn!("PKG {} attested the identity incorrectly", entry.address);
                return vec![ClientEvent::Error {
                    service: ServiceName::AddFriend,
                    round,
                    description: format!("bad attestation from PKG {}", entry.address),
                }];
            }

            private_keys.push(private_key);
            attestations.push(reply.identity_sig);
        }

        let mut round_state = round_state.lock().unwrap();
        round_state.identity_key = Some(IbeIdentityPrivateKey::aggregate(&private_keys));
        round_state.attestations = attestations;
        round_state.extract_success = true;
        debug!("extracted identity keys from {} PKGs", pkgs.len());
        Vec::new()
    }

    async fn addfriend_mix(
        &self,
        settings: alpenhorn_core::common::RoundSettings,
        signatures: Vec<alpenhorn_core::crypto::Signature>,
        channel: &mut (dyn CoordinatorChannel + Send),
    ) -> Vec<ClientEvent> {
        let round = settings.round;

        // snapshot under the lock, build and submit the onion outside it
        let (round_state, request, anchor, username, long_term, incoming_match) = {
            let state = self.state.lock().unwrap();
            let round_state = match state.addfriend_rounds.get(&round) {
                Some(round_state) => round_state.clone(),
                None => {
                    warn!("ignoring mix settings for unannounced round {}", round);
                    return Vec::new();
                }
            };
            if let Err(description) = Self::verify_mix_announcement(
                &settings,
                &signatures,
                &state.addfriend_inner.mix_servers,
                ServiceName::AddFriend,
            ) {
                warn!("round {}: {}", round, description);
                return vec![ClientEvent::Error {
                    service: ServiceName::AddFriend,
                    round,
                    description,
                }];
            }
            let request = state
                .persisted
                .outgoing_requests
                .iter()
                .find(|r| r.sent_dialing_round.is_none())
                .cloned();
            let anchor = state.persisted.latest_dialing_round + DIALING_ROUND_SLACK;
            let incoming_match = request.as_ref().and_then(|r| {
                state
                    .persisted
                    .incoming_requests
                    .iter()
                    .find(|i| i.friend == r.friend)
                    .cloned()
            });
            (
                round_state,
                request,
                anchor,
                state.persisted.username.clone(),
                state.persisted.long_term.clone(),
                incoming_match,
            )
        };

        let (extract_success, master, attestations) = {
            let round_state = round_state.lock().unwrap();
            (
                round_state.extract_success,
                round_state.master.clone(),
                round_state.attestations.clone(),
            )
        };

        let is_real = extract_success && request.is_some();
        let friend = match (&request, is_real) {
            (Some(request), true) => request.friend.clone(),
            _ => String::new(),
        };

        // the ciphertext is produced whether or not this round is real; the
        // constant-time copy below decides what actually leaves the client
        // unwrap safe: the client's own username was validated at construction
        let own_identity = Identity::from_username(&username).unwrap();
        let ciphertext = match &master {
            Some(master) => {
                if is_real {
                    let intro = Introduction::new_signed(
                        own_identity,
                        // unwrap safe: is_real implies the request exists
                        request.as_ref().unwrap().dh.public,
                        &long_term.secret,
                        anchor,
                        BlsSignature::aggregate(&attestations),
                    );
                    // unwrap safe: real requests are validated at queue time
                    let recipient = Identity::from_username(&friend).unwrap();
                    master.encrypt(&recipient, &intro.to_vec())
                } else {
                    master.encrypt(&own_identity, &[0_u8; INTRODUCTION_LENGTH])
                }
            }
            // no revealed master key this round: the round is cover-only
            None => vec![0_u8; ENCRYPTED_INTRODUCTION_LENGTH],
        };
        let encrypted_intro =
            EncryptedIntroduction::conditional_copy(&ciphertext, Choice::from(is_real as u8));
        let message = AddFriendMessage {
            mailbox_id: username_to_mailbox(&friend, settings.num_mailboxes),
            encrypted_intro,
        }
        .to_vec();
        let onion = onion::seal(&message, &settings.onion_keys);

        if let Err(e) = channel.send_onion(round, onion).await {
            warn!("failed to submit the round {} onion: {}", round, e);
            let state = self.state.lock().unwrap();
            let _ = self.persist(&state);
            return vec![ClientEvent::Error {
                service: ServiceName::AddFriend,
                round,
                description: format!("failed to submit the onion: {}", e),
            }];
        }

        let mut events = Vec::new();
        let mut state = self.state.lock().unwrap();
        round_state.lock().unwrap().settings = Some(settings);
        if is_real {
            // unwrap safe: is_real implies the request exists
            let friend = request.unwrap().friend;
            if let Some(entry) = state
                .persisted
                .outgoing_requests
                .iter_mut()
                .find(|r| r.friend == friend)
            {
                entry.sent_dialing_round = Some(anchor);
            }
            round_state.lock().unwrap().sent_friend = Some(friend.clone());
            events.push(ClientEvent::SentFriendRequest {
                friend: friend.clone(),
            });

            // their introduction already arrived: the friendship completes
            // the moment ours goes out
            if let Some(incoming) = incoming_match {
                events.extend(state.confirm_friend(
                    &friend,
                    &incoming.dh_public,
                    incoming.dialing_round.max(anchor),
                ));
            }
        }
        let _ = self.persist(&state);
        events
    }

    async fn addfriend_mailbox(
        &self,
        round: u32,
        url: &str,
        num_mailboxes: u32,
    ) -> Vec<ClientEvent> {
        // the round state is destroyed after the scan, whatever happens
        let (round_state, username) = {
            let mut state = self.state.lock().unwrap();
            let round_state = match state.addfriend_rounds.remove(&round) {
                Some(round_state) => round_state,
                None => {
                    warn!("ignoring mailboxes for unannounced round {}", round);
                    return Vec::new();
                }
            };
            (round_state, state.persisted.username.clone())
        };

        let (extract_success, identity_key, bls_keys, signed_mailboxes) = {
            let round_state = round_state.lock().unwrap();
            (
                round_state.extract_success,
                round_state.identity_key.clone(),
                round_state.bls_keys.clone(),
                round_state.settings.as_ref().map(|s| s.num_mailboxes),
            )
        };
        // the cascade-signed mailbox count outranks the bare announcement
        let num_mailboxes = signed_mailboxes.unwrap_or(num_mailboxes);

        let mut events = Vec::new();
        let intros = if let (true, Some(identity_key), true) =
            (extract_success, identity_key, num_mailboxes > 0)
        {
            let mailbox_id = username_to_mailbox(&username, num_mailboxes);
            match self.io.mailboxes.fetch(url, mailbox_id).await {
                Ok(blob) => {
                    let blob = blob.unwrap_or_default();
                    if blob.len() % ENCRYPTED_INTRODUCTION_LENGTH != 0 {
                        events.push(ClientEvent::Error {
                            service: ServiceName::AddFriend,
                            round,
                            description: format!("mailbox size {} is not slot-aligned", blob.len()),
                        });
                        Vec::new()
                    } else {
                        scan_mailbox(&blob, &identity_key)
                    }
                }
                Err(e) => {
                    events.push(ClientEvent::Error {
                        service: ServiceName::AddFriend,
                        round,
                        description: format!("failed to fetch the mailbox: {}", e),
                    });
                    Vec::new()
                }
            }
        } else {
            debug!("round {} is unusable, skipping the mailbox scan", round);
            Vec::new()
        };

        let mut state = self.state.lock().unwrap();
        for intro in intros {
            let sender = intro.identity.username();
            if sender == username || state.persisted.friends.contains(&sender) {
                continue;
            }

            // attestation closure: the aggregate must verify against every
            // PKG's per-round BLS key for this sender
            let messages: Vec<Vec<u8>> = bls_keys
                .iter()
                .map(|bls_public| {
                    Attestation {
                        bls_public: *bls_public,
                        identity: intro.identity,
                        long_term_key: intro.long_term_key,
                    }
                    .to_bytes()
                })
                .collect();
            let attested = intro.multisig.verify_aggregate(
                bls_keys
                    .iter()
                    .zip(messages.iter().map(Vec::as_slice)),
            );
            if !attested {
                warn!("dropping introduction from {:?}: attestation failed", sender);
                continue;
            }

            let sent = state
                .persisted
                .outgoing_requests
                .iter()
                .find(|r| r.friend == sender)
                .and_then(|r| r.sent_dialing_round);
            match sent {
                Some(our_anchor) => {
                    events.extend(state.confirm_friend(
                        &sender,
                        &intro.dh_public,
                        intro.dialing_round.max(our_anchor),
                    ));
                }
                None => {
                    let incoming = IncomingRequest {
                        friend: sender.clone(),
                        dh_public: intro.dh_public,
                        long_term_key: intro.long_term_key,
                        dialing_round: intro.dialing_round,
                    };
                    let fresh = !state
                        .persisted
                        .incoming_requests
                        .iter()
                        .any(|i| i.friend == sender);
                    state
                        .persisted
                        .incoming_requests
                        .retain(|i| i.friend != sender);
                    state.persisted.incoming_requests.push(incoming);
                    if fresh {
                        events.push(ClientEvent::ReceivedFriendRequest { friend: sender });
                    }
                }
            }
        }
        let _ = self.persist(&state);
        events
    }

    fn addfriend_error(&self, round: u32, description: String) -> Vec<ClientEvent> {
        let mut state = self.state.lock().unwrap();
        if let Some(round_state) = state.addfriend_rounds.remove(&round) {
            // a request sent into a failed round goes back to the queue
            if let Some(friend) = round_state.lock().unwrap().sent_friend.clone() {
                if let Some(entry) = state
                    .persisted
                    .outgoing_requests
                    .iter_mut()
                    .find(|r| r.friend == friend)
                {
                    entry.sent_dialing_round = None;
                }
            }
        }
        let _ = self.persist(&state);
        vec![ClientEvent::Error {
            service: ServiceName::AddFriend,
            round,
            description,
        }]
    }
}

impl crate::client::ClientState {
    /// Creates the per-round state and drops rounds that can no longer
    /// receive announcements.
    pub(crate) fn new_addfriend_round(&mut self, round: u32) {
        self.addfriend_rounds.insert(
            round,
            std::sync::Arc::new(std::sync::Mutex::new(
                crate::client::AddFriendRound::new(),
            )),
        );
        self.addfriend_rounds.retain(|&id, _| id + 1 >= round);
    }

    /// Installs a confirmed friendship: derives the shared secret, anchors
    /// the keywheel and clears the pending request state.
    pub(crate) fn confirm_friend(
        &mut self,
        friend: &str,
        their_dh: &alpenhorn_core::crypto::PublicEncryptKey,
        anchor: u32,
    ) -> Vec<ClientEvent> {
        let our_dh = match self
            .persisted
            .outgoing_requests
            .iter()
            .find(|r| r.friend == friend)
        {
            Some(request) => request.dh.clone(),
            None => return Vec::new(),
        };
        let shared = SharedSecret::derive(their_dh, &our_dh.secret);
        // unwrap safe: shared secrets and wheel secrets are both 32 bytes
        let secret: [u8; SECRET_LENGTH] = shared.as_slice().try_into().unwrap();
        self.keywheel.insert(friend, anchor, secret);
        self.persisted.friends.insert(friend.to_string());
        self.persisted.outgoing_requests.retain(|r| r.friend != friend);
        self.persisted.incoming_requests.retain(|i| i.friend != friend);
        vec![ClientEvent::ConfirmedFriend {
            friend: friend.to_string(),
        }]
    }
}

/// Scans a mailbox blob: every fixed-size slot is tried against the round's
/// aggregate identity key in parallel; slots that decrypt are parsed and the
/// sender signature checked. Slots addressed to other identities fail
/// decryption and are dropped silently.
fn scan_mailbox(blob: &[u8], identity_key: &IbeIdentityPrivateKey) -> Vec<Introduction> {
    blob.par_chunks(ENCRYPTED_INTRODUCTION_LENGTH)
        .filter_map(|slot| identity_key.decrypt(slot).ok())
        .filter_map(|plaintext| Introduction::from_bytes(&plaintext).ok())
        .filter(|intro| intro.verify_sender())
        .collect()
}
