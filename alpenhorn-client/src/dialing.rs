//! The client side of a dialing round.
//!
//! Per round the client publishes at most one dial token, derived from the
//! keywheel shared with the chosen friend; cover rounds publish a random
//! token into the cover mailbox. After scanning the round's Bloom filter,
//! the keywheel advances past the round and the older secrets are erased,
//! so nothing in the process can recompute a past session key.

use tracing::{debug, warn};

use alpenhorn_core::{
    announce::Announcement,
    bloom::BloomFilter,
    identity::username_to_mailbox,
    message::{DialMessage, DialToken, ToBytes},
    onion,
    crypto::ByteObject,
    ServiceName,
};

use crate::{
    client::{Client, QueuedCall},
    events::ClientEvent,
    traits::CoordinatorChannel,
};

impl Client {
    /// Handles one dialing announcement.
    ///
    /// Failures surface as [`ClientEvent::Error`]; a call notification lost
    /// to a failed round goes back to the front of the queue.
    pub async fn handle_dialing(
        &self,
        announcement: Announcement,
        channel: &mut (dyn CoordinatorChannel + Send),
    ) -> Vec<ClientEvent> {
        match announcement {
            Announcement::NewRound { round, config_hash } => {
                self.dialing_new_round(round, &config_hash).await
            }
            Announcement::Pkg { round, .. } => {
                warn!("ignoring PKG settings on the dialing channel for round {}", round);
                Vec::new()
            }
            Announcement::Mix {
                settings,
                signatures,
            } => self.dialing_mix(settings, signatures, channel).await,
            Announcement::Mailbox {
                round,
                url,
                num_mailboxes,
            } => self.dialing_mailbox(round, &url, num_mailboxes).await,
            Announcement::Error { round, description } => self.dialing_error(round, description),
        }
    }

    async fn dialing_new_round(&self, round: u32, config_hash: &str) -> Vec<ClientEvent> {
        let events = match self.ensure_config(ServiceName::Dialing, config_hash).await {
            Ok(events) => events,
            Err(description) => {
                warn!("skipping dialing round {}: {}", round, description);
                return vec![ClientEvent::Error {
                    service: ServiceName::Dialing,
                    round,
                    description,
                }];
            }
        };

        let mut state = self.state.lock().unwrap();
        state.new_dialing_round(round);
        if round > state.persisted.latest_dialing_round {
            state.persisted.latest_dialing_round = round;
        }
        debug!("created dialing state for round {}", round);
        events
    }

    async fn dialing_mix(
        &self,
        settings: alpenhorn_core::common::RoundSettings,
        signatures: Vec<alpenhorn_core::crypto::Signature>,
        channel: &mut (dyn CoordinatorChannel + Send),
    ) -> Vec<ClientEvent> {
        let round = settings.round;

        // pick the call and derive the token under the lock, submit outside
        let (round_state, call, token, mailbox_id) = {
            let mut state = self.state.lock().unwrap();
            let round_state = match state.dialing_rounds.get(&round) {
                Some(round_state) => round_state.clone(),
                None => {
                    warn!("ignoring mix settings for unannounced dialing round {}", round);
                    return Vec::new();
                }
            };
            if let Err(description) = Self::verify_mix_announcement(
                &settings,
                &signatures,
                &state.dialing_inner.mix_servers,
                ServiceName::Dialing,
            ) {
                warn!("dialing round {}: {}", round, description);
                return vec![ClientEvent::Error {
                    service: ServiceName::Dialing,
                    round,
                    description,
                }];
            }

            // the first queued call whose keywheel already covers this round
            let username = state.persisted.username.clone();
            let position = state.persisted.call_queue.iter().position(|call| {
                state
                    .keywheel
                    .dial_token(&call.friend, round, call.intent, &username)
                    .is_ok()
            });
            match position {
                Some(position) => {
                    // unwrap safe: the position came from this queue
                    let call = state.persisted.call_queue.remove(position).unwrap();
                    // unwrap safe: the position filter proved the token derives
                    let token = state
                        .keywheel
                        .dial_token(&call.friend, round, call.intent, &username)
                        .unwrap();
                    let mailbox_id = username_to_mailbox(&call.friend, settings.num_mailboxes);
                    (
                        round_state,
                        Some(call),
                        DialToken::from_slice_unchecked(&token),
                        mailbox_id,
                    )
                }
                None => (
                    round_state,
                    None,
                    DialToken::generate(),
                    username_to_mailbox("", settings.num_mailboxes),
                ),
            }
        };

        let message = DialMessage {
            mailbox_id,
            token,
        }
        .to_vec();
        let onion = onion::seal(&message, &settings.onion_keys);

        if let Err(e) = channel.send_onion(round, onion).await {
            warn!("failed to submit the dialing round {} onion: {}", round, e);
            let mut state = self.state.lock().unwrap();
            if let Some(call) = call {
                state.persisted.call_queue.push_front(call);
            }
            let _ = self.persist(&state);
            return vec![ClientEvent::Error {
                service: ServiceName::Dialing,
                round,
                description: format!("failed to submit the onion: {}", e),
            }];
        }

        let mut events = Vec::new();
        let state = self.state.lock().unwrap();
        if let Some(call) = call {
            round_state.lock().unwrap().sent = Some(call.clone());
            events.push(ClientEvent::SentCall {
                friend: call.friend,
                intent: call.intent,
            });
        }
        let _ = self.persist(&state);
        events
    }

    async fn dialing_mailbox(
        &self,
        round: u32,
        url: &str,
        num_mailboxes: u32,
    ) -> Vec<ClientEvent> {
        let username = {
            let mut state = self.state.lock().unwrap();
            if state.dialing_rounds.remove(&round).is_none() {
                warn!("ignoring mailboxes for unannounced dialing round {}", round);
                return Vec::new();
            }
            state.persisted.username.clone()
        };

        let mut events = Vec::new();
        let filter = if num_mailboxes > 0 {
            let mailbox_id = username_to_mailbox(&username, num_mailboxes);
            match self.io.mailboxes.fetch(url, mailbox_id).await {
                Ok(Some(blob)) => match BloomFilter::from_bytes(&blob) {
                    Ok(filter) => Some(filter),
                    Err(e) => {
                        events.push(ClientEvent::Error {
                            service: ServiceName::Dialing,
                            round,
                            description: format!("malformed dialing mailbox: {}", e),
                        });
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    events.push(ClientEvent::Error {
                        service: ServiceName::Dialing,
                        round,
                        description: format!("failed to fetch the mailbox: {}", e),
                    });
                    None
                }
            }
        } else {
            None
        };

        let mut state = self.state.lock().unwrap();
        if let Some(filter) = filter {
            let friends: Vec<String> = state.keywheel.friends().map(str::to_string).collect();
            let intents = state.persisted.intents;
            for friend in friends {
                for intent in 0..intents {
                    // the caller bakes their own username into the token
                    let token = match state.keywheel.dial_token(&friend, round, intent, &friend) {
                        Ok(token) => token,
                        Err(_) => break, // anchored past this round
                    };
                    if filter.test(&token) {
                        // unwrap safe: the token derived, so the session key does
                        let session_key = state.keywheel.session_key(&friend, round).unwrap();
                        events.push(ClientEvent::ReceivedCall {
                            friend: friend.clone(),
                            intent,
                            session_key,
                        });
                    }
                }
            }
        }

        // forward secrecy: past-round secrets are unrecoverable from here on
        state.keywheel.advance_to(round + 1);
        let _ = self.persist(&state);
        events
    }

    fn dialing_error(&self, round: u32, description: String) -> Vec<ClientEvent> {
        let mut state = self.state.lock().unwrap();
        if let Some(round_state) = state.dialing_rounds.remove(&round) {
            // a call sent into a failed round goes back to the queue
            if let Some(call) = round_state.lock().unwrap().sent.take() {
                state.persisted.call_queue.push_front(call);
            }
        }
        let _ = self.persist(&state);
        vec![ClientEvent::Error {
            service: ServiceName::Dialing,
            round,
            description,
        }]
    }
}

impl crate::client::ClientState {
    /// Creates the per-round state and drops rounds that can no longer
    /// receive announcements.
    pub(crate) fn new_dialing_round(&mut self, round: u32) {
        self.dialing_rounds.insert(
            round,
            std::sync::Arc::new(std::sync::Mutex::new(crate::client::DialingRound {
                sent: None,
            })),
        );
        self.dialing_rounds.retain(|&id, _| id + 1 >= round);
    }
}
