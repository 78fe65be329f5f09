//! The events the client surfaces to its consumer.
//!
//! One sum type with a constructor per event; the consumer pattern-matches.

use alpenhorn_core::{config::SignedConfig, keywheel::SECRET_LENGTH, ServiceName};

#[derive(Debug, Clone, PartialEq)]
/// An event surfaced by the client.
pub enum ClientEvent {
    /// A round failed; the client keeps participating in future rounds.
    Error {
        /// The service the failure happened in.
        service: ServiceName,
        /// The failed round.
        round: u32,
        /// A human-readable description.
        description: String,
    },
    /// The client verified and adopted a new signed configuration.
    NewConfig {
        /// The service whose configuration changed.
        service: ServiceName,
        /// The verified chain, oldest first, ending at the adopted
        /// configuration.
        chain: Vec<SignedConfig>,
    },
    /// A queued friend request went out this round.
    SentFriendRequest {
        /// The username the request was sent to.
        friend: String,
    },
    /// Someone the client has no pending request for introduced themselves.
    ReceivedFriendRequest {
        /// The sender's username.
        friend: String,
    },
    /// Both sides' introductions met; the friendship is established.
    ConfirmedFriend {
        /// The friend's username.
        friend: String,
    },
    /// A queued call notification went out this round.
    SentCall {
        /// The callee's username.
        friend: String,
        /// The call intent.
        intent: u32,
    },
    /// A friend is calling.
    ReceivedCall {
        /// The caller's username.
        friend: String,
        /// The call intent.
        intent: u32,
        /// The session key shared with the caller for this round.
        session_key: [u8; SECRET_LENGTH],
    },
}

/// A consumer of client events.
pub trait EventSink: Send {
    /// Delivers one event.
    fn handle(&mut self, event: ClientEvent);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<ClientEvent> {
    fn handle(&mut self, event: ClientEvent) {
        // a dropped receiver just means nobody is listening anymore
        let _ = self.send(event);
    }
}

impl EventSink for Vec<ClientEvent> {
    fn handle(&mut self, event: ClientEvent) {
        self.push(event);
    }
}
