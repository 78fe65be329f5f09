//! Per-friend rolling secrets.
//!
//! Each friendship installs a 32-byte shared secret anchored at a dialing
//! round. The secret advances one round at a time through HMAC-SHA256 and the
//! old value is discarded, so compromise of the current state never reveals
//! session keys or dial tokens of past rounds. The whole wheel is marshalled
//! to its own state file, separate from the rest of the client state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::auth::hmacsha256;
use thiserror::Error;

use crate::crypto::ByteObject;

/// Length in bytes of wheel secrets, session keys and dial tokens.
pub const SECRET_LENGTH: usize = hmacsha256::KEYBYTES;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// An error related to looking up a keywheel entry.
pub enum KeywheelError {
    #[error("no keywheel entry for {0:?}")]
    UnknownFriend(String),
    #[error("round {round} precedes the keywheel anchor {anchor}: the secret was erased")]
    RoundErased { round: u32, anchor: u32 },
}

/// A secret stamped with the round it is valid for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StampedSecret {
    round: u32,
    #[serde(with = "hex_secret")]
    secret: [u8; SECRET_LENGTH],
}

mod hex_secret {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::SECRET_LENGTH;

    pub fn serialize<S: Serializer>(
        secret: &[u8; SECRET_LENGTH],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(secret))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; SECRET_LENGTH], D::Error> {
        let text: String = Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        if bytes.len() != SECRET_LENGTH {
            return Err(D::Error::custom(format!(
                "invalid secret length {}, expected {}",
                bytes.len(),
                SECRET_LENGTH,
            )));
        }
        let mut out = [0_u8; SECRET_LENGTH];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

fn hmac(secret: &[u8; SECRET_LENGTH], message: &[u8]) -> [u8; SECRET_LENGTH] {
    // safe unwrap: the secret is exactly KEYBYTES long
    let key = hmacsha256::Key::from_slice(secret).unwrap();
    hmacsha256::authenticate(message, &key).0
}

impl StampedSecret {
    /// Advances the secret by one round and erases the predecessor.
    fn advance(&mut self) {
        let next_round = self.round + 1;
        let mut message = b"hash1".to_vec();
        message.extend_from_slice(&next_round.to_be_bytes());
        self.secret = hmac(&self.secret, &message);
        self.round = next_round;
    }

    /// The secret at `round`, which must not precede the anchor.
    fn secret_at(&self, round: u32) -> Option<[u8; SECRET_LENGTH]> {
        if round < self.round {
            return None;
        }
        let mut stamped = self.clone();
        while stamped.round < round {
            stamped.advance();
        }
        Some(stamped.secret)
    }
}

/// The client's rolling-secret store, one entry per friend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keywheel {
    entries: HashMap<String, StampedSecret>,
}

impl Keywheel {
    /// Creates an empty keywheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the shared secret for a freshly confirmed friendship.
    ///
    /// An existing entry for the same friend is replaced.
    pub fn insert(&mut self, friend: &str, round: u32, secret: [u8; SECRET_LENGTH]) {
        self.entries
            .insert(friend.to_string(), StampedSecret { round, secret });
    }

    /// Removes a friend's entry.
    pub fn remove(&mut self, friend: &str) {
        self.entries.remove(friend);
    }

    /// Whether the wheel has an entry for `friend`.
    pub fn contains(&self, friend: &str) -> bool {
        self.entries.contains_key(friend)
    }

    /// The friends with installed secrets.
    pub fn friends(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Advances every entry anchored before `round` up to `round`, erasing
    /// the older secrets. Entries anchored at or after `round` are untouched.
    pub fn advance_to(&mut self, round: u32) {
        for stamped in self.entries.values_mut() {
            while stamped.round < round {
                stamped.advance();
            }
        }
    }

    fn lookup(&self, friend: &str, round: u32) -> Result<[u8; SECRET_LENGTH], KeywheelError> {
        let stamped = self
            .entries
            .get(friend)
            .ok_or_else(|| KeywheelError::UnknownFriend(friend.to_string()))?;
        stamped.secret_at(round).ok_or(KeywheelError::RoundErased {
            round,
            anchor: stamped.round,
        })
    }

    /// The session key shared with `friend` at `round`.
    pub fn session_key(&self, friend: &str, round: u32) -> Result<[u8; SECRET_LENGTH], KeywheelError> {
        let secret = self.lookup(friend, round)?;
        let mut message = b"hash3".to_vec();
        message.extend_from_slice(&round.to_be_bytes());
        Ok(hmac(&secret, &message))
    }

    /// The dial token shared with `friend` at `round` for `intent`.
    ///
    /// `caller` is the username of the party placing the call: the caller
    /// passes their own username, the callee passes the friend's.
    pub fn dial_token(
        &self,
        friend: &str,
        round: u32,
        intent: u32,
        caller: &str,
    ) -> Result<[u8; SECRET_LENGTH], KeywheelError> {
        let secret = self.lookup(friend, round)?;
        let mut message = b"hash2".to_vec();
        message.extend_from_slice(&round.to_be_bytes());
        message.extend_from_slice(&intent.to_be_bytes());
        message.extend_from_slice(caller.as_bytes());
        Ok(hmac(&secret, &message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SharedSecret;

    fn secret(byte: u8) -> [u8; SECRET_LENGTH] {
        [byte; SECRET_LENGTH]
    }

    #[test]
    fn marshalling_round_trip() {
        let mut wheel = Keywheel::new();
        wheel.insert("bob", 7, secret(1));
        wheel.insert("carol", 9, secret(2));
        let json = serde_json::to_string(&wheel).unwrap();
        let back: Keywheel = serde_json::from_str(&json).unwrap();
        assert_eq!(wheel, back);
    }

    #[test]
    fn both_sides_agree() {
        // Alice and Bob install the same shared secret at the same round.
        let shared = SharedSecret::generate();
        let mut shared_bytes = [0_u8; SECRET_LENGTH];
        shared_bytes.copy_from_slice(shared.as_slice());

        let mut alice = Keywheel::new();
        alice.insert("bob", 10, shared_bytes);
        let mut bob = Keywheel::new();
        bob.insert("alice", 10, shared_bytes);

        // Bob has advanced further than Alice; agreement must survive.
        bob.advance_to(13);

        assert_eq!(
            alice.session_key("bob", 15).unwrap(),
            bob.session_key("alice", 15).unwrap()
        );
        assert_eq!(
            alice.dial_token("bob", 15, 0, "alice").unwrap(),
            bob.dial_token("alice", 15, 0, "alice").unwrap()
        );
    }

    #[test]
    fn advancing_erases_old_rounds() {
        let mut wheel = Keywheel::new();
        wheel.insert("bob", 10, secret(1));
        let early = wheel.session_key("bob", 10).unwrap();
        wheel.advance_to(11);
        assert_eq!(
            wheel.session_key("bob", 10),
            Err(KeywheelError::RoundErased {
                round: 10,
                anchor: 11
            })
        );
        // the erased key is not recomputable from the advanced state
        assert_ne!(wheel.session_key("bob", 11).unwrap(), early);
    }

    #[test]
    fn tokens_differ_by_intent_and_caller() {
        let mut wheel = Keywheel::new();
        wheel.insert("bob", 10, secret(1));
        let a = wheel.dial_token("bob", 10, 0, "alice").unwrap();
        let b = wheel.dial_token("bob", 10, 1, "alice").unwrap();
        let c = wheel.dial_token("bob", 10, 0, "bob").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unknown_friend_is_an_error() {
        let wheel = Keywheel::new();
        assert_eq!(
            wheel.session_key("bob", 10),
            Err(KeywheelError::UnknownFriend("bob".to_string()))
        );
    }
}
