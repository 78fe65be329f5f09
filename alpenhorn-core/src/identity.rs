//! Usernames, identities and mailbox assignment.
//!
//! A valid username is a lowercase string of at most 64 bytes drawn from
//! `[a-z0-9.-_'@]`. The corresponding identity is the username right-padded
//! with zero bytes to exactly 64 bytes; since usernames never contain zero
//! bytes, identities are a prefix-free encoding of their usernames.

use std::{convert::TryInto, fmt};

use serde::{Deserialize, Serialize};
use subtle::{Choice, ConditionallySelectable};
use thiserror::Error;

use crate::crypto::{ByteObject, Sha256};

/// Maximum length of a username in bytes, and the exact length of an identity.
pub const IDENTITY_LENGTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// An error related to the validation of a username.
pub enum UsernameError {
    #[error("username is empty")]
    Empty,
    #[error("username is longer than {} bytes", IDENTITY_LENGTH)]
    TooLong,
    #[error("username contains the invalid byte {0:#04x}")]
    InvalidByte(u8),
}

/// Validates a username against the protocol alphabet.
///
/// # Errors
/// Fails for the empty string, for strings longer than 64 bytes, and for any
/// byte outside `[a-z0-9.-_'@]`.
pub fn validate_username(username: &str) -> Result<(), UsernameError> {
    if username.is_empty() {
        return Err(UsernameError::Empty);
    }
    if username.len() > IDENTITY_LENGTH {
        return Err(UsernameError::TooLong);
    }
    for &byte in username.as_bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'\'' | b'@' => {}
            invalid => return Err(UsernameError::InvalidByte(invalid)),
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// A 64-byte zero-padded identity.
pub struct Identity(#[serde(with = "serde_identity")] [u8; IDENTITY_LENGTH]);

mod serde_identity {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::IDENTITY_LENGTH;

    pub fn serialize<S: Serializer>(
        bytes: &[u8; IDENTITY_LENGTH],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; IDENTITY_LENGTH], D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != IDENTITY_LENGTH {
            return Err(D::Error::custom(format!(
                "invalid length {}, expected {}",
                bytes.len(),
                IDENTITY_LENGTH,
            )));
        }
        let mut out = [0_u8; IDENTITY_LENGTH];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl Identity {
    /// Builds the identity for a username.
    ///
    /// # Errors
    /// Fails if the username does not validate.
    pub fn from_username(username: &str) -> Result<Self, UsernameError> {
        validate_username(username)?;
        let mut bytes = [0_u8; IDENTITY_LENGTH];
        bytes[..username.len()].copy_from_slice(username.as_bytes());
        Ok(Self(bytes))
    }

    /// Recovers the username by stripping the zero padding.
    pub fn username(&self) -> String {
        let end = self
            .0
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IDENTITY_LENGTH);
        // identities are only constructed from validated ASCII usernames
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl ByteObject for Identity {
    const LENGTH: usize = IDENTITY_LENGTH;

    fn zeroed() -> Self {
        Self([0_u8; IDENTITY_LENGTH])
    }

    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != IDENTITY_LENGTH {
            return None;
        }
        let mut out = [0_u8; IDENTITY_LENGTH];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:?})", self.username())
    }
}

/// Maps a username to its mailbox.
///
/// Real usernames map to `BE_u32(SHA256(username)[0..4]) mod num_mailboxes + 1`;
/// the empty (cover) username maps to mailbox `0`. The selection between the
/// two is constant-time so the computation does not branch on whether the
/// caller has a real recipient.
pub fn username_to_mailbox(username: &str, num_mailboxes: u32) -> u32 {
    let is_real = Choice::from(!username.is_empty() as u8);
    let digest = Sha256::hash(username.as_bytes());
    // safe unwrap: a SHA256 digest is longer than 4 bytes
    let prefix = u32::from_be_bytes(digest.as_slice()[..4].try_into().unwrap());
    let real_mailbox = prefix % num_mailboxes + 1;
    u32::conditional_select(&0, &real_mailbox, is_real)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_full_alphabet() {
        validate_username("az09.-_'@").unwrap();
        validate_username("alice").unwrap();
        validate_username(&"a".repeat(64)).unwrap();
    }

    #[test]
    fn rejects_out_of_alphabet_usernames() {
        assert_eq!(validate_username(""), Err(UsernameError::Empty));
        assert_eq!(
            validate_username(&"a".repeat(65)),
            Err(UsernameError::TooLong)
        );
        assert_eq!(
            validate_username("Alice"),
            Err(UsernameError::InvalidByte(b'A'))
        );
        assert_eq!(
            validate_username("alice bob"),
            Err(UsernameError::InvalidByte(b' '))
        );
        assert_eq!(
            validate_username("ali\x00ce"),
            Err(UsernameError::InvalidByte(0))
        );
    }

    #[test]
    fn identity_round_trip() {
        let identity = Identity::from_username("alice@example").unwrap();
        assert_eq!(identity.as_slice().len(), IDENTITY_LENGTH);
        assert_eq!(identity.username(), "alice@example");
        assert_eq!(&identity.as_slice()[13..], &[0_u8; 51][..]);
    }

    #[test]
    fn cover_maps_to_mailbox_zero() {
        for n in [1, 2, 7, 1000] {
            assert_eq!(username_to_mailbox("", n), 0);
        }
    }

    #[test]
    fn real_usernames_stay_in_range() {
        for n in [1, 2, 7, 1000] {
            let mailbox = username_to_mailbox("alice", n);
            assert!(mailbox >= 1 && mailbox <= n);
        }
        // one mailbox: everything real lands in mailbox 1
        assert_eq!(username_to_mailbox("alice", 1), 1);
        assert_eq!(username_to_mailbox("bob", 1), 1);
    }
}
