//! The innermost mix-network plaintexts.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! Both formats end in high-entropy bytes (the tail of an identity-encrypted
//! introduction, or a keyed dial token), which the mix servers' duplicate
//! filter relies on.
//!
//! [message module]: crate::message

use std::convert::TryInto;

use anyhow::anyhow;
use subtle::{Choice, ConditionallySelectable};

use crate::{
    crypto::ByteObject,
    message::{intro::ENCRYPTED_INTRODUCTION_LENGTH, DecodeError, FromBytes, ToBytes},
};

/// Length in bytes of a dial token.
pub const DIAL_TOKEN_LENGTH: usize = 32;

/// Length in bytes of a serialized contact-discovery mix message.
pub const ADD_FRIEND_MESSAGE_LENGTH: usize = 4 + ENCRYPTED_INTRODUCTION_LENGTH;

/// Length in bytes of a serialized dialing mix message.
pub const DIAL_MESSAGE_LENGTH: usize = 4 + DIAL_TOKEN_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq)]
/// An introduction encrypted to the recipient identity, padded to a fixed
/// size whether or not it carries a real request.
pub struct EncryptedIntroduction([u8; ENCRYPTED_INTRODUCTION_LENGTH]);

impl EncryptedIntroduction {
    /// An all-zero cover payload.
    pub fn zeroed() -> Self {
        Self([0_u8; ENCRYPTED_INTRODUCTION_LENGTH])
    }

    /// Copies `ciphertext` into a fresh payload if `is_real` is set, byte by
    /// byte in constant time; otherwise the payload stays zeroed. The caller
    /// always supplies a ciphertext, so the access pattern does not depend on
    /// whether this round carries a real request.
    ///
    /// # Panics
    /// Panics if `ciphertext` is not exactly [`ENCRYPTED_INTRODUCTION_LENGTH`]
    /// bytes long.
    pub fn conditional_copy(ciphertext: &[u8], is_real: Choice) -> Self {
        assert_eq!(ciphertext.len(), ENCRYPTED_INTRODUCTION_LENGTH);
        let mut out = [0_u8; ENCRYPTED_INTRODUCTION_LENGTH];
        for (slot, byte) in out.iter_mut().zip(ciphertext) {
            *slot = u8::conditional_select(&0, byte, is_real);
        }
        Self(out)
    }

    /// Gets the payload byte representation.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a payload from the given buffer.
    ///
    /// Returns `None` if the buffer length does not match.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The innermost plaintext of the contact-discovery service.
pub struct AddFriendMessage {
    /// The destination mailbox, `0` for cover.
    pub mailbox_id: u32,
    /// The encrypted introduction, all zeros for cover.
    pub encrypted_intro: EncryptedIntroduction,
}

impl ToBytes for AddFriendMessage {
    fn buffer_length(&self) -> usize {
        ADD_FRIEND_MESSAGE_LENGTH
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let buffer = buffer.as_mut();
        buffer[..4].copy_from_slice(&self.mailbox_id.to_be_bytes());
        buffer[4..].copy_from_slice(self.encrypted_intro.as_slice());
    }
}

impl FromBytes for AddFriendMessage {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let buffer = buffer.as_ref();
        if buffer.len() != ADD_FRIEND_MESSAGE_LENGTH {
            return Err(anyhow!(
                "invalid buffer length: {} != {}",
                buffer.len(),
                ADD_FRIEND_MESSAGE_LENGTH
            ));
        }
        // unwraps safe: lengths of slices are guaranteed by the check above
        Ok(Self {
            mailbox_id: u32::from_be_bytes(buffer[..4].try_into().unwrap()),
            encrypted_intro: EncryptedIntroduction::from_slice(&buffer[4..]).unwrap(),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
/// A dial token derived from the keywheel shared with one friend, or a
/// random value for cover.
pub struct DialToken([u8; DIAL_TOKEN_LENGTH]);

impl ByteObject for DialToken {
    const LENGTH: usize = DIAL_TOKEN_LENGTH;

    fn zeroed() -> Self {
        Self([0_u8; DIAL_TOKEN_LENGTH])
    }

    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The innermost plaintext of the dialing service.
pub struct DialMessage {
    /// The callee's mailbox, `0` for cover.
    pub mailbox_id: u32,
    /// The dial token.
    pub token: DialToken,
}

impl ToBytes for DialMessage {
    fn buffer_length(&self) -> usize {
        DIAL_MESSAGE_LENGTH
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let buffer = buffer.as_mut();
        buffer[..4].copy_from_slice(&self.mailbox_id.to_be_bytes());
        buffer[4..].copy_from_slice(self.token.as_slice());
    }
}

impl FromBytes for DialMessage {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let buffer = buffer.as_ref();
        if buffer.len() != DIAL_MESSAGE_LENGTH {
            return Err(anyhow!(
                "invalid buffer length: {} != {}",
                buffer.len(),
                DIAL_MESSAGE_LENGTH
            ));
        }
        // unwraps safe: lengths of slices are guaranteed by the check above
        Ok(Self {
            mailbox_id: u32::from_be_bytes(buffer[..4].try_into().unwrap()),
            token: DialToken::from_slice(&buffer[4..]).unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_friend_round_trip() {
        let message = AddFriendMessage {
            mailbox_id: 7,
            encrypted_intro: EncryptedIntroduction::from_slice(
                &[0xab; ENCRYPTED_INTRODUCTION_LENGTH],
            )
            .unwrap(),
        };
        let bytes = message.to_vec();
        assert_eq!(bytes.len(), ADD_FRIEND_MESSAGE_LENGTH);
        assert_eq!(&bytes[..4], &[0, 0, 0, 7]);
        assert_eq!(AddFriendMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn dial_round_trip() {
        let message = DialMessage {
            mailbox_id: 3,
            token: DialToken::fill_with(0xcd),
        };
        let bytes = message.to_vec();
        assert_eq!(bytes.len(), DIAL_MESSAGE_LENGTH);
        assert_eq!(DialMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn conditional_copy_selects_without_branching() {
        let ciphertext = [0x55_u8; ENCRYPTED_INTRODUCTION_LENGTH];
        let real = EncryptedIntroduction::conditional_copy(&ciphertext, Choice::from(1));
        assert_eq!(real.as_slice(), &ciphertext[..]);
        let cover = EncryptedIntroduction::conditional_copy(&ciphertext, Choice::from(0));
        assert_eq!(cover, EncryptedIntroduction::zeroed());
    }

    #[test]
    fn truncated_messages_are_rejected() {
        assert!(AddFriendMessage::from_bytes(&vec![0_u8; ADD_FRIEND_MESSAGE_LENGTH - 1]).is_err());
        assert!(DialMessage::from_bytes(&vec![0_u8; DIAL_MESSAGE_LENGTH + 1]).is_err());
    }
}
