//! Fixed-layout wire formats.
//!
//! Everything that crosses the mix network or is signed byte-exactly is
//! encoded by hand into fixed-size buffers: a variable-length or
//! self-describing encoding would leak information through sizes and break
//! the canonical signing forms. The [`ToBytes`] / [`FromBytes`] traits and
//! the buffer types with range-constant field accessors follow the same
//! scheme for every format.

pub(crate) mod intro;
pub(crate) mod mix;
pub(crate) mod traits;

pub use self::{
    intro::{Introduction, IntroductionBuffer, ENCRYPTED_INTRODUCTION_LENGTH, INTRODUCTION_LENGTH},
    mix::{
        AddFriendMessage,
        DialMessage,
        DialToken,
        EncryptedIntroduction,
        ADD_FRIEND_MESSAGE_LENGTH,
        DIAL_MESSAGE_LENGTH,
        DIAL_TOKEN_LENGTH,
    },
    traits::{FromBytes, ToBytes},
};

/// An error that signals a failure when trying to decrypt or parse a message.
pub type DecodeError = anyhow::Error;

/// Computes the range of a field from its offset and length.
pub(crate) const fn range(offset: usize, length: usize) -> std::ops::Range<usize> {
    offset..offset + length
}
