//! The introduction record of the contact-discovery protocol.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use std::{convert::TryInto, ops::Range};

use anyhow::{anyhow, Context};

use crate::{
    crypto::{
        BlsSignature,
        ByteObject,
        PublicEncryptKey,
        PublicSigningKey,
        SecretSigningKey,
        Signature,
        IBE_CIPHERTEXT_OVERHEAD,
    },
    identity::Identity,
    message::{range, DecodeError, FromBytes, ToBytes},
};

const IDENTITY_FIELD: Range<usize> = range(0, Identity::LENGTH);
const DH_PUBLIC_FIELD: Range<usize> = range(IDENTITY_FIELD.end, PublicEncryptKey::LENGTH);
const LONG_TERM_KEY_FIELD: Range<usize> = range(DH_PUBLIC_FIELD.end, PublicSigningKey::LENGTH);
const DIALING_ROUND_FIELD: Range<usize> = range(LONG_TERM_KEY_FIELD.end, 4);
const MULTISIG_FIELD: Range<usize> = range(DIALING_ROUND_FIELD.end, BlsSignature::LENGTH);
const SIGNATURE_FIELD: Range<usize> = range(MULTISIG_FIELD.end, Signature::LENGTH);

/// Length in bytes of a serialized introduction.
pub const INTRODUCTION_LENGTH: usize = SIGNATURE_FIELD.end;

/// Length in bytes of an introduction encrypted to the recipient identity.
pub const ENCRYPTED_INTRODUCTION_LENGTH: usize = INTRODUCTION_LENGTH + IBE_CIPHERTEXT_OVERHEAD;

/// A wrapper around a buffer that contains an [`Introduction`].
///
/// It provides getters and setters to access the different fields of the
/// record safely. The layout is fixed:
///
/// ```text
/// sender identity   64 bytes
/// DH public key     32 bytes
/// long-term key     32 bytes
/// dialing round      4 bytes (big endian)
/// server multisig   48 bytes (aggregated BLS attestation)
/// sender signature  64 bytes (covers everything prior)
/// ```
pub struct IntroductionBuffer<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> IntroductionBuffer<T> {
    /// Performs bound checks on `bytes` and returns a new [`IntroductionBuffer`].
    ///
    /// # Errors
    /// Fails if `bytes` is not exactly [`INTRODUCTION_LENGTH`] long.
    pub fn new(bytes: T) -> Result<Self, DecodeError> {
        let buffer = Self { inner: bytes };
        buffer
            .check_buffer_length()
            .context("not a valid IntroductionBuffer")?;
        Ok(buffer)
    }

    /// Returns an [`IntroductionBuffer`] without performing any bound checks.
    ///
    /// This means accessing the various fields may panic if the data is invalid.
    pub fn new_unchecked(bytes: T) -> Self {
        Self { inner: bytes }
    }

    /// Performs bound checks to ensure the fields can be accessed without panicking.
    pub fn check_buffer_length(&self) -> Result<(), DecodeError> {
        let len = self.inner.as_ref().len();
        if len != INTRODUCTION_LENGTH {
            return Err(anyhow!(
                "invalid buffer length: {} != {}",
                len,
                INTRODUCTION_LENGTH
            ));
        }
        Ok(())
    }

    /// Gets the dialing round field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn dialing_round(&self) -> u32 {
        // unwrap safe: the slice is exactly 4 bytes long
        u32::from_be_bytes(self.inner.as_ref()[DIALING_ROUND_FIELD].try_into().unwrap())
    }

    /// Gets the portion covered by the sender signature.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn signed_portion(&self) -> &[u8] {
        &self.inner.as_ref()[..SIGNATURE_FIELD.start]
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> IntroductionBuffer<&'a T> {
    /// Gets the sender identity field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn identity(&self) -> &'a [u8] {
        &self.inner.as_ref()[IDENTITY_FIELD]
    }

    /// Gets the DH public key field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn dh_public(&self) -> &'a [u8] {
        &self.inner.as_ref()[DH_PUBLIC_FIELD]
    }

    /// Gets the long-term key field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn long_term_key(&self) -> &'a [u8] {
        &self.inner.as_ref()[LONG_TERM_KEY_FIELD]
    }

    /// Gets the server multisig field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn multisig(&self) -> &'a [u8] {
        &self.inner.as_ref()[MULTISIG_FIELD]
    }

    /// Gets the sender signature field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn signature(&self) -> &'a [u8] {
        &self.inner.as_ref()[SIGNATURE_FIELD]
    }
}

impl<T: AsMut<[u8]> + AsRef<[u8]>> IntroductionBuffer<T> {
    /// Sets the sender identity field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn set_identity(&mut self, value: &[u8]) {
        self.inner.as_mut()[IDENTITY_FIELD].copy_from_slice(value);
    }

    /// Sets the DH public key field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn set_dh_public(&mut self, value: &[u8]) {
        self.inner.as_mut()[DH_PUBLIC_FIELD].copy_from_slice(value);
    }

    /// Sets the long-term key field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn set_long_term_key(&mut self, value: &[u8]) {
        self.inner.as_mut()[LONG_TERM_KEY_FIELD].copy_from_slice(value);
    }

    /// Sets the dialing round field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn set_dialing_round(&mut self, value: u32) {
        self.inner.as_mut()[DIALING_ROUND_FIELD].copy_from_slice(&value.to_be_bytes());
    }

    /// Sets the server multisig field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn set_multisig(&mut self, value: &[u8]) {
        self.inner.as_mut()[MULTISIG_FIELD].copy_from_slice(value);
    }

    /// Sets the sender signature field.
    ///
    /// # Panics
    /// Accessing the field may panic if the buffer has not been checked before.
    pub fn set_signature(&mut self, value: &[u8]) {
        self.inner.as_mut()[SIGNATURE_FIELD].copy_from_slice(value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A sender-identified introduction, encrypted under the recipient identity
/// before it enters the mix network.
pub struct Introduction {
    /// The sender identity.
    pub identity: Identity,
    /// A fresh DH public key for deriving the friendship secret.
    pub dh_public: PublicEncryptKey,
    /// The sender's long-term signing key.
    pub long_term_key: PublicSigningKey,
    /// The dialing round at which the sender anchors the keywheel.
    pub dialing_round: u32,
    /// Aggregated BLS attestation tying the sender identity to the long-term key.
    pub multisig: BlsSignature,
    /// Sender signature over everything prior.
    pub signature: Signature,
}

impl Introduction {
    /// Builds and signs an introduction with the sender's long-term secret key.
    pub fn new_signed(
        identity: Identity,
        dh_public: PublicEncryptKey,
        long_term_secret: &SecretSigningKey,
        dialing_round: u32,
        multisig: BlsSignature,
    ) -> Self {
        let mut this = Self {
            identity,
            dh_public,
            long_term_key: long_term_secret.public_key(),
            dialing_round,
            multisig,
            signature: Signature::zeroed(),
        };
        let bytes = this.to_vec();
        // unwrap safe: to_vec produced exactly INTRODUCTION_LENGTH bytes
        let buffer = IntroductionBuffer::new(&bytes[..]).unwrap();
        this.signature = long_term_secret.sign_detached(buffer.signed_portion());
        this
    }

    /// Verifies the sender signature against the embedded long-term key.
    pub fn verify_sender(&self) -> bool {
        let bytes = self.to_vec();
        // unwrap safe: to_vec produced exactly INTRODUCTION_LENGTH bytes
        let buffer = IntroductionBuffer::new(&bytes[..]).unwrap();
        self.long_term_key
            .verify_detached(&self.signature, buffer.signed_portion())
    }
}

impl ToBytes for Introduction {
    fn buffer_length(&self) -> usize {
        INTRODUCTION_LENGTH
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let mut writer = IntroductionBuffer::new_unchecked(buffer.as_mut());
        writer.set_identity(self.identity.as_slice());
        writer.set_dh_public(self.dh_public.as_slice());
        writer.set_long_term_key(self.long_term_key.as_slice());
        writer.set_dialing_round(self.dialing_round);
        writer.set_multisig(&self.multisig.to_bytes());
        writer.set_signature(self.signature.as_slice());
    }
}

impl FromBytes for Introduction {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let reader = IntroductionBuffer::new(buffer.as_ref())?;
        Ok(Self {
            identity: Identity::from_slice(reader.identity())
                .ok_or_else(|| anyhow!("invalid identity"))?,
            dh_public: PublicEncryptKey::from_slice(reader.dh_public())
                .ok_or_else(|| anyhow!("invalid DH public key"))?,
            long_term_key: PublicSigningKey::from_slice(reader.long_term_key())
                .ok_or_else(|| anyhow!("invalid long-term key"))?,
            dialing_round: reader.dialing_round(),
            multisig: BlsSignature::from_bytes(reader.multisig())
                .ok_or_else(|| anyhow!("invalid multisig"))?,
            signature: Signature::from_slice(reader.signature())
                .ok_or_else(|| anyhow!("invalid signature"))?,
        })
    }
}
