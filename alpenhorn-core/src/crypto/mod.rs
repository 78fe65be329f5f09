//! Wrappers around the crypto primitives used across the protocol.
//!
//! The wrappers provide methods defined on structs instead of the raw
//! [sodiumoxide] functions. This is done for the `C25519` encryption and
//! `Ed25519` signature key pairs as well as the `SHA256` hash function. The
//! pairing-based primitives (identity-based encryption and BLS signatures)
//! live in their own submodules on top of `ark-bls12-381`.
//!
//! # Examples
//! ## Encryption of messages
//! ```
//! # use alpenhorn_core::crypto::{EncryptKeyPair, SealedBox};
//! let keys = EncryptKeyPair::generate();
//! let message = b"Hello world!".to_vec();
//! let cipher = SealedBox::seal(&keys.public, &message);
//! assert_eq!(message, SealedBox::open(&keys.secret, &cipher).unwrap());
//! ```
//!
//! ## Signing of messages
//! ```
//! # use alpenhorn_core::crypto::SigningKeyPair;
//! let keys = SigningKeyPair::generate();
//! let message = b"Hello world!".to_vec();
//! let signature = keys.secret.sign_detached(&message);
//! assert!(keys.public.verify_detached(&signature, &message));
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod bls;
pub(crate) mod encrypt;
pub(crate) mod hash;
pub(crate) mod ibe;
pub(crate) mod sign;

use sodiumoxide::randombytes::randombytes;

pub use self::{
    bls::{BlsKeyPair, BlsPublicKey, BlsSecretKey, BlsSignature},
    encrypt::{
        DecryptionError,
        EncryptKeyPair,
        PublicEncryptKey,
        SealedBox,
        SecretEncryptKey,
        SharedSecret,
        SEALBYTES,
    },
    hash::Sha256,
    ibe::{
        IbeCiphertextError,
        IbeIdentityPrivateKey,
        IbeMasterKeyPair,
        IbeMasterPublicKey,
        IbeMasterSecretKey,
        IBE_CIPHERTEXT_OVERHEAD,
    },
    sign::{PublicSigningKey, SecretSigningKey, Signature, SigningKeyPair},
};

/// An interface for slicing into cryptographic byte objects.
pub trait ByteObject: Sized {
    /// Length in bytes of this object.
    const LENGTH: usize;

    /// Creates a new object with all the bytes initialized to `0`.
    fn zeroed() -> Self;

    /// Gets the object byte representation.
    fn as_slice(&self) -> &[u8];

    /// Creates an object from the given buffer.
    ///
    /// # Errors
    /// Returns `None` if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Creates an object from the given buffer.
    ///
    /// # Panics
    /// Panics if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice_unchecked(bytes: &[u8]) -> Self {
        Self::from_slice(bytes).unwrap()
    }

    /// Generates an object with random bytes.
    fn generate() -> Self {
        // safe unwrap: length of slice is guaranteed by constants
        Self::from_slice_unchecked(randombytes(Self::LENGTH).as_slice())
    }

    /// A helper for instantiating an object filled with the given value.
    fn fill_with(value: u8) -> Self {
        Self::from_slice_unchecked(&vec![value; Self::LENGTH])
    }
}
