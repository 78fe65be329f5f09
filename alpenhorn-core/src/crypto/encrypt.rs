//! Wrappers around the [sodiumoxide] asymmetric encryption primitives.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/
//! [crypto module]: crate::crypto

use derive_more::{AsMut, AsRef, From};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::box_;

use super::ByteObject;

/// Number of additional bytes of a sealed box compared to the corresponding
/// plaintext: a fresh ephemeral public key plus the authenticator tag.
pub const SEALBYTES: usize = box_::PUBLICKEYBYTES + box_::MACBYTES;

/// The fixed all-zero nonce.
///
/// Safe here because every encryption in the protocol uses a fresh ephemeral
/// key pair, so no (key, nonce) pair is ever reused.
fn zero_nonce() -> box_::Nonce {
    box_::Nonce([0_u8; box_::NONCEBYTES])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A `C25519` key pair for asymmetric authenticated encryption.
pub struct EncryptKeyPair {
    /// The `C25519` public key.
    pub public: PublicEncryptKey,
    /// The `C25519` secret key.
    pub secret: SecretEncryptKey,
}

impl EncryptKeyPair {
    /// Generates a new random `C25519` key pair for encryption.
    pub fn generate() -> Self {
        let (pk, sk) = box_::gen_keypair();
        Self {
            public: PublicEncryptKey(pk),
            secret: SecretEncryptKey(sk),
        }
    }
}

#[derive(
    AsRef,
    AsMut,
    From,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    Ord,
    PartialEq,
    Copy,
    Clone,
    PartialOrd,
    Debug,
)]
/// A `C25519` public key for asymmetric authenticated encryption.
pub struct PublicEncryptKey(box_::PublicKey);

impl ByteObject for PublicEncryptKey {
    const LENGTH: usize = box_::PUBLICKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::PublicKey([0_u8; box_::PUBLICKEYBYTES]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::PublicKey::from_slice(bytes).map(Self)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("decryption of a message failed")]
/// An error related to the decryption of a message.
pub struct DecryptionError;

#[derive(AsRef, AsMut, From, Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
/// A `C25519` secret key for asymmetric authenticated encryption.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct SecretEncryptKey(box_::SecretKey);

impl SecretEncryptKey {
    /// Computes the corresponding public key for this secret key.
    pub fn public_key(&self) -> PublicEncryptKey {
        PublicEncryptKey(self.0.public_key())
    }
}

impl ByteObject for SecretEncryptKey {
    const LENGTH: usize = box_::SECRETKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::SecretKey([0_u8; box_::SECRETKEYBYTES]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::SecretKey::from_slice(bytes).map(Self)
    }
}

/// Sealing and opening of single encryption layers.
///
/// A sealed box is `ephemeral_public_key (32 B) || ciphertext`, where the
/// ciphertext is a NaCl box from the ephemeral secret key to the recipient
/// under the fixed zero nonce. The ephemeral secret key is dropped once the
/// box is sealed.
pub struct SealedBox;

impl SealedBox {
    /// Encrypts `m` to the recipient public key.
    ///
    /// The resulting ciphertext length is [`SEALBYTES`]` + m.len()`.
    pub fn seal(recipient: &PublicEncryptKey, m: &[u8]) -> Vec<u8> {
        let (eph_pk, eph_sk) = box_::gen_keypair();
        let mut out = Vec::with_capacity(SEALBYTES + m.len());
        out.extend_from_slice(eph_pk.as_ref());
        out.extend_from_slice(&box_::seal(m, &zero_nonce(), recipient.as_ref(), &eph_sk));
        out
    }

    /// Decrypts the sealed box `c` using the recipient secret key.
    ///
    /// # Errors
    /// Returns `Err(DecryptionError)` if `c` is shorter than [`SEALBYTES`] or
    /// the authenticator does not verify.
    pub fn open(recipient: &SecretEncryptKey, c: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        if c.len() < SEALBYTES {
            return Err(DecryptionError);
        }
        // safe unwrap: the slice is exactly PUBLICKEYBYTES long
        let eph_pk = box_::PublicKey::from_slice(&c[..box_::PUBLICKEYBYTES]).unwrap();
        box_::open(
            &c[box_::PUBLICKEYBYTES..],
            &zero_nonce(),
            &eph_pk,
            recipient.as_ref(),
        )
        .map_err(|_| DecryptionError)
    }
}

#[derive(AsRef, From, Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
/// A `C25519` shared secret derived via `crypto_box_beforenm`.
///
/// Both parties of a Diffie-Hellman exchange arrive at the same value, which
/// seeds the keywheel of a freshly confirmed friendship.
pub struct SharedSecret(box_::PrecomputedKey);

impl SharedSecret {
    /// Derives the shared secret between `their` public key and `our` secret key.
    pub fn derive(their: &PublicEncryptKey, our: &SecretEncryptKey) -> Self {
        Self(box_::precompute(their.as_ref(), our.as_ref()))
    }
}

impl ByteObject for SharedSecret {
    const LENGTH: usize = box_::PRECOMPUTEDKEYBYTES;

    fn zeroed() -> Self {
        Self(box_::PrecomputedKey([0_u8; box_::PRECOMPUTEDKEYBYTES]))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::PrecomputedKey::from_slice(bytes).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_box_round_trip() {
        let keys = EncryptKeyPair::generate();
        let message = b"attack at dawn".to_vec();
        let sealed = SealedBox::seal(&keys.public, &message);
        assert_eq!(sealed.len(), SEALBYTES + message.len());
        assert_eq!(SealedBox::open(&keys.secret, &sealed).unwrap(), message);
    }

    #[test]
    fn sealed_box_rejects_wrong_recipient() {
        let keys = EncryptKeyPair::generate();
        let other = EncryptKeyPair::generate();
        let sealed = SealedBox::seal(&keys.public, b"attack at dawn");
        assert!(SealedBox::open(&other.secret, &sealed).is_err());
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let alice = EncryptKeyPair::generate();
        let bob = EncryptKeyPair::generate();
        let a = SharedSecret::derive(&bob.public, &alice.secret);
        let b = SharedSecret::derive(&alice.public, &bob.secret);
        assert_eq!(a, b);
    }
}
