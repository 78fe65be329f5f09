//! Boneh-Franklin identity-based encryption over BLS12-381.
//!
//! Every PKG holds a master secret scalar `s` with master public key `s·G2`.
//! The private key for an identity is `s·H(identity)` in G1, so both master
//! public keys and extracted identity keys aggregate by point addition: a
//! client encrypts once to the *sum* of all PKGs' master public keys and
//! decrypts with the sum of the extracted identity keys. No single PKG ever
//! sees the aggregate master secret.
//!
//! Ciphertexts are hybrid: a compressed ephemeral G2 point followed by an
//! XSalsa20-Poly1305 secretbox under a key derived from the pairing shared
//! secret. The box nonce is zero since the key is unique per ciphertext.

use std::fmt;

use ark_bls12_381::{Bls12_381, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{pairing::Pairing, CurveGroup, Group};
use ark_ff::{UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::rngs::OsRng;
use sodiumoxide::crypto::secretbox;
use thiserror::Error;

use super::{bls::impl_point_bytes, ByteObject, Sha256};
use crate::identity::Identity;

/// Domain separation tag for hashing identities onto G1.
const IDENTITY_DOMAIN: &[u8] = b"ALPENHORN-IBE-IDENTITY";

/// Domain prefix for deriving the secretbox key from the pairing output.
const KEY_DOMAIN: &[u8] = b"ALPENHORN-IBE-KEY";

/// Number of additional bytes in a ciphertext compared to the corresponding
/// plaintext: a compressed G2 point plus the secretbox authenticator tag.
pub const IBE_CIPHERTEXT_OVERHEAD: usize = 96 + secretbox::MACBYTES;

#[derive(Error, Debug)]
#[error("decryption of an identity-based ciphertext failed")]
/// An error related to the decryption of an identity-based ciphertext.
///
/// Expected in high volume during mailbox scans: a ciphertext that was not
/// encrypted to the scanning client's identity fails exactly this way.
pub struct IbeCiphertextError;

#[derive(Clone, Copy, PartialEq, Eq)]
/// An IBE master public key, a point in G2.
pub struct IbeMasterPublicKey(G2Affine);

impl_point_bytes!(IbeMasterPublicKey, G2Affine, 96);

#[derive(Clone, PartialEq, Eq)]
/// An IBE master secret key, a scalar.
///
/// Owned exclusively by the generating PKG and never serialized.
pub struct IbeMasterSecretKey(Fr);

impl fmt::Debug for IbeMasterSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IbeMasterSecretKey(..)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
/// An extracted per-identity private key, a point in G1.
pub struct IbeIdentityPrivateKey(G1Affine);

impl_point_bytes!(IbeIdentityPrivateKey, G1Affine, 48);

#[derive(Clone, Debug)]
/// An IBE master key pair.
pub struct IbeMasterKeyPair {
    /// The master public key.
    pub public: IbeMasterPublicKey,
    /// The master secret key.
    pub secret: IbeMasterSecretKey,
}

impl IbeMasterKeyPair {
    /// Generates a new random master key pair.
    pub fn generate() -> Self {
        let secret = Fr::rand(&mut OsRng);
        let public = (G2Projective::generator() * secret).into_affine();
        Self {
            public: IbeMasterPublicKey(public),
            secret: IbeMasterSecretKey(secret),
        }
    }
}

/// Hashes an identity onto G1.
fn identity_point(identity: &Identity) -> G1Projective {
    super::bls::hash_to_g1(IDENTITY_DOMAIN, identity.as_slice())
}

/// Derives the secretbox key from a pairing output.
fn shared_key(shared: &ark_ec::pairing::PairingOutput<Bls12_381>) -> secretbox::Key {
    let mut bytes = Vec::new();
    // safe unwrap: serializing into a Vec cannot fail
    shared.serialize_compressed(&mut bytes).unwrap();
    let digest = Sha256::hash(&[KEY_DOMAIN, &bytes].concat());
    // safe unwrap: a SHA256 digest is exactly KEYBYTES long
    secretbox::Key::from_slice(digest.as_slice()).unwrap()
}

impl IbeMasterSecretKey {
    /// Extracts the private key for an identity.
    pub fn extract(&self, identity: &Identity) -> IbeIdentityPrivateKey {
        IbeIdentityPrivateKey((identity_point(identity) * self.0).into_affine())
    }
}

impl IbeMasterPublicKey {
    /// Sums master public keys into the aggregate encryption key.
    pub fn aggregate<'a>(keys: impl IntoIterator<Item = &'a IbeMasterPublicKey>) -> Self {
        let sum = keys
            .into_iter()
            .fold(G2Projective::zero(), |acc, k| acc + k.0);
        Self(sum.into_affine())
    }

    /// Encrypts `m` to `identity` under this (usually aggregated) master
    /// public key.
    ///
    /// The resulting ciphertext length is [`IBE_CIPHERTEXT_OVERHEAD`]` + m.len()`.
    pub fn encrypt(&self, identity: &Identity, m: &[u8]) -> Vec<u8> {
        let r = Fr::rand(&mut OsRng);
        let ephemeral = (G2Projective::generator() * r).into_affine();
        let shared = Bls12_381::pairing(identity_point(identity), self.0) * r;
        let key = shared_key(&shared);

        let mut out = Vec::with_capacity(IBE_CIPHERTEXT_OVERHEAD + m.len());
        // safe unwrap: serializing into a Vec cannot fail
        ephemeral.serialize_compressed(&mut out).unwrap();
        let nonce = secretbox::Nonce([0_u8; secretbox::NONCEBYTES]);
        out.extend_from_slice(&secretbox::seal(m, &nonce, &key));
        out
    }
}

impl IbeIdentityPrivateKey {
    /// Sums extracted identity keys into the aggregate decryption key.
    pub fn aggregate<'a>(keys: impl IntoIterator<Item = &'a IbeIdentityPrivateKey>) -> Self {
        let sum = keys
            .into_iter()
            .fold(G1Projective::zero(), |acc, k| acc + k.0);
        Self(sum.into_affine())
    }

    /// Decrypts a ciphertext produced by [`IbeMasterPublicKey::encrypt`].
    ///
    /// # Errors
    /// Fails if the ciphertext is malformed or was encrypted to a different
    /// identity or master key.
    pub fn decrypt(&self, c: &[u8]) -> Result<Vec<u8>, IbeCiphertextError> {
        if c.len() < IBE_CIPHERTEXT_OVERHEAD {
            return Err(IbeCiphertextError);
        }
        let ephemeral =
            G2Affine::deserialize_compressed(&c[..96]).map_err(|_| IbeCiphertextError)?;
        let shared = Bls12_381::pairing(self.0, ephemeral);
        let key = shared_key(&shared);
        let nonce = secretbox::Nonce([0_u8; secretbox::NONCEBYTES]);
        secretbox::open(&c[96..], &nonce, &key).map_err(|_| IbeCiphertextError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> Identity {
        Identity::from_username(name).unwrap()
    }

    #[test]
    fn encrypt_decrypt_single_authority() {
        let master = IbeMasterKeyPair::generate();
        let id = identity("alice");
        let private = master.secret.extract(&id);
        let ciphertext = master.public.encrypt(&id, b"introduction");
        assert_eq!(
            ciphertext.len(),
            IBE_CIPHERTEXT_OVERHEAD + b"introduction".len()
        );
        assert_eq!(private.decrypt(&ciphertext).unwrap(), b"introduction");
    }

    #[test]
    fn wrong_identity_fails() {
        let master = IbeMasterKeyPair::generate();
        let ciphertext = master.public.encrypt(&identity("alice"), b"introduction");
        let wrong = master.secret.extract(&identity("bob"));
        assert!(wrong.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn aggregated_authorities() {
        let masters: Vec<IbeMasterKeyPair> = (0..3).map(|_| IbeMasterKeyPair::generate()).collect();
        let id = identity("alice");
        let aggregate_public = IbeMasterPublicKey::aggregate(masters.iter().map(|m| &m.public));
        let privates: Vec<IbeIdentityPrivateKey> =
            masters.iter().map(|m| m.secret.extract(&id)).collect();
        let aggregate_private = IbeIdentityPrivateKey::aggregate(&privates);

        let ciphertext = aggregate_public.encrypt(&id, b"introduction");
        assert_eq!(aggregate_private.decrypt(&ciphertext).unwrap(), b"introduction");

        // a subset of the extracted keys must not decrypt
        let partial = IbeIdentityPrivateKey::aggregate(&privates[..2]);
        assert!(partial.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn extract_is_deterministic() {
        let master = IbeMasterKeyPair::generate();
        let id = identity("alice");
        let first = master.secret.extract(&id);
        let second = master.secret.extract(&id);
        let ciphertext = master.public.encrypt(&id, b"introduction");
        assert_eq!(
            first.decrypt(&ciphertext).unwrap(),
            second.decrypt(&ciphertext).unwrap()
        );
    }
}
