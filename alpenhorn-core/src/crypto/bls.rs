//! BLS signatures over BLS12-381.
//!
//! Secret keys are scalars, public keys live in G2 and signatures in G1, so
//! a signature is a short 48-byte point. Signatures on *distinct* messages
//! aggregate by point addition into a single signature that verifies against
//! the per-message public keys with one multi-pairing. The identity
//! attestations collected from every PKG are aggregated this way.

use std::fmt;

use ark_bls12_381::{g1, Bls12_381, Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{
    hashing::{curve_maps::wb::WBMap, map_to_curve_hasher::MapToCurveBasedHasher, HashToCurve},
    pairing::Pairing,
    AffineRepr,
    CurveGroup,
    Group,
};
use ark_ff::{field_hashers::DefaultFieldHasher, UniformRand, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::rngs::OsRng;
use sha2::Sha256 as Sha256Digest;

/// Domain separation tag for hashing messages onto G1.
const SIGNATURE_DOMAIN: &[u8] = b"ALPENHORN-BLS-SIGNATURE";

/// Hashes an arbitrary message onto the signature group.
pub(crate) fn hash_to_g1(domain: &[u8], message: &[u8]) -> G1Projective {
    // safe unwraps: the BLS12-381 Weierstrass map parameters are fixed and
    // valid for any non-empty domain tag
    let hasher = MapToCurveBasedHasher::<
        G1Projective,
        DefaultFieldHasher<Sha256Digest, 128>,
        WBMap<g1::Config>,
    >::new(domain)
    .unwrap();
    hasher.hash(message).unwrap().into()
}

macro_rules! impl_point_bytes {
    ($type:ty, $point:ty, $len:expr) => {
        impl $type {
            /// Length in bytes of the compressed encoding.
            pub const LENGTH: usize = $len;

            /// Returns the compressed encoding of this point.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut bytes = Vec::with_capacity(Self::LENGTH);
                // safe unwrap: serializing into a Vec cannot fail
                self.0.serialize_compressed(&mut bytes).unwrap();
                bytes
            }

            /// Decodes a compressed point, checking that it is on the curve
            /// and in the correct subgroup.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                <$point>::deserialize_compressed(bytes).ok().map(Self)
            }
        }

        impl serde::Serialize for $type {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.to_bytes().serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $type {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
                Self::from_bytes(&bytes)
                    .ok_or_else(|| serde::de::Error::custom("invalid curve point"))
            }
        }

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($type), "({})"), hex::encode(self.to_bytes()))
            }
        }
    };
}

pub(crate) use impl_point_bytes;

#[derive(Clone, Copy, PartialEq, Eq)]
/// A BLS public key, a point in G2.
pub struct BlsPublicKey(pub(crate) G2Affine);

impl_point_bytes!(BlsPublicKey, G2Affine, 96);

#[derive(Clone, PartialEq, Eq)]
/// A BLS secret key, a scalar.
pub struct BlsSecretKey(Fr);

impl fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSecretKey(..)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
/// A BLS signature, a point in G1.
pub struct BlsSignature(G1Affine);

impl_point_bytes!(BlsSignature, G1Affine, 48);

#[derive(Clone, Debug)]
/// A BLS key pair.
pub struct BlsKeyPair {
    /// The public key.
    pub public: BlsPublicKey,
    /// The secret key.
    pub secret: BlsSecretKey,
}

impl BlsKeyPair {
    /// Generates a new random BLS key pair.
    pub fn generate() -> Self {
        let secret = Fr::rand(&mut OsRng);
        let public = (G2Projective::generator() * secret).into_affine();
        Self {
            public: BlsPublicKey(public),
            secret: BlsSecretKey(secret),
        }
    }
}

impl BlsSecretKey {
    /// Signs the message `m` with this secret key.
    pub fn sign(&self, m: &[u8]) -> BlsSignature {
        BlsSignature((hash_to_g1(SIGNATURE_DOMAIN, m) * self.0).into_affine())
    }
}

impl BlsPublicKey {
    /// Verifies a single signature on `m` against this public key.
    pub fn verify(&self, signature: &BlsSignature, m: &[u8]) -> bool {
        let h = hash_to_g1(SIGNATURE_DOMAIN, m).into_affine();
        Bls12_381::pairing(signature.0, G2Affine::generator()) == Bls12_381::pairing(h, self.0)
    }
}

impl BlsSignature {
    /// Aggregates signatures on distinct messages by point addition.
    pub fn aggregate<'a>(signatures: impl IntoIterator<Item = &'a BlsSignature>) -> BlsSignature {
        let sum = signatures
            .into_iter()
            .fold(G1Projective::zero(), |acc, s| acc + s.0);
        BlsSignature(sum.into_affine())
    }

    /// Verifies this aggregate signature against one `(public key, message)`
    /// pair per signer.
    ///
    /// Returns `false` for an empty message list: an aggregate over nothing
    /// attests to nothing.
    pub fn verify_aggregate<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a BlsPublicKey, &'a [u8])>,
    ) -> bool {
        let mut g1s = Vec::new();
        let mut g2s = Vec::new();
        for (pk, m) in pairs {
            g1s.push(hash_to_g1(SIGNATURE_DOMAIN, m).into_affine());
            g2s.push(pk.0);
        }
        if g1s.is_empty() {
            return false;
        }
        let lhs = Bls12_381::pairing(self.0, G2Affine::generator());
        let rhs = Bls12_381::multi_pairing(g1s, g2s);
        lhs == rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keys = BlsKeyPair::generate();
        let signature = keys.secret.sign(b"attestation");
        assert!(keys.public.verify(&signature, b"attestation"));
        assert!(!keys.public.verify(&signature, b"attestatiom"));
    }

    #[test]
    fn point_encoding_round_trip() {
        let keys = BlsKeyPair::generate();
        let signature = keys.secret.sign(b"attestation");
        assert_eq!(keys.public.to_bytes().len(), BlsPublicKey::LENGTH);
        assert_eq!(signature.to_bytes().len(), BlsSignature::LENGTH);
        assert_eq!(
            BlsPublicKey::from_bytes(&keys.public.to_bytes()).unwrap(),
            keys.public
        );
        assert_eq!(
            BlsSignature::from_bytes(&signature.to_bytes()).unwrap(),
            signature
        );
    }

    #[test]
    fn aggregate_over_distinct_messages() {
        let signers: Vec<BlsKeyPair> = (0..3).map(|_| BlsKeyPair::generate()).collect();
        let messages: Vec<Vec<u8>> = (0..3_u8).map(|i| vec![i; 16]).collect();
        let signatures: Vec<BlsSignature> = signers
            .iter()
            .zip(&messages)
            .map(|(keys, m)| keys.secret.sign(m))
            .collect();
        let aggregate = BlsSignature::aggregate(&signatures);
        assert!(aggregate.verify_aggregate(
            signers
                .iter()
                .zip(&messages)
                .map(|(keys, m)| (&keys.public, m.as_slice()))
        ));
        // a swapped message breaks the aggregate
        assert!(!aggregate.verify_aggregate(
            signers
                .iter()
                .zip(messages.iter().rev())
                .map(|(keys, m)| (&keys.public, m.as_slice()))
        ));
    }

    #[test]
    fn aggregate_over_nothing_is_invalid() {
        let aggregate = BlsSignature::aggregate([].iter());
        assert!(!aggregate.verify_aggregate(std::iter::empty()));
    }
}
