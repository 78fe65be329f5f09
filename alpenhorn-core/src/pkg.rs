//! Types of the PKG commit/reveal and key-extraction protocol.
//!
//! Per round every PKG commits to a fresh IBE master public key and a fresh
//! BLS public key before revealing either, so no PKG can pick its keys as a
//! function of another's. The canonical byte forms here are shared between
//! the servers that produce signatures and the clients that verify them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    crypto::{
        BlsPublicKey,
        BlsSignature,
        ByteObject,
        IbeMasterPublicKey,
        PublicEncryptKey,
        PublicSigningKey,
        Sha256,
        Signature,
    },
    identity::Identity,
};

/// Commits to a PKG's per-round key pairs:
/// `SHA256(ibe_master_public || bls_public)`.
pub fn key_commitment(ibe_public: &IbeMasterPublicKey, bls_public: &BlsPublicKey) -> Sha256 {
    Sha256::hash(&[ibe_public.to_bytes(), bls_public.to_bytes()].concat())
}

/// The canonical form every PKG signs at reveal time:
/// `"Commitments" || BE_u32(round) || for each hex key in sorted order: hex_key || commitment`.
///
/// The map is keyed by the lowercase hex encoding of each PKG's signing key;
/// `BTreeMap` iteration provides the sorted order.
pub fn commitment_list_message(round: u32, commitments: &BTreeMap<String, Sha256>) -> Vec<u8> {
    let mut message = b"Commitments".to_vec();
    message.extend_from_slice(&round.to_be_bytes());
    for (hex_key, commitment) in commitments {
        message.extend_from_slice(hex_key.as_bytes());
        message.extend_from_slice(commitment.as_slice());
    }
    message
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One PKG's statement that `identity` owns `long_term_key`, signed with the
/// PKG's per-round BLS key. The aggregate of all PKGs' attestations travels
/// inside every introduction.
pub struct Attestation {
    /// The attesting PKG's per-round BLS public key.
    pub bls_public: BlsPublicKey,
    /// The attested identity.
    pub identity: Identity,
    /// The attested long-term signing key.
    pub long_term_key: PublicSigningKey,
}

impl Attestation {
    /// The canonical form: `bls_public || identity || long_term_key`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut message = self.bls_public.to_bytes();
        message.extend_from_slice(self.identity.as_slice());
        message.extend_from_slice(self.long_term_key.as_slice());
        message
    }
}

/// The canonical form a user's login key signs to request extraction:
/// `"ExtractArgs" || pkg_signing_key || BE_u32(round) || identity || return_key || user_long_term_key`.
pub fn extract_request_message(
    pkg_key: &PublicSigningKey,
    round: u32,
    identity: &Identity,
    return_key: &PublicEncryptKey,
    long_term_key: &PublicSigningKey,
) -> Vec<u8> {
    let mut message = b"ExtractArgs".to_vec();
    message.extend_from_slice(pkg_key.as_slice());
    message.extend_from_slice(&round.to_be_bytes());
    message.extend_from_slice(identity.as_slice());
    message.extend_from_slice(return_key.as_slice());
    message.extend_from_slice(long_term_key.as_slice());
    message
}

/// The canonical form the PKG signs over its reply:
/// `"ExtractReply" || BE_u32(round) || identity || encrypted_private_key`.
pub fn extract_reply_message(
    round: u32,
    identity: &Identity,
    encrypted_private_key: &[u8],
) -> Vec<u8> {
    let mut message = b"ExtractReply".to_vec();
    message.extend_from_slice(&round.to_be_bytes());
    message.extend_from_slice(identity.as_slice());
    message.extend_from_slice(encrypted_private_key);
    message
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A request for the per-round identity private key.
pub struct ExtractRequest {
    /// The round the key is requested for.
    pub round: u32,
    /// The requesting username.
    pub username: String,
    /// A fresh key the reply is sealed to.
    pub return_key: PublicEncryptKey,
    /// The user's long-term signing key, to be attested.
    pub long_term_key: PublicSigningKey,
    /// Signature by the user's login key over [`extract_request_message`].
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The PKG's reply to an [`ExtractRequest`].
pub struct ExtractReply {
    /// The round the key belongs to.
    pub round: u32,
    /// The username the key was extracted for.
    pub username: String,
    /// The identity private key, sealed to the request's return key.
    pub encrypted_private_key: Vec<u8>,
    /// Signature by the PKG's signing key over [`extract_reply_message`].
    pub signature: Signature,
    /// BLS signature over the [`Attestation`] canonical form.
    pub identity_sig: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One PKG's revealed per-round settings, announced to clients.
pub struct PkgRoundInfo {
    /// The revealed IBE master public key.
    pub master_public_key: IbeMasterPublicKey,
    /// The revealed BLS public key.
    pub bls_public_key: BlsPublicKey,
    /// Ed25519 signature over the full ordered commitment list.
    pub signature: Signature,
}

/// The per-round PKG settings, keyed by the hex encoding of each PKG's
/// signing key.
pub type PkgSettings = BTreeMap<String, PkgRoundInfo>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
/// An error related to the verification of announced PKG settings.
pub enum PkgSettingsError {
    #[error("settings list {got} PKGs, the configuration lists {expected}")]
    WrongCount { expected: usize, got: usize },
    #[error("no settings entry for PKG {0}")]
    MissingPkg(String),
    #[error("PKG {0} has a bad commitment-list signature")]
    BadSignature(String),
}

/// Verifies announced PKG settings against the expected PKG signing keys.
///
/// Recomputes every PKG's commitment from its revealed keys, rebuilds the
/// canonical commitment list and checks each PKG's signature over it. A PKG
/// that revealed keys other than the ones it committed to cannot produce a
/// valid signature set.
pub fn verify_pkg_settings(
    round: u32,
    settings: &PkgSettings,
    expected_keys: &[PublicSigningKey],
) -> Result<(), PkgSettingsError> {
    if settings.len() != expected_keys.len() {
        return Err(PkgSettingsError::WrongCount {
            expected: expected_keys.len(),
            got: settings.len(),
        });
    }

    let mut commitments = BTreeMap::new();
    for (hex_key, info) in settings {
        commitments.insert(
            hex_key.clone(),
            key_commitment(&info.master_public_key, &info.bls_public_key),
        );
    }
    let message = commitment_list_message(round, &commitments);

    for key in expected_keys {
        let hex_key = key.to_hex();
        let info = settings
            .get(&hex_key)
            .ok_or_else(|| PkgSettingsError::MissingPkg(hex_key.clone()))?;
        if !key.verify_detached(&info.signature, &message) {
            return Err(PkgSettingsError::BadSignature(hex_key));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BlsKeyPair, IbeMasterKeyPair, SigningKeyPair};

    #[test]
    fn commitment_list_message_is_byte_exact() {
        let mut commitments = BTreeMap::new();
        commitments.insert("aa".to_string(), Sha256::fill_with(1));
        commitments.insert("bb".to_string(), Sha256::fill_with(2));
        let message = commitment_list_message(7, &commitments);

        let mut expected = b"Commitments".to_vec();
        expected.extend_from_slice(&[0, 0, 0, 7]);
        expected.extend_from_slice(b"aa");
        expected.extend_from_slice(&[1; 32]);
        expected.extend_from_slice(b"bb");
        expected.extend_from_slice(&[2; 32]);
        assert_eq!(message, expected);
    }

    #[test]
    fn settings_with_valid_signatures_verify() {
        let round = 5;
        let signers: Vec<SigningKeyPair> = (0..2).map(|_| SigningKeyPair::generate()).collect();
        let keys: Vec<(IbeMasterKeyPair, BlsKeyPair)> = signers
            .iter()
            .map(|_| (IbeMasterKeyPair::generate(), BlsKeyPair::generate()))
            .collect();

        let mut commitments = BTreeMap::new();
        for (signer, (ibe, bls)) in signers.iter().zip(&keys) {
            commitments.insert(
                signer.public.to_hex(),
                key_commitment(&ibe.public, &bls.public),
            );
        }
        let message = commitment_list_message(round, &commitments);

        let mut settings = PkgSettings::new();
        for (signer, (ibe, bls)) in signers.iter().zip(&keys) {
            settings.insert(
                signer.public.to_hex(),
                PkgRoundInfo {
                    master_public_key: ibe.public.clone(),
                    bls_public_key: bls.public,
                    signature: signer.secret.sign_detached(&message),
                },
            );
        }

        let expected: Vec<_> = signers.iter().map(|s| s.public).collect();
        verify_pkg_settings(round, &settings, &expected).unwrap();

        // a swapped-in key breaks the recomputed commitment list
        let rogue = IbeMasterKeyPair::generate();
        let first = settings.keys().next().unwrap().clone();
        settings.get_mut(&first).unwrap().master_public_key = rogue.public;
        assert!(matches!(
            verify_pkg_settings(round, &settings, &expected),
            Err(PkgSettingsError::BadSignature(_))
        ));
    }

    #[test]
    fn missing_pkg_is_rejected() {
        let signer = SigningKeyPair::generate();
        let settings = PkgSettings::new();
        assert_eq!(
            verify_pkg_settings(1, &settings, &[signer.public]),
            Err(PkgSettingsError::WrongCount {
                expected: 1,
                got: 0
            })
        );
    }
}
