//! Guardian-signed service configurations.
//!
//! Each service (contact discovery, dialing) is described by a chain of
//! immutable configurations linked by predecessor hashes. A new configuration
//! is only valid if every guardian of its predecessor signed it, plus any
//! guardians it newly introduces. Clients track the hash of their trusted
//! configuration and, on a coordinator announcing a different hash, fetch and
//! verify the connecting chain before participating further.
//!
//! The inner payload is service-specific and decoded through an explicit
//! [`ConfigCodec`] table constructed at startup, so the set of known services
//! is visible at the call site instead of hiding in process-global state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{ByteObject, PublicSigningKey, SecretSigningKey, Sha256, Signature};

#[derive(Error, Debug)]
/// An error related to configuration decoding and chain verification.
pub enum ConfigError {
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("invalid inner configuration: {0}")]
    InnerFormat(#[from] serde_json::Error),
    #[error("the chain is empty")]
    EmptyChain,
    #[error("configuration is for service {got:?}, expected {expected:?}")]
    WrongService { expected: String, got: String },
    #[error("version {next} does not increase over {prev}")]
    NonMonotonicVersion { prev: u64, next: u64 },
    #[error("previous-hash pointer does not match the predecessor")]
    BrokenChain,
    #[error("missing signature from guardian {0}")]
    MissingSignature(String),
    #[error("invalid signature from guardian {0}")]
    BadSignature(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A server listed in a configuration: its long-term signing key and the
/// address it serves on.
pub struct ServerEntry {
    /// The server's long-term Ed25519 signing key.
    pub key: PublicSigningKey,
    /// The address the server listens on.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A guardian whose signature blesses configuration updates.
pub struct Guardian {
    /// The guardian's username, for display only.
    pub username: String,
    /// The guardian's signing key.
    pub key: PublicSigningKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The contact-discovery service membership.
pub struct AddFriendInner {
    /// The round coordinator.
    pub coordinator: ServerEntry,
    /// The PKG servers, every one of which must attest a registration.
    pub pkgs: Vec<ServerEntry>,
    /// The mix cascade, in order.
    pub mix_servers: Vec<ServerEntry>,
    /// The CDN that round outputs are published to.
    pub cdn: ServerEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The dialing service membership.
pub struct DialingInner {
    /// The round coordinator.
    pub coordinator: ServerEntry,
    /// The mix cascade, in order.
    pub mix_servers: Vec<ServerEntry>,
    /// The CDN that round outputs are published to.
    pub cdn: ServerEntry,
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded service-specific configuration payload.
pub enum InnerConfig {
    /// Payload of the contact-discovery service.
    AddFriend(AddFriendInner),
    /// Payload of the dialing service.
    Dialing(DialingInner),
}

impl InnerConfig {
    /// The mix cascade, common to both services.
    pub fn mix_servers(&self) -> &[ServerEntry] {
        match self {
            InnerConfig::AddFriend(inner) => &inner.mix_servers,
            InnerConfig::Dialing(inner) => &inner.mix_servers,
        }
    }

    /// The coordinator entry, common to both services.
    pub fn coordinator(&self) -> &ServerEntry {
        match self {
            InnerConfig::AddFriend(inner) => &inner.coordinator,
            InnerConfig::Dialing(inner) => &inner.coordinator,
        }
    }

    /// The CDN entry, common to both services.
    pub fn cdn(&self) -> &ServerEntry {
        match self {
            InnerConfig::AddFriend(inner) => &inner.cdn,
            InnerConfig::Dialing(inner) => &inner.cdn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One immutable link of a service's configuration chain.
pub struct SignedConfig {
    /// The version, strictly increasing along the chain.
    pub version: u64,
    /// The service name, constant along the chain.
    pub service: String,
    /// When this configuration was created.
    pub created: DateTime<Utc>,
    /// When this configuration expires.
    pub expires: DateTime<Utc>,
    /// Hex hash of the predecessor, absent only for the first link.
    pub prev_config_hash: Option<String>,
    /// The raw service-specific payload; decode with a [`ConfigCodec`].
    pub inner: serde_json::Value,
    /// The guardians whose signatures bless the *next* update.
    pub guardians: Vec<Guardian>,
    /// Guardian signatures over this configuration's hash, keyed by hex key.
    pub signatures: BTreeMap<String, Signature>,
}

impl SignedConfig {
    /// The configuration hash.
    ///
    /// Computed over the canonical JSON encoding with the signature map
    /// cleared, so signing does not change the hash. JSON object keys are
    /// sorted, which keeps the hash stable across re-marshalling.
    pub fn hash(&self) -> Sha256 {
        let mut unsigned = self.clone();
        unsigned.signatures = BTreeMap::new();
        // safe unwrap: the struct serializes to JSON by construction
        let encoded = serde_json::to_vec(&unsigned).unwrap();
        Sha256::hash(&[b"SignedConfig".as_ref(), &encoded].concat())
    }

    /// The message guardians sign: `"ConfigHash" || hash`.
    pub fn signing_message(&self) -> Vec<u8> {
        [b"ConfigHash".as_ref(), self.hash().as_slice()].concat()
    }

    /// Adds a guardian signature.
    pub fn sign(&mut self, key: &SecretSigningKey) {
        let signature = key.sign_detached(&self.signing_message());
        self.signatures
            .insert(key.public_key().to_hex(), signature);
    }

    /// Whether this configuration has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires
    }

    /// Verifies that `next` is a valid successor of `self`.
    ///
    /// # Errors
    /// Fails unless the service matches, the version increases, the
    /// previous-hash pointer equals this configuration's hash, and `next`
    /// carries valid signatures from all of this configuration's guardians
    /// plus all guardians it newly introduces.
    pub fn verify_update(&self, next: &SignedConfig) -> Result<(), ConfigError> {
        if next.service != self.service {
            return Err(ConfigError::WrongService {
                expected: self.service.clone(),
                got: next.service.clone(),
            });
        }
        if next.version <= self.version {
            return Err(ConfigError::NonMonotonicVersion {
                prev: self.version,
                next: next.version,
            });
        }
        if next.prev_config_hash.as_deref() != Some(self.hash().to_hex().as_str()) {
            return Err(ConfigError::BrokenChain);
        }

        let mut required: Vec<&Guardian> = self.guardians.iter().collect();
        for guardian in &next.guardians {
            if !self.guardians.iter().any(|g| g.key == guardian.key) {
                required.push(guardian);
            }
        }

        let message = next.signing_message();
        for guardian in required {
            let hex_key = guardian.key.to_hex();
            let signature = next
                .signatures
                .get(&hex_key)
                .ok_or_else(|| ConfigError::MissingSignature(guardian.username.clone()))?;
            if !guardian.key.verify_detached(signature, &message) {
                return Err(ConfigError::BadSignature(guardian.username.clone()));
            }
        }
        Ok(())
    }

    /// Verifies a chain of successors, oldest first, starting from `self`.
    ///
    /// Returns the head of the chain on success.
    ///
    /// # Errors
    /// Fails on an empty chain or if any link fails [`verify_update`](Self::verify_update).
    pub fn verify_chain<'a>(
        &self,
        chain: &'a [SignedConfig],
    ) -> Result<&'a SignedConfig, ConfigError> {
        let mut current = self;
        for next in chain {
            current.verify_update(next)?;
            current = next;
        }
        if chain.is_empty() {
            Err(ConfigError::EmptyChain)
        } else {
            // safe unwrap: the chain is non-empty
            Ok(chain.last().unwrap())
        }
    }
}

/// Decoder for one service's inner payload.
type InnerDecoder = fn(&serde_json::Value) -> Result<InnerConfig, ConfigError>;

/// The table of known services and their inner-payload decoders.
pub struct ConfigCodec {
    decoders: BTreeMap<String, InnerDecoder>,
}

impl ConfigCodec {
    /// The table knowing the two standard services.
    pub fn standard() -> Self {
        let mut decoders: BTreeMap<String, InnerDecoder> = BTreeMap::new();
        decoders.insert("addfriend".to_string(), |value| {
            let inner: AddFriendInner = serde_json::from_value(value.clone())?;
            Ok(InnerConfig::AddFriend(inner))
        });
        decoders.insert("dialing".to_string(), |value| {
            let inner: DialingInner = serde_json::from_value(value.clone())?;
            Ok(InnerConfig::Dialing(inner))
        });
        Self { decoders }
    }

    /// Decodes a configuration's inner payload.
    ///
    /// # Errors
    /// Fails for services absent from the table and for malformed payloads.
    pub fn decode_inner(&self, config: &SignedConfig) -> Result<InnerConfig, ConfigError> {
        let decoder = self
            .decoders
            .get(&config.service)
            .ok_or_else(|| ConfigError::UnknownService(config.service.clone()))?;
        decoder(&config.inner)
    }

    /// Encodes an inner payload into its raw form.
    pub fn encode_inner(inner: &InnerConfig) -> serde_json::Value {
        // safe unwraps: the inner structs serialize to JSON by construction
        match inner {
            InnerConfig::AddFriend(inner) => serde_json::to_value(inner).unwrap(),
            InnerConfig::Dialing(inner) => serde_json::to_value(inner).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::crypto::SigningKeyPair;

    fn entry(address: &str) -> ServerEntry {
        ServerEntry {
            key: SigningKeyPair::generate().public,
            address: address.to_string(),
        }
    }

    fn dialing_config(version: u64, guardians: &[&SigningKeyPair]) -> SignedConfig {
        let inner = InnerConfig::Dialing(DialingInner {
            coordinator: entry("coordinator.example:8000"),
            mix_servers: vec![entry("mix0.example:8000"), entry("mix1.example:8000")],
            cdn: entry("cdn.example:8000"),
        });
        SignedConfig {
            version,
            service: "dialing".to_string(),
            created: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            expires: Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap(),
            prev_config_hash: None,
            inner: ConfigCodec::encode_inner(&inner),
            guardians: guardians
                .iter()
                .enumerate()
                .map(|(i, keys)| Guardian {
                    username: format!("guardian{}", i),
                    key: keys.public,
                })
                .collect(),
            signatures: BTreeMap::new(),
        }
    }

    fn successor(prev: &SignedConfig, signers: &[&SigningKeyPair]) -> SignedConfig {
        let mut next = prev.clone();
        next.version = prev.version + 1;
        next.prev_config_hash = Some(prev.hash().to_hex());
        next.signatures = BTreeMap::new();
        for signer in signers {
            next.sign(&signer.secret);
        }
        next
    }

    #[test]
    fn marshalling_round_trip_and_stable_hash() {
        let guardian = SigningKeyPair::generate();
        let config = dialing_config(1, &[&guardian]);
        let json = serde_json::to_string(&config).unwrap();
        let back: SignedConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
        assert_eq!(config.hash(), back.hash());
    }

    #[test]
    fn hash_ignores_signatures() {
        let guardian = SigningKeyPair::generate();
        let mut config = dialing_config(1, &[&guardian]);
        let before = config.hash();
        config.sign(&guardian.secret);
        assert_eq!(config.hash(), before);
    }

    #[test]
    fn codec_decodes_known_services() {
        let guardian = SigningKeyPair::generate();
        let config = dialing_config(1, &[&guardian]);
        let codec = ConfigCodec::standard();
        match codec.decode_inner(&config).unwrap() {
            InnerConfig::Dialing(inner) => assert_eq!(inner.mix_servers.len(), 2),
            other => panic!("decoded the wrong service: {:?}", other),
        }

        let mut unknown = config;
        unknown.service = "paging".to_string();
        assert!(matches!(
            codec.decode_inner(&unknown),
            Err(ConfigError::UnknownService(_))
        ));
    }

    #[test]
    fn chain_with_all_guardian_signatures_verifies() {
        let g1 = SigningKeyPair::generate();
        let g2 = SigningKeyPair::generate();
        let first = dialing_config(1, &[&g1, &g2]);
        let second = successor(&first, &[&g1, &g2]);
        let head = first.verify_chain(std::slice::from_ref(&second)).unwrap();
        assert_eq!(head.version, 2);
    }

    #[test]
    fn a_missing_guardian_signature_is_rejected() {
        let g1 = SigningKeyPair::generate();
        let g2 = SigningKeyPair::generate();
        let first = dialing_config(1, &[&g1, &g2]);
        let second = successor(&first, &[&g1]);
        assert!(matches!(
            first.verify_update(&second),
            Err(ConfigError::MissingSignature(_))
        ));
    }

    #[test]
    fn added_guardians_must_also_sign() {
        let g1 = SigningKeyPair::generate();
        let g2 = SigningKeyPair::generate();
        let first = dialing_config(1, &[&g1]);
        let mut second = successor(&first, &[]);
        second.guardians.push(Guardian {
            username: "guardian1".to_string(),
            key: g2.public,
        });
        // re-sign after the guardian change: signatures cover the hash
        second.signatures = BTreeMap::new();
        second.sign(&g1.secret);
        assert!(matches!(
            first.verify_update(&second),
            Err(ConfigError::MissingSignature(_))
        ));

        second.sign(&g2.secret);
        first.verify_update(&second).unwrap();
    }

    #[test]
    fn version_must_increase_and_hash_must_link() {
        let g1 = SigningKeyPair::generate();
        let first = dialing_config(5, &[&g1]);

        let mut stale = successor(&first, &[&g1]);
        stale.version = 5;
        stale.signatures = BTreeMap::new();
        stale.sign(&g1.secret);
        assert!(matches!(
            first.verify_update(&stale),
            Err(ConfigError::NonMonotonicVersion { .. })
        ));

        let mut unlinked = successor(&first, &[&g1]);
        unlinked.prev_config_hash = Some(Sha256::fill_with(9).to_hex());
        unlinked.signatures = BTreeMap::new();
        unlinked.sign(&g1.secret);
        assert!(matches!(
            first.verify_update(&unlinked),
            Err(ConfigError::BrokenChain)
        ));
    }
}
