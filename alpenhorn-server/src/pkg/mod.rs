//! The private key generator (PKG).
//!
//! Per round each PKG generates a fresh IBE master key pair and a fresh BLS
//! key pair, commits to both public keys, and reveals them only after the
//! coordinator has collected every PKG's commitment. Registered users then
//! extract their per-identity IBE private keys and receive a BLS attestation
//! binding their identity to their long-term signing key.
//!
//! Client-caused failures are logged at info severity so a hostile client
//! cannot flood the error log; internal failures are logged at error
//! severity.

mod storage;

pub use self::storage::{UserEvent, UserState, UserStore};

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use alpenhorn_core::{
    crypto::{
        BlsKeyPair,
        ByteObject,
        IbeMasterKeyPair,
        PublicSigningKey,
        SealedBox,
        Sha256,
        SigningKeyPair,
    },
    identity::{Identity, UsernameError},
    pkg::{
        commitment_list_message,
        extract_reply_message,
        extract_request_message,
        key_commitment,
        Attestation,
        ExtractReply,
        ExtractRequest,
        PkgRoundInfo,
    },
    LoginPublicKey,
};

#[derive(Error, Debug)]
/// An error a PKG reports to its caller. The kind survives transport.
pub enum PkgError {
    #[error("invalid username: {0}")]
    InvalidUsername(#[from] UsernameError),
    #[error("invalid login key")]
    InvalidLoginKey,
    #[error("username is not registered")]
    NotRegistered,
    #[error("username is already registered")]
    AlreadyRegistered,
    #[error("invalid registration token")]
    InvalidToken,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid user long-term key")]
    InvalidUserLongTermKey,
    #[error("round {0} not found")]
    RoundNotFound(u32),
    #[error("commitment does not match the committed keys")]
    BadCommitment,
    #[error("database error: {0}")]
    Database(String),
    #[error("caller is not authorized for this call")]
    Unauthorized,
}

impl PkgError {
    /// A stable name for transmitting the error kind to the caller.
    pub fn kind(&self) -> &'static str {
        match self {
            PkgError::InvalidUsername(_) => "InvalidUsername",
            PkgError::InvalidLoginKey => "InvalidLoginKey",
            PkgError::NotRegistered => "NotRegistered",
            PkgError::AlreadyRegistered => "AlreadyRegistered",
            PkgError::InvalidToken => "InvalidToken",
            PkgError::InvalidSignature => "InvalidSignature",
            PkgError::InvalidUserLongTermKey => "InvalidUserLongTermKey",
            PkgError::RoundNotFound(_) => "RoundNotFound",
            PkgError::BadCommitment => "BadCommitment",
            PkgError::Database(_) => "DatabaseError",
            PkgError::Unauthorized => "Unauthorized",
        }
    }

    /// Whether the caller, not this server, caused the failure.
    pub fn is_client_fault(&self) -> bool {
        !matches!(self, PkgError::Database(_) | PkgError::BadCommitment)
    }

    /// Rebuilds an error from its transmitted kind.
    pub fn from_kind(kind: &str, message: &str) -> Self {
        match kind {
            "InvalidUsername" => PkgError::InvalidUsername(UsernameError::Empty),
            "InvalidLoginKey" => PkgError::InvalidLoginKey,
            "NotRegistered" => PkgError::NotRegistered,
            "AlreadyRegistered" => PkgError::AlreadyRegistered,
            "InvalidToken" => PkgError::InvalidToken,
            "InvalidSignature" => PkgError::InvalidSignature,
            "InvalidUserLongTermKey" => PkgError::InvalidUserLongTermKey,
            "RoundNotFound" => PkgError::RoundNotFound(0),
            "BadCommitment" => PkgError::BadCommitment,
            "Unauthorized" => PkgError::Unauthorized,
            _ => PkgError::Database(message.to_string()),
        }
    }
}

/// Verifies registration tokens against an external authority.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Whether `token` authorizes registering `username`.
    async fn verify(&self, username: &str, token: &str) -> bool;
}

/// Open registration: accepts every token.
pub struct OpenRegistration;

#[async_trait]
impl TokenVerifier for OpenRegistration {
    async fn verify(&self, _username: &str, _token: &str) -> bool {
        true
    }
}

/// Per-round key material. Never serialized; dropped when the round ages out.
struct PkgRound {
    ibe: IbeMasterKeyPair,
    bls: BlsKeyPair,
    commitment: Sha256,
}

/// A PKG server.
pub struct PkgServer {
    keys: SigningKeyPair,
    coordinator_key: PublicSigningKey,
    store: UserStore,
    verifier: Arc<dyn TokenVerifier>,
    rounds: Mutex<BTreeMap<u32, PkgRound>>,
}

impl PkgServer {
    /// Creates a PKG server.
    pub fn new(
        keys: SigningKeyPair,
        coordinator_key: PublicSigningKey,
        store: UserStore,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            keys,
            coordinator_key,
            store,
            verifier,
            rounds: Mutex::new(BTreeMap::new()),
        }
    }

    /// The server's long-term signing key.
    pub fn public_key(&self) -> PublicSigningKey {
        self.keys.public
    }

    /// Generates (or returns) the round's keys and commits to them.
    /// Cleans up state older than `round - 1`.
    pub fn commit(&self, peer: &PublicSigningKey, round: u32) -> Result<Sha256, PkgError> {
        if *peer != self.coordinator_key {
            return Err(PkgError::Unauthorized);
        }

        let mut rounds = self.rounds.lock().unwrap();
        rounds.retain(|&id, _| id + 1 >= round);
        if let Some(existing) = rounds.get(&round) {
            return Ok(existing.commitment);
        }

        let ibe = IbeMasterKeyPair::generate();
        let bls = BlsKeyPair::generate();
        let commitment = key_commitment(&ibe.public, &bls.public);
        info!(round, "committed to fresh round keys");
        rounds.insert(
            round,
            PkgRound {
                ibe,
                bls,
                commitment,
            },
        );
        Ok(commitment)
    }

    /// Reveals the round's public keys and signs the full commitment list.
    /// Idempotent.
    pub fn reveal(
        &self,
        peer: &PublicSigningKey,
        round: u32,
        commitments: &BTreeMap<String, Sha256>,
    ) -> Result<PkgRoundInfo, PkgError> {
        if *peer != self.coordinator_key {
            return Err(PkgError::Unauthorized);
        }

        let rounds = self.rounds.lock().unwrap();
        let state = rounds.get(&round).ok_or(PkgError::RoundNotFound(round))?;

        let own = commitments.get(&self.keys.public.to_hex());
        if own != Some(&state.commitment) {
            error!(round, "commitment list disagrees with the committed keys");
            return Err(PkgError::BadCommitment);
        }

        let message = commitment_list_message(round, commitments);
        Ok(PkgRoundInfo {
            master_public_key: state.ibe.public.clone(),
            bls_public_key: state.bls.public,
            signature: self.keys.secret.sign_detached(&message),
        })
    }

    /// Registers a username with its login key. Atomic.
    pub async fn register(
        &self,
        username: &str,
        login_key: LoginPublicKey,
        token: &str,
    ) -> Result<(), PkgError> {
        let identity = Identity::from_username(username).map_err(|e| {
            info!(%username, "registration with invalid username");
            PkgError::InvalidUsername(e)
        })?;
        if !self.verifier.verify(username, token).await {
            info!(%username, "registration with invalid token");
            return Err(PkgError::InvalidToken);
        }
        self.store.register(&identity, login_key).map_err(|e| {
            if e.is_client_fault() {
                info!(%username, kind = e.kind(), "registration rejected");
            } else {
                error!(%username, kind = e.kind(), "registration failed");
            }
            e
        })?;
        info!(%username, "registered");
        Ok(())
    }

    /// Extracts the per-round identity private key for a registered user and
    /// attests the user's long-term key.
    pub fn extract(&self, request: &ExtractRequest) -> Result<ExtractReply, PkgError> {
        let reply = self.extract_inner(request);
        if let Err(e) = &reply {
            if e.is_client_fault() {
                info!(username = %request.username, round = request.round, kind = e.kind(), "extraction rejected");
            } else {
                error!(username = %request.username, round = request.round, kind = e.kind(), "extraction failed");
            }
        }
        reply
    }

    fn extract_inner(&self, request: &ExtractRequest) -> Result<ExtractReply, PkgError> {
        let identity = Identity::from_username(&request.username)?;
        let user = self
            .store
            .get(&identity)?
            .ok_or(PkgError::NotRegistered)?;

        let message = extract_request_message(
            &self.keys.public,
            request.round,
            &identity,
            &request.return_key,
            &request.long_term_key,
        );
        if !user.login_key.verify_detached(&request.signature, &message) {
            return Err(PkgError::InvalidSignature);
        }

        let (encrypted_private_key, identity_sig) = {
            let rounds = self.rounds.lock().unwrap();
            let state = rounds
                .get(&request.round)
                .ok_or(PkgError::RoundNotFound(request.round))?;

            let private_key = state.ibe.secret.extract(&identity);
            let encrypted = SealedBox::seal(&request.return_key, &private_key.to_bytes());
            let attestation = Attestation {
                bls_public: state.bls.public,
                identity,
                long_term_key: request.long_term_key,
            };
            (encrypted, state.bls.secret.sign(&attestation.to_bytes()))
        };

        self.store.record_extraction(&identity, request.round)?;

        let reply_message =
            extract_reply_message(request.round, &identity, &encrypted_private_key);
        Ok(ExtractReply {
            round: request.round,
            username: request.username.clone(),
            encrypted_private_key,
            signature: self.keys.secret.sign_detached(&reply_message),
            identity_sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use alpenhorn_core::crypto::EncryptKeyPair;

    use super::*;

    struct RejectAll;

    #[async_trait]
    impl TokenVerifier for RejectAll {
        async fn verify(&self, _username: &str, _token: &str) -> bool {
            false
        }
    }

    fn server() -> (PkgServer, SigningKeyPair) {
        let coordinator = SigningKeyPair::generate();
        let server = PkgServer::new(
            SigningKeyPair::generate(),
            coordinator.public,
            UserStore::ephemeral(),
            Arc::new(OpenRegistration),
        );
        (server, coordinator)
    }

    fn extract_request(
        server: &PkgServer,
        round: u32,
        username: &str,
        login: &SigningKeyPair,
        long_term: &SigningKeyPair,
        return_keys: &EncryptKeyPair,
    ) -> ExtractRequest {
        let identity = Identity::from_username(username).unwrap();
        let message = extract_request_message(
            &server.public_key(),
            round,
            &identity,
            &return_keys.public,
            &long_term.public,
        );
        ExtractRequest {
            round,
            username: username.to_string(),
            return_key: return_keys.public,
            long_term_key: long_term.public,
            signature: login.secret.sign_detached(&message),
        }
    }

    #[test]
    fn commit_is_idempotent_and_authorized() {
        let (server, coordinator) = server();
        let first = server.commit(&coordinator.public, 1).unwrap();
        let second = server.commit(&coordinator.public, 1).unwrap();
        assert_eq!(first, second);

        let stranger = SigningKeyPair::generate();
        assert!(matches!(
            server.commit(&stranger.public, 1),
            Err(PkgError::Unauthorized)
        ));
    }

    #[test]
    fn reveal_checks_the_own_commitment() {
        let (server, coordinator) = server();
        let commitment = server.commit(&coordinator.public, 1).unwrap();

        let mut commitments = BTreeMap::new();
        commitments.insert(server.public_key().to_hex(), commitment);
        let info = server.reveal(&coordinator.public, 1, &commitments).unwrap();
        assert_eq!(
            key_commitment(&info.master_public_key, &info.bls_public_key),
            commitment
        );
        let message = commitment_list_message(1, &commitments);
        assert!(server.public_key().verify_detached(&info.signature, &message));

        // reveal is idempotent
        let again = server.reveal(&coordinator.public, 1, &commitments).unwrap();
        assert_eq!(info, again);

        // a tampered commitment is rejected
        let mut tampered = BTreeMap::new();
        tampered.insert(server.public_key().to_hex(), Sha256::fill_with(1));
        assert!(matches!(
            server.reveal(&coordinator.public, 1, &tampered),
            Err(PkgError::BadCommitment)
        ));
    }

    #[tokio::test]
    async fn register_validates_username_and_token() {
        let (server, _) = server();
        let login = SigningKeyPair::generate();
        server.register("alice", login.public, "tok").await.unwrap();
        assert!(matches!(
            server.register("alice", login.public, "tok").await,
            Err(PkgError::AlreadyRegistered)
        ));
        assert!(matches!(
            server.register("Alice", login.public, "tok").await,
            Err(PkgError::InvalidUsername(_))
        ));

        let coordinator = SigningKeyPair::generate();
        let rejecting = PkgServer::new(
            SigningKeyPair::generate(),
            coordinator.public,
            UserStore::ephemeral(),
            Arc::new(RejectAll),
        );
        assert!(matches!(
            rejecting.register("bob", login.public, "tok").await,
            Err(PkgError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn extract_round_trip() {
        let (server, coordinator) = server();
        let login = SigningKeyPair::generate();
        let long_term = SigningKeyPair::generate();
        let return_keys = EncryptKeyPair::generate();
        server.register("alice", login.public, "tok").await.unwrap();
        let commitment = server.commit(&coordinator.public, 1).unwrap();
        let mut commitments = BTreeMap::new();
        commitments.insert(server.public_key().to_hex(), commitment);
        let round_info = server.reveal(&coordinator.public, 1, &commitments).unwrap();

        let request = extract_request(&server, 1, "alice", &login, &long_term, &return_keys);
        let reply = server.extract(&request).unwrap();

        // the reply signature verifies
        let identity = Identity::from_username("alice").unwrap();
        let message = extract_reply_message(1, &identity, &reply.encrypted_private_key);
        assert!(server.public_key().verify_detached(&reply.signature, &message));

        // the sealed private key opens and decrypts
        let key_bytes = SealedBox::open(&return_keys.secret, &reply.encrypted_private_key).unwrap();
        let private_key =
            alpenhorn_core::crypto::IbeIdentityPrivateKey::from_bytes(&key_bytes).unwrap();
        let ciphertext = round_info.master_public_key.encrypt(&identity, b"hi");
        assert_eq!(private_key.decrypt(&ciphertext).unwrap(), b"hi");

        // the attestation verifies
        let attestation = Attestation {
            bls_public: round_info.bls_public_key,
            identity,
            long_term_key: long_term.public,
        };
        assert!(round_info
            .bls_public_key
            .verify(&reply.identity_sig, &attestation.to_bytes()));
    }

    #[tokio::test]
    async fn extract_rejects_bad_requests() {
        let (server, coordinator) = server();
        let login = SigningKeyPair::generate();
        let long_term = SigningKeyPair::generate();
        let return_keys = EncryptKeyPair::generate();
        server.register("alice", login.public, "tok").await.unwrap();
        server.commit(&coordinator.public, 1).unwrap();

        // unknown user
        let request = extract_request(&server, 1, "bob", &login, &long_term, &return_keys);
        assert!(matches!(
            server.extract(&request),
            Err(PkgError::NotRegistered)
        ));

        // wrong login key
        let wrong_login = SigningKeyPair::generate();
        let request = extract_request(&server, 1, "alice", &wrong_login, &long_term, &return_keys);
        assert!(matches!(
            server.extract(&request),
            Err(PkgError::InvalidSignature)
        ));

        // unknown round
        let request = extract_request(&server, 9, "alice", &login, &long_term, &return_keys);
        assert!(matches!(
            server.extract(&request),
            Err(PkgError::RoundNotFound(9))
        ));
    }

    #[test]
    fn commit_garbage_collects_old_rounds() {
        let (server, coordinator) = server();
        server.commit(&coordinator.public, 1).unwrap();
        server.commit(&coordinator.public, 2).unwrap();
        server.commit(&coordinator.public, 3).unwrap();
        let rounds = server.rounds.lock().unwrap();
        assert!(!rounds.contains_key(&1));
        assert!(rounds.contains_key(&2));
        assert!(rounds.contains_key(&3));
    }
}
