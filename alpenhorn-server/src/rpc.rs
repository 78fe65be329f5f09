//! The coordinator-to-server RPC contracts.
//!
//! All peer-to-peer traffic runs over mutually-authenticated TLS whose
//! self-signed certificates embed the peer's long-term Ed25519 key; that
//! layer is an external collaborator. What the core consumes is the result:
//! every server handler receives the caller's verified signing key and
//! compares it against the one key allowed to make that call.
//!
//! The traits here are the client half of each contract. [`local`] provides
//! in-process implementations used in tests and single-process deployments;
//! [`crate::rest`] provides the HTTP implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use alpenhorn_core::{
    common::{RoundSettings, ServiceName},
    crypto::{PublicSigningKey, Sha256, Signature},
    pkg::{ExtractReply, ExtractRequest, PkgRoundInfo},
    LoginPublicKey,
    OnionPublicKey,
};

use crate::{mix::MixError, pkg::PkgError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One mix server of a cascade: its long-term key and address.
pub struct MixNode {
    /// The server's long-term signing key.
    pub key: PublicSigningKey,
    /// The address the server listens on.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The coordinator's round-opening request to a mix server.
pub struct NewRoundRequest {
    /// The service the round belongs to.
    pub service: ServiceName,
    /// The round number.
    pub round: u32,
    /// The full cascade, in order; the receiver locates itself by key.
    pub chain: Vec<MixNode>,
    /// Address of the CDN the last server uploads to.
    pub cdn_address: String,
    /// The CDN's signing key.
    pub cdn_key: PublicSigningKey,
}

#[derive(Error, Debug)]
/// An error crossing an RPC boundary.
pub enum RpcError {
    /// The call never completed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A mix server rejected the call.
    #[error(transparent)]
    Mix(#[from] MixError),
    /// A PKG rejected the call.
    #[error(transparent)]
    Pkg(#[from] PkgError),
}

/// The coordinator-to-mix contract.
#[async_trait]
pub trait MixRpc: Send + Sync {
    /// Opens a round; returns the server's fresh round onion key.
    async fn new_round(&self, request: NewRoundRequest) -> Result<OnionPublicKey, RpcError>;

    /// Delivers the round settings; returns the server's signature over the
    /// canonical settings form.
    async fn set_round_settings(&self, settings: RoundSettings) -> Result<Signature, RpcError>;

    /// Streams a batch of onions into the round.
    async fn add_onions(
        &self,
        service: ServiceName,
        round: u32,
        onions: Vec<Vec<u8>>,
    ) -> Result<(), RpcError>;

    /// Closes the round; returns the mailbox base URL once the cascade has
    /// fully drained.
    async fn close_round(&self, service: ServiceName, round: u32) -> Result<String, RpcError>;
}

/// The coordinator-to-PKG contract.
#[async_trait]
pub trait PkgRpc: Send + Sync {
    /// Requests the commitment to the PKG's per-round keys.
    async fn commit(&self, round: u32) -> Result<Sha256, RpcError>;

    /// Delivers all PKGs' commitments; returns the revealed keys and the
    /// commitment-list signature.
    async fn reveal(
        &self,
        round: u32,
        commitments: BTreeMap<String, Sha256>,
    ) -> Result<PkgRoundInfo, RpcError>;
}

/// The client-to-PKG contract.
#[async_trait]
pub trait PkgUserRpc: Send + Sync {
    /// Registers a username with its login key.
    async fn register(
        &self,
        username: &str,
        login_key: LoginPublicKey,
        token: &str,
    ) -> Result<(), RpcError>;

    /// Extracts the per-round identity private key.
    async fn extract(&self, request: ExtractRequest) -> Result<ExtractReply, RpcError>;
}

/// Dials the next hop of a cascade.
#[async_trait]
pub trait MixDialer: Send + Sync {
    /// Returns an RPC handle for `node`, authenticated as the dialling server.
    async fn dial(&self, node: &MixNode) -> Result<std::sync::Arc<dyn MixRpc>, RpcError>;
}

pub mod local {
    //! In-process RPC implementations.
    //!
    //! These bind a server instance to a fixed caller key, standing in for
    //! the authenticated transport. Tests and single-process deployments
    //! wire components together with them.

    use std::{collections::HashMap, sync::Arc};

    use super::*;
    use crate::{mix::MixServer, pkg::PkgServer};

    /// A [`MixRpc`] handle calling straight into a [`MixServer`].
    pub struct LocalMixRpc {
        server: Arc<MixServer>,
        caller: PublicSigningKey,
    }

    impl LocalMixRpc {
        /// Binds `server` to calls authenticated as `caller`.
        pub fn new(server: Arc<MixServer>, caller: PublicSigningKey) -> Self {
            Self { server, caller }
        }
    }

    #[async_trait]
    impl MixRpc for LocalMixRpc {
        async fn new_round(&self, request: NewRoundRequest) -> Result<OnionPublicKey, RpcError> {
            self.server
                .new_round(&self.caller, request)
                .await
                .map_err(RpcError::from)
        }

        async fn set_round_settings(&self, settings: RoundSettings) -> Result<Signature, RpcError> {
            self.server
                .set_round_settings(&self.caller, settings)
                .await
                .map_err(RpcError::from)
        }

        async fn add_onions(
            &self,
            service: ServiceName,
            round: u32,
            onions: Vec<Vec<u8>>,
        ) -> Result<(), RpcError> {
            self.server
                .add_onions(&self.caller, service, round, onions)
                .await
                .map_err(RpcError::from)
        }

        async fn close_round(&self, service: ServiceName, round: u32) -> Result<String, RpcError> {
            self.server
                .close_round(&self.caller, service, round)
                .await
                .map_err(RpcError::from)
        }
    }

    /// A registry of in-process mix servers, keyed by address.
    ///
    /// Servers are registered after construction, which breaks the cycle
    /// between building a server (which needs a dialer) and building the
    /// dialer (which needs the servers).
    #[derive(Default)]
    pub struct MixRegistry(std::sync::Mutex<HashMap<String, Arc<MixServer>>>);

    impl MixRegistry {
        /// Creates an empty registry.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Registers a server under its address.
        pub fn insert(&self, address: impl Into<String>, server: Arc<MixServer>) {
            self.0.lock().unwrap().insert(address.into(), server);
        }

        fn get(&self, address: &str) -> Option<Arc<MixServer>> {
            self.0.lock().unwrap().get(address).cloned()
        }
    }

    /// A [`MixDialer`] over a registry of in-process servers.
    pub struct LocalMixDialer {
        registry: Arc<MixRegistry>,
        caller: PublicSigningKey,
    }

    impl LocalMixDialer {
        /// Builds a dialer over `registry`, authenticated as `caller`.
        pub fn new(registry: Arc<MixRegistry>, caller: PublicSigningKey) -> Self {
            Self { registry, caller }
        }
    }

    #[async_trait]
    impl MixDialer for LocalMixDialer {
        async fn dial(&self, node: &MixNode) -> Result<Arc<dyn MixRpc>, RpcError> {
            let server = self
                .registry
                .get(&node.address)
                .ok_or_else(|| RpcError::Transport(format!("unknown address {}", node.address)))?;
            Ok(Arc::new(LocalMixRpc::new(server, self.caller)))
        }
    }

    /// A [`PkgRpc`] and [`PkgUserRpc`] handle calling straight into a
    /// [`PkgServer`].
    pub struct LocalPkgRpc {
        server: Arc<PkgServer>,
        caller: PublicSigningKey,
    }

    impl LocalPkgRpc {
        /// Binds `server` to calls authenticated as `caller`.
        pub fn new(server: Arc<PkgServer>, caller: PublicSigningKey) -> Self {
            Self { server, caller }
        }
    }

    #[async_trait]
    impl PkgRpc for LocalPkgRpc {
        async fn commit(&self, round: u32) -> Result<Sha256, RpcError> {
            self.server
                .commit(&self.caller, round)
                .map_err(RpcError::from)
        }

        async fn reveal(
            &self,
            round: u32,
            commitments: BTreeMap<String, Sha256>,
        ) -> Result<PkgRoundInfo, RpcError> {
            self.server
                .reveal(&self.caller, round, &commitments)
                .map_err(RpcError::from)
        }
    }

    #[async_trait]
    impl PkgUserRpc for LocalPkgRpc {
        async fn register(
            &self,
            username: &str,
            login_key: LoginPublicKey,
            token: &str,
        ) -> Result<(), RpcError> {
            self.server
                .register(username, login_key, token)
                .await
                .map_err(RpcError::from)
        }

        async fn extract(&self, request: ExtractRequest) -> Result<ExtractReply, RpcError> {
            self.server.extract(&request).map_err(RpcError::from)
        }
    }
}
