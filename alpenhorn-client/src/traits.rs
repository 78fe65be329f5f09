//! The traits the client uses to talk to the outside world.
//!
//! Everything network-shaped is behind a trait so the round logic can be
//! driven end-to-end in tests with in-memory implementations, and so the
//! transport (authenticated TLS, websockets) stays an external concern.

use std::sync::Arc;

use async_trait::async_trait;

use alpenhorn_core::{
    announce::Announcement,
    config::{ServerEntry, SignedConfig},
    pkg::{ExtractReply, ExtractRequest},
    LoginPublicKey,
};

/// A boxed error crossing an IO trait boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The client's half of the coordinator channel for one service.
#[async_trait]
pub trait CoordinatorChannel: Send {
    /// Waits for the next announcement, in coordinator emission order.
    async fn next_announcement(&mut self) -> Result<Announcement, BoxError>;

    /// Submits the client's one onion for `round`.
    async fn send_onion(&mut self, round: u32, onion: Vec<u8>) -> Result<(), BoxError>;
}

/// Fetches single mailboxes from the CDN.
#[async_trait]
pub trait MailboxFetcher: Send + Sync {
    /// Fetches mailbox `mailbox_id` from the announced base `url`; `None` if
    /// the mailbox does not exist.
    async fn fetch(&self, url: &str, mailbox_id: u32) -> Result<Option<Vec<u8>>, BoxError>;
}

/// The signed-configuration service.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// The current configuration of a service.
    async fn current(&self, service: &str) -> Result<SignedConfig, BoxError>;

    /// The chain connecting the configuration hashed `have` to the one
    /// hashed `want`, oldest first, excluding `have` itself.
    async fn chain(&self, have: &str, want: &str) -> Result<Vec<SignedConfig>, BoxError>;
}

/// A connection to one PKG.
#[async_trait]
pub trait PkgClient: Send + Sync {
    /// Registers a username with its login key.
    async fn register(
        &self,
        username: &str,
        login_key: LoginPublicKey,
        token: &str,
    ) -> Result<(), BoxError>;

    /// Extracts the per-round identity private key.
    async fn extract(&self, request: ExtractRequest) -> Result<ExtractReply, BoxError>;
}

/// Dials PKGs listed in the configuration.
pub trait PkgConnector: Send + Sync {
    /// Returns a connection for the PKG at `entry`.
    fn connect(&self, entry: &ServerEntry) -> Arc<dyn PkgClient>;
}

/// The bundle of IO implementations a client runs on.
pub struct ClientIo {
    /// The signed-configuration service.
    pub config_source: Arc<dyn ConfigSource>,
    /// The CDN mailbox fetcher.
    pub mailboxes: Arc<dyn MailboxFetcher>,
    /// The PKG dialer.
    pub pkgs: Arc<dyn PkgConnector>,
}
