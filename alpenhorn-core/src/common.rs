//! Common protocol types.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::crypto::{ByteObject, PublicEncryptKey, SecretSigningKey, Signature};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The two services that share the mix-network substrate.
pub enum ServiceName {
    /// The anonymous contact-discovery service.
    #[display(fmt = "addfriend")]
    AddFriend,
    /// The anonymous call-initiation service.
    #[display(fmt = "dialing")]
    Dialing,
}

impl ServiceName {
    /// The service's wire name, used in canonical signing forms and CDN
    /// bucket names.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::AddFriend => "addfriend",
            ServiceName::Dialing => "dialing",
        }
    }

    /// Whether rounds of this service run the PKG commit/reveal phases.
    pub fn has_pkg_phase(&self) -> bool {
        matches!(self, ServiceName::AddFriend)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The per-round mix settings, signed independently by every mix server.
pub struct RoundSettings {
    /// The service this round belongs to.
    pub service: ServiceName,
    /// The round number.
    pub round: u32,
    /// The number of real mailboxes; ids range over `[0, num_mailboxes]`
    /// with `0` reserved for cover.
    pub num_mailboxes: u32,
    /// The round onion public keys, in cascade order.
    pub onion_keys: Vec<PublicEncryptKey>,
}

impl RoundSettings {
    /// The canonical signing form:
    /// `"RoundSettings" || service || BE_u32(round) || BE_u32(num_mailboxes) || key_1 || … || key_M`.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut message = b"RoundSettings".to_vec();
        message.extend_from_slice(self.service.as_str().as_bytes());
        message.extend_from_slice(&self.round.to_be_bytes());
        message.extend_from_slice(&self.num_mailboxes.to_be_bytes());
        for key in &self.onion_keys {
            message.extend_from_slice(key.as_slice());
        }
        message
    }

    /// Signs the canonical form with a mix server's long-term key.
    pub fn sign(&self, key: &SecretSigningKey) -> Signature {
        key.sign_detached(&self.signing_message())
    }
}
