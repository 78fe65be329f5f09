//! The typed frames of the coordinator-to-client channel.
//!
//! The channel is a tag-multiplexed message stream: each frame carries a
//! `tag` naming one of a closed set of bodies. Clients send only `onion`
//! frames; everything else flows server-to-client, in announcement order
//! within a round (`newround`, then `pkg`, then `mix`, then `mailbox`).
//! Unknown tags fail deserialization and the frame is rejected.

use serde::{Deserialize, Serialize};

use crate::{
    common::RoundSettings,
    pkg::PkgSettings,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
/// A server-to-client announcement.
pub enum Announcement {
    /// A new round has begun under the named configuration.
    #[serde(rename = "newround")]
    NewRound {
        /// The round number.
        round: u32,
        /// Hex hash of the coordinator's trusted configuration.
        config_hash: String,
    },
    /// The PKGs committed and revealed their per-round keys.
    #[serde(rename = "pkg")]
    Pkg {
        /// The round number.
        round: u32,
        /// Per-PKG revealed keys and commitment-list signatures.
        pkg_settings: PkgSettings,
    },
    /// The mix cascade accepted the round settings; submissions may begin.
    #[serde(rename = "mix")]
    Mix {
        /// The settings every mix server signed.
        settings: RoundSettings,
        /// One signature per mix server, in cascade order.
        signatures: Vec<crate::crypto::Signature>,
    },
    /// The round's mailboxes are published.
    #[serde(rename = "mailbox")]
    Mailbox {
        /// The round number.
        round: u32,
        /// Base URL of the round's mailboxes on the CDN.
        url: String,
        /// The mailbox count the round ran with.
        num_mailboxes: u32,
    },
    /// The round failed and will not publish.
    #[serde(rename = "error")]
    Error {
        /// The round number.
        round: u32,
        /// Human-readable failure description.
        description: String,
    },
}

impl Announcement {
    /// The round this announcement belongs to.
    pub fn round(&self) -> u32 {
        match self {
            Announcement::NewRound { round, .. }
            | Announcement::Pkg { round, .. }
            | Announcement::Mailbox { round, .. }
            | Announcement::Error { round, .. } => *round,
            Announcement::Mix { settings, .. } => settings.round,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
/// A client-to-server frame.
pub enum ClientFrame {
    /// The client's one onion for the round.
    #[serde(rename = "onion")]
    Onion {
        /// The round the onion was built for.
        round: u32,
        /// The layered onion, sized for the full cascade.
        onion: Vec<u8>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged() {
        let frame = Announcement::NewRound {
            round: 3,
            config_hash: "aabb".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["tag"], "newround");
        assert_eq!(json["round"], 3);
        let back: Announcement = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let json = serde_json::json!({ "tag": "gossip", "round": 1 });
        assert!(serde_json::from_value::<Announcement>(json).is_err());
        let json = serde_json::json!({ "tag": "mailbox", "round": 1 });
        // a known tag with a missing body field is also rejected
        assert!(serde_json::from_value::<Announcement>(json).is_err());
    }
}
