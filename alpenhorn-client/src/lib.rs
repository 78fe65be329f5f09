#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Alpenhorn client round logic
//!
//! The client half of the round pipeline: it translates coordinator
//! announcements into local actions, produces exactly one onion per round
//! per service (real or cover), and scans the published mailboxes.
//!
//! The flow per contact-discovery round:
//!
//! 1. `newround` — check the configuration hash, fetch and verify the chain
//!    on mismatch, create per-round state;
//! 2. `pkg` — verify the commit/reveal binding, extract the per-round
//!    identity key from every PKG and verify every attestation;
//! 3. `mix` — verify the cascade's settings signatures, build the onion
//!    (a real introduction or cover zeros, selected in constant time) and
//!    submit it;
//! 4. `mailbox` — fetch the mailbox, try every slot against the aggregate
//!    identity key in parallel, verify sender signatures and attestation
//!    closure, and match introductions against pending requests.
//!
//! Dialing rounds are the same shape without the PKG step; tokens come from
//! the per-friend [keywheel], and the mailbox is a Bloom filter. After every
//! scan the keywheel advances and erased secrets are gone for good.
//!
//! All IO runs behind the traits in [`traits`], so the whole pipeline can be
//! exercised in-process.
//!
//! [keywheel]: alpenhorn_core::keywheel

mod addfriend;
mod client;
mod dialing;
mod events;
mod persist;
mod traits;

#[cfg(feature = "reqwest-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest-client")))]
pub mod reqwest_io;

pub use self::{
    client::{
        Client,
        ClientError,
        ClientSettings,
        IncomingRequest,
        OutgoingRequest,
        QueuedCall,
    },
    events::{ClientEvent, EventSink},
    persist::PersistError,
    traits::{
        BoxError,
        ClientIo,
        ConfigSource,
        CoordinatorChannel,
        MailboxFetcher,
        PkgClient,
        PkgConnector,
    },
};
