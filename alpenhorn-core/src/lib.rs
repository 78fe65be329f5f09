#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Alpenhorn: metadata-private contact discovery and call initiation
//!
//! Alpenhorn lets two users who know each other's usernames establish a
//! shared secret, and lets established friends signal impending calls,
//! without revealing to observers *who* is communicating. Both protocols run
//! in synchronous rounds over a shared mix-network substrate: every
//! participant transmits one fixed-size onion-wrapped message per round,
//! real or cover, so activity is invisible.
//!
//! This crate holds everything the coordinator, the mix servers, the PKG
//! servers and the clients agree on:
//!
//! - the crypto glue: NaCl box/sign wrappers, layered onion encryption,
//!   Boneh-Franklin identity-based encryption and BLS attestations over
//!   BLS12-381 ([`crypto`], [`onion`]);
//! - the fixed-layout wire formats and byte-exact canonical signing forms
//!   ([`message`], [`common`], [`pkg`]);
//! - usernames, identities and mailbox assignment ([`identity`]);
//! - the per-friend rolling secrets that give forward secrecy ([`keywheel`]);
//! - the guardian-signed configuration chain ([`config`]);
//! - the dialing mailbox Bloom filter ([`bloom`]) and the mix-server noise
//!   policy ([`noise`]).

pub mod announce;
pub mod bloom;
pub mod common;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod keywheel;
pub mod message;
pub mod noise;
pub mod onion;
pub mod pkg;

use thiserror::Error;

use self::crypto::{PublicEncryptKey, PublicSigningKey};

#[derive(Error, Debug)]
#[error("initialization failed: insufficient system entropy to generate secrets")]
/// An error related to insufficient system entropy for secrets at program startup.
pub struct InitError;

/// Initializes the crypto backend. Must be called before any other function
/// in this crate; safe to call more than once.
///
/// # Errors
/// Fails when the underlying sodium library cannot be initialized.
pub fn init() -> Result<(), InitError> {
    sodiumoxide::init().map_err(|_| InitError)
}

pub use self::common::{RoundSettings, ServiceName};

/// A signing key that identifies a coordinator.
pub type CoordinatorPublicKey = PublicSigningKey;

/// A signing key that identifies a mix server.
pub type MixPublicKey = PublicSigningKey;

/// A signing key that identifies a PKG server.
pub type PkgPublicKey = PublicSigningKey;

/// A signing key that identifies a user to the PKGs. The login key authorizes
/// key extraction; it is distinct from the long-term key friends learn.
pub type LoginPublicKey = PublicSigningKey;

/// A user's long-term signing key, attested by the PKGs and exchanged in
/// introductions.
pub type LongTermPublicKey = PublicSigningKey;

/// A per-round mix onion key.
pub type OnionPublicKey = PublicEncryptKey;
