#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Alpenhorn server roles
//!
//! The three server roles of the round pipeline:
//!
//! - [`coordinator`] — drives one service's rounds in strict sequence and
//!   announces phase transitions to connected clients;
//! - [`mix`] — the cascade mix server: peels, filters, injects noise,
//!   shuffles, forwards, and at the last position publishes mailboxes;
//! - [`pkg`] — the identity-based-encryption authority with its
//!   commit/reveal protocol, user registry and attestations.
//!
//! [`rpc`] defines the typed contracts between them, [`rest`] their HTTP
//! transport and the coordinator's client websocket, [`cdn`] the contract of
//! the bucket store round outputs are published to, and [`settings`] the
//! operator configuration.

pub mod cdn;
pub mod coordinator;
pub mod mix;
pub mod pkg;
pub mod rest;
pub mod rpc;
pub mod settings;
