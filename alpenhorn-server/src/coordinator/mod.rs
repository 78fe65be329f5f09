//! The round coordinator.
//!
//! # Overview
//!
//! One coordinator per service drives rounds in strict sequence through a
//! state machine:
//!
//! ```text
//! Announce ──▶ PkgSetup ──▶ MixSetup ──▶ Collect ──▶ Close ──▶ Publish ─┐
//!    ▲            (contact discovery only)                              │
//!    └──────────────────────────────────────────────────────────────────┘
//!
//! every phase ──▶ Failure ──▶ Announce (fresh round) or Shutdown
//! ```
//!
//! Per round the coordinator announces the round number and its trusted
//! configuration hash, runs the PKG commit/reveal exchange (contact
//! discovery only), opens the round on every mix server and distributes the
//! signed settings, collects client onions for the submission window, drives
//! the cascade to close, and announces the mailbox URL. Any server failure
//! abandons the round with an error announcement; nothing from a failed
//! round is retried in place.
//!
//! Round numbers strictly increase and are persisted before use, so a
//! restart can never reuse one.
//!
//! # Requests
//!
//! Client onions reach the driver through the channel created by
//! [`requests::onion_channel`]; the sender half is held by every client
//! connection. When all senders are gone the driver shuts down cleanly.
//!
//! # Events
//!
//! Announcements fan out to connected clients through the
//! [`events::EventSubscriber`], and the recent rounds' announcements are
//! kept in a [`store::RoundHistory`] so reconnecting clients can catch up.

pub mod events;
pub mod phases;
pub mod requests;
pub mod store;

use std::sync::Arc;

use derive_more::From;

use alpenhorn_core::{
    config::{ConfigError, InnerConfig, SignedConfig},
    ServiceName,
};

use crate::{
    coordinator::{
        events::{EventPublisher, EventSubscriber},
        phases::{
            Announce,
            Close,
            Collect,
            CoordinatorState,
            Failure,
            MixSetup,
            PhaseState,
            PkgPeer,
            PkgSetup,
            Publish,
            Shared,
            Shutdown,
        },
        requests::{onion_channel, OnionSender},
        store::{CoordinatorStore, RoundHistory, StoreError},
    },
    rpc::{MixNode, MixRpc},
    settings::CoordinatorWaits,
};

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine {
    /// The [`Announce`] phase.
    Announce(PhaseState<Announce>),
    /// The [`PkgSetup`] phase.
    PkgSetup(PhaseState<PkgSetup>),
    /// The [`MixSetup`] phase.
    MixSetup(PhaseState<MixSetup>),
    /// The [`Collect`] phase.
    Collect(PhaseState<Collect>),
    /// The [`Close`] phase.
    Close(PhaseState<Close>),
    /// The [`Publish`] phase.
    Publish(PhaseState<Publish>),
    /// The [`Failure`] phase.
    Failure(PhaseState<Failure>),
    /// The [`Shutdown`] phase.
    Shutdown(PhaseState<Shutdown>),
}

impl StateMachine {
    /// Moves the state machine to the next state and consumes the current one.
    ///
    /// Returns the next state or `None` if the state machine reached
    /// [`Shutdown`].
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Announce(state) => state.run_phase().await,
            StateMachine::PkgSetup(state) => state.run_phase().await,
            StateMachine::MixSetup(state) => state.run_phase().await,
            StateMachine::Collect(state) => state.run_phase().await,
            StateMachine::Close(state) => state.run_phase().await,
            StateMachine::Publish(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until it shuts down.
    ///
    /// The state machine shuts down once all [`OnionSender`] handles have
    /// been dropped.
    pub async fn run(mut self) -> Option<()> {
        loop {
            self = self.next().await?;
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// An error initializing the round driver.
pub enum InitError {
    #[error("failed to load the round counter: {0}")]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("the configuration names no mix servers")]
    EmptyCascade,
    #[error("{0} RPC handles for {1} configured servers")]
    HandleMismatch(usize, usize),
}

/// Assembles a round driver from its parts.
pub struct StateMachineInitializer {
    service: ServiceName,
    config: SignedConfig,
    inner: InnerConfig,
    waits: CoordinatorWaits,
    num_mailboxes: u32,
    mixers: Vec<Arc<dyn MixRpc>>,
    pkgs: Vec<PkgPeer>,
    store: Box<dyn CoordinatorStore>,
}

impl StateMachineInitializer {
    /// Collects the parts. `mixers` must parallel the configuration's mix
    /// cascade and `pkgs` its PKG set.
    pub fn new(
        service: ServiceName,
        config: SignedConfig,
        inner: InnerConfig,
        waits: CoordinatorWaits,
        num_mailboxes: u32,
        mixers: Vec<Arc<dyn MixRpc>>,
        pkgs: Vec<PkgPeer>,
        store: Box<dyn CoordinatorStore>,
    ) -> Self {
        Self {
            service,
            config,
            inner,
            waits,
            num_mailboxes,
            mixers,
            pkgs,
            store,
        }
    }

    /// Builds the initial state machine together with the onion submission
    /// handle, the event subscriber, and the shared round history.
    pub fn init(
        self,
    ) -> Result<
        (
            StateMachine,
            OnionSender,
            EventSubscriber,
            Arc<std::sync::Mutex<RoundHistory>>,
        ),
        InitError,
    > {
        let mix_chain: Vec<MixNode> = self
            .inner
            .mix_servers()
            .iter()
            .map(|entry| MixNode {
                key: entry.key,
                address: entry.address.clone(),
            })
            .collect();
        if mix_chain.is_empty() {
            return Err(InitError::EmptyCascade);
        }
        if self.mixers.len() != mix_chain.len() {
            return Err(InitError::HandleMismatch(self.mixers.len(), mix_chain.len()));
        }

        let round_id = self.store.load_round()?;
        let cdn = self.inner.cdn().clone();
        let state = CoordinatorState {
            service: self.service,
            round_id,
            config_hash: self.config.hash().to_hex(),
            mix_chain,
            cdn_address: cdn.address,
            cdn_key: cdn.key,
            num_mailboxes: self.num_mailboxes,
            pkg_wait: self.waits.pkg_wait,
            mix_wait: self.waits.mix_wait,
            round_wait: self.waits.round_wait,
            rpc_timeout: self.waits.rpc_timeout,
        };

        let (publisher, subscriber) = EventPublisher::init(round_id);
        let (onion_tx, onion_rx) = onion_channel();
        let history = Arc::new(std::sync::Mutex::new(RoundHistory::new()));

        let shared = Shared::new(
            state,
            publisher,
            onion_rx,
            self.mixers,
            self.pkgs,
            history.clone(),
            self.store,
        );
        let state_machine = PhaseState::<Announce>::enter(shared).into();
        Ok((state_machine, onion_tx, subscriber, history))
    }
}
