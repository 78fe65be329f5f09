use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use derive_more::Display;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;

use alpenhorn_core::{announce::Announcement, crypto::PublicSigningKey, ServiceName};

use crate::{
    coordinator::{
        events::EventPublisher,
        requests::OnionReceiver,
        store::{CoordinatorStore, RoundHistory, StoreError},
        StateMachine,
    },
    rpc::{MixNode, MixRpc, PkgRpc, RpcError},
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Announce")]
    Announce,
    #[display(fmt = "PkgSetup")]
    PkgSetup,
    #[display(fmt = "MixSetup")]
    MixSetup,
    #[display(fmt = "Collect")]
    Collect,
    #[display(fmt = "Close")]
    Close,
    #[display(fmt = "Publish")]
    Publish,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// Errors which can occur while driving a round. Any of them aborts the
/// round; the next round starts fresh.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("PKG {key} failed: {source}")]
    Pkg {
        key: String,
        #[source]
        source: RpcError,
    },
    #[error("mix server at position {position} failed: {source}")]
    Mix {
        position: usize,
        #[source]
        source: RpcError,
    },
    #[error("phase deadline expired while {0}")]
    Timeout(&'static str),
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("the onion channel closed: all submission handles were dropped")]
    ChannelClosed,
    #[error("failed to persist the round counter: {0}")]
    Store(#[from] StoreError),
}

/// A PKG peer: its long-term key and an RPC handle to it.
pub struct PkgPeer {
    /// The PKG's signing key.
    pub key: PublicSigningKey,
    /// The RPC handle.
    pub rpc: Arc<dyn PkgRpc>,
}

/// The per-service coordinator state carried across phases.
pub struct CoordinatorState {
    /// The service whose rounds this coordinator drives.
    pub service: ServiceName,
    /// The current round number.
    pub round_id: u32,
    /// Hex hash of the coordinator's trusted signed configuration.
    pub config_hash: String,
    /// The mix cascade, in order.
    pub mix_chain: Vec<MixNode>,
    /// Address of the CDN round outputs are published to.
    pub cdn_address: String,
    /// The CDN's signing key.
    pub cdn_key: PublicSigningKey,
    /// The number of mailboxes per round.
    pub num_mailboxes: u32,
    /// Wait after announcing PKG settings, giving clients time to extract.
    pub pkg_wait: Duration,
    /// The onion collection window.
    pub mix_wait: Duration,
    /// Wait after publishing before the next round begins.
    pub round_wait: Duration,
    /// Deadline for a single server RPC.
    pub rpc_timeout: Duration,
}

/// A struct that contains the coordinator state and the I/O interfaces that
/// are shared and accessible by all `PhaseState`s.
pub struct Shared {
    pub(in crate::coordinator) state: CoordinatorState,
    pub(in crate::coordinator) events: EventPublisher,
    pub(in crate::coordinator) onion_rx: OnionReceiver,
    pub(in crate::coordinator) mixers: Vec<Arc<dyn MixRpc>>,
    pub(in crate::coordinator) pkgs: Vec<PkgPeer>,
    pub(in crate::coordinator) history: Arc<std::sync::Mutex<RoundHistory>>,
    pub(in crate::coordinator) store: Box<dyn CoordinatorStore>,
}

impl Shared {
    /// Creates a new shared state.
    pub fn new(
        state: CoordinatorState,
        events: EventPublisher,
        onion_rx: OnionReceiver,
        mixers: Vec<Arc<dyn MixRpc>>,
        pkgs: Vec<PkgPeer>,
        history: Arc<std::sync::Mutex<RoundHistory>>,
        store: Box<dyn CoordinatorStore>,
    ) -> Self {
        Self {
            state,
            events,
            onion_rx,
            mixers,
            pkgs,
            history,
            store,
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: u32) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u32 {
        self.state.round_id
    }

    /// Records an announcement in the round history and broadcasts it to
    /// every connected client.
    pub fn announce(&mut self, announcement: Announcement) {
        self.history.lock().unwrap().record(announcement.clone());
        self.events.broadcast_announcement(announcement);
    }
}

/// A trait that must be implemented by a state in order to move to a next
/// state.
#[async_trait]
pub trait Phase {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Moves from this phase to the next phase.
    async fn next(self) -> Option<StateMachine>;
}

/// The state corresponding to a phase of a round.
///
/// This contains the state-dependent `private` state and the
/// state-independent `shared` state which is shared across state
/// transitions.
pub struct PhaseState<S> {
    /// The private state.
    pub(in crate::coordinator) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::coordinator) shared: Shared,
}

impl<S> PhaseState<S>
where
    S: Send,
    Self: Phase,
{
    /// Runs the current phase to completion, then transitions to the next
    /// phase, or into the failure phase if the tasks failed.
    pub async fn run_phase(mut self) -> Option<StateMachine> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase, round = self.shared.state.round_id);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return Some(self.into_failure_state(err));
            }
            debug!("phase ran successfully");

            debug!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }

    fn into_failure_state(self, err: PhaseError) -> StateMachine {
        PhaseState::new(self.shared, super::Failure::new(err)).into()
    }
}

impl<S> PhaseState<S> {
    /// Builds the state for a phase from the shared state and the phase's
    /// private state.
    pub fn new(shared: Shared, private: S) -> Self {
        Self { private, shared }
    }
}

/// How a single RPC attempt (plus its one retry) ended.
pub(in crate::coordinator) enum CallError {
    /// The phase deadline expired.
    Timeout,
    /// The server reported an error.
    Rpc(RpcError),
}

/// Runs one server RPC under the phase deadline, retrying a single time on
/// a transport failure. Errors the server itself reported are never retried:
/// within a round they are final.
pub(in crate::coordinator) async fn rpc_with_retry<T, Fut>(
    deadline: Duration,
    what: &'static str,
    mut call: impl FnMut() -> Fut,
) -> Result<T, CallError>
where
    Fut: Future<Output = Result<T, RpcError>>,
{
    timeout(deadline, async {
        match call().await {
            Err(RpcError::Transport(reason)) => {
                warn!("transport failure while {}: {}; retrying once", what, reason);
                call().await
            }
            other => other,
        }
    })
    .await
    .map_err(|_| CallError::Timeout)?
    .map_err(CallError::Rpc)
}
