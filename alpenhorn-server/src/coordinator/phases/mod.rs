//! The round phases.
//!
//! See the [coordinator module] documentation.
//!
//! [coordinator module]: crate::coordinator

mod announce;
mod close;
mod collect;
mod failure;
mod mix;
mod phase;
mod pkg;
mod publish;
mod shutdown;

pub use self::{
    announce::Announce,
    close::Close,
    collect::Collect,
    failure::Failure,
    mix::MixSetup,
    phase::{CoordinatorState, Phase, PhaseError, PhaseName, PhaseState, PkgPeer, Shared},
    pkg::PkgSetup,
    publish::Publish,
    shutdown::Shutdown,
};

pub(in crate::coordinator) use self::phase::{rpc_with_retry, CallError};
