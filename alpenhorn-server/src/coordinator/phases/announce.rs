use async_trait::async_trait;
use tracing::{debug, info};

use alpenhorn_core::announce::Announcement;

use crate::coordinator::{
    phases::{MixSetup, Phase, PhaseError, PhaseName, PhaseState, PkgSetup, Shared},
    StateMachine,
};

/// The announce state: opens the next round.
#[derive(Debug)]
pub struct Announce;

#[async_trait]
impl Phase for PhaseState<Announce> {
    const NAME: PhaseName = PhaseName::Announce;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let next_round = self.shared.round_id() + 1;
        // the counter is persisted before the round number becomes visible
        // anywhere, so a restarted coordinator can never reuse it
        self.shared.store.save_round(next_round)?;
        self.shared.set_round_id(next_round);
        debug!("new round ID = {}", next_round);

        self.shared.announce(Announcement::NewRound {
            round: next_round,
            config_hash: self.shared.state.config_hash.clone(),
        });
        info!("announced round {}", next_round);
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        if self.shared.state.service.has_pkg_phase() {
            Some(PhaseState::new(self.shared, PkgSetup).into())
        } else {
            Some(PhaseState::new(self.shared, MixSetup).into())
        }
    }
}

impl PhaseState<Announce> {
    /// Creates the announce state; the entry point of every round.
    pub fn enter(shared: Shared) -> Self {
        PhaseState::new(shared, Announce)
    }
}
