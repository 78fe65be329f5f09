use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, warn};

use alpenhorn_core::announce::Announcement;

use crate::coordinator::{
    phases::{Announce, Phase, PhaseError, PhaseName, PhaseState, Shutdown},
    StateMachine,
};

/// The failure state: abandon the round and tell the clients.
///
/// No partial state from the failed round is carried forward; the next
/// round starts from scratch. The one unrecoverable failure is the onion
/// channel closing, which means every submission handle is gone: then the
/// driver shuts down.
#[derive(Debug)]
pub struct Failure {
    error: PhaseError,
}

impl Failure {
    pub fn new(error: PhaseError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl Phase for PhaseState<Failure> {
    const NAME: PhaseName = PhaseName::Failure;

    async fn process(&mut self) -> Result<(), PhaseError> {
        error!("round failed: {}", self.private.error);
        if matches!(self.private.error, PhaseError::ChannelClosed) {
            return Ok(());
        }

        let round = self.shared.round_id();
        self.shared.announce(Announcement::Error {
            round,
            description: self.private.error.to_string(),
        });
        warn!("abandoned round {}", round);

        sleep(self.shared.state.round_wait).await;
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        if matches!(self.private.error, PhaseError::ChannelClosed) {
            Some(PhaseState::new(self.shared, Shutdown).into())
        } else {
            Some(PhaseState::<Announce>::enter(self.shared).into())
        }
    }
}
