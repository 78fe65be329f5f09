use async_trait::async_trait;
use tracing::info;

use crate::coordinator::{
    phases::{Phase, PhaseError, PhaseName, PhaseState},
    StateMachine,
};

/// The terminal state.
#[derive(Debug)]
pub struct Shutdown;

#[async_trait]
impl Phase for PhaseState<Shutdown> {
    const NAME: PhaseName = PhaseName::Shutdown;

    async fn process(&mut self) -> Result<(), PhaseError> {
        // drain pending submissions so late senders see the channel close
        self.shared.onion_rx.close();
        info!("round driver stopped");
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        None
    }
}
