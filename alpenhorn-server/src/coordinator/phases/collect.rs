use async_trait::async_trait;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use alpenhorn_core::{
    message::{ADD_FRIEND_MESSAGE_LENGTH, DIAL_MESSAGE_LENGTH},
    onion::ONION_OVERHEAD,
    ServiceName,
};

use crate::coordinator::{
    phases::{Close, Phase, PhaseError, PhaseName, PhaseState},
    StateMachine,
};

/// The collect state: buffer client onions until the collection window ends.
#[derive(Debug)]
pub struct Collect {
    onions: Vec<Vec<u8>>,
    dropped: u64,
}

impl Collect {
    pub fn new() -> Self {
        Self {
            onions: Vec::new(),
            dropped: 0,
        }
    }
}

#[async_trait]
impl Phase for PhaseState<Collect> {
    const NAME: PhaseName = PhaseName::Collect;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();
        let message_size = match self.shared.state.service {
            ServiceName::AddFriend => ADD_FRIEND_MESSAGE_LENGTH,
            ServiceName::Dialing => DIAL_MESSAGE_LENGTH,
        };
        let expected_len =
            self.shared.state.mix_chain.len() * ONION_OVERHEAD + message_size;
        let deadline = Instant::now() + self.shared.state.mix_wait;

        loop {
            let submission = match timeout_at(deadline, self.shared.onion_rx.recv()).await {
                Err(_) => break,
                Ok(None) => return Err(PhaseError::ChannelClosed),
                Ok(Some(submission)) => submission,
            };
            if submission.round != round || submission.onion.len() != expected_len {
                debug!(
                    submitted_for = submission.round,
                    len = submission.onion.len(),
                    "dropping out-of-round or malformed submission"
                );
                self.private.dropped += 1;
                continue;
            }
            self.private.onions.push(submission.onion);
        }

        info!(
            collected = self.private.onions.len(),
            dropped = self.private.dropped,
            "collection window closed"
        );
        Ok(())
    }

    async fn next(mut self) -> Option<StateMachine> {
        let onions = std::mem::take(&mut self.private.onions);
        Some(PhaseState::new(self.shared, Close::new(onions)).into())
    }
}
