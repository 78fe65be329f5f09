use async_trait::async_trait;
use tokio::time::sleep;
use tracing::info;

use alpenhorn_core::announce::Announcement;

use crate::coordinator::{
    phases::{Announce, Phase, PhaseError, PhaseName, PhaseState},
    StateMachine,
};

/// The publish state: announce the mailbox URL and let the round rest.
#[derive(Debug)]
pub struct Publish {
    url: String,
}

impl Publish {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Phase for PhaseState<Publish> {
    const NAME: PhaseName = PhaseName::Publish;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();
        self.shared.announce(Announcement::Mailbox {
            round,
            url: self.private.url.clone(),
            num_mailboxes: self.shared.state.num_mailboxes,
        });
        info!(url = %self.private.url, "published round {}", round);

        self.shared
            .history
            .lock()
            .unwrap()
            .collect_garbage(round);

        sleep(self.shared.state.round_wait).await;
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        Some(PhaseState::<Announce>::enter(self.shared).into())
    }
}
