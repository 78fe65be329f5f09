use async_trait::async_trait;
use tracing::info;

use crate::coordinator::{
    phases::{rpc_with_retry, CallError, Phase, PhaseError, PhaseName, PhaseState, Publish},
    StateMachine,
};

/// Number of onions handed to the first mix server per RPC.
const SUBMIT_BATCH: usize = 512;

/// The close state: hand the collected onions to the cascade and wait for
/// the mailbox URL to come back through it.
#[derive(Debug)]
pub struct Close {
    onions: Vec<Vec<u8>>,
    url: Option<String>,
}

impl Close {
    pub fn new(onions: Vec<Vec<u8>>) -> Self {
        Self { onions, url: None }
    }
}

#[async_trait]
impl Phase for PhaseState<Close> {
    const NAME: PhaseName = PhaseName::Close;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();
        let service = self.shared.state.service;
        let deadline = self.shared.state.rpc_timeout;
        let first = self.shared.mixers[0].clone();

        for chunk in self.private.onions.chunks(SUBMIT_BATCH) {
            rpc_with_retry(deadline, "submitting onions", || {
                first.add_onions(service, round, chunk.to_vec())
            })
            .await
            .map_err(|e| match e {
                CallError::Timeout => PhaseError::Timeout("submitting onions"),
                CallError::Rpc(source) => PhaseError::Mix {
                    position: 0,
                    source,
                },
            })?;
        }
        info!("submitted {} onions to the cascade", self.private.onions.len());

        // closing traverses the whole cascade, so the deadline scales with
        // its length
        let close_deadline = deadline * self.shared.mixers.len() as u32;
        let url = rpc_with_retry(close_deadline, "closing the cascade", || {
            first.close_round(service, round)
        })
        .await
        .map_err(|e| match e {
            CallError::Timeout => PhaseError::Timeout("closing the cascade"),
            CallError::Rpc(source) => PhaseError::Mix {
                position: 0,
                source,
            },
        })?;
        info!(%url, "cascade closed");
        self.private.url = Some(url);
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        // safe unwrap: process sets the URL before a successful transition
        let url = self.private.url.clone().unwrap();
        Some(PhaseState::new(self.shared, Publish::new(url)).into())
    }
}
