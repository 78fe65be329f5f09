use async_trait::async_trait;
use futures::future::join_all;
use tracing::info;

use alpenhorn_core::{announce::Announcement, common::RoundSettings};

use crate::{
    coordinator::{
        phases::{rpc_with_retry, CallError, Collect, Phase, PhaseError, PhaseName, PhaseState},
        StateMachine,
    },
    rpc::NewRoundRequest,
};

/// The mix setup state: open the round on every mix server, distribute the
/// settings and collect the servers' signatures.
#[derive(Debug)]
pub struct MixSetup;

#[async_trait]
impl Phase for PhaseState<MixSetup> {
    const NAME: PhaseName = PhaseName::MixSetup;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();
        let deadline = self.shared.state.rpc_timeout;

        let request = NewRoundRequest {
            service: self.shared.state.service,
            round,
            chain: self.shared.state.mix_chain.clone(),
            cdn_address: self.shared.state.cdn_address.clone(),
            cdn_key: self.shared.state.cdn_key,
        };
        let calls = self.shared.mixers.iter().map(|mixer| {
            let request = request.clone();
            rpc_with_retry(deadline, "opening the round", move || {
                mixer.new_round(request.clone())
            })
        });
        let mut onion_keys = Vec::with_capacity(self.shared.mixers.len());
        for (position, result) in join_all(calls).await.into_iter().enumerate() {
            let key = result.map_err(|e| match e {
                CallError::Timeout => PhaseError::Timeout("opening the round"),
                CallError::Rpc(source) => PhaseError::Mix { position, source },
            })?;
            onion_keys.push(key);
        }
        info!("collected {} onion keys", onion_keys.len());

        let settings = RoundSettings {
            service: self.shared.state.service,
            round,
            num_mailboxes: self.shared.state.num_mailboxes,
            onion_keys,
        };
        let calls = self.shared.mixers.iter().map(|mixer| {
            let settings = settings.clone();
            rpc_with_retry(deadline, "distributing the settings", move || {
                mixer.set_round_settings(settings.clone())
            })
        });
        let mut signatures = Vec::with_capacity(self.shared.mixers.len());
        for (position, result) in join_all(calls).await.into_iter().enumerate() {
            let signature = result.map_err(|e| match e {
                CallError::Timeout => PhaseError::Timeout("distributing the settings"),
                CallError::Rpc(source) => PhaseError::Mix { position, source },
            })?;
            if !self.shared.state.mix_chain[position]
                .key
                .verify_detached(&signature, &settings.signing_message())
            {
                return Err(PhaseError::Verification(format!(
                    "mix server at position {} signed the settings incorrectly",
                    position
                )));
            }
            signatures.push(signature);
        }
        info!("verified {} settings signatures", signatures.len());

        self.shared.announce(Announcement::Mix {
            settings,
            signatures,
        });
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        Some(PhaseState::new(self.shared, Collect::new()).into())
    }
}
