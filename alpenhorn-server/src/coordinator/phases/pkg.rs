use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::sleep;
use tracing::info;

use alpenhorn_core::{
    announce::Announcement,
    crypto::Sha256,
    pkg::{verify_pkg_settings, PkgSettings},
};

use crate::coordinator::{
    phases::{rpc_with_retry, CallError, MixSetup, Phase, PhaseError, PhaseName, PhaseState},
    StateMachine,
};

/// The PKG setup state: commit, then reveal, then announce.
#[derive(Debug)]
pub struct PkgSetup;

#[async_trait]
impl Phase for PhaseState<PkgSetup> {
    const NAME: PhaseName = PhaseName::PkgSetup;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round_id();

        let commitments = self.commit_all(round).await?;
        info!("collected {} commitments", commitments.len());

        let pkg_settings = self.reveal_all(round, &commitments).await?;

        let expected: Vec<_> = self.shared.pkgs.iter().map(|p| p.key).collect();
        verify_pkg_settings(round, &pkg_settings, &expected)
            .map_err(|e| PhaseError::Verification(e.to_string()))?;
        info!("verified {} reveals", pkg_settings.len());

        self.shared
            .announce(Announcement::Pkg { round, pkg_settings });

        // clients extract their identity keys during this window
        sleep(self.shared.state.pkg_wait).await;
        Ok(())
    }

    async fn next(self) -> Option<StateMachine> {
        Some(PhaseState::new(self.shared, MixSetup).into())
    }
}

impl PhaseState<PkgSetup> {
    /// Runs `commit` on every PKG in parallel.
    async fn commit_all(&self, round: u32) -> Result<BTreeMap<String, Sha256>, PhaseError> {
        let deadline = self.shared.state.rpc_timeout;
        let calls = self.shared.pkgs.iter().map(|peer| {
            rpc_with_retry(deadline, "committing", move || peer.rpc.commit(round))
        });
        let results = join_all(calls).await;

        let mut commitments = BTreeMap::new();
        for (peer, result) in self.shared.pkgs.iter().zip(results) {
            let commitment = result.map_err(|e| match e {
                CallError::Timeout => PhaseError::Timeout("committing"),
                CallError::Rpc(source) => PhaseError::Pkg {
                    key: peer.key.to_hex(),
                    source,
                },
            })?;
            commitments.insert(peer.key.to_hex(), commitment);
        }
        Ok(commitments)
    }

    /// Runs `reveal` on every PKG in parallel.
    async fn reveal_all(
        &self,
        round: u32,
        commitments: &BTreeMap<String, Sha256>,
    ) -> Result<PkgSettings, PhaseError> {
        let deadline = self.shared.state.rpc_timeout;
        let calls = self.shared.pkgs.iter().map(|peer| {
            let commitments = commitments.clone();
            rpc_with_retry(deadline, "revealing", move || {
                peer.rpc.reveal(round, commitments.clone())
            })
        });
        let results = join_all(calls).await;

        let mut settings = PkgSettings::new();
        for (peer, result) in self.shared.pkgs.iter().zip(results) {
            let info = result.map_err(|e| match e {
                CallError::Timeout => PhaseError::Timeout("revealing"),
                CallError::Rpc(source) => PhaseError::Pkg {
                    key: peer.key.to_hex(),
                    source,
                },
            })?;
            settings.insert(peer.key.to_hex(), info);
        }
        Ok(settings)
    }
}
