//! Background cover-noise generation.
//!
//! Started as soon as a mix server accepts its round settings and joined at
//! close. One count is drawn per mailbox, *including* the cover mailbox `0`:
//! a mailbox without noise would let the last server's output reveal how
//! much real cover traffic the clients produced. Noise payloads are fresh
//! random bytes, so the duplicate filter never collapses them, and they are
//! onion-wrapped to the downstream servers only, making them byte-compatible
//! with real traffic at every later hop.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tokio::sync::oneshot;
use tracing::debug;

use alpenhorn_core::{
    common::{RoundSettings, ServiceName},
    message::{ADD_FRIEND_MESSAGE_LENGTH, DIAL_MESSAGE_LENGTH},
    noise::NoiseDistribution,
    onion,
};

/// Builds one cover plaintext for `mailbox_id`.
fn cover_plaintext<R: Rng>(service: ServiceName, mailbox_id: u32, rng: &mut R) -> Vec<u8> {
    let size = match service {
        ServiceName::AddFriend => ADD_FRIEND_MESSAGE_LENGTH,
        ServiceName::Dialing => DIAL_MESSAGE_LENGTH,
    };
    let mut plaintext = vec![0_u8; size];
    plaintext[..4].copy_from_slice(&mailbox_id.to_be_bytes());
    rng.fill(&mut plaintext[4..]);
    plaintext
}

/// Spawns noise generation on the compute pool; the receiver yields the
/// finished batch, wrapped for the servers after `position`.
pub(super) fn spawn(
    pool: &rayon::ThreadPool,
    service: ServiceName,
    distribution: NoiseDistribution,
    settings: RoundSettings,
    position: usize,
) -> oneshot::Receiver<Vec<Vec<u8>>> {
    let (tx, rx) = oneshot::channel();
    pool.spawn(move || {
        let mut count_rng = ChaCha20Rng::from_entropy();
        let mut jobs = Vec::new();
        for mailbox_id in 0..=settings.num_mailboxes {
            for _ in 0..distribution.sample(&mut count_rng) {
                jobs.push(mailbox_id);
            }
        }

        let downstream = &settings.onion_keys[position + 1..];
        let noise: Vec<Vec<u8>> = jobs
            .into_par_iter()
            .map_init(ChaCha20Rng::from_entropy, |rng, mailbox_id| {
                let plaintext = cover_plaintext(service, mailbox_id, rng);
                onion::seal(&plaintext, downstream)
            })
            .collect();

        debug!(
            round = settings.round,
            count = noise.len(),
            "noise generation finished"
        );
        // the receiver may be gone if the round was abandoned
        let _ = tx.send(noise);
    });
    rx
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use alpenhorn_core::crypto::EncryptKeyPair;

    #[tokio::test]
    async fn noise_is_wrapped_for_downstream_servers() {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().build().unwrap());
        let servers: Vec<EncryptKeyPair> = (0..3).map(|_| EncryptKeyPair::generate()).collect();
        let settings = RoundSettings {
            service: ServiceName::Dialing,
            round: 1,
            num_mailboxes: 2,
            onion_keys: servers.iter().map(|s| s.public).collect(),
        };
        let distribution = NoiseDistribution { mu: 5.0, b: 1.0 };

        let noise = spawn(&pool, ServiceName::Dialing, distribution, settings, 0)
            .await
            .unwrap();
        assert!(!noise.is_empty());
        for wrapped in &noise {
            // two remaining layers after position 0
            assert_eq!(
                wrapped.len(),
                DIAL_MESSAGE_LENGTH + 2 * onion::ONION_OVERHEAD
            );
            let after_first = onion::peel(wrapped, &servers[1].secret).unwrap();
            let plaintext = onion::peel(&after_first, &servers[2].secret).unwrap();
            assert_eq!(plaintext.len(), DIAL_MESSAGE_LENGTH);
        }
    }

    #[tokio::test]
    async fn last_position_noise_is_plaintext() {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().build().unwrap());
        let server = EncryptKeyPair::generate();
        let settings = RoundSettings {
            service: ServiceName::AddFriend,
            round: 1,
            num_mailboxes: 1,
            onion_keys: vec![server.public],
        };
        let distribution = NoiseDistribution { mu: 3.0, b: 1.0 };

        let noise = spawn(&pool, ServiceName::AddFriend, distribution, settings, 0)
            .await
            .unwrap();
        for plaintext in &noise {
            assert_eq!(plaintext.len(), ADD_FRIEND_MESSAGE_LENGTH);
        }
    }
}
