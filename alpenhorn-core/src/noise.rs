//! The noise-count policy for mix-server cover traffic.
//!
//! Each mix server draws one count per mailbox (including the cover mailbox
//! `0`) from a Laplace distribution and injects that many cover messages
//! before shuffling, drowning out how many real messages each mailbox
//! received.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// A Laplace distribution, parameterized by location `mu` and scale `b`.
pub struct NoiseDistribution {
    /// The location parameter.
    pub mu: f64,
    /// The scale parameter.
    pub b: f64,
}

impl NoiseDistribution {
    /// Draws a noise count by inverse-CDF sampling, clamped at zero.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        // u is uniform on (-1/2, 1/2]; the open lower bound keeps ln finite
        let u: f64 = 0.5 - rng.gen::<f64>();
        let x = self.mu - self.b * u.signum() * (1.0 - 2.0 * u.abs()).ln();
        if x <= 0.0 {
            0
        } else {
            x.round() as u32
        }
    }
}
