//! The onion submission channel.
//!
//! The channel connecting the client-facing fan-out tasks to the round
//! driver. Clients submit exactly one onion per round; the collect phase
//! drains the receiver until the phase deadline.

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One client-submitted onion.
pub struct SubmittedOnion {
    /// The round the onion was built for.
    pub round: u32,
    /// The layered onion.
    pub onion: Vec<u8>,
}

#[derive(Error, Debug)]
#[error("the round driver has shut down")]
/// An error submitting an onion after the driver stopped.
pub struct SubmitError;

/// Creates a new onion channel.
pub fn onion_channel() -> (OnionSender, OnionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OnionSender(tx), OnionReceiver(rx))
}

#[derive(Debug, Clone)]
/// The sender half, held by every client connection.
pub struct OnionSender(mpsc::UnboundedSender<SubmittedOnion>);

impl OnionSender {
    /// Submits an onion for `round`.
    ///
    /// # Errors
    /// Fails when the driver has shut down.
    pub fn submit(&self, round: u32, onion: Vec<u8>) -> Result<(), SubmitError> {
        self.0
            .send(SubmittedOnion { round, onion })
            .map_err(|_| SubmitError)
    }
}

#[derive(Debug)]
/// The receiver half, owned by the round driver.
pub struct OnionReceiver(mpsc::UnboundedReceiver<SubmittedOnion>);

impl OnionReceiver {
    /// Receives the next submission; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<SubmittedOnion> {
        self.0.recv().await
    }

    /// Closes the channel and discards pending submissions.
    pub fn close(&mut self) {
        self.0.close();
        while self.0.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submissions_flow_through() {
        let (tx, mut rx) = onion_channel();
        tx.submit(1, vec![0xab]).unwrap();
        assert_eq!(
            rx.recv().await,
            Some(SubmittedOnion {
                round: 1,
                onion: vec![0xab]
            })
        );
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let (tx, mut rx) = onion_channel();
        rx.close();
        assert!(tx.submit(1, vec![]).is_err());
    }
}
