//! The coordinator's event channels.
//!
//! Phase transitions are published through a watch channel (latest value
//! wins, for observers that only care about current state). Client
//! announcements are a *sequence*, not a latest-value cell, so they go
//! through a broadcast channel: every connected client fan-out task gets
//! each announcement once, in order. A fan-out task that lags far enough to
//! miss an announcement drops the round, which is the protocol's stance on
//! missed announcements anyway.

use tokio::sync::{broadcast, watch};

use alpenhorn_core::announce::Announcement;

use crate::coordinator::phases::PhaseName;

/// Capacity of the announcement broadcast channel.
const ANNOUNCE_CAPACITY: usize = 64;

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted.
    pub round_id: u32,
    /// The event itself.
    pub event: E,
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    round_id: u32,
    phase_tx: watch::Sender<Event<PhaseName>>,
    announce_tx: broadcast::Sender<Event<Announcement>>,
}

/// The `EventSubscriber` hands out listeners for any coordinator event.
#[derive(Debug)]
pub struct EventSubscriber {
    phase_rx: watch::Receiver<Event<PhaseName>>,
    announce_tx: broadcast::Sender<Event<Announcement>>,
}

impl EventPublisher {
    /// Initializes a new event publisher, starting at the given round.
    pub fn init(round_id: u32) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(Event {
            round_id,
            event: PhaseName::Announce,
        });
        let (announce_tx, _) = broadcast::channel(ANNOUNCE_CAPACITY);

        let publisher = EventPublisher {
            round_id,
            phase_tx,
            announce_tx: announce_tx.clone(),
        };
        let subscriber = EventSubscriber {
            phase_rx,
            announce_tx,
        };
        (publisher, subscriber)
    }

    /// Sets the round ID attached to subsequent events.
    pub fn set_round_id(&mut self, round_id: u32) {
        self.round_id = round_id;
    }

    /// Emits a phase event.
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        // an error means there are no receivers, which is fine
        let _ = self.phase_tx.send(Event {
            round_id: self.round_id,
            event: phase,
        });
    }

    /// Emits an announcement to all connected clients.
    pub fn broadcast_announcement(&mut self, announcement: Announcement) {
        let _ = self.announce_tx.send(Event {
            round_id: self.round_id,
            event: announcement,
        });
    }
}

impl EventSubscriber {
    /// A listener for phase events.
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        EventListener(self.phase_rx.clone())
    }

    /// A fresh announcement stream. Each receiver sees every announcement
    /// sent after its creation.
    pub fn announcements(&self) -> broadcast::Receiver<Event<Announcement>> {
        self.announce_tx.subscribe()
    }
}

/// A listener for a watch-backed event.
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E: Clone> EventListener<E> {
    /// The most recently emitted event.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next event.
    ///
    /// # Errors
    /// Fails when the publisher has been dropped.
    pub async fn next(&mut self) -> Result<Event<E>, watch::error::RecvError> {
        self.0.changed().await?;
        Ok(self.0.borrow().clone())
    }
}
