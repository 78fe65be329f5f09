//! Coordinator round persistence and history.
//!
//! The round counter is the one piece of coordinator state that must
//! survive a restart: round numbers strictly increase per service, and
//! reusing one is a fatal error. The counter is persisted in the common
//! versioned format (a one-byte version prefix followed by a JSON body)
//! with atomic replacement via write-to-temp-then-rename.
//!
//! The in-memory round history keeps the recent rounds' announcements so
//! late or reconnecting clients can catch up; rounds older than the current
//! by more than one are garbage-collected.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use alpenhorn_core::{announce::Announcement, ServiceName};

/// Version byte of the persisted round counter format.
const STORE_VERSION: u8 = 1;

#[derive(Error, Debug)]
/// An error persisting coordinator state.
pub enum StoreError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported store version {0}")]
    Version(u8),
    #[error("corrupt store: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("store is for service {got}, expected {expected}")]
    WrongService { expected: ServiceName, got: ServiceName },
}

/// Durable storage for the round counter.
pub trait CoordinatorStore: Send + Sync {
    /// The last persisted round number, `0` if none was ever persisted.
    fn load_round(&self) -> Result<u32, StoreError>;

    /// Persists `round` before it is announced.
    fn save_round(&self, round: u32) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct PersistedRound {
    service: ServiceName,
    round: u32,
}

/// The file-backed store.
pub struct FileStore {
    service: ServiceName,
    path: PathBuf,
}

impl FileStore {
    /// Creates a store at `path` for one service.
    pub fn new(service: ServiceName, path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            path: path.into(),
        }
    }
}

impl CoordinatorStore for FileStore {
    fn load_round(&self) -> Result<u32, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        match bytes.split_first() {
            Some((&STORE_VERSION, body)) => {
                let persisted: PersistedRound = serde_json::from_slice(body)?;
                if persisted.service != self.service {
                    return Err(StoreError::WrongService {
                        expected: self.service,
                        got: persisted.service,
                    });
                }
                Ok(persisted.round)
            }
            Some((&version, _)) => Err(StoreError::Version(version)),
            None => Err(StoreError::Version(0)),
        }
    }

    fn save_round(&self, round: u32) -> Result<(), StoreError> {
        let persisted = PersistedRound {
            service: self.service,
            round,
        };
        let mut bytes = vec![STORE_VERSION];
        // safe unwrap: the record serializes to JSON by construction
        bytes.extend_from_slice(&serde_json::to_vec(&persisted).unwrap());

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// An in-memory store for tests.
#[derive(Default)]
pub struct MemoryStore(AtomicU32);

impl MemoryStore {
    /// Creates a store starting at round 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoordinatorStore for MemoryStore {
    fn load_round(&self) -> Result<u32, StoreError> {
        Ok(self.0.load(Ordering::SeqCst))
    }

    fn save_round(&self, round: u32) -> Result<(), StoreError> {
        self.0.store(round, Ordering::SeqCst);
        Ok(())
    }
}

/// The recent rounds' announcements, for late and reconnecting clients.
#[derive(Debug, Default)]
pub struct RoundHistory {
    records: BTreeMap<u32, Vec<Announcement>>,
}

impl RoundHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement under its round.
    pub fn record(&mut self, announcement: Announcement) {
        self.records
            .entry(announcement.round())
            .or_default()
            .push(announcement);
    }

    /// The announcements of `round` so far, in emission order.
    pub fn catch_up(&self, round: u32) -> Vec<Announcement> {
        self.records.get(&round).cloned().unwrap_or_default()
    }

    /// The newest recorded round.
    pub fn latest_round(&self) -> Option<u32> {
        self.records.keys().next_back().copied()
    }

    /// Drops rounds older than `current` by more than one.
    pub fn collect_garbage(&mut self, current: u32) {
        self.records.retain(|&round, _| round + 1 >= current);
    }
}
