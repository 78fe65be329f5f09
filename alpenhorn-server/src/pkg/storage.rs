//! The PKG's embedded user registry.
//!
//! Backed by sled with prefixed keys: `user:<identity>:registration` holds
//! the registration record and `user:<identity>:log` the append-only event
//! log. Updates spanning both keys run in one transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};

use alpenhorn_core::{crypto::ByteObject, identity::Identity, LoginPublicKey};

use super::PkgError;

/// A user's registration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    /// The login key that authorizes extractions.
    pub login_key: LoginPublicKey,
    /// Unix time of the most recent extraction. Written on every extraction
    /// and kept for schema compatibility; nothing reads it back.
    pub last_extraction: Option<i64>,
}

/// One event of a user's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserEvent {
    /// The user registered.
    Registered {
        /// Unix time of the registration.
        at: i64,
    },
    /// A per-round identity key was extracted.
    KeyExtracted {
        /// Unix time of the extraction.
        at: i64,
        /// The round the key was extracted for.
        round: u32,
    },
}

fn registration_key(identity: &Identity) -> Vec<u8> {
    [b"user:".as_ref(), identity.as_slice(), b":registration"].concat()
}

fn log_key(identity: &Identity) -> Vec<u8> {
    [b"user:".as_ref(), identity.as_slice(), b":log"].concat()
}

/// The sled-backed registry.
pub struct UserStore {
    tree: sled::Tree,
}

impl UserStore {
    /// Opens the registry inside `db`.
    pub fn new(db: &sled::Db) -> Result<Self, PkgError> {
        let tree = db
            .open_tree("users")
            .map_err(|e| PkgError::Database(e.to_string()))?;
        Ok(Self { tree })
    }

    /// An in-memory registry for tests.
    pub fn ephemeral() -> Self {
        // safe unwraps: a temporary in-memory database always opens
        let db = sled::Config::new().temporary(true).open().unwrap();
        Self::new(&db).unwrap()
    }

    /// Looks up a registration.
    pub fn get(&self, identity: &Identity) -> Result<Option<UserState>, PkgError> {
        let value = self
            .tree
            .get(registration_key(identity))
            .map_err(|e| PkgError::Database(e.to_string()))?;
        match value {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| PkgError::Database(e.to_string())),
        }
    }

    /// Registers a user atomically: fails without side effects if the
    /// identity is already registered.
    pub fn register(&self, identity: &Identity, login_key: LoginPublicKey) -> Result<(), PkgError> {
        let state = UserState {
            login_key,
            last_extraction: None,
        };
        let log = vec![UserEvent::Registered {
            at: Utc::now().timestamp(),
        }];
        // safe unwraps: the records serialize by construction
        let state_bytes = bincode::serialize(&state).unwrap();
        let log_bytes = bincode::serialize(&log).unwrap();

        let reg_key = registration_key(identity);
        let log_key = log_key(identity);
        let result = self.tree.transaction(move |tx| {
            if tx.get(&reg_key)?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    PkgError::AlreadyRegistered,
                ));
            }
            tx.insert(reg_key.as_slice(), state_bytes.clone())?;
            tx.insert(log_key.as_slice(), log_bytes.clone())?;
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(PkgError::Database(e.to_string())),
        }
    }

    /// Records an extraction: bumps the last-extraction timestamp and
    /// appends to the event log, in one transaction.
    pub fn record_extraction(&self, identity: &Identity, round: u32) -> Result<(), PkgError> {
        let at = Utc::now().timestamp();
        let reg_key = registration_key(identity);
        let log_key = log_key(identity);
        let result = self.tree.transaction(move |tx| {
            let state_bytes = tx
                .get(&reg_key)?
                .ok_or(ConflictableTransactionError::Abort(PkgError::NotRegistered))?;
            let mut state: UserState = bincode::deserialize(&state_bytes).map_err(|_| {
                ConflictableTransactionError::Abort(PkgError::Database(
                    "corrupt registration record".to_string(),
                ))
            })?;
            state.last_extraction = Some(at);

            let mut log: Vec<UserEvent> = match tx.get(&log_key)? {
                Some(bytes) => bincode::deserialize(&bytes).map_err(|_| {
                    ConflictableTransactionError::Abort(PkgError::Database(
                        "corrupt event log".to_string(),
                    ))
                })?,
                None => Vec::new(),
            };
            log.push(UserEvent::KeyExtracted { at, round });

            // safe unwraps: the records serialize by construction
            tx.insert(reg_key.as_slice(), bincode::serialize(&state).unwrap())?;
            tx.insert(log_key.as_slice(), bincode::serialize(&log).unwrap())?;
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(PkgError::Database(e.to_string())),
        }
    }

    /// Reads a user's event log.
    pub fn log(&self, identity: &Identity) -> Result<Vec<UserEvent>, PkgError> {
        let value = self
            .tree
            .get(log_key(identity))
            .map_err(|e| PkgError::Database(e.to_string()))?;
        match value {
            None => Ok(Vec::new()),
            Some(bytes) => {
                bincode::deserialize(&bytes).map_err(|e| PkgError::Database(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alpenhorn_core::crypto::SigningKeyPair;

    use super::*;

    fn identity(name: &str) -> Identity {
        Identity::from_username(name).unwrap()
    }

    #[test]
    fn register_then_lookup() {
        let store = UserStore::ephemeral();
        let login = SigningKeyPair::generate();
        store.register(&identity("alice"), login.public).unwrap();

        let state = store.get(&identity("alice")).unwrap().unwrap();
        assert_eq!(state.login_key, login.public);
        assert_eq!(state.last_extraction, None);
        assert!(store.get(&identity("bob")).unwrap().is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let store = UserStore::ephemeral();
        let first = SigningKeyPair::generate();
        let second = SigningKeyPair::generate();
        store.register(&identity("alice"), first.public).unwrap();
        assert!(matches!(
            store.register(&identity("alice"), second.public),
            Err(PkgError::AlreadyRegistered)
        ));
        // the original login key survives
        let state = store.get(&identity("alice")).unwrap().unwrap();
        assert_eq!(state.login_key, first.public);
    }

    #[test]
    fn extraction_updates_state_and_log() {
        let store = UserStore::ephemeral();
        let login = SigningKeyPair::generate();
        store.register(&identity("alice"), login.public).unwrap();
        store.record_extraction(&identity("alice"), 4).unwrap();

        let state = store.get(&identity("alice")).unwrap().unwrap();
        assert!(state.last_extraction.is_some());
        let log = store.log(&identity("alice")).unwrap();
        assert_eq!(log.len(), 2);
        assert!(matches!(log[1], UserEvent::KeyExtracted { round: 4, .. }));
    }

    #[test]
    fn extraction_for_unknown_user_fails() {
        let store = UserStore::ephemeral();
        assert!(matches!(
            store.record_extraction(&identity("ghost"), 1),
            Err(PkgError::NotRegistered)
        ));
    }
}
