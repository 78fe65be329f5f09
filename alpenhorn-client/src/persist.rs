//! Versioned client persistence.
//!
//! Persisted objects are a one-byte version prefix followed by a JSON body,
//! replaced atomically by writing to a temporary file and renaming it into
//! place. The keywheel lives in its own file, separate from the rest of the
//! client state, so it can be excluded from backups: restoring an old
//! keywheel would resurrect erased secrets and break forward secrecy.

use std::{fs, io, path::Path};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Version byte of the persisted client formats.
pub(crate) const PERSIST_VERSION: u8 = 1;

#[derive(Error, Debug)]
/// An error persisting or restoring client state.
pub enum PersistError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported persisted version {0}")]
    Version(u8),
    #[error("corrupt persisted state: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Writes `value` to `path` atomically.
pub(crate) fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let mut bytes = vec![PERSIST_VERSION];
    bytes.extend_from_slice(&serde_json::to_vec(value)?);

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a value from `path`; `None` if the file does not exist.
pub(crate) fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match bytes.split_first() {
        Some((&PERSIST_VERSION, body)) => Ok(Some(serde_json::from_slice(body)?)),
        Some((&version, _)) => Err(PersistError::Version(version)),
        None => Err(PersistError::Version(0)),
    }
}
