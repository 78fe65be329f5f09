//! The CDN contract.
//!
//! The CDN itself is an external collaborator: a dumb bucket store with
//! `POST /put?bucket=<service>/<round>` and
//! `GET /get?bucket=<service>/<round>&key=<mailbox_id>`. The last mix server
//! of a cascade uploads the round's encoded mailbox map to it, and clients
//! fetch single mailboxes from it. This module carries the trait the core
//! consumes, the HTTP implementation, an in-memory implementation for tests,
//! and the wire encoding of the mailbox map.

use std::{
    collections::{BTreeMap, HashMap},
    convert::TryInto,
    sync::Mutex,
};

use anyhow::anyhow;
use async_trait::async_trait;
use thiserror::Error;

use alpenhorn_core::message::DecodeError;

#[derive(Error, Debug)]
/// An error talking to the CDN.
pub enum CdnError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("the CDN rejected the request: {0}")]
    Rejected(String),
}

/// The bucket name for a round's mailboxes.
pub fn bucket(service: alpenhorn_core::ServiceName, round: u32) -> String {
    format!("{}/{}", service.as_str(), round)
}

/// The contract the mix servers and clients consume.
#[async_trait]
pub trait CdnClient: Send + Sync {
    /// Uploads a round's full mailbox map.
    async fn put(&self, bucket: &str, mailboxes: BTreeMap<u32, Vec<u8>>) -> Result<(), CdnError>;

    /// Fetches one mailbox, `None` if the bucket or mailbox does not exist.
    async fn get(&self, bucket: &str, key: u32) -> Result<Option<Vec<u8>>, CdnError>;
}

/// Encodes a mailbox map:
/// `BE_u32(count) || for each entry: BE_u32(id) || BE_u32(len) || bytes`.
pub fn encode_mailboxes(mailboxes: &BTreeMap<u32, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(mailboxes.len() as u32).to_be_bytes());
    for (id, bytes) in mailboxes {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Decodes a mailbox map produced by [`encode_mailboxes`].
///
/// # Errors
/// Fails on truncation, trailing bytes or duplicated mailbox ids.
pub fn decode_mailboxes(bytes: &[u8]) -> Result<BTreeMap<u32, Vec<u8>>, DecodeError> {
    let read_u32 = |bytes: &[u8], at: usize| -> Result<u32, DecodeError> {
        bytes
            .get(at..at + 4)
            .ok_or_else(|| anyhow!("truncated mailbox map"))
            // unwrap safe: the slice is exactly 4 bytes long
            .map(|slice| u32::from_be_bytes(slice.try_into().unwrap()))
    };

    let count = read_u32(bytes, 0)?;
    let mut offset = 4;
    let mut mailboxes = BTreeMap::new();
    for _ in 0..count {
        let id = read_u32(bytes, offset)?;
        let len = read_u32(bytes, offset + 4)? as usize;
        let value = bytes
            .get(offset + 8..offset + 8 + len)
            .ok_or_else(|| anyhow!("truncated mailbox map"))?;
        if mailboxes.insert(id, value.to_vec()).is_some() {
            return Err(anyhow!("duplicated mailbox id {}", id));
        }
        offset += 8 + len;
    }
    if offset != bytes.len() {
        return Err(anyhow!("trailing bytes in mailbox map"));
    }
    Ok(mailboxes)
}

/// An in-memory CDN for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCdn {
    buckets: Mutex<HashMap<String, BTreeMap<u32, Vec<u8>>>>,
}

impl MemoryCdn {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CdnClient for MemoryCdn {
    async fn put(&self, bucket: &str, mailboxes: BTreeMap<u32, Vec<u8>>) -> Result<(), CdnError> {
        self.buckets
            .lock()
            .unwrap()
            .insert(bucket.to_string(), mailboxes);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: u32) -> Result<Option<Vec<u8>>, CdnError> {
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .get(bucket)
            .and_then(|mailboxes| mailboxes.get(&key).cloned()))
    }
}

/// The HTTP CDN client.
pub struct HttpCdn {
    base: String,
    http: reqwest::Client,
}

impl HttpCdn {
    /// Builds a client for the CDN at `base`, e.g. `https://cdn.example:8080`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CdnClient for HttpCdn {
    async fn put(&self, bucket: &str, mailboxes: BTreeMap<u32, Vec<u8>>) -> Result<(), CdnError> {
        let url = format!("{}/put?bucket={}", self.base, bucket);
        let response = self
            .http
            .post(&url)
            .body(encode_mailboxes(&mailboxes))
            .send()
            .await
            .map_err(|e| CdnError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CdnError::Rejected(response.status().to_string()));
        }
        Ok(())
    }

    async fn get(&self, bucket: &str, key: u32) -> Result<Option<Vec<u8>>, CdnError> {
        let url = format!("{}/get?bucket={}&key={}", self.base, bucket, key);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CdnError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CdnError::Rejected(response.status().to_string()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CdnError::Transport(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Connects mix servers to the CDN named in each round's opening request.
pub trait CdnConnector: Send + Sync {
    /// Returns a client for the CDN at `address`.
    fn connect(&self, address: &str) -> std::sync::Arc<dyn CdnClient>;
}

/// A connector returning one fixed in-memory store for every address.
pub struct MemoryCdnConnector(pub std::sync::Arc<MemoryCdn>);

impl CdnConnector for MemoryCdnConnector {
    fn connect(&self, _address: &str) -> std::sync::Arc<dyn CdnClient> {
        self.0.clone()
    }
}

/// A connector building an HTTP client per address.
pub struct HttpCdnConnector;

impl CdnConnector for HttpCdnConnector {
    fn connect(&self, address: &str) -> std::sync::Arc<dyn CdnClient> {
        std::sync::Arc::new(HttpCdn::new(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_map_round_trip() {
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert(0, vec![1, 2, 3]);
        mailboxes.insert(2, vec![]);
        mailboxes.insert(7, vec![9; 100]);
        let bytes = encode_mailboxes(&mailboxes);
        assert_eq!(decode_mailboxes(&bytes).unwrap(), mailboxes);
    }

    #[test]
    fn truncated_maps_are_rejected() {
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert(1, vec![1, 2, 3]);
        let bytes = encode_mailboxes(&mailboxes);
        assert!(decode_mailboxes(&bytes[..bytes.len() - 1]).is_err());
        let mut trailing = bytes;
        trailing.push(0);
        assert!(decode_mailboxes(&trailing).is_err());
    }

    #[tokio::test]
    async fn memory_cdn_stores_and_serves() {
        let cdn = MemoryCdn::new();
        let mut mailboxes = BTreeMap::new();
        mailboxes.insert(1, vec![1, 2, 3]);
        cdn.put("addfriend/1", mailboxes).await.unwrap();
        assert_eq!(
            cdn.get("addfriend/1", 1).await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(cdn.get("addfriend/1", 2).await.unwrap(), None);
        assert_eq!(cdn.get("dialing/1", 1).await.unwrap(), None);
    }
}
