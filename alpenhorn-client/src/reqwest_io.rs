//! HTTP implementations of the client IO traits.
//!
//! The coordinator channel is not provided here: it rides the
//! application's authenticated websocket connection.

use std::sync::Arc;

use async_trait::async_trait;

use alpenhorn_core::{
    config::{ServerEntry, SignedConfig},
    pkg::{ExtractReply, ExtractRequest},
    LoginPublicKey,
};

use crate::traits::{BoxError, ConfigSource, MailboxFetcher, PkgClient, PkgConnector};

/// Fetches mailboxes from the CDN over HTTP.
pub struct HttpMailboxFetcher {
    http: reqwest::Client,
}

impl HttpMailboxFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpMailboxFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxFetcher for HttpMailboxFetcher {
    async fn fetch(&self, url: &str, mailbox_id: u32) -> Result<Option<Vec<u8>>, BoxError> {
        let full = format!("{}&key={}", url, mailbox_id);
        let response = self.http.get(&full).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

/// Talks to the signed-configuration service over HTTP.
pub struct HttpConfigSource {
    base: String,
    http: reqwest::Client,
}

impl HttpConfigSource {
    /// Builds a source for the service at `base`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn current(&self, service: &str) -> Result<SignedConfig, BoxError> {
        let url = format!("{}/current?service={}", self.base, service);
        Ok(self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn chain(&self, have: &str, want: &str) -> Result<Vec<SignedConfig>, BoxError> {
        let url = format!("{}/getchain?have={}&want={}", self.base, have, want);
        Ok(self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Talks to a PKG's user endpoints over HTTP.
pub struct HttpPkgClient {
    base: String,
    http: reqwest::Client,
}

#[derive(serde::Serialize)]
struct RegisterBody<'a> {
    username: &'a str,
    login_key: LoginPublicKey,
    token: &'a str,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, BoxError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(format!("{}: {}", body.kind, body.message).into()),
        Err(_) => Err(format!("request failed with status {}", status).into()),
    }
}

#[async_trait]
impl PkgClient for HttpPkgClient {
    async fn register(
        &self,
        username: &str,
        login_key: LoginPublicKey,
        token: &str,
    ) -> Result<(), BoxError> {
        let response = self
            .http
            .post(&format!("{}/pkg/register", self.base))
            .json(&RegisterBody {
                username,
                login_key,
                token,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn extract(&self, request: ExtractRequest) -> Result<ExtractReply, BoxError> {
        let response = self
            .http
            .post(&format!("{}/pkg/extract", self.base))
            .json(&request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

/// Connects to PKGs by their configured addresses.
pub struct HttpPkgConnector;

impl PkgConnector for HttpPkgConnector {
    fn connect(&self, entry: &ServerEntry) -> Arc<dyn PkgClient> {
        Arc::new(HttpPkgClient {
            base: entry.address.clone(),
            http: reqwest::Client::new(),
        })
    }
}
