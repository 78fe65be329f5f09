//! The cascade mix server.
//!
//! Each server of a cascade peels one onion layer off every incoming
//! message, filters duplicates, appends its own cover noise, shuffles, and
//! hands the batch to the next server. The last server sorts the fully
//! peeled plaintexts into mailboxes and uploads them to the CDN. Because
//! every server shuffles, a single honest server in the cascade suffices to
//! break the link between submission order and mailbox contents.

mod noise;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    convert::TryInto,
    sync::Arc,
};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use alpenhorn_core::{
    bloom::BloomFilter,
    common::{RoundSettings, ServiceName},
    crypto::{ByteObject, EncryptKeyPair, PublicSigningKey, SigningKeyPair, Signature},
    message::{
        AddFriendMessage,
        DialMessage,
        FromBytes,
        ADD_FRIEND_MESSAGE_LENGTH,
        DIAL_MESSAGE_LENGTH,
    },
    noise::NoiseDistribution,
    onion,
    OnionPublicKey,
};

use crate::{
    cdn::{bucket, CdnConnector},
    rpc::{MixDialer, MixNode, NewRoundRequest},
};

/// Number of onions forwarded to the next hop per RPC.
const FORWARD_BATCH: usize = 512;

/// Number of trailing plaintext bytes the duplicate filter keys on.
const DEDUP_SUFFIX: usize = 8;

#[derive(Error, Debug)]
/// An error a mix server reports to its caller.
pub enum MixError {
    #[error("caller is not authorized for this call")]
    Unauthorized,
    #[error("round {0} not found")]
    RoundNotFound(u32),
    #[error("round {0} is closed")]
    RoundClosed(u32),
    #[error("request is for service {got}, this server mixes {expected}")]
    ServiceMismatch {
        expected: ServiceName,
        got: ServiceName,
    },
    #[error("this server's key is not in the round's chain")]
    NotInChain,
    #[error("round settings do not match the round state")]
    BadSettings,
    #[error("round settings have not been set")]
    SettingsMissing,
    #[error("next hop failed: {0}")]
    NextHop(String),
    #[error("CDN upload failed: {0}")]
    Cdn(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MixError {
    /// A stable name for transmitting the error kind to the caller.
    pub fn kind(&self) -> &'static str {
        match self {
            MixError::Unauthorized => "Unauthorized",
            MixError::RoundNotFound(_) => "RoundNotFound",
            MixError::RoundClosed(_) => "RoundClosed",
            MixError::ServiceMismatch { .. } => "ServiceMismatch",
            MixError::NotInChain => "NotInChain",
            MixError::BadSettings => "BadSettings",
            MixError::SettingsMissing => "SettingsMissing",
            MixError::NextHop(_) => "NextHop",
            MixError::Cdn(_) => "Cdn",
            MixError::Internal(_) => "Internal",
        }
    }

    /// Rebuilds an error from its transmitted kind.
    pub fn from_kind(kind: &str, message: &str) -> Self {
        match kind {
            "Unauthorized" => MixError::Unauthorized,
            "RoundNotFound" => MixError::RoundNotFound(0),
            "RoundClosed" => MixError::RoundClosed(0),
            "NotInChain" => MixError::NotInChain,
            "BadSettings" => MixError::BadSettings,
            "SettingsMissing" => MixError::SettingsMissing,
            "NextHop" => MixError::NextHop(message.to_string()),
            "Cdn" => MixError::Cdn(message.to_string()),
            _ => MixError::Internal(message.to_string()),
        }
    }

    /// Whether the caller, not this server, caused the failure.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            MixError::Unauthorized
                | MixError::RoundNotFound(_)
                | MixError::RoundClosed(_)
                | MixError::ServiceMismatch { .. }
                | MixError::BadSettings
        )
    }
}

/// Per-round mix state.
struct MixRound {
    keys: EncryptKeyPair,
    chain: Vec<MixNode>,
    position: usize,
    cdn_address: String,
    settings: Option<RoundSettings>,
    noise_rx: Option<oneshot::Receiver<Vec<Vec<u8>>>>,
    /// Peeled plaintexts accumulated from the previous hop.
    incoming: Vec<Vec<u8>>,
    dropped_bad_size: u64,
    dropped_bad_box: u64,
    dropped_duplicate: u64,
    dropped_bad_mailbox: u64,
    /// The mailbox base URL, set once the round is closed.
    closed: Option<String>,
}

/// A cascade mix server for one service.
pub struct MixServer {
    keys: SigningKeyPair,
    service: ServiceName,
    coordinator_key: PublicSigningKey,
    dialer: Arc<dyn MixDialer>,
    cdn: Arc<dyn CdnConnector>,
    noise: NoiseDistribution,
    pool: Arc<rayon::ThreadPool>,
    rounds: Mutex<HashMap<u32, Arc<Mutex<MixRound>>>>,
}

impl MixServer {
    /// Creates a mix server.
    pub fn new(
        keys: SigningKeyPair,
        service: ServiceName,
        coordinator_key: PublicSigningKey,
        dialer: Arc<dyn MixDialer>,
        cdn: Arc<dyn CdnConnector>,
        noise: NoiseDistribution,
        pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        Self {
            keys,
            service,
            coordinator_key,
            dialer,
            cdn,
            noise,
            pool,
            rounds: Mutex::new(HashMap::new()),
        }
    }

    /// The server's long-term signing key.
    pub fn public_key(&self) -> PublicSigningKey {
        self.keys.public
    }

    /// The service this server mixes.
    pub fn service(&self) -> ServiceName {
        self.service
    }

    /// Length of the innermost plaintext this server's service mixes.
    fn message_size(&self) -> usize {
        match self.service {
            ServiceName::AddFriend => ADD_FRIEND_MESSAGE_LENGTH,
            ServiceName::Dialing => DIAL_MESSAGE_LENGTH,
        }
    }

    fn check_service(&self, service: ServiceName) -> Result<(), MixError> {
        if service != self.service {
            return Err(MixError::ServiceMismatch {
                expected: self.service,
                got: service,
            });
        }
        Ok(())
    }

    async fn round(&self, round: u32) -> Result<Arc<Mutex<MixRound>>, MixError> {
        self.rounds
            .lock()
            .await
            .get(&round)
            .cloned()
            .ok_or(MixError::RoundNotFound(round))
    }

    /// Opens a round. Idempotent: repeating the call returns the same onion key.
    pub async fn new_round(
        &self,
        peer: &PublicSigningKey,
        request: NewRoundRequest,
    ) -> Result<OnionPublicKey, MixError> {
        if *peer != self.coordinator_key {
            return Err(MixError::Unauthorized);
        }
        self.check_service(request.service)?;

        let mut rounds = self.rounds.lock().await;
        if let Some(existing) = rounds.get(&request.round) {
            return Ok(existing.lock().await.keys.public);
        }

        let position = request
            .chain
            .iter()
            .position(|node| node.key == self.keys.public)
            .ok_or(MixError::NotInChain)?;

        let keys = EncryptKeyPair::generate();
        let public = keys.public;
        let round = request.round;
        info!(
            round = request.round,
            position, "opened round with a fresh onion key"
        );
        rounds.insert(
            round,
            Arc::new(Mutex::new(MixRound {
                keys,
                chain: request.chain,
                position,
                cdn_address: request.cdn_address,
                settings: None,
                noise_rx: None,
                incoming: Vec::new(),
                dropped_bad_size: 0,
                dropped_bad_box: 0,
                dropped_duplicate: 0,
                dropped_bad_mailbox: 0,
                closed: None,
            })),
        );

        // closed rounds linger one extra round to answer idempotent retries
        rounds.retain(|&id, _| id + 2 > round);
        Ok(public)
    }

    /// Accepts the round settings, signs them and starts noise generation.
    /// Idempotent: signing is deterministic.
    pub async fn set_round_settings(
        &self,
        peer: &PublicSigningKey,
        settings: RoundSettings,
    ) -> Result<Signature, MixError> {
        if *peer != self.coordinator_key {
            return Err(MixError::Unauthorized);
        }
        self.check_service(settings.service)?;

        let round = self.round(settings.round).await?;
        let mut round = round.lock().await;

        if settings.onion_keys.len() != round.chain.len()
            || settings.onion_keys[round.position] != round.keys.public
        {
            return Err(MixError::BadSettings);
        }

        if round.settings.is_none() {
            round.noise_rx = Some(noise::spawn(
                &self.pool,
                self.service,
                self.noise,
                settings.clone(),
                round.position,
            ));
            round.settings = Some(settings.clone());
        }

        Ok(settings.sign(&self.keys.secret))
    }

    /// Accepts a batch of onions from the previous hop (or the coordinator
    /// at position 0), peels them and buffers the plaintexts. May be called
    /// any number of times before the round closes.
    pub async fn add_onions(
        &self,
        peer: &PublicSigningKey,
        service: ServiceName,
        round_id: u32,
        onions: Vec<Vec<u8>>,
    ) -> Result<(), MixError> {
        self.check_service(service)?;
        let round = self.round(round_id).await?;
        let mut round = round.lock().await;

        let expected_peer = if round.position == 0 {
            self.coordinator_key
        } else {
            round.chain[round.position - 1].key
        };
        if *peer != expected_peer {
            return Err(MixError::Unauthorized);
        }
        if round.closed.is_some() {
            return Err(MixError::RoundClosed(round_id));
        }

        let round = &mut *round;
        let expected_len =
            (round.chain.len() - round.position) * onion::ONION_OVERHEAD + self.message_size();
        for onion_bytes in onions {
            if onion_bytes.len() != expected_len {
                round.dropped_bad_size += 1;
                continue;
            }
            match onion::peel(&onion_bytes, &round.keys.secret) {
                Ok(plaintext) => round.incoming.push(plaintext),
                Err(_) => round.dropped_bad_box += 1,
            }
        }
        debug!(
            round = round_id,
            buffered = round.incoming.len(),
            "buffered onion batch"
        );
        Ok(())
    }

    /// Closes the round: deduplicates, joins the noise, shuffles, and either
    /// forwards to the next hop or publishes the mailboxes. Idempotent:
    /// repeating the call returns the same URL.
    pub async fn close_round(
        &self,
        peer: &PublicSigningKey,
        service: ServiceName,
        round_id: u32,
    ) -> Result<String, MixError> {
        self.check_service(service)?;
        let round = self.round(round_id).await?;
        let mut round = round.lock().await;

        let expected_peer = if round.position == 0 {
            self.coordinator_key
        } else {
            round.chain[round.position - 1].key
        };
        if *peer != expected_peer {
            return Err(MixError::Unauthorized);
        }
        if let Some(url) = &round.closed {
            return Ok(url.clone());
        }

        let round = &mut *round;
        let settings = round.settings.clone().ok_or(MixError::SettingsMissing)?;

        // dedup before the noise joins: only adversarial resubmission is
        // filtered, never our own cover traffic
        let mut seen: HashSet<[u8; DEDUP_SUFFIX]> = HashSet::new();
        let mut batch = Vec::with_capacity(round.incoming.len());
        for plaintext in round.incoming.drain(..) {
            // unwrap safe: plaintexts are at least message_size long
            let suffix: [u8; DEDUP_SUFFIX] =
                plaintext[plaintext.len() - DEDUP_SUFFIX..].try_into().unwrap();
            if seen.insert(suffix) {
                batch.push(plaintext);
            } else {
                round.dropped_duplicate += 1;
            }
        }
        let mixed = batch.len();

        let noise_rx = round.noise_rx.take().ok_or(MixError::SettingsMissing)?;
        let noise = noise_rx
            .await
            .map_err(|_| MixError::Internal("noise generation failed".to_string()))?;
        let noise_count = noise.len();
        batch.extend(noise);

        let mut rng = ChaCha20Rng::from_entropy();
        batch.shuffle(&mut rng);

        let url = if round.position + 1 < round.chain.len() {
            let next = self
                .dialer
                .dial(&round.chain[round.position + 1])
                .await
                .map_err(|e| MixError::NextHop(e.to_string()))?;
            for chunk in batch.chunks(FORWARD_BATCH) {
                next.add_onions(service, round_id, chunk.to_vec())
                    .await
                    .map_err(|e| MixError::NextHop(e.to_string()))?;
            }
            next.close_round(service, round_id)
                .await
                .map_err(|e| MixError::NextHop(e.to_string()))?
        } else {
            let mailboxes = self.sort_mailboxes(&settings, batch, &mut round.dropped_bad_mailbox);
            let bucket = bucket(service, round_id);
            self.cdn
                .connect(&round.cdn_address)
                .put(&bucket, mailboxes)
                .await
                .map_err(|e| MixError::Cdn(e.to_string()))?;
            format!("{}/get?bucket={}", round.cdn_address, bucket)
        };

        info!(
            round = round_id,
            mixed,
            noise = noise_count,
            dropped_bad_size = round.dropped_bad_size,
            dropped_bad_box = round.dropped_bad_box,
            dropped_duplicate = round.dropped_duplicate,
            dropped_bad_mailbox = round.dropped_bad_mailbox,
            %url,
            "closed round"
        );
        round.closed = Some(url.clone());
        Ok(url)
    }

    /// Per-round drop counters: `(bad size, failed open, duplicate, bad mailbox)`.
    pub async fn drop_counters(&self, round_id: u32) -> Result<(u64, u64, u64, u64), MixError> {
        let round = self.round(round_id).await?;
        let round = round.lock().await;
        Ok((
            round.dropped_bad_size,
            round.dropped_bad_box,
            round.dropped_duplicate,
            round.dropped_bad_mailbox,
        ))
    }

    /// Sorts fully peeled plaintexts into per-mailbox blobs.
    ///
    /// Contact-discovery mailboxes concatenate the fixed-size encrypted
    /// introductions; dialing mailboxes fold the tokens into a Bloom filter.
    /// Every mailbox in `[0, num_mailboxes]` gets an entry even if empty.
    fn sort_mailboxes(
        &self,
        settings: &RoundSettings,
        plaintexts: Vec<Vec<u8>>,
        dropped: &mut u64,
    ) -> BTreeMap<u32, Vec<u8>> {
        match self.service {
            ServiceName::AddFriend => {
                let mut mailboxes: BTreeMap<u32, Vec<u8>> = (0..=settings.num_mailboxes)
                    .map(|id| (id, Vec::new()))
                    .collect();
                for plaintext in plaintexts {
                    let message = match AddFriendMessage::from_bytes(&plaintext) {
                        Ok(message) => message,
                        Err(_) => {
                            *dropped += 1;
                            continue;
                        }
                    };
                    match mailboxes.get_mut(&message.mailbox_id) {
                        Some(blob) => blob.extend_from_slice(message.encrypted_intro.as_slice()),
                        None => *dropped += 1,
                    }
                }
                mailboxes
            }
            ServiceName::Dialing => {
                let mut tokens: BTreeMap<u32, Vec<[u8; 32]>> = (0..=settings.num_mailboxes)
                    .map(|id| (id, Vec::new()))
                    .collect();
                for plaintext in plaintexts {
                    let message = match DialMessage::from_bytes(&plaintext) {
                        Ok(message) => message,
                        Err(_) => {
                            *dropped += 1;
                            continue;
                        }
                    };
                    match tokens.get_mut(&message.mailbox_id) {
                        Some(list) => {
                            // unwrap safe: tokens are exactly 32 bytes
                            list.push(message.token.as_slice().try_into().unwrap())
                        }
                        None => *dropped += 1,
                    }
                }
                tokens
                    .into_iter()
                    .map(|(id, tokens)| {
                        let mut filter = BloomFilter::new(tokens.len());
                        for token in &tokens {
                            filter.insert(token);
                        }
                        (id, filter.to_bytes())
                    })
                    .collect()
            }
        }
    }
}
