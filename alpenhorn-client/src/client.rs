//! The client handle and its long-lived state.
//!
//! One client participates in both services over two coordinator channels.
//! A single mutex guards the friend table, the request queues, the keywheel
//! and the per-round state maps; it is never held across network I/O.
//! Per-round state sits behind its own mutex so the extraction and scan
//! paths only touch the round they belong to.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use alpenhorn_core::{
    common::RoundSettings,
    config::{
        AddFriendInner,
        ConfigCodec,
        ConfigError,
        DialingInner,
        InnerConfig,
        ServerEntry,
        SignedConfig,
    },
    crypto::{
        BlsPublicKey,
        BlsSignature,
        EncryptKeyPair,
        IbeIdentityPrivateKey,
        IbeMasterPublicKey,
        PublicEncryptKey,
        PublicSigningKey,
        Signature,
        SigningKeyPair,
    },
    identity::{validate_username, UsernameError},
    keywheel::Keywheel,
    ServiceName,
};

use crate::{
    events::{ClientEvent, EventSink},
    persist::{self, PersistError},
    traits::{BoxError, ClientIo, CoordinatorChannel},
};

#[derive(Error, Debug)]
/// An error constructing or instructing a client.
pub enum ClientError {
    #[error("invalid username: {0}")]
    Username(#[from] UsernameError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0:?} is already a friend")]
    AlreadyFriends(String),
    #[error("{0:?} is not a friend")]
    NotFriends(String),
    #[error("persistence failed: {0}")]
    Persist(#[from] PersistError),
    #[error("registration failed: {0}")]
    Register(String),
}

/// The client's construction-time settings.
pub struct ClientSettings {
    /// The client's registered username.
    pub username: String,
    /// The login key registered with the PKGs.
    pub login: SigningKeyPair,
    /// The long-term key friends learn through introductions.
    pub long_term: SigningKeyPair,
    /// The trusted contact-discovery configuration.
    pub addfriend_config: SignedConfig,
    /// The trusted dialing configuration.
    pub dialing_config: SignedConfig,
    /// How many call intents to test per friend per dialing round.
    pub intents: u32,
    /// Path of the main state file, `None` for an in-memory client.
    pub state_path: Option<PathBuf>,
    /// Path of the keywheel file, `None` for an in-memory client.
    pub keywheel_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A queued or in-flight friend request.
pub struct OutgoingRequest {
    /// The username the request is addressed to.
    pub friend: String,
    /// The fresh DH key pair minted for this request.
    pub(crate) dh: EncryptKeyPair,
    /// The dialing round the request's introduction was anchored at, once
    /// it has been sent.
    pub(crate) sent_dialing_round: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An introduction received from someone without a matching pending request.
pub struct IncomingRequest {
    /// The sender's username.
    pub friend: String,
    /// The sender's DH public key.
    pub(crate) dh_public: PublicEncryptKey,
    /// The sender's attested long-term key.
    pub long_term_key: PublicSigningKey,
    /// The dialing round the sender anchored at.
    pub(crate) dialing_round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A queued call notification.
pub struct QueuedCall {
    /// The callee.
    pub friend: String,
    /// The intent.
    pub intent: u32,
}

#[derive(Serialize, Deserialize)]
/// The shape of the main persisted state file.
pub(crate) struct PersistedClient {
    pub(crate) username: String,
    pub(crate) login: SigningKeyPair,
    pub(crate) long_term: SigningKeyPair,
    pub(crate) intents: u32,
    pub(crate) addfriend_config: SignedConfig,
    pub(crate) dialing_config: SignedConfig,
    pub(crate) outgoing_requests: Vec<OutgoingRequest>,
    pub(crate) incoming_requests: Vec<IncomingRequest>,
    pub(crate) call_queue: VecDeque<QueuedCall>,
    pub(crate) friends: BTreeSet<String>,
    pub(crate) latest_dialing_round: u32,
}

/// Per-round contact-discovery state.
pub(crate) struct AddFriendRound {
    /// Fresh key the PKGs seal extracted private keys to.
    pub(crate) return_keys: EncryptKeyPair,
    /// The PKGs' per-round BLS keys, ordered like the configuration.
    pub(crate) bls_keys: Vec<BlsPublicKey>,
    /// The aggregate IBE master public key.
    pub(crate) master: Option<IbeMasterPublicKey>,
    /// The aggregate extracted identity private key.
    pub(crate) identity_key: Option<IbeIdentityPrivateKey>,
    /// The per-PKG attestations of this client's identity and long-term key.
    pub(crate) attestations: Vec<BlsSignature>,
    /// Whether every PKG's extraction verified.
    pub(crate) extract_success: bool,
    /// The verified mix settings.
    pub(crate) settings: Option<RoundSettings>,
    /// The friend a real introduction went to this round, if any.
    pub(crate) sent_friend: Option<String>,
}

impl AddFriendRound {
    pub(crate) fn new() -> Self {
        Self {
            return_keys: EncryptKeyPair::generate(),
            bls_keys: Vec::new(),
            master: None,
            identity_key: None,
            attestations: Vec::new(),
            extract_success: false,
            settings: None,
            sent_friend: None,
        }
    }
}

/// Per-round dialing state.
pub(crate) struct DialingRound {
    /// The friend and intent dialed this round, if any.
    pub(crate) sent: Option<QueuedCall>,
}

pub(crate) struct ClientState {
    pub(crate) persisted: PersistedClient,
    pub(crate) addfriend_inner: AddFriendInner,
    pub(crate) dialing_inner: DialingInner,
    pub(crate) addfriend_hash: String,
    pub(crate) dialing_hash: String,
    pub(crate) keywheel: Keywheel,
    pub(crate) addfriend_rounds: HashMap<u32, Arc<Mutex<AddFriendRound>>>,
    pub(crate) dialing_rounds: HashMap<u32, Arc<Mutex<DialingRound>>>,
}

/// An Alpenhorn client.
pub struct Client {
    pub(crate) io: ClientIo,
    pub(crate) codec: ConfigCodec,
    state_path: Option<PathBuf>,
    keywheel_path: Option<PathBuf>,
    pub(crate) state: Mutex<ClientState>,
}

impl Client {
    /// Builds a client. If the state files already exist, the persisted
    /// state wins over `settings`.
    pub fn new(settings: ClientSettings, io: ClientIo) -> Result<Self, ClientError> {
        let ClientSettings {
            username,
            login,
            long_term,
            addfriend_config,
            dialing_config,
            intents,
            state_path,
            keywheel_path,
        } = settings;
        validate_username(&username)?;

        let persisted = match &state_path {
            Some(path) => persist::load::<PersistedClient>(path)?,
            None => None,
        };
        let persisted = persisted.unwrap_or_else(|| PersistedClient {
            username,
            login,
            long_term,
            intents,
            addfriend_config,
            dialing_config,
            outgoing_requests: Vec::new(),
            incoming_requests: Vec::new(),
            call_queue: VecDeque::new(),
            friends: BTreeSet::new(),
            latest_dialing_round: 0,
        });

        let keywheel = match &keywheel_path {
            Some(path) => persist::load::<Keywheel>(path)?.unwrap_or_default(),
            None => Keywheel::new(),
        };

        let codec = ConfigCodec::standard();
        let addfriend_inner = match codec.decode_inner(&persisted.addfriend_config)? {
            InnerConfig::AddFriend(inner) => inner,
            InnerConfig::Dialing(_) => {
                return Err(ClientError::Config(ConfigError::WrongService {
                    expected: "addfriend".to_string(),
                    got: "dialing".to_string(),
                }))
            }
        };
        let dialing_inner = match codec.decode_inner(&persisted.dialing_config)? {
            InnerConfig::Dialing(inner) => inner,
            InnerConfig::AddFriend(_) => {
                return Err(ClientError::Config(ConfigError::WrongService {
                    expected: "dialing".to_string(),
                    got: "addfriend".to_string(),
                }))
            }
        };

        let state = ClientState {
            addfriend_hash: persisted.addfriend_config.hash().to_hex(),
            dialing_hash: persisted.dialing_config.hash().to_hex(),
            persisted,
            addfriend_inner,
            dialing_inner,
            keywheel,
            addfriend_rounds: HashMap::new(),
            dialing_rounds: HashMap::new(),
        };
        Ok(Self {
            io,
            codec,
            state_path,
            keywheel_path,
            state: Mutex::new(state),
        })
    }

    /// The client's username.
    pub fn username(&self) -> String {
        self.state.lock().unwrap().persisted.username.clone()
    }

    /// The client's long-term public key.
    pub fn long_term_key(&self) -> PublicSigningKey {
        self.state.lock().unwrap().persisted.long_term.public
    }

    /// The confirmed friends.
    pub fn friends(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().persisted.friends.clone()
    }

    /// The received-but-unanswered friend requests.
    pub fn incoming_requests(&self) -> Vec<IncomingRequest> {
        self.state
            .lock()
            .unwrap()
            .persisted
            .incoming_requests
            .clone()
    }

    /// The queued and in-flight outgoing friend requests.
    pub fn outgoing_requests(&self) -> Vec<OutgoingRequest> {
        self.state
            .lock()
            .unwrap()
            .persisted
            .outgoing_requests
            .clone()
    }

    /// Registers the client's username and login key with every configured
    /// PKG. Already-registered replies are tolerated.
    pub async fn register(&self, token: &str) -> Result<(), ClientError> {
        let (username, login_key, pkgs) = {
            let state = self.state.lock().unwrap();
            (
                state.persisted.username.clone(),
                state.persisted.login.public,
                state.addfriend_inner.pkgs.clone(),
            )
        };
        for entry in &pkgs {
            let pkg = self.io.pkgs.connect(entry);
            match pkg.register(&username, login_key, token).await {
                Ok(()) => info!("registered {:?} with PKG {}", username, entry.address),
                Err(e) if e.to_string().contains("already registered") => {
                    info!("{:?} was already registered with PKG {}", username, entry.address)
                }
                Err(e) => {
                    return Err(ClientError::Register(format!(
                        "PKG {}: {}",
                        entry.address, e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Queues a friend request to `friend`, to go out with the next
    /// contact-discovery round. Also the way to answer an incoming request.
    pub fn queue_friend_request(&self, friend: &str) -> Result<(), ClientError> {
        validate_username(friend)?;
        let mut state = self.state.lock().unwrap();
        if state.persisted.friends.contains(friend) {
            return Err(ClientError::AlreadyFriends(friend.to_string()));
        }
        if state
            .persisted
            .outgoing_requests
            .iter()
            .any(|r| r.friend == friend)
        {
            return Ok(());
        }
        state.persisted.outgoing_requests.push(OutgoingRequest {
            friend: friend.to_string(),
            dh: EncryptKeyPair::generate(),
            sent_dialing_round: None,
        });
        self.persist(&state)?;
        Ok(())
    }

    /// Queues a call notification to a confirmed friend.
    pub fn queue_call(&self, friend: &str, intent: u32) -> Result<(), ClientError> {
        let mut state = self.state.lock().unwrap();
        if !state.persisted.friends.contains(friend) {
            return Err(ClientError::NotFriends(friend.to_string()));
        }
        state.persisted.call_queue.push_back(QueuedCall {
            friend: friend.to_string(),
            intent,
        });
        self.persist(&state)?;
        Ok(())
    }

    /// Persists the main state and the keywheel. Called unconditionally at
    /// the same points of every round, real or cover, so the write pattern
    /// itself reveals nothing.
    pub(crate) fn persist(&self, state: &ClientState) -> Result<(), PersistError> {
        if let Some(path) = &self.state_path {
            persist::save(path, &state.persisted)?;
        }
        if let Some(path) = &self.keywheel_path {
            persist::save(path, &state.keywheel)?;
        }
        Ok(())
    }

    /// Checks the announced configuration hash for `service` and, on
    /// mismatch, fetches and verifies the connecting chain and adopts its
    /// head.
    pub(crate) async fn ensure_config(
        &self,
        service: ServiceName,
        announced_hash: &str,
    ) -> Result<Vec<ClientEvent>, String> {
        let (current_hash, current_config) = {
            let state = self.state.lock().unwrap();
            match service {
                ServiceName::AddFriend => (
                    state.addfriend_hash.clone(),
                    state.persisted.addfriend_config.clone(),
                ),
                ServiceName::Dialing => (
                    state.dialing_hash.clone(),
                    state.persisted.dialing_config.clone(),
                ),
            }
        };
        if current_hash == announced_hash {
            return Ok(Vec::new());
        }

        info!(
            "configuration hash changed from {} to {}, fetching the chain",
            current_hash, announced_hash
        );
        let chain = self
            .io
            .config_source
            .chain(&current_hash, announced_hash)
            .await
            .map_err(|e| format!("failed to fetch the configuration chain: {}", e))?;
        let head = current_config
            .verify_chain(&chain)
            .map_err(|e| format!("configuration chain failed verification: {}", e))?;
        if head.hash().to_hex() != announced_hash {
            return Err("configuration chain does not end at the announced hash".to_string());
        }
        let inner = self
            .codec
            .decode_inner(head)
            .map_err(|e| format!("invalid configuration payload: {}", e))?;

        let mut state = self.state.lock().unwrap();
        match (service, inner) {
            (ServiceName::AddFriend, InnerConfig::AddFriend(inner)) => {
                state.persisted.addfriend_config = head.clone();
                state.addfriend_inner = inner;
                state.addfriend_hash = announced_hash.to_string();
            }
            (ServiceName::Dialing, InnerConfig::Dialing(inner)) => {
                state.persisted.dialing_config = head.clone();
                state.dialing_inner = inner;
                state.dialing_hash = announced_hash.to_string();
            }
            _ => return Err("configuration is for the wrong service".to_string()),
        }
        if let Err(e) = self.persist(&state) {
            warn!("failed to persist the adopted configuration: {}", e);
        }
        Ok(vec![ClientEvent::NewConfig { service, chain }])
    }

    /// Verifies an announced mix round against the configured cascade.
    pub(crate) fn verify_mix_announcement(
        settings: &RoundSettings,
        signatures: &[Signature],
        mixers: &[ServerEntry],
        service: ServiceName,
    ) -> Result<(), String> {
        if settings.service != service {
            return Err("mix settings are for the wrong service".to_string());
        }
        if signatures.len() != mixers.len() || settings.onion_keys.len() != mixers.len() {
            return Err("mix settings do not match the configured cascade".to_string());
        }
        let message = settings.signing_message();
        for (position, (entry, signature)) in mixers.iter().zip(signatures).enumerate() {
            if !entry.key.verify_detached(signature, &message) {
                return Err(format!(
                    "mix server at position {} signed the settings incorrectly",
                    position
                ));
            }
        }
        Ok(())
    }

    /// Runs the contact-discovery loop until the channel fails.
    pub async fn run_addfriend(
        &self,
        mut channel: impl CoordinatorChannel,
        sink: &mut dyn EventSink,
    ) -> Result<(), BoxError> {
        loop {
            let announcement = channel.next_announcement().await?;
            for event in self.handle_addfriend(announcement, &mut channel).await {
                sink.handle(event);
            }
        }
    }

    /// Runs the dialing loop until the channel fails.
    pub async fn run_dialing(
        &self,
        mut channel: impl CoordinatorChannel,
        sink: &mut dyn EventSink,
    ) -> Result<(), BoxError> {
        loop {
            let announcement = channel.next_announcement().await?;
            for event in self.handle_dialing(announcement, &mut channel).await {
                sink.handle(event);
            }
        }
    }
}
