//! End-to-end rounds: coordinator, PKGs, mix cascade, CDN and clients wired
//! together in-process. The coordinators free-run; the clients react to the
//! announcement stream exactly as they would over the wire.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use alpenhorn_client::{
    BoxError,
    Client,
    ClientEvent,
    ClientIo,
    ClientSettings,
    ConfigSource,
    CoordinatorChannel,
    MailboxFetcher,
    PkgClient,
    PkgConnector,
};
use alpenhorn_core::{
    announce::Announcement,
    config::{AddFriendInner, ConfigCodec, DialingInner, Guardian, InnerConfig, ServerEntry, SignedConfig},
    crypto::{Sha256, SigningKeyPair},
    message::ENCRYPTED_INTRODUCTION_LENGTH,
    noise::NoiseDistribution,
    pkg::PkgRoundInfo,
    ServiceName,
};
use alpenhorn_server::{
    cdn::{CdnClient, MemoryCdn, MemoryCdnConnector},
    coordinator::{
        events::{Event, EventSubscriber},
        requests::OnionSender,
        store::MemoryStore,
        StateMachineInitializer,
    },
    mix::MixServer,
    pkg::{OpenRegistration, PkgServer, UserStore},
    rpc::{
        local::{LocalMixDialer, LocalMixRpc, LocalPkgRpc, MixRegistry},
        MixRpc,
        PkgRpc,
        RpcError,
    },
    settings::CoordinatorWaits,
};

// ---- in-memory client IO ----

struct LocalChannel {
    rx: broadcast::Receiver<Event<Announcement>>,
    onions: OnionSender,
}

#[async_trait]
impl CoordinatorChannel for LocalChannel {
    async fn next_announcement(&mut self) -> Result<Announcement, BoxError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event.event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e @ broadcast::error::RecvError::Closed) => return Err(Box::new(e)),
            }
        }
    }

    async fn send_onion(&mut self, round: u32, onion: Vec<u8>) -> Result<(), BoxError> {
        self.onions
            .submit(round, onion)
            .map_err(|e| Box::new(e) as BoxError)
    }
}

struct LocalMailboxes(Arc<MemoryCdn>);

#[async_trait]
impl MailboxFetcher for LocalMailboxes {
    async fn fetch(&self, url: &str, mailbox_id: u32) -> Result<Option<Vec<u8>>, BoxError> {
        let bucket = url
            .split("bucket=")
            .nth(1)
            .ok_or("mailbox url carries no bucket")?;
        Ok(self.0.get(bucket, mailbox_id).await?)
    }
}

struct NoConfigService;

#[async_trait]
impl ConfigSource for NoConfigService {
    async fn current(&self, _service: &str) -> Result<SignedConfig, BoxError> {
        Err("no configuration service in this deployment".into())
    }

    async fn chain(&self, _have: &str, _want: &str) -> Result<Vec<SignedConfig>, BoxError> {
        Err("no configuration service in this deployment".into())
    }
}

struct LocalPkgs(HashMap<String, Arc<PkgServer>>);

struct LocalPkg(Arc<PkgServer>);

#[async_trait]
impl PkgClient for LocalPkg {
    async fn register(
        &self,
        username: &str,
        login_key: alpenhorn_core::LoginPublicKey,
        token: &str,
    ) -> Result<(), BoxError> {
        self.0
            .register(username, login_key, token)
            .await
            .map_err(|e| Box::new(e) as BoxError)
    }

    async fn extract(
        &self,
        request: alpenhorn_core::pkg::ExtractRequest,
    ) -> Result<alpenhorn_core::pkg::ExtractReply, BoxError> {
        self.0.extract(&request).map_err(|e| Box::new(e) as BoxError)
    }
}

impl PkgConnector for LocalPkgs {
    fn connect(&self, entry: &ServerEntry) -> Arc<dyn PkgClient> {
        Arc::new(LocalPkg(self.0[&entry.address].clone()))
    }
}

/// A PKG RPC handle with a kill switch, for outage tests.
struct FlakyPkg {
    inner: LocalPkgRpc,
    down: Arc<AtomicBool>,
}

#[async_trait]
impl PkgRpc for FlakyPkg {
    async fn commit(&self, round: u32) -> Result<Sha256, RpcError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("PKG is offline".to_string()));
        }
        self.inner.commit(round).await
    }

    async fn reveal(
        &self,
        round: u32,
        commitments: BTreeMap<String, Sha256>,
    ) -> Result<PkgRoundInfo, RpcError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("PKG is offline".to_string()));
        }
        self.inner.reveal(round, commitments).await
    }
}

// ---- the in-process deployment ----

struct TestNet {
    cdn: Arc<MemoryCdn>,
    addfriend_config: SignedConfig,
    dialing_config: SignedConfig,
    addfriend_subscriber: EventSubscriber,
    dialing_subscriber: EventSubscriber,
    addfriend_onions: OnionSender,
    dialing_onions: OnionSender,
    pkg_servers: HashMap<String, Arc<PkgServer>>,
    pkg_down: Arc<AtomicBool>,
}

const NUM_PKGS: usize = 2;
const NUM_MIXERS: usize = 2;
const NUM_MAILBOXES: u32 = 2;

fn waits() -> CoordinatorWaits {
    CoordinatorWaits {
        pkg_wait: Duration::from_millis(300),
        mix_wait: Duration::from_millis(1200),
        round_wait: Duration::from_millis(200),
        rpc_timeout: Duration::from_secs(5),
    }
}

fn entry(key: &SigningKeyPair, address: String) -> ServerEntry {
    ServerEntry {
        key: key.public,
        address,
    }
}

fn sign_config(config: &mut SignedConfig, guardian: &SigningKeyPair) {
    config.sign(&guardian.secret);
}

impl TestNet {
    /// Builds both services and starts their round drivers.
    fn start(noise: NoiseDistribution) -> TestNet {
        alpenhorn_core::init().unwrap();
        let guardian = SigningKeyPair::generate();
        let cdn = Arc::new(MemoryCdn::new());
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().build().unwrap());
        let pkg_down = Arc::new(AtomicBool::new(false));
        let now = chrono::Utc::now();

        // PKG servers
        let mut pkg_servers = HashMap::new();
        let mut pkg_entries = Vec::new();
        let addfriend_coordinator = SigningKeyPair::generate();
        for i in 0..NUM_PKGS {
            let keys = SigningKeyPair::generate();
            let address = format!("pkg{}.test", i);
            pkg_entries.push(entry(&keys, address.clone()));
            let server = Arc::new(PkgServer::new(
                keys,
                addfriend_coordinator.public,
                UserStore::ephemeral(),
                Arc::new(OpenRegistration),
            ));
            pkg_servers.insert(address, server);
        }

        // one mix cascade per service
        let dialing_coordinator_keys = SigningKeyPair::generate();
        let mut cascades = Vec::new();
        for (service, coordinator) in [
            (ServiceName::AddFriend, &addfriend_coordinator),
            (ServiceName::Dialing, &dialing_coordinator_keys),
        ] {
            let registry = MixRegistry::new();
            let mut servers = Vec::new();
            let mut entries = Vec::new();
            for i in 0..NUM_MIXERS {
                let keys = SigningKeyPair::generate();
                let address = format!("{}-mix{}.test", service.as_str(), i);
                entries.push(entry(&keys, address.clone()));
                let own = keys.public;
                let server = Arc::new(MixServer::new(
                    keys,
                    service,
                    coordinator.public,
                    Arc::new(LocalMixDialer::new(registry.clone(), own)),
                    Arc::new(MemoryCdnConnector(cdn.clone())),
                    noise,
                    pool.clone(),
                ));
                registry.insert(address, server.clone());
                servers.push(server);
            }
            cascades.push((coordinator.clone(), servers, entries));
        }
        let (dialing_coordinator, dialing_mixers, dialing_entries) = cascades.pop().unwrap();
        let (addfriend_coordinator, addfriend_mixers, addfriend_entries) = cascades.pop().unwrap();

        // signed configurations
        let cdn_keys = SigningKeyPair::generate();
        let mut addfriend_config = SignedConfig {
            version: 1,
            service: "addfriend".to_string(),
            created: now,
            expires: now + chrono::Duration::days(30),
            prev_config_hash: None,
            inner: ConfigCodec::encode_inner(&InnerConfig::AddFriend(AddFriendInner {
                coordinator: entry(&addfriend_coordinator, "addfriend.test".to_string()),
                pkgs: pkg_entries,
                mix_servers: addfriend_entries,
                cdn: entry(&cdn_keys, "http://cdn.test".to_string()),
            })),
            guardians: vec![Guardian {
                username: "guardian".to_string(),
                key: guardian.public,
            }],
            signatures: BTreeMap::new(),
        };
        sign_config(&mut addfriend_config, &guardian);
        let mut dialing_config = SignedConfig {
            version: 1,
            service: "dialing".to_string(),
            created: now,
            expires: now + chrono::Duration::days(30),
            prev_config_hash: None,
            inner: ConfigCodec::encode_inner(&InnerConfig::Dialing(DialingInner {
                coordinator: entry(&dialing_coordinator, "dialing.test".to_string()),
                mix_servers: dialing_entries,
                cdn: entry(&cdn_keys, "http://cdn.test".to_string()),
            })),
            guardians: vec![Guardian {
                username: "guardian".to_string(),
                key: guardian.public,
            }],
            signatures: BTreeMap::new(),
        };
        sign_config(&mut dialing_config, &guardian);

        let codec = ConfigCodec::standard();

        // contact-discovery coordinator
        let mixers: Vec<Arc<dyn MixRpc>> = addfriend_mixers
            .iter()
            .map(|server| {
                Arc::new(LocalMixRpc::new(server.clone(), addfriend_coordinator.public))
                    as Arc<dyn MixRpc>
            })
            .collect();
        let pkgs = pkg_servers
            .values()
            .map(|server| alpenhorn_server::coordinator::phases::PkgPeer {
                key: server.public_key(),
                rpc: Arc::new(FlakyPkg {
                    inner: LocalPkgRpc::new(server.clone(), addfriend_coordinator.public),
                    down: pkg_down.clone(),
                }) as Arc<dyn PkgRpc>,
            })
            .collect();
        let inner = codec.decode_inner(&addfriend_config).unwrap();
        let (machine, addfriend_onions, addfriend_subscriber, _history) =
            StateMachineInitializer::new(
                ServiceName::AddFriend,
                addfriend_config.clone(),
                inner,
                waits(),
                NUM_MAILBOXES,
                mixers,
                pkgs,
                Box::new(MemoryStore::new()),
            )
            .init()
            .unwrap();
        tokio::spawn(machine.run());

        // dialing coordinator
        let mixers: Vec<Arc<dyn MixRpc>> = dialing_mixers
            .iter()
            .map(|server| {
                Arc::new(LocalMixRpc::new(server.clone(), dialing_coordinator.public))
                    as Arc<dyn MixRpc>
            })
            .collect();
        let inner = codec.decode_inner(&dialing_config).unwrap();
        let (machine, dialing_onions, dialing_subscriber, _history) = StateMachineInitializer::new(
            ServiceName::Dialing,
            dialing_config.clone(),
            inner,
            waits(),
            NUM_MAILBOXES,
            mixers,
            Vec::new(),
            Box::new(MemoryStore::new()),
        )
        .init()
        .unwrap();
        tokio::spawn(machine.run());

        TestNet {
            cdn,
            addfriend_config,
            dialing_config,
            addfriend_subscriber,
            dialing_subscriber,
            addfriend_onions,
            dialing_onions,
            pkg_servers,
            pkg_down,
        }
    }

    fn client(&self, username: &str) -> Arc<Client> {
        let io = ClientIo {
            config_source: Arc::new(NoConfigService),
            mailboxes: Arc::new(LocalMailboxes(self.cdn.clone())),
            pkgs: Arc::new(LocalPkgs(self.pkg_servers.clone())),
        };
        let settings = ClientSettings {
            username: username.to_string(),
            login: SigningKeyPair::generate(),
            long_term: SigningKeyPair::generate(),
            addfriend_config: self.addfriend_config.clone(),
            dialing_config: self.dialing_config.clone(),
            intents: 2,
            state_path: None,
            keywheel_path: None,
        };
        Arc::new(Client::new(settings, io).unwrap())
    }

    /// Spawns both run loops for a client; returns its event stream.
    fn run_client(&self, client: &Arc<Client>) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let addfriend = LocalChannel {
            rx: self.addfriend_subscriber.announcements(),
            onions: self.addfriend_onions.clone(),
        };
        let mut sink = tx.clone();
        let handle = client.clone();
        tokio::spawn(async move {
            let _ = handle.run_addfriend(addfriend, &mut sink).await;
        });

        let dialing = LocalChannel {
            rx: self.dialing_subscriber.announcements(),
            onions: self.dialing_onions.clone(),
        };
        let mut sink = tx;
        let handle = client.clone();
        tokio::spawn(async move {
            let _ = handle.run_dialing(dialing, &mut sink).await;
        });

        rx
    }
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    what: &str,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed while waiting for {}", what),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

async fn wait_for_announcement(
    rx: &mut broadcast::Receiver<Event<Announcement>>,
    what: &str,
    predicate: impl Fn(&Announcement) -> bool,
) -> Announcement {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event.event) => return event.event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("announcements closed while waiting for {}", what)
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

#[tokio::test(flavor = "multi_thread")]
async fn a_cover_round_publishes_and_raises_nothing() {
    let net = TestNet::start(NoiseDistribution { mu: 5.0, b: 1.0 });
    let mut watch = net.addfriend_subscriber.announcements();

    let alice = net.client("alice");
    alice.register("token").await.unwrap();
    let mut events = net.run_client(&alice);

    // let two full contact-discovery rounds publish
    let first = wait_for_announcement(&mut watch, "a mailbox announcement", |a| {
        matches!(a, Announcement::Mailbox { .. })
    })
    .await;
    let first_round = first.round();
    wait_for_announcement(&mut watch, "the next mailbox announcement", |a| {
        matches!(a, Announcement::Mailbox { round, .. } if *round > first_round)
    })
    .await;

    // the published mailboxes are slot-aligned and padded with noise
    let bucket = format!("addfriend/{}", first_round);
    for mailbox_id in 0..=NUM_MAILBOXES {
        let blob = net.cdn.get(&bucket, mailbox_id).await.unwrap().unwrap();
        assert_eq!(blob.len() % ENCRYPTED_INTRODUCTION_LENGTH, 0);
    }
    // the cover mailbox holds at least the client's own cover message
    let cover = net.cdn.get(&bucket, 0).await.unwrap().unwrap();
    assert!(cover.len() >= ENCRYPTED_INTRODUCTION_LENGTH);

    // a cover-only client surfaces nothing
    assert!(events.try_recv().is_err());
    assert!(alice.friends().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn alice_and_bob_become_friends_and_call() {
    let net = TestNet::start(NoiseDistribution { mu: 2.0, b: 1.0 });

    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.register("token").await.unwrap();
    bob.register("token").await.unwrap();

    alice.queue_friend_request("bob").unwrap();
    bob.queue_friend_request("alice").unwrap();

    let mut alice_events = net.run_client(&alice);
    let mut bob_events = net.run_client(&bob);

    wait_for(&mut alice_events, "alice's confirmation", |e| {
        matches!(e, ClientEvent::ConfirmedFriend { friend } if friend == "bob")
    })
    .await;
    wait_for(&mut bob_events, "bob's confirmation", |e| {
        matches!(e, ClientEvent::ConfirmedFriend { friend } if friend == "alice")
    })
    .await;

    assert!(alice.friends().contains("bob"));
    assert!(bob.friends().contains("alice"));
    assert!(alice.outgoing_requests().is_empty());
    assert!(bob.outgoing_requests().is_empty());

    // now alice dials bob with intent 0
    alice.queue_call("bob", 0).unwrap();
    wait_for(&mut alice_events, "alice's sent call", |e| {
        matches!(e, ClientEvent::SentCall { friend, intent: 0 } if friend == "bob")
    })
    .await;
    let received = wait_for(&mut bob_events, "bob's incoming call", |e| {
        matches!(e, ClientEvent::ReceivedCall { friend, intent: 0, .. } if friend == "alice")
    })
    .await;
    match received {
        ClientEvent::ReceivedCall { session_key, .. } => {
            assert_ne!(session_key, [0_u8; 32]);
        }
        _ => unreachable!(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn a_pkg_outage_aborts_the_round_and_keeps_the_request() {
    let net = TestNet::start(NoiseDistribution { mu: 2.0, b: 1.0 });
    net.pkg_down.store(true, Ordering::SeqCst);

    let alice = net.client("alice");
    let bob = net.client("bob");
    alice.register("token").await.unwrap();
    bob.register("token").await.unwrap();
    alice.queue_friend_request("bob").unwrap();
    bob.queue_friend_request("alice").unwrap();

    let mut alice_events = net.run_client(&alice);
    let mut bob_events = net.run_client(&bob);

    // the coordinator aborts the round; the client surfaces it and keeps
    // the request queued
    wait_for(&mut alice_events, "alice's round error", |e| {
        matches!(
            e,
            ClientEvent::Error {
                service: ServiceName::AddFriend,
                ..
            }
        )
    })
    .await;
    assert_eq!(alice.outgoing_requests().len(), 1);
    assert_eq!(alice.outgoing_requests()[0].friend, "bob");

    // the PKG recovers; the next rounds complete the friendship
    net.pkg_down.store(false, Ordering::SeqCst);
    wait_for(&mut alice_events, "alice's confirmation", |e| {
        matches!(e, ClientEvent::ConfirmedFriend { friend } if friend == "bob")
    })
    .await;
    wait_for(&mut bob_events, "bob's confirmation", |e| {
        matches!(e, ClientEvent::ConfirmedFriend { friend } if friend == "alice")
    })
    .await;
}
