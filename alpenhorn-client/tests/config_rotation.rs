//! Configuration rotation: a coordinator announcing an unknown
//! configuration hash makes the client fetch the connecting chain, verify
//! every guardian signature, and participate under the new configuration
//! from that round on.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

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
    config::{
        AddFriendInner,
        ConfigCodec,
        DialingInner,
        Guardian,
        InnerConfig,
        ServerEntry,
        SignedConfig,
    },
    crypto::SigningKeyPair,
    ServiceName,
};

struct NullChannel;

#[async_trait]
impl CoordinatorChannel for NullChannel {
    async fn next_announcement(&mut self) -> Result<Announcement, BoxError> {
        Err("the null channel carries nothing".into())
    }

    async fn send_onion(&mut self, _round: u32, _onion: Vec<u8>) -> Result<(), BoxError> {
        Err("the null channel carries nothing".into())
    }
}

struct NoMailboxes;

#[async_trait]
impl MailboxFetcher for NoMailboxes {
    async fn fetch(&self, _url: &str, _mailbox_id: u32) -> Result<Option<Vec<u8>>, BoxError> {
        Ok(None)
    }
}

struct NoPkgs;

impl PkgConnector for NoPkgs {
    fn connect(&self, _entry: &ServerEntry) -> Arc<dyn PkgClient> {
        unreachable!("this test never extracts")
    }
}

/// Serves exactly one prepared chain.
struct OneChain {
    have: String,
    want: String,
    chain: Vec<SignedConfig>,
}

#[async_trait]
impl ConfigSource for OneChain {
    async fn current(&self, _service: &str) -> Result<SignedConfig, BoxError> {
        Ok(self.chain.last().unwrap().clone())
    }

    async fn chain(&self, have: &str, want: &str) -> Result<Vec<SignedConfig>, BoxError> {
        if have == self.have && want == self.want {
            Ok(self.chain.clone())
        } else {
            Err(format!("no chain from {} to {}", have, want).into())
        }
    }
}

fn entry(address: &str) -> ServerEntry {
    ServerEntry {
        key: SigningKeyPair::generate().public,
        address: address.to_string(),
    }
}

fn addfriend_config(version: u64, guardians: &[(&str, &SigningKeyPair)]) -> SignedConfig {
    let now = chrono::Utc::now();
    SignedConfig {
        version,
        service: "addfriend".to_string(),
        created: now,
        expires: now + chrono::Duration::days(30),
        prev_config_hash: None,
        inner: ConfigCodec::encode_inner(&InnerConfig::AddFriend(AddFriendInner {
            coordinator: entry("coordinator.test"),
            pkgs: vec![entry("pkg0.test")],
            mix_servers: vec![entry("mix0.test")],
            cdn: entry("http://cdn.test"),
        })),
        guardians: guardians
            .iter()
            .map(|(username, keys)| Guardian {
                username: username.to_string(),
                key: keys.public,
            })
            .collect(),
        signatures: BTreeMap::new(),
    }
}

fn dialing_config() -> SignedConfig {
    let now = chrono::Utc::now();
    let guardian = SigningKeyPair::generate();
    let mut config = SignedConfig {
        version: 1,
        service: "dialing".to_string(),
        created: now,
        expires: now + chrono::Duration::days(30),
        prev_config_hash: None,
        inner: ConfigCodec::encode_inner(&InnerConfig::Dialing(DialingInner {
            coordinator: entry("dialing.test"),
            mix_servers: vec![entry("mix0.test")],
            cdn: entry("http://cdn.test"),
        })),
        guardians: vec![Guardian {
            username: "guardian".to_string(),
            key: guardian.public,
        }],
        signatures: BTreeMap::new(),
    };
    config.sign(&guardian.secret);
    config
}

#[tokio::test]
async fn the_client_adopts_a_properly_signed_successor() {
    alpenhorn_core::init().unwrap();
    let guardian = SigningKeyPair::generate();
    let old = addfriend_config(1, &[("guardian", &guardian)]);

    // the successor adds a PKG, so it re-lists the membership; the original
    // guardian must sign it
    let mut new = addfriend_config(2, &[("guardian", &guardian)]);
    new.prev_config_hash = Some(old.hash().to_hex());
    match ConfigCodec::standard().decode_inner(&new).unwrap() {
        InnerConfig::AddFriend(mut inner) => {
            inner.pkgs.push(entry("pkg1.test"));
            new.inner = ConfigCodec::encode_inner(&InnerConfig::AddFriend(inner));
        }
        _ => unreachable!(),
    }
    new.sign(&guardian.secret);

    let source = OneChain {
        have: old.hash().to_hex(),
        want: new.hash().to_hex(),
        chain: vec![new.clone()],
    };
    let io = ClientIo {
        config_source: Arc::new(source),
        mailboxes: Arc::new(NoMailboxes),
        pkgs: Arc::new(NoPkgs),
    };
    let client = Client::new(
        ClientSettings {
            username: "alice".to_string(),
            login: SigningKeyPair::generate(),
            long_term: SigningKeyPair::generate(),
            addfriend_config: old,
            dialing_config: dialing_config(),
            intents: 1,
            state_path: None,
            keywheel_path: None,
        },
        io,
    )
    .unwrap();

    let mut channel = NullChannel;
    let events = client
        .handle_addfriend(
            Announcement::NewRound {
                round: 9,
                config_hash: new.hash().to_hex(),
            },
            &mut channel,
        )
        .await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        ClientEvent::NewConfig { service, chain } => {
            assert_eq!(*service, ServiceName::AddFriend);
            assert_eq!(chain.len(), 1);
            assert_eq!(chain[0].version, 2);
        }
        other => panic!("expected a NewConfig event, got {:?}", other),
    }

    // the same hash announced again is already trusted: no further events
    let events = client
        .handle_addfriend(
            Announcement::NewRound {
                round: 10,
                config_hash: new.hash().to_hex(),
            },
            &mut channel,
        )
        .await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn an_unverifiable_chain_is_rejected() {
    alpenhorn_core::init().unwrap();
    let guardian = SigningKeyPair::generate();
    let old = addfriend_config(1, &[("guardian", &guardian)]);

    // the successor is not signed by the guardian
    let mut new = addfriend_config(2, &[("guardian", &guardian)]);
    new.prev_config_hash = Some(old.hash().to_hex());
    let rogue = SigningKeyPair::generate();
    new.sign(&rogue.secret);

    let source = OneChain {
        have: old.hash().to_hex(),
        want: new.hash().to_hex(),
        chain: vec![new.clone()],
    };
    let io = ClientIo {
        config_source: Arc::new(source),
        mailboxes: Arc::new(NoMailboxes),
        pkgs: Arc::new(NoPkgs),
    };
    let client = Client::new(
        ClientSettings {
            username: "alice".to_string(),
            login: SigningKeyPair::generate(),
            long_term: SigningKeyPair::generate(),
            addfriend_config: old.clone(),
            dialing_config: dialing_config(),
            intents: 1,
            state_path: None,
            keywheel_path: None,
        },
        io,
    )
    .unwrap();

    let mut channel = NullChannel;
    let events = client
        .handle_addfriend(
            Announcement::NewRound {
                round: 9,
                config_hash: new.hash().to_hex(),
            },
            &mut channel,
        )
        .await;
    assert!(matches!(
        events.as_slice(),
        [ClientEvent::Error {
            service: ServiceName::AddFriend,
            round: 9,
            ..
        }]
    ));
}
