//! The HTTP transport.
//!
//! Server routes (warp) and client handles (reqwest) for the RPC contracts
//! of [`crate::rpc`], plus the coordinator's typed websocket channel to
//! clients.
//!
//! Peer authentication is the job of the mutually-authenticated TLS layer,
//! whose self-signed certificates embed the peer's Ed25519 key in a custom
//! X.509 extension; that terminator hands the verified key to these routes
//! in the `x-alpenhorn-peer` header. The handlers only compare it against
//! the expected key.

use std::{collections::BTreeMap, convert::Infallible, sync::Arc};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use warp::{http::StatusCode, Filter, Rejection, Reply};

use alpenhorn_core::{
    announce::{Announcement, ClientFrame},
    common::{RoundSettings, ServiceName},
    crypto::{ByteObject, PublicSigningKey, Sha256, Signature},
    pkg::{ExtractReply, ExtractRequest, PkgRoundInfo},
    LoginPublicKey,
    OnionPublicKey,
};

use crate::{
    coordinator::{events::EventSubscriber, requests::OnionSender, store::RoundHistory},
    mix::{MixError, MixServer},
    pkg::{PkgError, PkgServer},
    rpc::{MixRpc, NewRoundRequest, PkgRpc, PkgUserRpc, RpcError},
};

/// Header carrying the transport-verified peer signing key, hex encoded.
pub const PEER_HEADER: &str = "x-alpenhorn-peer";

#[derive(Debug, Serialize, Deserialize)]
/// The JSON body of an error reply.
pub struct ErrorBody {
    /// The stable error kind.
    pub kind: String,
    /// A human-readable description.
    pub message: String,
}

#[derive(Debug)]
struct BadPeerHeader;
impl warp::reject::Reject for BadPeerHeader {}

/// Extracts the transport-verified peer key.
fn peer_key() -> impl Filter<Extract = (PublicSigningKey,), Error = Rejection> + Copy {
    warp::header::<String>(PEER_HEADER).and_then(|hex_key: String| async move {
        hex::decode(&hex_key)
            .ok()
            .and_then(|bytes| PublicSigningKey::from_slice(&bytes))
            .ok_or_else(|| warp::reject::custom(BadPeerHeader))
    })
}

fn error_reply(kind: &str, message: String, status: StatusCode) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            kind: kind.to_string(),
            message,
        }),
        status,
    )
    .into_response()
}

fn mix_error_reply(error: MixError) -> warp::reply::Response {
    let status = match &error {
        MixError::Unauthorized => StatusCode::FORBIDDEN,
        MixError::RoundNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_client_fault() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_reply(error.kind(), error.to_string(), status)
}

fn pkg_error_reply(error: PkgError) -> warp::reply::Response {
    let status = match &error {
        PkgError::Unauthorized => StatusCode::FORBIDDEN,
        PkgError::RoundNotFound(_) | PkgError::NotRegistered => StatusCode::NOT_FOUND,
        e if e.is_client_fault() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_reply(error.kind(), error.to_string(), status)
}

async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (kind, status) = if rejection.find::<BadPeerHeader>().is_some() {
        ("Unauthorized", StatusCode::FORBIDDEN)
    } else if rejection.is_not_found() {
        ("NotFound", StatusCode::NOT_FOUND)
    } else {
        ("BadRequest", StatusCode::BAD_REQUEST)
    };
    Ok(error_reply(kind, format!("{:?}", rejection), status))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Body of the onion-batch RPC.
pub struct AddOnionsBody {
    pub service: ServiceName,
    pub round: u32,
    pub onions: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
/// Body of the close RPC.
pub struct CloseRoundBody {
    pub service: ServiceName,
    pub round: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
/// Body of the PKG commit RPC.
pub struct CommitBody {
    pub round: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Body of the PKG reveal RPC.
pub struct RevealBody {
    pub round: u32,
    pub commitments: BTreeMap<String, Sha256>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Body of the PKG register RPC.
pub struct RegisterBody {
    pub username: String,
    pub login_key: LoginPublicKey,
    pub token: String,
}

/// The routes a mix server exposes.
pub fn mix_routes(
    server: Arc<MixServer>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let with_server = warp::any().map(move || server.clone());

    let new_round = warp::path!("mix" / "new-round")
        .and(warp::post())
        .and(peer_key())
        .and(warp::body::json())
        .and(with_server.clone())
        .then(
            |peer: PublicSigningKey, request: NewRoundRequest, server: Arc<MixServer>| async move {
                match server.new_round(&peer, request).await {
                    Ok(key) => warp::reply::json(&key).into_response(),
                    Err(e) => mix_error_reply(e),
                }
            },
        );

    let round_settings = warp::path!("mix" / "round-settings")
        .and(warp::post())
        .and(peer_key())
        .and(warp::body::json())
        .and(with_server.clone())
        .then(
            |peer: PublicSigningKey, settings: RoundSettings, server: Arc<MixServer>| async move {
                match server.set_round_settings(&peer, settings).await {
                    Ok(signature) => warp::reply::json(&signature).into_response(),
                    Err(e) => mix_error_reply(e),
                }
            },
        );

    let add_onions = warp::path!("mix" / "onions")
        .and(warp::post())
        .and(peer_key())
        .and(warp::body::json())
        .and(with_server.clone())
        .then(
            |peer: PublicSigningKey, body: AddOnionsBody, server: Arc<MixServer>| async move {
                match server
                    .add_onions(&peer, body.service, body.round, body.onions)
                    .await
                {
                    Ok(()) => warp::reply::json(&()).into_response(),
                    Err(e) => mix_error_reply(e),
                }
            },
        );

    let close_round = warp::path!("mix" / "close")
        .and(warp::post())
        .and(peer_key())
        .and(warp::body::json())
        .and(with_server)
        .then(
            |peer: PublicSigningKey, body: CloseRoundBody, server: Arc<MixServer>| async move {
                match server.close_round(&peer, body.service, body.round).await {
                    Ok(url) => warp::reply::json(&url).into_response(),
                    Err(e) => mix_error_reply(e),
                }
            },
        );

    new_round
        .or(round_settings)
        .unify()
        .or(add_onions)
        .unify()
        .or(close_round)
        .unify()
        .recover(handle_rejection)
}

/// The routes a PKG server exposes.
pub fn pkg_routes(
    server: Arc<PkgServer>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let with_server = warp::any().map(move || server.clone());

    let commit = warp::path!("pkg" / "commit")
        .and(warp::post())
        .and(peer_key())
        .and(warp::body::json())
        .and(with_server.clone())
        .then(
            |peer: PublicSigningKey, body: CommitBody, server: Arc<PkgServer>| async move {
                match server.commit(&peer, body.round) {
                    Ok(commitment) => warp::reply::json(&commitment).into_response(),
                    Err(e) => pkg_error_reply(e),
                }
            },
        );

    let reveal = warp::path!("pkg" / "reveal")
        .and(warp::post())
        .and(peer_key())
        .and(warp::body::json())
        .and(with_server.clone())
        .then(
            |peer: PublicSigningKey, body: RevealBody, server: Arc<PkgServer>| async move {
                match server.reveal(&peer, body.round, &body.commitments) {
                    Ok(info) => warp::reply::json(&info).into_response(),
                    Err(e) => pkg_error_reply(e),
                }
            },
        );

    // registration and extraction are user calls: the transport
    // authenticates the user connection but no fixed peer is expected
    let register = warp::path!("pkg" / "register")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server.clone())
        .then(|body: RegisterBody, server: Arc<PkgServer>| async move {
            match server.register(&body.username, body.login_key, &body.token).await {
                Ok(()) => warp::reply::json(&()).into_response(),
                Err(e) => pkg_error_reply(e),
            }
        });

    let extract = warp::path!("pkg" / "extract")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_server)
        .then(|request: ExtractRequest, server: Arc<PkgServer>| async move {
            match server.extract(&request) {
                Ok(reply) => warp::reply::json(&reply).into_response(),
                Err(e) => pkg_error_reply(e),
            }
        });

    commit
        .or(reveal)
        .unify()
        .or(register)
        .unify()
        .or(extract)
        .unify()
        .recover(handle_rejection)
}

/// The coordinator's client-facing websocket.
///
/// On connect the client receives the current round's announcements so far
/// (catch-up), then the live stream. Frames the client sends are `onion`
/// submissions; anything else closes the connection.
pub fn coordinator_routes(
    subscriber: Arc<EventSubscriber>,
    history: Arc<std::sync::Mutex<RoundHistory>>,
    onions: OnionSender,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("ws")
        .and(warp::ws())
        .map(move |ws: warp::ws::Ws| {
            let subscriber = subscriber.clone();
            let history = history.clone();
            let onions = onions.clone();
            ws.on_upgrade(move |socket| client_session(socket, subscriber, history, onions))
        })
}

async fn client_session(
    socket: warp::ws::WebSocket,
    subscriber: Arc<EventSubscriber>,
    history: Arc<std::sync::Mutex<RoundHistory>>,
    onions: OnionSender,
) {
    let (mut tx, mut rx) = socket.split();

    // subscribe before snapshotting so nothing falls between the two
    let mut live = subscriber.announcements();
    let snapshot = {
        let history = history.lock().unwrap();
        match history.latest_round() {
            Some(round) => history.catch_up(round),
            None => Vec::new(),
        }
    };
    let snapshot_round = snapshot.first().map(Announcement::round);

    let forward = async move {
        for announcement in &snapshot {
            if send_frame(&mut tx, announcement).await.is_err() {
                return;
            }
        }
        loop {
            let event = match live.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client stream lagged, continuing");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            // skip live copies of announcements already sent in the snapshot
            if Some(event.event.round()) == snapshot_round && snapshot.contains(&event.event) {
                continue;
            }
            if send_frame(&mut tx, &event.event).await.is_err() {
                return;
            }
        }
    };
    let forward = tokio::spawn(forward);

    while let Some(message) = rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("websocket read failed: {}", e);
                break;
            }
        };
        let text = match message.to_str() {
            Ok(text) => text,
            Err(_) => continue, // ping/pong/binary
        };
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame::Onion { round, onion }) => {
                if onions.submit(round, onion).is_err() {
                    break;
                }
            }
            Err(e) => {
                info!("rejecting malformed client frame: {}", e);
                break;
            }
        }
    }
    forward.abort();
}

async fn send_frame(
    tx: &mut (impl SinkExt<warp::ws::Message> + Unpin),
    announcement: &Announcement,
) -> Result<(), ()> {
    // safe unwrap: announcements serialize to JSON by construction
    let text = serde_json::to_string(announcement).unwrap();
    tx.send(warp::ws::Message::text(text)).await.map_err(|_| ())
}

async fn parse_error_body(response: reqwest::Response) -> (String, String) {
    let status = response.status().to_string();
    match response.json::<ErrorBody>().await {
        Ok(body) => (body.kind, body.message),
        Err(_) => ("Transport".to_string(), status),
    }
}

/// A [`MixRpc`] handle over HTTP.
pub struct HttpMixRpc {
    base: String,
    http: reqwest::Client,
    own_key: PublicSigningKey,
}

impl HttpMixRpc {
    /// Builds a handle for the mix server at `base`, authenticated as
    /// `own_key` by the transport.
    pub fn new(base: impl Into<String>, own_key: PublicSigningKey) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
            own_key,
        }
    }

    async fn post<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RpcError> {
        let response = self
            .http
            .post(&format!("{}{}", self.base, path))
            .header(PEER_HEADER, self.own_key.to_hex())
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            let (kind, message) = parse_error_body(response).await;
            return Err(RpcError::Mix(MixError::from_kind(&kind, &message)));
        }
        response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}

#[async_trait]
impl MixRpc for HttpMixRpc {
    async fn new_round(&self, request: NewRoundRequest) -> Result<OnionPublicKey, RpcError> {
        self.post("/mix/new-round", &request).await
    }

    async fn set_round_settings(&self, settings: RoundSettings) -> Result<Signature, RpcError> {
        self.post("/mix/round-settings", &settings).await
    }

    async fn add_onions(
        &self,
        service: ServiceName,
        round: u32,
        onions: Vec<Vec<u8>>,
    ) -> Result<(), RpcError> {
        self.post(
            "/mix/onions",
            &AddOnionsBody {
                service,
                round,
                onions,
            },
        )
        .await
    }

    async fn close_round(&self, service: ServiceName, round: u32) -> Result<String, RpcError> {
        self.post("/mix/close", &CloseRoundBody { service, round })
            .await
    }
}

/// A [`PkgRpc`] and [`PkgUserRpc`] handle over HTTP.
pub struct HttpPkgRpc {
    base: String,
    http: reqwest::Client,
    own_key: PublicSigningKey,
}

impl HttpPkgRpc {
    /// Builds a handle for the PKG at `base`, authenticated as `own_key` by
    /// the transport.
    pub fn new(base: impl Into<String>, own_key: PublicSigningKey) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
            own_key,
        }
    }

    async fn post<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RpcError> {
        let response = self
            .http
            .post(&format!("{}{}", self.base, path))
            .header(PEER_HEADER, self.own_key.to_hex())
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            let (kind, message) = parse_error_body(response).await;
            return Err(RpcError::Pkg(PkgError::from_kind(&kind, &message)));
        }
        response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PkgRpc for HttpPkgRpc {
    async fn commit(&self, round: u32) -> Result<Sha256, RpcError> {
        self.post("/pkg/commit", &CommitBody { round }).await
    }

    async fn reveal(
        &self,
        round: u32,
        commitments: BTreeMap<String, Sha256>,
    ) -> Result<PkgRoundInfo, RpcError> {
        self.post(
            "/pkg/reveal",
            &RevealBody {
                round,
                commitments,
            },
        )
        .await
    }
}

#[async_trait]
impl PkgUserRpc for HttpPkgRpc {
    async fn register(
        &self,
        username: &str,
        login_key: LoginPublicKey,
        token: &str,
    ) -> Result<(), RpcError> {
        self.post(
            "/pkg/register",
            &RegisterBody {
                username: username.to_string(),
                login_key,
                token: token.to_string(),
            },
        )
        .await
    }

    async fn extract(&self, request: ExtractRequest) -> Result<ExtractReply, RpcError> {
        self.post("/pkg/extract", &request).await
    }
}
