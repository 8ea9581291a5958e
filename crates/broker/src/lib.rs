//! Wires the shared state (store, presence registries, the change-stream
//! bus, the actor directories) to the three websocket upgrade routes (§6)
//! and spawns one channel actor per accepted connection. Split into a
//! library so integration tests can drive the router end to end over a
//! real websocket, the way the teacher's own binaries separate `lib.rs`
//! from a thin `main.rs`.

pub mod auth;
pub mod client_channel;
pub mod config;
pub mod gateway_channel;
pub mod handles;
pub mod logging;
pub mod store;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use model::{ClientId, GatewayId, RelayId, TokenKind};
use tokio::sync::mpsc;
use tracing::warn;

use auth::UpgradeRejection;
use handles::{ClientHandle, GatewayHandle};
use store::InMemoryStore;

const MAILBOX_CAPACITY: usize = 64;

pub struct AppState {
    pub store: Arc<InMemoryStore>,
    pub clients: Arc<presence::Registry<ClientId, ()>>,
    pub gateways: Arc<presence::Registry<GatewayId, ()>>,
    pub relays: Arc<presence::Registry<RelayId, model::Relay>>,
    pub change_bus: Arc<pubsub::Bus<changestream::DomainEvent>>,
    pub client_directory: Arc<DashMap<ClientId, ClientHandle>>,
    pub gateway_directory: Arc<DashMap<GatewayId, GatewayHandle>>,
    pub args: config::Args,
}

impl AppState {
    pub fn new(args: config::Args) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            clients: Arc::new(presence::Registry::new(Arc::new(pubsub::Bus::new(MAILBOX_CAPACITY)))),
            gateways: Arc::new(presence::Registry::new(Arc::new(pubsub::Bus::new(MAILBOX_CAPACITY)))),
            relays: Arc::new(presence::Registry::new(Arc::new(pubsub::Bus::new(MAILBOX_CAPACITY)))),
            change_bus: Arc::new(pubsub::Bus::new(MAILBOX_CAPACITY)),
            client_directory: Arc::new(DashMap::new()),
            gateway_directory: Arc::new(DashMap::new()),
            args,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct AuthQuery {
    token: Option<String>,
    /// Relay-only: the secret a relay picks at startup, whose hash is its
    /// stable id across reconnects (`model::RelayId::from_stamp_secret`).
    stamp_secret: Option<String>,
    addr: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Builds the router the binary serves; also what integration tests bind
/// to an ephemeral port and drive with a real websocket client.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/gateway/websocket", get(gateway_ws_handler))
        .route("/client/websocket", get(client_ws_handler))
        .route("/relay/websocket", get(relay_ws_handler))
        .with_state(state)
}

/// Binds and serves `router(state)` on `state.args.bind_addr` until the
/// process is killed. The binary's `main` is a thin wrapper over this.
pub async fn run(args: config::Args) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(args));
    let listener = tokio::net::TcpListener::bind(state.args.bind_addr).await?;
    tracing::info!(addr = %state.args.bind_addr, "broker listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn bearer(headers: &HeaderMap, query: &AuthQuery) -> Option<String> {
    let header_value = headers
        .get("x-authorization")
        .and_then(|v| v.to_str().ok());
    auth::extract_token(header_value, query.token.as_deref())
}

async fn gateway_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token_str) = bearer(&headers, &query) else {
        return UpgradeRejection::MissingToken.into_response();
    };
    let Ok(token_id) = token_str.parse::<model::TokenId>() else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(token) = state.store.authenticate(token_id, TokenKind::Gateway) else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(account) = state.store.account(token.account_id) else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    if !account.active {
        return UpgradeRejection::AccountDisabled.into_response();
    }
    let Ok(gateway_id) = token.subject_id.to_string().parse::<GatewayId>() else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(gateway) = state.store.gateway(gateway_id) else {
        return UpgradeRejection::Unauthenticated.into_response();
    };

    ws.on_upgrade(move |socket| run_gateway_socket(socket, state, gateway, account, token.id))
}

async fn client_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token_str) = bearer(&headers, &query) else {
        return UpgradeRejection::MissingToken.into_response();
    };
    let Ok(token_id) = token_str.parse::<model::TokenId>() else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(token) = state.store.authenticate(token_id, TokenKind::Client) else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(account) = state.store.account(token.account_id) else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    if !account.active {
        return UpgradeRejection::AccountDisabled.into_response();
    }
    let Ok(client_id) = token.subject_id.to_string().parse::<ClientId>() else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(client) = state.store.client(client_id) else {
        return UpgradeRejection::Unauthenticated.into_response();
    };

    let subject = model::Subject {
        account_id: account.id,
        actor_id: client.actor_id,
        token: token.clone(),
    };

    ws.on_upgrade(move |socket| run_client_socket(socket, state, client, account, subject))
}

/// Relays speak no application-level protocol beyond the connection
/// itself: presence is the whole point (§4.7). Reconnecting under the same
/// `stamp_secret` before the old socket's drop is observed lands on the
/// same id (the [`presence::Registry`] holder rule absorbs the race); a
/// restart under a fresh secret is a new relay as far as selection is
/// concerned.
async fn relay_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token_str) = bearer(&headers, &query) else {
        return UpgradeRejection::MissingToken.into_response();
    };
    let Ok(token_id) = token_str.parse::<model::TokenId>() else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(token) = state.store.authenticate(token_id, TokenKind::Relay) else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let Some(account) = state.store.account(token.account_id) else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    if !account.active {
        return UpgradeRejection::AccountDisabled.into_response();
    }
    let Some(stamp_secret) = query.stamp_secret.clone() else {
        return UpgradeRejection::InvalidToken.into_response();
    };
    let (Some(addr), Some(username), Some(password)) =
        (query.addr.clone(), query.username.clone(), query.password.clone())
    else {
        return UpgradeRejection::InvalidToken.into_response();
    };

    let relay = model::Relay {
        id: model::RelayId::from_stamp_secret(&stamp_secret),
        kind: model::RelayKind::Turn,
        addr,
        username,
        password,
        expires_at: chrono::Utc::now() + chrono::Duration::hours(24),
        location: None,
    };

    ws.on_upgrade(move |socket| run_relay_socket(socket, state, relay, account.id))
}

async fn run_gateway_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    gateway: model::Gateway,
    account: model::Account,
    token_id: model::TokenId,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (wire_tx, wire_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (outbox_tx, mut outbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (request_tx, request_rx) = mpsc::channel(MAILBOX_CAPACITY);

    let gateway_id = gateway.id;
    state.gateway_directory.insert(
        gateway_id,
        GatewayHandle {
            gateway_id,
            tx: request_tx,
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let envelope = wire::Envelope::new("gateway", message, None);
            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            let Message::Text(text) = message else { continue };
            match serde_json::from_str::<wire::Envelope<wire::GatewayIngress>>(&text) {
                Ok(envelope) => {
                    if wire_tx.send(envelope.message).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "dropping malformed gateway frame"),
            }
        }
    });

    let gw_state = gateway_channel::GatewayChannelState::new(gateway, account, token_id);
    let deps = gateway_channel::Deps {
        gateways: state.gateways.clone(),
        relays: state.relays.clone(),
        change_bus: state.change_bus.clone(),
        client_directory: state.client_directory.clone(),
        relay_count: state.args.relay_selection_count,
        prune_interval: state.args.prune_interval,
        relay_debounce: state.args.relay_debounce,
    };

    gateway_channel::run(gw_state, wire_rx, outbox_tx, request_rx, deps).await;

    state.gateway_directory.remove(&gateway_id);
    reader.abort();
    writer.abort();
}

async fn run_client_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    client: model::Client,
    account: model::Account,
    subject: model::Subject,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (wire_tx, wire_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (outbox_tx, mut outbox_rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (reply_tx, reply_rx) = mpsc::channel(MAILBOX_CAPACITY);

    let client_id = client.id;
    let self_handle = ClientHandle {
        client_id,
        tx: reply_tx,
    };

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let envelope = wire::Envelope::new("client", message, None);
            let Ok(json) = serde_json::to_string(&envelope) else {
                continue;
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            let Message::Text(text) = message else { continue };
            match serde_json::from_str::<wire::Envelope<wire::ClientIngress>>(&text) {
                Ok(envelope) => {
                    if wire_tx.send(envelope.message).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "dropping malformed client frame"),
            }
        }
    });

    let client_state = client_channel::ClientChannelState::new(client, account, subject);
    let deps = client_channel::Deps {
        store: state.store.clone(),
        clients: state.clients.clone(),
        gateways: state.gateways.clone(),
        change_bus: state.change_bus.clone(),
        client_directory: state.client_directory.clone(),
        gateway_directory: state.gateway_directory.clone(),
        request_timeout: state.args.request_timeout,
    };

    client_channel::run(client_state, wire_rx, outbox_tx, reply_rx, self_handle, deps).await;

    state.client_directory.remove(&client_id);
    reader.abort();
    writer.abort();
}

async fn run_relay_socket(mut socket: WebSocket, state: Arc<AppState>, relay: model::Relay, account_id: model::AccountId) {
    let holder = presence::HolderId::next();
    let relay_id = relay.id;

    state.relays.join(
        relay_id,
        account_id,
        relay,
        holder,
        &pubsub::Topic::relay_presence(account_id),
    );

    while let Some(Ok(_)) = socket.next().await {}

    state
        .relays
        .leave(&relay_id, holder, &pubsub::Topic::relay_presence(account_id));
}
