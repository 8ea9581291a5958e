//! End-to-end tests driving the real axum router over actual websocket
//! connections, the way `firezone-headless-client`'s `tests/search_domain.rs`
//! exercises its crate through its public surface rather than unit-testing
//! internals directly.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use model::{
    Account, AccountId, ActorId, Client, Gateway, Group, GroupId, Membership, Policy, Resource,
    ResourceId, ResourceKind, SiteId, Token, TokenId, TokenKind,
};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{self, Message};

struct Server {
    addr: std::net::SocketAddr,
    state: std::sync::Arc<broker::AppState>,
}

async fn spawn_server() -> Server {
    let args = <broker::config::Args as clap::Parser>::parse_from([
        "broker",
        "--bind-addr",
        "127.0.0.1:0",
    ]);
    let state = std::sync::Arc::new(broker::AppState::new(args));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = broker::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Server { addr, state }
}

fn account() -> Account {
    Account {
        id: AccountId::random(),
        slug: "acme".to_string(),
        active: true,
    }
}

fn gateway_row(account_id: AccountId, site_id: SiteId) -> Gateway {
    Gateway {
        id: model::GatewayId::random(),
        account_id,
        site_id,
        ipv4_address: "100.64.0.1".parse().unwrap(),
        ipv6_address: "fd00::1".parse().unwrap(),
        public_key: "gw-pub".to_string(),
        last_seen_version: "1.3.0".to_string(),
        location: None,
    }
}

fn client_row(account_id: AccountId, actor_id: ActorId) -> Client {
    Client {
        id: model::ClientId::random(),
        account_id,
        actor_id,
        ipv4_address: Ipv4Addr::new(100, 64, 0, 2),
        ipv6_address: "fd00::2".parse().unwrap(),
        public_key: "client-pub".to_string(),
        verified_at: None,
        last_seen_version: "1.3.0".to_string(),
        last_seen_user_agent: None,
    }
}

fn resource_row(account_id: AccountId, site_id: SiteId) -> Resource {
    Resource {
        id: ResourceId::random(),
        account_id,
        name: "internal-wiki".to_string(),
        kind: ResourceKind::Dns {
            address: "wiki.corp".to_string(),
            ip_stack: model::IpStack::Dual,
        },
        filters: vec![],
        connected_site_ids: vec![site_id],
    }
}

fn subject_uuid(id: impl std::fmt::Display) -> uuid::Uuid {
    uuid::Uuid::parse_str(&id.to_string()).unwrap()
}

fn token_row(account_id: AccountId, kind: TokenKind, subject_id: uuid::Uuid) -> Token {
    Token {
        id: TokenId::random(),
        account_id,
        kind,
        subject_id,
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }
}

async fn connect(
    addr: std::net::SocketAddr,
    path: &str,
    token: &TokenId,
) -> Result<
    (
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        tungstenite::http::Response<Option<Vec<u8>>>,
    ),
    tungstenite::Error,
> {
    let url = format!("ws://{addr}{path}?token={token}");
    tokio_tungstenite::connect_async(url).await
}

async fn send_envelope<M: serde::Serialize>(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    topic: &str,
    message: M,
) {
    #[derive(serde::Serialize)]
    struct Envelope<M> {
        topic: String,
        #[serde(flatten)]
        message: M,
        #[serde(rename = "ref")]
        reference: Option<u64>,
    }
    let json = serde_json::to_string(&Envelope {
        topic: topic.to_string(),
        message,
        reference: None,
    })
    .unwrap();
    socket.send(Message::Text(json)).await.unwrap();
}

async fn recv_json(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn missing_token_rejects_the_gateway_upgrade_with_401() {
    let server = spawn_server().await;

    let url = format!("ws://{}/gateway/websocket", server.addr);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();

    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), tungstenite::http::StatusCode::UNAUTHORIZED);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_token_rejects_the_client_upgrade_with_401() {
    let server = spawn_server().await;

    let bogus = TokenId::random();
    let err = connect(server.addr, "/client/websocket", &bogus).await.unwrap_err();

    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), tungstenite::http::StatusCode::UNAUTHORIZED);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn disabled_account_rejects_the_gateway_upgrade_with_403() {
    let server = spawn_server().await;
    let mut acc = account();
    acc.active = false;
    let site_id = SiteId::random();
    let gw = gateway_row(acc.id, site_id);
    let token = token_row(acc.id, TokenKind::Gateway, subject_uuid(gw.id));

    server.state.store.accounts.insert(acc.id, acc);
    server.state.store.gateways.insert(gw.id, gw);
    server.state.store.tokens.insert(token.id, token.clone());

    let err = connect(server.addr, "/gateway/websocket", &token.id).await.unwrap_err();

    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), tungstenite::http::StatusCode::FORBIDDEN);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn gateway_connect_pushes_an_init_frame() {
    let server = spawn_server().await;
    let acc = account();
    let site_id = SiteId::random();
    let gw = gateway_row(acc.id, site_id);
    let token = token_row(acc.id, TokenKind::Gateway, subject_uuid(gw.id));

    server.state.store.accounts.insert(acc.id, acc.clone());
    server.state.store.gateways.insert(gw.id, gw);
    server.state.store.tokens.insert(token.id, token.clone());

    let (mut socket, _) = connect(server.addr, "/gateway/websocket", &token.id).await.unwrap();

    let frame = recv_json(&mut socket).await;
    assert_eq!(frame["event"], "init");
    assert_eq!(frame["payload"]["account_slug"], acc.slug);
}

#[tokio::test]
async fn client_connect_pushes_authorized_resources_from_existing_grants() {
    let server = spawn_server().await;
    let acc = account();
    let site_id = SiteId::random();
    let actor_id = ActorId::random();
    let client = client_row(acc.id, actor_id);
    let resource = resource_row(acc.id, site_id);
    let gw = gateway_row(acc.id, site_id);
    let group = Group {
        id: GroupId::random(),
        account_id: acc.id,
        name: "everyone".to_string(),
    };
    let membership = Membership {
        id: model::MembershipId::random(),
        account_id: acc.id,
        actor_id,
        group_id: group.id,
    };
    let policy = Policy {
        id: model::PolicyId::random(),
        account_id: acc.id,
        resource_id: resource.id,
        group_id: group.id,
        session_duration: chrono::Duration::hours(8),
        disabled_at: None,
    };
    let authorization = model::PolicyAuthorization {
        id: model::PolicyAuthorizationId::random(),
        account_id: acc.id,
        client_id: client.id,
        resource_id: resource.id,
        gateway_id: gw.id,
        policy_id: policy.id,
        membership_id: membership.id,
        token_id: TokenId::random(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    };
    let token = token_row(acc.id, TokenKind::Client, subject_uuid(client.id));

    server.state.store.accounts.insert(acc.id, acc.clone());
    server.state.store.clients.insert(client.id, client);
    server.state.store.resources.insert(resource.id, resource.clone());
    server.state.store.groups.insert(group.id, group);
    server.state.store.memberships.insert(membership.id, membership);
    server.state.store.policies.insert(policy.id, policy);
    server.state.store.tokens.insert(token.id, token.clone());
    server
        .state
        .store
        .policy_authorizations
        .lock()
        .unwrap()
        .push(authorization);

    let (mut socket, _) = connect(server.addr, "/client/websocket", &token.id).await.unwrap();

    let frame = recv_json(&mut socket).await;
    assert_eq!(frame["event"], "authorized_resources");
    assert_eq!(frame["payload"]["resources"][0]["id"], resource.id.to_string());
    assert_eq!(frame["payload"]["resources"][0]["type"], "dns");
}

/// Drives a full `request_connection` round trip: the Client asks for a
/// resource, the broker picks the online Gateway serving its site and
/// forwards `request_connection`, the Gateway answers `connection_ready`,
/// and the Client receives it back on the same resource id.
#[tokio::test]
async fn client_request_connection_round_trips_through_the_gateway() {
    let server = spawn_server().await;
    let acc = account();
    let site_id = SiteId::random();
    let actor_id = ActorId::random();
    let client = client_row(acc.id, actor_id);
    let resource = resource_row(acc.id, site_id);
    let gw = gateway_row(acc.id, site_id);
    let group = Group {
        id: GroupId::random(),
        account_id: acc.id,
        name: "everyone".to_string(),
    };
    let membership = Membership {
        id: model::MembershipId::random(),
        account_id: acc.id,
        actor_id,
        group_id: group.id,
    };
    let policy = Policy {
        id: model::PolicyId::random(),
        account_id: acc.id,
        resource_id: resource.id,
        group_id: group.id,
        session_duration: chrono::Duration::hours(8),
        disabled_at: None,
    };
    let client_token = token_row(acc.id, TokenKind::Client, subject_uuid(client.id));
    let gateway_token = token_row(acc.id, TokenKind::Gateway, subject_uuid(gw.id));

    server.state.store.accounts.insert(acc.id, acc.clone());
    server.state.store.clients.insert(client.id, client.clone());
    server.state.store.gateways.insert(gw.id, gw.clone());
    server.state.store.resources.insert(resource.id, resource.clone());
    server.state.store.groups.insert(group.id, group);
    server.state.store.memberships.insert(membership.id, membership);
    server.state.store.policies.insert(policy.id, policy);
    server.state.store.tokens.insert(client_token.id, client_token.clone());
    server.state.store.tokens.insert(gateway_token.id, gateway_token.clone());

    let (mut gw_socket, _) = connect(server.addr, "/gateway/websocket", &gateway_token.id)
        .await
        .unwrap();
    let init = recv_json(&mut gw_socket).await;
    assert_eq!(init["event"], "init");

    let (mut client_socket, _) = connect(server.addr, "/client/websocket", &client_token.id)
        .await
        .unwrap();
    let authorized = recv_json(&mut client_socket).await;
    assert_eq!(authorized["event"], "authorized_resources");

    // Give the Gateway Channel's join a moment to land in the presence
    // registry before the Client Channel looks up online gateways.
    tokio::time::sleep(Duration::from_millis(50)).await;

    #[derive(serde::Serialize)]
    #[serde(rename_all = "snake_case", tag = "event", content = "payload")]
    enum Ingress {
        RequestConnection {
            resource_id: ResourceId,
            gateway_id: Option<model::GatewayId>,
            client_payload: String,
            client_preshared_key: String,
        },
    }
    send_envelope(
        &mut client_socket,
        "client",
        Ingress::RequestConnection {
            resource_id: resource.id,
            gateway_id: None,
            client_payload: "offer-sdp".to_string(),
            client_preshared_key: "psk".to_string(),
        },
    )
    .await;

    let push = recv_json(&mut gw_socket).await;
    assert_eq!(push["event"], "request_connection");
    let reference = push["payload"]["ref"].as_str().unwrap().to_string();
    assert_eq!(push["payload"]["client"]["id"], client.id.to_string());

    #[derive(serde::Serialize)]
    #[serde(rename_all = "snake_case", tag = "event", content = "payload")]
    enum GatewayReply {
        ConnectionReady {
            #[serde(rename = "ref")]
            reference: String,
            gateway_payload: String,
        },
    }
    send_envelope(
        &mut gw_socket,
        "gateway",
        GatewayReply::ConnectionReady {
            reference,
            gateway_payload: "answer-sdp".to_string(),
        },
    )
    .await;

    let ready = recv_json(&mut client_socket).await;
    assert_eq!(ready["event"], "connection_ready");
    assert_eq!(ready["payload"]["resource_id"], resource.id.to_string());
    assert_eq!(ready["payload"]["gateway_payload"], "answer-sdp");
}
