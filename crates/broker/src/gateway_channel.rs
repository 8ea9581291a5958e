//! The Gateway Channel actor (C5): one task per connected Gateway, owning
//! its authorization cache, relay selection, and pending-reference table
//! exclusively. Everything it reacts to — a wire ingress frame, a routed
//! [`GatewayRequest`], a change-stream event, a relay presence diff —
//! arrives over its own mailbox; nothing outside this module ever touches
//! its state directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use model::{Account, ClientId, Gateway, Relay, RelayId, Resource, ResourceId};
use semver::Version;
use tokio::sync::mpsc;
use tracing::{info, warn};
use wire::{
    AccessAuthorizationExpiryUpdated, AllowAccess, AuthorizeFlow, ConnectionClient,
    ConnectionPeer, GatewayConfig, GatewayEgress, GatewayIngress, Init, Interface, PendingRef,
    RejectAccess, RelayView, RelaysPresence, RequestConnection as WireRequestConnection,
};

use crate::handles::{ClientReply, GatewayRequest};

/// `(client_id, resource_id) -> {policy_authorization_id -> expires_at}`.
/// The cache Invariant 5 governs: an entry survives only as long as at
/// least one contributing authorization does.
pub type Cache = HashMap<(ClientId, ResourceId), HashMap<model::PolicyAuthorizationId, DateTime<Utc>>>;

enum Pending {
    Connection {
        reply_to: crate::handles::ClientHandle,
        resource_id: ResourceId,
    },
    Flow {
        reply_to: crate::handles::ClientHandle,
        resource_id: ResourceId,
        gateway_public_key: String,
        gateway_ipv4: std::net::Ipv4Addr,
        gateway_ipv6: std::net::Ipv6Addr,
        site_id: model::SiteId,
        preshared_key: String,
        client_ice_credentials: wire::IceCredentials,
        gateway_ice_credentials: wire::IceCredentials,
    },
}

pub struct GatewayChannelState {
    pub gateway: Gateway,
    pub account: Account,
    pub token_id: model::TokenId,
    pub last_lsn: i64,
    pub cache: Cache,
    pub relay_selection: Vec<Relay>,
    pending: HashMap<PendingRef, Pending>,
}

impl GatewayChannelState {
    pub fn new(gateway: Gateway, account: Account, token_id: model::TokenId) -> Self {
        Self {
            gateway,
            account,
            token_id,
            last_lsn: 0,
            cache: HashMap::new(),
            relay_selection: Vec::new(),
            pending: HashMap::new(),
        }
    }

    fn peer_version(&self) -> Version {
        Version::parse(&self.gateway.last_seen_version).unwrap_or(Version::new(0, 0, 0))
    }

    fn init_message(&self) -> Init {
        Init {
            account_slug: self.account.slug.clone(),
            interface: Interface {
                ipv4: self.gateway.ipv4_address,
                ipv6: self.gateway.ipv6_address,
            },
            relays: self.relay_selection.iter().map(to_relay_view).collect(),
            config: GatewayConfig {
                ipv4_masquerade_enabled: true,
                ipv6_masquerade_enabled: true,
            },
        }
    }
}

/// Parses the `{os_name}/{os_version}` leading token out of a client's
/// self-reported user agent (the shape the product's own agent software
/// sends, e.g. `"macOS/14.1 connlib/1.3.0 (arm64; 22.6.0)"`). Anything that
/// doesn't start with a `name/version` token yields `(None, None)`.
fn parse_user_agent_os(user_agent: &str) -> (Option<String>, Option<String>) {
    let Some(first_token) = user_agent.split_whitespace().next() else {
        return (None, None);
    };
    match first_token.split_once('/') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            (Some(name.to_string()), Some(version.to_string()))
        }
        _ => (None, None),
    }
}

pub fn to_relay_view(relay: &Relay) -> RelayView {
    RelayView {
        id: relay.id,
        kind: match relay.kind {
            model::RelayKind::Turn => wire::RelayKind::Turn,
            model::RelayKind::Stun => wire::RelayKind::Stun,
        },
        addr: relay.addr.clone(),
        username: relay.username.clone(),
        password: relay.password.clone(),
        expires_at: relay.expires_at.timestamp(),
    }
}

/// The wire pushes one state transition produced, plus whether the
/// transition means the channel must now terminate (gateway or its token
/// was deleted).
#[derive(Default)]
pub struct Effect {
    pub messages: Vec<GatewayEgress>,
    pub terminate: bool,
}

impl Effect {
    fn push(msg: GatewayEgress) -> Self {
        Self {
            messages: vec![msg],
            terminate: false,
        }
    }
}

/// Applies one change-stream event to the cache/account state, producing
/// the wire pushes it causes (§4.5's three-way resource reaction, the
/// cache-shrink-or-evict policy-authorization reaction, and the two
/// terminate-the-channel reactions). LSN replay-guarding (Invariant 6)
/// happens first: an event at or below the last applied LSN never reaches
/// the match arms below.
pub fn apply_change_event(
    state: &mut GatewayChannelState,
    event: &changestream::DomainEvent,
) -> Effect {
    if event.lsn() <= state.last_lsn {
        return Effect::default();
    }
    state.last_lsn = event.lsn();

    match event {
        changestream::DomainEvent::PolicyAuthorizationDeleted(e) => {
            let key = (e.client_id, e.resource_id);
            let Some(inner) = state.cache.get_mut(&key) else {
                return Effect::default();
            };
            if inner.remove(&e.policy_authorization_id).is_none() {
                return Effect::default();
            }
            if inner.is_empty() {
                state.cache.remove(&key);
                Effect::push(GatewayEgress::RejectAccess(RejectAccess {
                    client_id: e.client_id,
                    resource_id: e.resource_id,
                }))
            } else {
                let max_expiry = inner.values().max().copied().expect("checked non-empty");
                Effect::push(GatewayEgress::AccessAuthorizationExpiryUpdated(
                    AccessAuthorizationExpiryUpdated {
                        client_id: e.client_id,
                        resource_id: e.resource_id,
                        expires_at: max_expiry.timestamp(),
                    },
                ))
            }
        }
        changestream::DomainEvent::ResourceUpdated(e) => {
            if e.old.kind != e.new.kind {
                let messages = state
                    .cache
                    .keys()
                    .filter(|&&(_, resource_id)| resource_id == e.resource_id)
                    .map(|&(client_id, resource_id)| {
                        GatewayEgress::RejectAccess(RejectAccess {
                            client_id,
                            resource_id,
                        })
                    })
                    .collect::<Vec<_>>();
                Effect {
                    messages,
                    terminate: false,
                }
            } else if e.old.filters != e.new.filters {
                match resource_adapter::adapt(&e.new, &state.peer_version()) {
                    resource_adapter::Adapted::Cont(view) => {
                        Effect::push(GatewayEgress::ResourceUpdated(view))
                    }
                    resource_adapter::Adapted::Drop => Effect::default(),
                }
            } else {
                Effect::default()
            }
        }
        changestream::DomainEvent::AccountSlugChanged(e) => {
            if e.account_id != state.account.id {
                return Effect::default();
            }
            state.account.slug = e.new_slug.clone();
            Effect::push(GatewayEgress::Init(state.init_message()))
        }
        changestream::DomainEvent::GatewayDeleted(e) => Effect {
            messages: vec![],
            terminate: e.gateway_id == state.gateway.id,
        },
        changestream::DomainEvent::TokenDeleted(e) => Effect {
            messages: vec![],
            terminate: e.token_id == state.token_id,
        },
    }
}

/// Drops expired cache entries. Pure and silent: no wire message is owed
/// to the Gateway just because a cache entry it never queried lapsed.
pub fn prune_cache(cache: &mut Cache, now: DateTime<Utc>) {
    cache.retain(|_, inner| {
        inner.retain(|_, expires_at| *expires_at > now);
        !inner.is_empty()
    });
}

/// Recomputes the relay selection against currently present relays,
/// returning `None` when the selected id set hasn't actually changed (so
/// the caller suppresses a spurious `relays_presence` push).
pub fn recompute_relays(
    state: &GatewayChannelState,
    present: &[Relay],
    n: usize,
) -> Option<(Vec<Relay>, relay_selector::SelectionDiff)> {
    let selected = relay_selector::select(state.gateway.location, present, n);

    let previous_ids: std::collections::HashSet<RelayId> =
        state.relay_selection.iter().map(|r| r.id).collect();
    let new_ids: std::collections::HashSet<RelayId> = selected.iter().map(|r| r.id).collect();
    if previous_ids == new_ids {
        return None;
    }

    let diff = relay_selector::diff(&state.relay_selection, &selected);
    Some((selected, diff))
}

/// Shared dependencies handed to every Gateway Channel task.
pub struct Deps {
    pub gateways: Arc<presence::Registry<model::GatewayId, ()>>,
    pub relays: Arc<presence::Registry<RelayId, Relay>>,
    pub change_bus: Arc<pubsub::Bus<changestream::DomainEvent>>,
    pub client_directory: Arc<DashMap<ClientId, crate::handles::ClientHandle>>,
    pub relay_count: usize,
    pub prune_interval: Duration,
    pub relay_debounce: Duration,
}

/// Runs one Gateway Channel to completion: joins presence, pushes the
/// initial `init`, then services its mailboxes until the Gateway or its
/// token is deleted, or its wire connection closes.
pub async fn run(
    mut state: GatewayChannelState,
    mut wire_rx: mpsc::Receiver<GatewayIngress>,
    outbox: mpsc::Sender<GatewayEgress>,
    mut request_rx: mpsc::Receiver<GatewayRequest>,
    deps: Deps,
) {
    let holder = presence::HolderId::next();
    let gateway_id = state.gateway.id;
    let account_id = state.account.id;

    let present_relays = deps
        .relays
        .online_in_account(&account_id)
        .into_iter()
        .map(|(_, relay)| relay)
        .collect::<Vec<_>>();
    if let Some((selected, _diff)) = recompute_relays(&state, &present_relays, deps.relay_count) {
        state.relay_selection = selected;
    }

    deps.gateways.join(
        gateway_id,
        account_id,
        (),
        holder,
        &pubsub::Topic::gateway_presence(account_id),
    );

    if outbox
        .send(GatewayEgress::Init(state.init_message()))
        .await
        .is_err()
    {
        return;
    }

    let change_sub = pubsub::SubscriberId::next();
    let mut change_rx = deps
        .change_bus
        .subscribe(pubsub::Topic::account(account_id), change_sub);
    let relay_sub = pubsub::SubscriberId::next();
    let mut relay_diff_rx = deps
        .relays
        .subscribe(pubsub::Topic::relay_presence(account_id), relay_sub);

    let mut prune_ticker = tokio::time::interval(deps.prune_interval);
    prune_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut relay_ticker = tokio::time::interval(deps.relay_debounce);
    relay_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut relay_dirty = false;

    loop {
        tokio::select! {
            frame = wire_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    GatewayIngress::BroadcastIceCandidates(broadcast) => {
                        broadcast_ice_candidates(&deps.client_directory, gateway_id, broadcast, false);
                    }
                    GatewayIngress::BroadcastInvalidatedIceCandidates(broadcast) => {
                        broadcast_ice_candidates(&deps.client_directory, gateway_id, broadcast, true);
                    }
                    other => handle_ingress(&mut state, other),
                }
            }
            request = request_rx.recv() => {
                let Some(request) = request else { break };
                if let Some(push) = handle_request(&mut state, request) {
                    if outbox.send(push).await.is_err() {
                        break;
                    }
                }
            }
            event = change_rx.recv() => {
                let Some(event) = event else { break };
                let effect = apply_change_event(&mut state, &event);
                for message in effect.messages {
                    if outbox.send(message).await.is_err() {
                        break;
                    }
                }
                if effect.terminate {
                    info!(%gateway_id, "gateway channel terminating: underlying row deleted");
                    break;
                }
            }
            diff = relay_diff_rx.recv() => {
                if diff.is_none() { break }
                relay_dirty = true;
            }
            _ = relay_ticker.tick() => {
                if !relay_dirty { continue; }
                relay_dirty = false;
                let present = deps.relays.online_in_account(&account_id).into_iter().map(|(_, r)| r).collect::<Vec<_>>();
                if let Some((selected, diff)) = recompute_relays(&state, &present, deps.relay_count) {
                    state.relay_selection = selected;
                    let push = GatewayEgress::RelaysPresence(RelaysPresence {
                        connected: state.relay_selection.iter().map(to_relay_view).collect(),
                        disconnected_ids: diff.disconnected_ids,
                    });
                    if outbox.send(push).await.is_err() {
                        break;
                    }
                }
            }
            _ = prune_ticker.tick() => {
                prune_cache(&mut state.cache, Utc::now());
            }
        }
    }

    deps.change_bus
        .unsubscribe(&pubsub::Topic::account(account_id), change_sub);
    let _ = relay_sub;
    deps.gateways
        .leave(&gateway_id, holder, &pubsub::Topic::gateway_presence(account_id));
}

fn handle_ingress(state: &mut GatewayChannelState, frame: GatewayIngress) {
    match frame {
        GatewayIngress::FlowAuthorized { reference } => {
            let Some(Pending::Flow {
                reply_to,
                resource_id,
                gateway_public_key,
                gateway_ipv4,
                gateway_ipv6,
                site_id,
                preshared_key,
                client_ice_credentials,
                gateway_ice_credentials,
            }) = state.pending.remove(&reference)
            else {
                warn!(?reference, "flow_authorized for an unknown or already-resolved ref");
                return;
            };
            let _ = reply_to.tx.try_send(ClientReply::FlowCreated {
                resource_id,
                gateway_id: state.gateway.id,
                gateway_public_key,
                gateway_ipv4,
                gateway_ipv6,
                site_id,
                preshared_key,
                client_ice_credentials,
                gateway_ice_credentials,
            });
        }
        GatewayIngress::ConnectionReady {
            reference,
            gateway_payload,
        } => {
            let Some(Pending::Connection {
                reply_to,
                resource_id,
            }) = state.pending.remove(&reference)
            else {
                warn!(?reference, "connection_ready for an unknown or already-resolved ref");
                return;
            };
            let _ = reply_to.tx.try_send(ClientReply::ConnectionReady {
                resource_id,
                gateway_payload,
            });
        }
        GatewayIngress::BroadcastIceCandidates(_) | GatewayIngress::BroadcastInvalidatedIceCandidates(_) => {
            unreachable!("dispatched to broadcast_ice_candidates by the caller before reaching here")
        }
    }
}

/// Forwards a Gateway's ICE candidate broadcast to every client named in
/// it, wrapping the candidates/gateway id as the client-side push. Split
/// out from [`handle_ingress`] because it needs the shared client
/// directory, which the per-channel `state` doesn't carry.
pub fn broadcast_ice_candidates(
    directory: &DashMap<ClientId, crate::handles::ClientHandle>,
    gateway_id: model::GatewayId,
    broadcast: wire::IceCandidateBroadcast,
    invalidated: bool,
) {
    for client_id in broadcast.client_ids {
        let Some(handle) = directory.get(&client_id) else {
            continue;
        };
        let reply = if invalidated {
            ClientReply::InvalidatedIceCandidates {
                gateway_id,
                candidates: broadcast.candidates.clone(),
            }
        } else {
            ClientReply::IceCandidates {
                gateway_id,
                candidates: broadcast.candidates.clone(),
            }
        };
        let _ = handle.tx.try_send(reply);
    }
}

fn handle_request(state: &mut GatewayChannelState, request: GatewayRequest) -> Option<GatewayEgress> {
    match request {
        GatewayRequest::RequestConnection {
            reference,
            client,
            resource,
            expires_at,
            client_payload,
            client_preshared_key,
            reply_to,
        } => {
            let view = resource_view_for(state, &resource)?;
            state.pending.insert(
                reference.clone(),
                Pending::Connection {
                    reply_to,
                    resource_id: resource.id,
                },
            );
            Some(GatewayEgress::RequestConnection(WireRequestConnection {
                reference,
                resource: view,
                expires_at: expires_at.timestamp(),
                client: ConnectionClient {
                    id: client.id,
                    peer: ConnectionPeer {
                        ipv4: client.ipv4_address,
                        ipv6: client.ipv6_address,
                        public_key: client.public_key,
                        persistent_keepalive: 25,
                        preshared_key: client_preshared_key,
                    },
                    payload: client_payload,
                },
            }))
        }
        GatewayRequest::AuthorizeFlow {
            reference,
            client,
            resource,
            subject,
            client_ice_credentials,
            gateway_ice_credentials,
            expires_at,
            reply_to,
        } => {
            let view = resource_view_for(state, &resource)?;
            let (device_os_name, device_os_version) = client
                .last_seen_user_agent
                .as_deref()
                .map(parse_user_agent_os)
                .unwrap_or((None, None));
            state.pending.insert(
                reference.clone(),
                Pending::Flow {
                    reply_to,
                    resource_id: resource.id,
                    gateway_public_key: state.gateway.public_key.clone(),
                    gateway_ipv4: state.gateway.ipv4_address,
                    gateway_ipv6: state.gateway.ipv6_address,
                    site_id: state.gateway.site_id,
                    preshared_key: client_ice_credentials.password.clone(),
                    client_ice_credentials: client_ice_credentials.clone(),
                    gateway_ice_credentials: gateway_ice_credentials.clone(),
                },
            );
            Some(GatewayEgress::AuthorizeFlow(AuthorizeFlow {
                reference,
                resource: view,
                client: wire::AuthorizeFlowClient {
                    id: client.id,
                    ipv4: client.ipv4_address,
                    ipv6: client.ipv6_address,
                    preshared_key: client_ice_credentials.password.clone(),
                    public_key: client.public_key,
                    version: client.last_seen_version,
                    device_serial: None,
                    device_uuid: None,
                    identifier_for_vendor: None,
                    firebase_installation_id: None,
                    device_os_name,
                    device_os_version,
                },
                subject,
                client_ice_credentials,
                gateway_ice_credentials,
                expires_at: expires_at.timestamp(),
            }))
        }
        GatewayRequest::AllowAccess {
            client,
            resource,
            expires_at,
            client_payload,
        } => {
            let view = resource_view_for(state, &resource)?;
            Some(GatewayEgress::AllowAccess(AllowAccess {
                reference: PendingRef::random(),
                resource: view,
                client_id: client.id,
                client_ipv4: client.ipv4_address,
                client_ipv6: client.ipv6_address,
                expires_at: expires_at.timestamp(),
                client_payload,
            }))
        }
    }
}

fn resource_view_for(state: &GatewayChannelState, resource: &Resource) -> Option<wire::ResourceView> {
    resource_adapter::adapt(resource, &state.peer_version()).into_option()
}
