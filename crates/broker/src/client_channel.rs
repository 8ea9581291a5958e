//! The Client Channel actor (C6): one task per connected Client. Owns its
//! authorized-resource cache and in-flight request table exclusively;
//! resolves authorization synchronously through [`authz::resolve`] and
//! routes the resulting wire exchange through the target Gateway Channel's
//! [`crate::handles::GatewayHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use model::{Client, ClientId, GatewayId, Resource, ResourceId, SiteId, Subject};
use rand::seq::SliceRandom;
use semver::Version;
use tokio::sync::mpsc;
use wire::{
    AuthorizeFlowSubject, ClientEgress, ClientIngress, FlowFailureReason, IceCredentials,
    PendingRef,
};

use crate::handles::{ClientHandle, ClientReply, GatewayHandle, GatewayRequest};
use crate::store::InMemoryStore;

/// Maps an [`authz::Rejection`] onto the client-facing failure taxonomy.
/// `wire::FlowFailureReason` is narrower than `authz::Rejection` — every
/// account/token-level rejection collapses onto `Forbidden` from the
/// Client's point of view.
pub fn map_rejection(rejection: authz::Rejection) -> FlowFailureReason {
    match rejection {
        authz::Rejection::NotFound => FlowFailureReason::NotFound,
        authz::Rejection::Unauthorized
        | authz::Rejection::AccountDisabled
        | authz::Rejection::Expired
        | authz::Rejection::Internal => FlowFailureReason::Forbidden,
    }
}

/// Picks a Gateway to serve `resource`: the caller's `preferred` id if it
/// is online and actually serves this resource's sites, else uniformly
/// random among online gateways whose `site_id` is one of the resource's
/// connections (§4.6). `None` when no eligible Gateway is online.
pub fn select_gateway(
    resource: &Resource,
    online_gateways: &[(GatewayId, SiteId)],
    preferred: Option<GatewayId>,
    rng: &mut impl rand::Rng,
) -> Option<GatewayId> {
    let eligible: Vec<GatewayId> = online_gateways
        .iter()
        .filter(|(_, site_id)| resource.connected_site_ids.contains(site_id))
        .map(|(id, _)| *id)
        .collect();

    if let Some(wanted) = preferred {
        return eligible.contains(&wanted).then_some(wanted);
    }

    eligible.choose(rng).copied()
}

struct PendingRequest {
    resource_id: ResourceId,
    deadline: Instant,
}

pub struct ClientChannelState {
    pub client: Client,
    pub account: model::Account,
    pub subject: Subject,
    pub last_lsn: i64,
    pub resources: HashMap<ResourceId, wire::ResourceView>,
    pending: HashMap<PendingRef, PendingRequest>,
    /// Gateways this Client already has a live peer on, from an earlier
    /// flow — lets a later authorization on the same Gateway skip the ICE
    /// handshake via `allow_access` instead of a full `request_connection`
    /// / `authorize_flow` round trip.
    established_gateways: HashSet<GatewayId>,
}

impl ClientChannelState {
    pub fn new(client: Client, account: model::Account, subject: Subject) -> Self {
        Self {
            client,
            account,
            subject,
            last_lsn: 0,
            resources: HashMap::new(),
            pending: HashMap::new(),
            established_gateways: HashSet::new(),
        }
    }

    fn peer_version(&self) -> Version {
        Version::parse(&self.client.last_seen_version).unwrap_or(Version::new(0, 0, 0))
    }
}

/// Applies a change-stream event to the authorized-resource cache,
/// producing the client-facing push it causes, if any. Mirrors the
/// Gateway Channel's `apply_change_event` LSN-guard discipline.
pub fn apply_change_event(
    state: &mut ClientChannelState,
    event: &changestream::DomainEvent,
) -> Option<ClientEgress> {
    if event.lsn() <= state.last_lsn {
        return None;
    }
    state.last_lsn = event.lsn();

    match event {
        changestream::DomainEvent::ResourceUpdated(e) => {
            if !state.resources.contains_key(&e.resource_id) {
                return None;
            }
            match resource_adapter::adapt(&e.new, &state.peer_version()) {
                resource_adapter::Adapted::Cont(view) => {
                    state.resources.insert(e.resource_id, view.clone());
                    Some(ClientEgress::ResourceUpdated(view))
                }
                resource_adapter::Adapted::Drop => {
                    state.resources.remove(&e.resource_id);
                    Some(ClientEgress::ResourceDeleted(wire::ResourceDeleted {
                        resource_id: e.resource_id,
                    }))
                }
            }
        }
        changestream::DomainEvent::PolicyAuthorizationDeleted(e) => {
            if e.client_id != state.client.id {
                return None;
            }
            if state.resources.remove(&e.resource_id).is_none() {
                return None;
            }
            Some(ClientEgress::ResourceDeleted(wire::ResourceDeleted {
                resource_id: e.resource_id,
            }))
        }
        _ => None,
    }
}

/// Sweeps pending references past their deadline, returning the failures
/// to push (§4.6: "offline" once the Gateway doesn't answer in time).
pub fn sweep_expired(state: &mut ClientChannelState, now: Instant) -> Vec<ClientEgress> {
    let expired: Vec<PendingRef> = state
        .pending
        .iter()
        .filter(|(_, p)| p.deadline <= now)
        .map(|(reference, _)| reference.clone())
        .collect();

    expired
        .into_iter()
        .filter_map(|reference| {
            state.pending.remove(&reference).map(|p| {
                ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: p.resource_id,
                    reason: FlowFailureReason::Offline,
                })
            })
        })
        .collect()
}

/// Shared dependencies handed to every Client Channel task.
pub struct Deps {
    pub store: Arc<InMemoryStore>,
    pub clients: Arc<presence::Registry<ClientId, ()>>,
    pub gateways: Arc<presence::Registry<GatewayId, ()>>,
    pub change_bus: Arc<pubsub::Bus<changestream::DomainEvent>>,
    pub client_directory: Arc<DashMap<ClientId, ClientHandle>>,
    pub gateway_directory: Arc<DashMap<GatewayId, GatewayHandle>>,
    pub request_timeout: Duration,
}

pub async fn run(
    mut state: ClientChannelState,
    mut wire_rx: mpsc::Receiver<ClientIngress>,
    outbox: mpsc::Sender<ClientEgress>,
    mut reply_rx: mpsc::Receiver<ClientReply>,
    self_handle: ClientHandle,
    deps: Deps,
) {
    let holder = presence::HolderId::next();
    let client_id = state.client.id;
    let account_id = state.account.id;
    let actor_id = state.subject.actor_id;

    let initial: Vec<wire::ResourceView> = deps
        .store
        .policy_authorizations_for_client(client_id)
        .into_iter()
        .filter_map(|pa| {
            let resource = deps.store.resource(pa.resource_id)?;
            let view = resource_adapter::adapt(&resource, &state.peer_version()).into_option()?;
            state.resources.insert(pa.resource_id, view.clone());
            Some(view)
        })
        .collect();

    deps.clients
        .join(client_id, account_id, (), holder, &pubsub::Topic::client(account_id));
    deps.clients.join(
        client_id,
        account_id,
        (),
        holder,
        &pubsub::Topic::actor_clients(actor_id),
    );
    deps.client_directory.insert(client_id, self_handle);

    if outbox
        .send(ClientEgress::AuthorizedResources(wire::AuthorizedResources {
            resources: initial,
        }))
        .await
        .is_err()
    {
        deps.client_directory.remove(&client_id);
        return;
    }

    let change_sub = pubsub::SubscriberId::next();
    let mut change_rx = deps
        .change_bus
        .subscribe(pubsub::Topic::account(account_id), change_sub);

    let mut sweep_ticker = tokio::time::interval(Duration::from_secs(1));
    sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = wire_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Some(failure) = handle_ingress(&mut state, frame, &deps).await {
                    if outbox.send(failure).await.is_err() {
                        break;
                    }
                }
            }
            reply = reply_rx.recv() => {
                let Some(reply) = reply else { break };
                if let Some(push) = handle_gateway_reply(&mut state, reply) {
                    if outbox.send(push).await.is_err() {
                        break;
                    }
                }
            }
            event = change_rx.recv() => {
                let Some(event) = event else { break };
                if let Some(push) = apply_change_event(&mut state, &event) {
                    if outbox.send(push).await.is_err() {
                        break;
                    }
                }
            }
            _ = sweep_ticker.tick() => {
                for failure in sweep_expired(&mut state, Instant::now()) {
                    if outbox.send(failure).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    deps.change_bus
        .unsubscribe(&pubsub::Topic::account(account_id), change_sub);
    deps.client_directory.remove(&client_id);
    deps.clients
        .leave(&client_id, holder, &pubsub::Topic::client(account_id));
    deps.clients
        .leave(&client_id, holder, &pubsub::Topic::actor_clients(actor_id));
}

async fn handle_ingress(
    state: &mut ClientChannelState,
    frame: ClientIngress,
    deps: &Deps,
) -> Option<ClientEgress> {
    match frame {
        ClientIngress::RequestConnection(req) => {
            let resource = deps.store.resource(req.resource_id)?;
            let online = online_gateways(deps, state.account.id);
            let Some(gateway_id) =
                select_gateway(&resource, &online, req.gateway_id, &mut rand::thread_rng())
            else {
                return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: req.resource_id,
                    reason: FlowFailureReason::Offline,
                }));
            };
            let Some(gateway_handle) = deps.gateway_directory.get(&gateway_id) else {
                return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: req.resource_id,
                    reason: FlowFailureReason::Offline,
                }));
            };

            let authorization = match authz::resolve(
                &state.client,
                &resource,
                &state.subject,
                gateway_id,
                deps.store.as_ref(),
                Utc::now(),
            ) {
                Ok(a) => a,
                Err(rejection) => {
                    return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                        resource_id: req.resource_id,
                        reason: map_rejection(rejection),
                    }));
                }
            };

            let reference = PendingRef::random();
            state.pending.insert(
                reference.clone(),
                PendingRequest {
                    resource_id: req.resource_id,
                    deadline: Instant::now() + deps.request_timeout,
                },
            );

            let sent = gateway_handle.tx.try_send(GatewayRequest::RequestConnection {
                reference,
                client: Box::new(state.client.clone()),
                resource: Box::new(resource),
                expires_at: authorization.expires_at,
                client_payload: req.client_payload,
                client_preshared_key: req.client_preshared_key,
                reply_to: deps
                    .client_directory
                    .get(&state.client.id)
                    .map(|h| h.clone())
                    .expect("registered before ingress is served"),
            });
            if sent.is_err() {
                state.pending.clear();
                return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: req.resource_id,
                    reason: FlowFailureReason::Offline,
                }));
            }
            None
        }
        ClientIngress::CreateFlow(req) => {
            let resource = deps.store.resource(req.resource_id)?;
            let online = online_gateways(deps, state.account.id);
            let preferred = req
                .preferred_gateways
                .iter()
                .find(|id| online.iter().any(|(gw, _)| gw == *id))
                .copied();
            let Some(gateway_id) = select_gateway(&resource, &online, preferred, &mut rand::thread_rng())
            else {
                return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: req.resource_id,
                    reason: FlowFailureReason::Offline,
                }));
            };
            let Some(gateway_handle) = deps.gateway_directory.get(&gateway_id) else {
                return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: req.resource_id,
                    reason: FlowFailureReason::Offline,
                }));
            };

            let authorization = match authz::resolve(
                &state.client,
                &resource,
                &state.subject,
                gateway_id,
                deps.store.as_ref(),
                Utc::now(),
            ) {
                Ok(a) => a,
                Err(rejection) => {
                    return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                        resource_id: req.resource_id,
                        reason: map_rejection(rejection),
                    }));
                }
            };

            if state.established_gateways.contains(&gateway_id) {
                let _ = gateway_handle.tx.try_send(GatewayRequest::AllowAccess {
                    client: Box::new(state.client.clone()),
                    resource: Box::new(resource),
                    expires_at: authorization.expires_at,
                    client_payload: String::new(),
                });
                return None;
            }

            let reference = PendingRef::random();
            let client_ice = IceCredentials {
                username: uuid::Uuid::new_v4().to_string(),
                password: uuid::Uuid::new_v4().to_string(),
            };
            let gateway_ice = IceCredentials {
                username: uuid::Uuid::new_v4().to_string(),
                password: uuid::Uuid::new_v4().to_string(),
            };
            state.pending.insert(
                reference.clone(),
                PendingRequest {
                    resource_id: req.resource_id,
                    deadline: Instant::now() + deps.request_timeout,
                },
            );

            let sent = gateway_handle.tx.try_send(GatewayRequest::AuthorizeFlow {
                reference,
                client: Box::new(state.client.clone()),
                resource: Box::new(resource),
                subject: AuthorizeFlowSubject {
                    auth_provider_id: None,
                    actor_id: state.subject.actor_id.to_string(),
                    actor_email: None,
                    actor_name: String::new(),
                },
                client_ice_credentials: client_ice,
                gateway_ice_credentials: gateway_ice,
                expires_at: authorization.expires_at,
                reply_to: deps
                    .client_directory
                    .get(&state.client.id)
                    .map(|h| h.clone())
                    .expect("registered before ingress is served"),
            });
            if sent.is_err() {
                return Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                    resource_id: req.resource_id,
                    reason: FlowFailureReason::Offline,
                }));
            }
            state.established_gateways.insert(gateway_id);
            None
        }
    }
}

fn handle_gateway_reply(state: &mut ClientChannelState, reply: ClientReply) -> Option<ClientEgress> {
    match reply {
        ClientReply::ConnectionReady {
            resource_id,
            gateway_payload,
        } => {
            retire_pending_for(state, resource_id);
            Some(ClientEgress::ConnectionReady(wire::ConnectionReady {
                resource_id,
                gateway_payload,
            }))
        }
        ClientReply::FlowCreated {
            resource_id,
            gateway_id,
            gateway_public_key,
            gateway_ipv4,
            gateway_ipv6,
            site_id,
            preshared_key,
            client_ice_credentials,
            gateway_ice_credentials,
        } => {
            retire_pending_for(state, resource_id);
            Some(ClientEgress::FlowCreated(wire::FlowCreated {
                resource_id,
                gateway_id,
                gateway_public_key,
                gateway_ipv4,
                gateway_ipv6,
                site_id,
                preshared_key,
                client_ice_credentials,
                gateway_ice_credentials,
            }))
        }
        ClientReply::FlowCreationFailed { resource_id, reason } => {
            retire_pending_for(state, resource_id);
            state.established_gateways.clear();
            Some(ClientEgress::FlowCreationFailed(wire::FlowCreationFailed {
                resource_id,
                reason,
            }))
        }
        ClientReply::IceCandidates { gateway_id, candidates } => Some(ClientEgress::IceCandidates(
            wire::GatewayIceCandidates { gateway_id, candidates },
        )),
        ClientReply::InvalidatedIceCandidates { gateway_id, candidates } => {
            Some(ClientEgress::InvalidatedIceCandidates(wire::GatewayIceCandidates {
                gateway_id,
                candidates,
            }))
        }
    }
}

fn retire_pending_for(state: &mut ClientChannelState, resource_id: ResourceId) {
    state.pending.retain(|_, p| p.resource_id != resource_id);
}

fn online_gateways(deps: &Deps, account_id: model::AccountId) -> Vec<(GatewayId, SiteId)> {
    deps.gateways
        .online_in_account(&account_id)
        .into_iter()
        .filter_map(|(id, ())| deps.store.gateway(id).map(|g| (id, g.site_id)))
        .collect()
}
