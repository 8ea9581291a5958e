//! Typed mailbox handles used for direct actor-to-actor sends — the only
//! cross-channel interaction the concurrency model allows besides the
//! PubSub bus (§5). A handle is just a cloneable sender plus the id of the
//! actor it addresses; the actor owns all of its own state exclusively.

use chrono::{DateTime, Utc};
use model::{Client, GatewayId, Resource};
use tokio::sync::mpsc;
use wire::{AuthorizeFlowSubject, IceCredentials, PendingRef};

#[derive(Debug, Clone)]
pub struct GatewayHandle {
    pub gateway_id: GatewayId,
    pub tx: mpsc::Sender<GatewayRequest>,
}

/// A request routed into a Gateway Channel from the Client Channel that
/// originated it.
#[derive(Debug)]
pub enum GatewayRequest {
    /// Full ICE/WireGuard handshake path (`request_connection`).
    RequestConnection {
        reference: PendingRef,
        client: Box<Client>,
        resource: Box<Resource>,
        expires_at: DateTime<Utc>,
        client_payload: String,
        client_preshared_key: String,
        reply_to: ClientHandle,
    },
    /// Pre-exchanged-ICE path (`authorize_flow`).
    AuthorizeFlow {
        reference: PendingRef,
        client: Box<Client>,
        resource: Box<Resource>,
        subject: AuthorizeFlowSubject,
        client_ice_credentials: IceCredentials,
        gateway_ice_credentials: IceCredentials,
        expires_at: DateTime<Utc>,
        reply_to: ClientHandle,
    },
    /// Existing-tunnel shortcut: the Client already has a live peer on
    /// this Gateway from an earlier flow, so no new handshake is needed —
    /// only the new resource's authorization needs pushing.
    AllowAccess {
        client: Box<Client>,
        resource: Box<Resource>,
        expires_at: DateTime<Utc>,
        client_payload: String,
    },
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub client_id: model::ClientId,
    pub tx: mpsc::Sender<ClientReply>,
}

/// A reply routed back into a Client Channel from the Gateway Channel
/// handling its request.
#[derive(Debug)]
pub enum ClientReply {
    ConnectionReady {
        resource_id: model::ResourceId,
        gateway_payload: String,
    },
    FlowCreated {
        resource_id: model::ResourceId,
        gateway_id: GatewayId,
        gateway_public_key: String,
        gateway_ipv4: std::net::Ipv4Addr,
        gateway_ipv6: std::net::Ipv6Addr,
        site_id: model::SiteId,
        preshared_key: String,
        client_ice_credentials: IceCredentials,
        gateway_ice_credentials: IceCredentials,
    },
    FlowCreationFailed {
        resource_id: model::ResourceId,
        reason: wire::FlowFailureReason,
    },
    IceCandidates {
        gateway_id: GatewayId,
        candidates: Vec<String>,
    },
    InvalidatedIceCandidates {
        gateway_id: GatewayId,
        candidates: Vec<String>,
    },
}
