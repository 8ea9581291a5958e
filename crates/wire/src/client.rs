//! Wire messages exchanged on a Client Channel (§4.6).

use std::net::{Ipv4Addr, Ipv6Addr};

use model::{GatewayId, ResourceId, SiteId};
use serde::{Deserialize, Serialize};

use crate::common::{GatewayIceCandidates, IceCredentials, ResourceView};

/// Messages a connected Client may send to the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum ClientIngress {
    RequestConnection(RequestConnection),
    CreateFlow(CreateFlow),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestConnection {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub gateway_id: Option<GatewayId>,
    pub client_payload: String,
    pub client_preshared_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlow {
    pub resource_id: ResourceId,
    #[serde(default, rename = "connected_gateway_ids")]
    pub preferred_gateways: Vec<GatewayId>,
}

/// Messages pushed from the control plane to a connected Client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum ClientEgress {
    AuthorizedResources(AuthorizedResources),
    ResourceUpdated(ResourceView),
    ResourceDeleted(ResourceDeleted),
    ConnectionReady(ConnectionReady),
    FlowCreated(FlowCreated),
    FlowCreationFailed(FlowCreationFailed),
    IceCandidates(GatewayIceCandidates),
    InvalidatedIceCandidates(GatewayIceCandidates),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizedResources {
    pub resources: Vec<ResourceView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceDeleted {
    pub resource_id: ResourceId,
}

/// The client-side reply to a `request_connection`: the opaque gateway SDP
/// payload, forwarded unmodified from the Gateway Channel's `connection_ready`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReady {
    pub resource_id: ResourceId,
    pub gateway_payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowCreated {
    pub resource_id: ResourceId,
    pub gateway_id: GatewayId,
    pub gateway_public_key: String,
    pub gateway_ipv4: Ipv4Addr,
    pub gateway_ipv6: Ipv6Addr,
    pub site_id: SiteId,
    pub preshared_key: String,
    pub client_ice_credentials: IceCredentials,
    pub gateway_ice_credentials: IceCredentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowFailureReason {
    NotFound,
    Offline,
    VersionMismatch,
    Forbidden,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowCreationFailed {
    pub resource_id: ResourceId,
    pub reason: FlowFailureReason,
}
