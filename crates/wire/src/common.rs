use std::net::{Ipv4Addr, Ipv6Addr};

use model::{GatewayId, RelayId, ResourceId};
use serde::{Deserialize, Serialize};

/// ICE credentials exchanged through the control plane so the Client and
/// Gateway can authenticate candidates peer-to-peer. The control plane never
/// inspects these beyond passing them along.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub ipv4_masquerade_enabled: bool,
    pub ipv6_masquerade_enabled: bool,
}

/// Opaque correlation id minted by the Gateway/Client Channel for a pending
/// `request_connection` / `authorize_flow` exchange, threaded back through
/// `flow_authorized` / `connection_ready`. Distinct from the Phoenix
/// [`crate::envelope::EnvelopeRef`], which correlates one request/reply pair
/// at the transport framing level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingRef(pub String);

impl PendingRef {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Turn,
    Stun,
}

/// Per-relay view pushed in `init.relays` / `relays_presence.connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayView {
    pub id: RelayId,
    #[serde(rename = "type")]
    pub kind: RelayKind,
    pub addr: String,
    pub username: String,
    pub password: String,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlatProtocol {
    Tcp,
    Udp,
    Icmp,
}

/// A single `{protocol, port_range_start, port_range_end}` entry, one per
/// explicit port or range in a resource's filter set (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlatFilter {
    pub protocol: FlatProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_start: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_end: Option<u16>,
}

/// The version-adapted shape of a [`model::Resource`] (§4.8). Produced by
/// `resource-adapter`; pushed verbatim as `allow_access.resource`,
/// `resource_updated`'s payload, and `authorized_resources` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceView {
    Dns {
        id: ResourceId,
        name: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<Vec<FlatFilter>>,
    },
    Cidr {
        id: ResourceId,
        name: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<Vec<FlatFilter>>,
    },
    /// Only ever carries `id` — peers new enough to see it (>= 1.3.0) already
    /// know the rest from the product itself.
    Internet { id: ResourceId },
}

impl ResourceView {
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceView::Dns { id, .. } => *id,
            ResourceView::Cidr { id, .. } => *id,
            ResourceView::Internet { id } => *id,
        }
    }
}

/// A request to forward (or invalidate) ICE candidates to/from a set of
/// clients in a single account, keyed by the originating gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIceCandidates {
    pub gateway_id: GatewayId,
    pub candidates: Vec<String>,
}
