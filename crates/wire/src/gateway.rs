//! Wire messages exchanged on a Gateway Channel (§4.5).

use std::net::{Ipv4Addr, Ipv6Addr};

use model::{ClientId, GatewayId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::common::{
    GatewayConfig, IceCredentials, Interface, PendingRef, RelayView, ResourceView,
};

/// Messages a connected Gateway may send to the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum GatewayIngress {
    FlowAuthorized {
        #[serde(rename = "ref")]
        reference: PendingRef,
    },
    ConnectionReady {
        #[serde(rename = "ref")]
        reference: PendingRef,
        gateway_payload: String,
    },
    BroadcastIceCandidates(IceCandidateBroadcast),
    BroadcastInvalidatedIceCandidates(IceCandidateBroadcast),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IceCandidateBroadcast {
    pub client_ids: Vec<ClientId>,
    pub candidates: Vec<String>,
}

/// Messages pushed from the control plane to a connected Gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "payload")]
pub enum GatewayEgress {
    Init(Init),
    RelaysPresence(RelaysPresence),
    AllowAccess(AllowAccess),
    RequestConnection(RequestConnection),
    AuthorizeFlow(AuthorizeFlow),
    ResourceUpdated(ResourceView),
    RejectAccess(RejectAccess),
    AccessAuthorizationExpiryUpdated(AccessAuthorizationExpiryUpdated),
}

#[derive(Debug, Clone, Serialize)]
pub struct Init {
    pub account_slug: String,
    pub interface: Interface,
    pub relays: Vec<RelayView>,
    pub config: GatewayConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaysPresence {
    pub connected: Vec<RelayView>,
    pub disconnected_ids: Vec<model::RelayId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllowAccess {
    #[serde(rename = "ref")]
    pub reference: PendingRef,
    pub resource: ResourceView,
    pub client_id: ClientId,
    pub client_ipv4: Ipv4Addr,
    pub client_ipv6: Ipv6Addr,
    /// Unix seconds.
    pub expires_at: i64,
    pub client_payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPeer {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub public_key: String,
    pub persistent_keepalive: u16,
    pub preshared_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionClient {
    pub id: ClientId,
    pub peer: ConnectionPeer,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestConnection {
    #[serde(rename = "ref")]
    pub reference: PendingRef,
    pub resource: ResourceView,
    /// Unix seconds.
    pub expires_at: i64,
    pub client: ConnectionClient,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeFlowClient {
    pub id: ClientId,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub preshared_key: String,
    pub public_key: String,
    pub version: String,
    pub device_serial: Option<String>,
    pub device_uuid: Option<String>,
    pub identifier_for_vendor: Option<String>,
    pub firebase_installation_id: Option<String>,
    pub device_os_name: Option<String>,
    pub device_os_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeFlowSubject {
    pub auth_provider_id: Option<String>,
    pub actor_id: String,
    pub actor_email: Option<String>,
    pub actor_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeFlow {
    #[serde(rename = "ref")]
    pub reference: PendingRef,
    pub resource: ResourceView,
    pub client: AuthorizeFlowClient,
    pub subject: AuthorizeFlowSubject,
    pub client_ice_credentials: IceCredentials,
    pub gateway_ice_credentials: IceCredentials,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectAccess {
    pub client_id: ClientId,
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessAuthorizationExpiryUpdated {
    pub client_id: ClientId,
    pub resource_id: ResourceId,
    /// Unix seconds; the max over surviving cache entries.
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use model::RelayId;

    use super::*;
    use crate::common::{FlatFilter, FlatProtocol, RelayKind};

    #[test]
    fn can_deserialize_flow_authorized() {
        let json = r#"{"event":"flow_authorized","payload":{"ref":"abc-123"}}"#;

        let message: GatewayIngress = serde_json::from_str(json).unwrap();

        assert!(matches!(
            message,
            GatewayIngress::FlowAuthorized { reference } if reference.0 == "abc-123"
        ));
    }

    #[test]
    fn can_deserialize_broadcast_ice_candidates_with_empty_client_list() {
        let json = r#"{"event":"broadcast_ice_candidates","payload":{"client_ids":[],"candidates":[]}}"#;

        let message: GatewayIngress = serde_json::from_str(json).unwrap();

        let GatewayIngress::BroadcastIceCandidates(broadcast) = message else {
            panic!("wrong variant");
        };
        assert!(broadcast.client_ids.is_empty());
    }

    #[test]
    fn unknown_event_fails_to_deserialize() {
        let json = r#"{"event":"something_else","payload":{}}"#;

        let result = serde_json::from_str::<GatewayIngress>(json);

        assert!(result.is_err());
    }

    #[test]
    fn init_serializes_relays_with_type_turn() {
        let init = Init {
            account_slug: "acme".to_string(),
            interface: Interface {
                ipv4: "100.64.0.1".parse().unwrap(),
                ipv6: "fd00::1".parse().unwrap(),
            },
            relays: vec![RelayView {
                id: RelayId::from_u128(1),
                kind: RelayKind::Turn,
                addr: "172.28.0.101:3478".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
                expires_at: 1_719_367_575,
            }],
            config: GatewayConfig {
                ipv4_masquerade_enabled: true,
                ipv6_masquerade_enabled: true,
            },
        };

        let envelope = crate::Envelope::new("gateway", GatewayEgress::Init(init), None);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["event"], "init");
        assert_eq!(json["payload"]["relays"][0]["type"], "turn");
    }

    #[test]
    fn resource_updated_carries_expanded_filters() {
        let view = ResourceView::Dns {
            id: ResourceId::from_u128(1),
            name: "gitlab".to_string(),
            address: "gitlab.mycorp.com".to_string(),
            filters: Some(vec![FlatFilter {
                protocol: FlatProtocol::Tcp,
                port_range_start: Some(443),
                port_range_end: Some(443),
            }]),
        };

        let message = GatewayEgress::ResourceUpdated(view);
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["event"], "resource_updated");
        assert_eq!(json["payload"]["filters"][0]["port_range_start"], 443);
    }
}
