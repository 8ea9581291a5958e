//! The `{topic, event, ref?, payload}` wire protocol spoken by Clients,
//! Gateways, and Relays, and the message vocabulary for the Gateway and
//! Client channels (§4.5, §4.6, §6).

mod client;
mod common;
mod envelope;
mod error;
mod gateway;

pub use client::{
    AuthorizedResources, ClientEgress, ClientIngress, ConnectionReady as ClientConnectionReady,
    CreateFlow, FlowCreated, FlowCreationFailed, FlowFailureReason,
    RequestConnection as ClientRequestConnection, ResourceDeleted,
};
pub use common::{
    FlatFilter, FlatProtocol, GatewayConfig, GatewayIceCandidates, IceCredentials, Interface,
    PendingRef, RelayKind, RelayView, ResourceView,
};
pub use envelope::{
    EnvelopeRef, Envelope, ErrorResponse, Reply, ReplyFrame, PHX_REPLY_EVENT,
};
pub use error::WireError;
pub use gateway::{
    AccessAuthorizationExpiryUpdated, AllowAccess, AuthorizeFlow, AuthorizeFlowClient,
    AuthorizeFlowSubject, ConnectionClient, ConnectionPeer, GatewayEgress, GatewayIngress, Init,
    IceCandidateBroadcast, RejectAccess, RelaysPresence,
    RequestConnection as GatewayRequestConnection,
};
