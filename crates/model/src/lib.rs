//! The entities the broker holds or transits.
//!
//! Every type here is a plain data record: the broker stores entities
//! flat, keyed by id, and treats references between them (`resource_id`,
//! `client_id`, ...) as opaque ids rather than pointers, per the "cycles /
//! backrefs" design note — `Resource <-> Policy <-> PolicyAuthorization <->
//! Client <-> Gateway` forms a graph and nothing here owns another entity's
//! lifetime.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[macro_use]
mod make_id;

make_id!(AccountId);
make_id!(ResourceId);
make_id!(PolicyId);
make_id!(GroupId);
make_id!(MembershipId);
make_id!(ActorId);
make_id!(ClientId);
make_id!(GatewayId);
make_id!(SiteId);
make_id!(RelayId);
make_id!(TokenId);
make_id!(PolicyAuthorizationId);

/// Tenant scope. Every other entity is account-scoped; a cache entry,
/// authorization, or cross-reference spanning two accounts is a programming
/// error (Invariant 1/2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub slug: String,
    pub active: bool,
}

/// `ip_stack` only applies to `Resource::Dns`; CIDR/internet resources are
/// dual-stack by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStack {
    Dual,
    Ipv4Only,
    Ipv6Only,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// An inclusive port range. ICMP filters carry no ports; `0..=65535` is used
/// as the "no restriction" sentinel for TCP/UDP when a filter omits ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const ALL: PortRange = PortRange {
        start: 0,
        end: u16::MAX,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub protocol: Protocol,
    /// Empty for ICMP. One explicit port becomes a single-element range.
    pub ports: Vec<PortRange>,
}

/// A protected destination. The `internet` type is a singleton per account
/// (Invariant 3: it cannot be deleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub account_id: AccountId,
    pub name: String,
    pub kind: ResourceKind,
    /// Ordered list of filters; an empty list means allow-all.
    pub filters: Vec<Filter>,
    /// Sites whose Gateways may serve this resource ("connections" in the
    /// product's own vocabulary). Gateway selection for a connection
    /// request is uniformly random among online Gateways whose `site_id`
    /// appears here.
    pub connected_site_ids: Vec<SiteId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    Dns {
        address: String,
        ip_stack: IpStack,
    },
    Ip {
        address: std::net::IpAddr,
    },
    Cidr {
        address: ip_network::IpNetwork,
    },
    /// Singleton per account; implicit address covers all of IPv4 + IPv6.
    Internet,
}

impl Resource {
    pub fn is_internet(&self) -> bool {
        matches!(self.kind, ResourceKind::Internet)
    }
}

/// Permits `{group -> resource}`. A resource edit that changes its type or
/// connections is modeled upstream as delete + insert rather than an
/// in-place update, so a policy's `resource_id` is stable for its whole
/// lifetime even though the resource row it names may get replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub account_id: AccountId,
    pub resource_id: ResourceId,
    pub group_id: GroupId,
    /// How long an authorization minted from this policy remains valid.
    pub session_duration: chrono::Duration,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn is_enabled(&self) -> bool {
        self.disabled_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub account_id: AccountId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub ipv4_address: std::net::Ipv4Addr,
    pub ipv6_address: std::net::Ipv6Addr,
    pub public_key: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_seen_version: String,
    pub last_seen_user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    pub account_id: AccountId,
    pub site_id: SiteId,
    pub ipv4_address: std::net::Ipv4Addr,
    pub ipv6_address: std::net::Ipv6Addr,
    pub public_key: String,
    pub last_seen_version: String,
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    Turn,
    Stun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    /// Derived: `hash(stamp_secret)`. See [`RelayId::from_stamp_secret`].
    pub id: RelayId,
    pub kind: RelayKind,
    /// `ip:port`, IPv4 or IPv6.
    pub addr: String,
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
    pub location: Option<GeoLocation>,
}

impl RelayId {
    /// A relay's id is a pure function of the `stamp_secret` it picked at
    /// startup: reconnecting with the same secret yields the same id, a
    /// restart with a fresh secret yields a new one. Truncates a SHA-256
    /// digest to the 128 bits a UUID holds.
    pub fn from_stamp_secret(stamp_secret: &str) -> Self {
        use sha2::{Digest, Sha256};

        let digest = Sha256::digest(stamp_secret.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(uuid::Uuid::from_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Client,
    Gateway,
    Relay,
    Browser,
    Email,
    ApiClient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub account_id: AccountId,
    pub kind: TokenKind,
    /// The row this token authenticates: a client id, gateway id, relay id,
    /// or actor id depending on `kind`.
    pub subject_id: uuid::Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The decision record produced by the Authorization Resolver. Its
/// lifecycle mirrors the decision: it is destroyed when any contributing
/// row (policy, membership, token, resource, client, gateway) is deleted or
/// disabled (Invariant 5 governs cache entries derived from it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAuthorization {
    pub id: PolicyAuthorizationId,
    /// Denormalized from `client`/`resource` (Invariant 1: the two always
    /// agree) so the change stream can route a deletion without a join.
    pub account_id: AccountId,
    pub client_id: ClientId,
    pub resource_id: ResourceId,
    pub gateway_id: GatewayId,
    pub policy_id: PolicyId,
    pub membership_id: MembershipId,
    pub token_id: TokenId,
    pub expires_at: DateTime<Utc>,
}

/// The authenticated envelope presented to authorization: `(account, actor,
/// credential, token)`.
#[derive(Debug, Clone)]
pub struct Subject {
    pub account_id: AccountId,
    pub actor_id: ActorId,
    pub token: Token,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor={} account={}", self.actor_id, self.account_id)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn id_display_from_str_roundtrip() {
        let id = ResourceId::random();
        let parsed = ResourceId::from_str(&id.to_string()).unwrap();

        assert_eq!(id, parsed);
    }

    #[test]
    fn id_debug_matches_display() {
        let id = GatewayId::random();

        assert_eq!(format!("{id:?}"), format!("{id}"));
    }

    #[test]
    fn internet_resource_is_recognised() {
        let resource = Resource {
            id: ResourceId::random(),
            account_id: AccountId::random(),
            name: "Internet".to_string(),
            kind: ResourceKind::Internet,
            filters: vec![],
            connected_site_ids: vec![],
        };

        assert!(resource.is_internet());
    }

    #[test]
    fn disabled_policy_is_not_enabled() {
        let policy = Policy {
            id: PolicyId::random(),
            account_id: AccountId::random(),
            resource_id: ResourceId::random(),
            group_id: GroupId::random(),
            session_duration: chrono::Duration::hours(8),
            disabled_at: Some(Utc::now()),
        };

        assert!(!policy.is_enabled());
    }

    #[test]
    fn token_expiry_is_inclusive() {
        let now = Utc::now();
        let token = Token {
            id: TokenId::random(),
            account_id: AccountId::random(),
            kind: TokenKind::Client,
            subject_id: uuid::Uuid::new_v4(),
            expires_at: now,
        };

        assert!(token.is_expired(now));
        assert!(!token.is_expired(now - chrono::Duration::seconds(1)));
    }

    #[test]
    fn relay_id_is_stable_for_the_same_stamp_secret() {
        let a = RelayId::from_stamp_secret("secret-1");
        let b = RelayId::from_stamp_secret("secret-1");

        assert_eq!(a, b);
    }

    #[test]
    fn relay_id_changes_with_the_stamp_secret() {
        let a = RelayId::from_stamp_secret("secret-1");
        let b = RelayId::from_stamp_secret("secret-2");

        assert_ne!(a, b);
    }

    #[test]
    fn resource_kind_wire_tag_is_snake_case() {
        let resource = Resource {
            id: ResourceId::from_u128(1),
            account_id: AccountId::from_u128(2),
            name: "github.com".to_string(),
            kind: ResourceKind::Dns {
                address: "github.com".to_string(),
                ip_stack: IpStack::Dual,
            },
            filters: vec![Filter {
                protocol: Protocol::Tcp,
                ports: vec![PortRange {
                    start: 443,
                    end: 443,
                }],
            }],
            connected_site_ids: vec![],
        };

        let json = serde_json::to_value(&resource).unwrap();

        assert_eq!(json["kind"]["type"], "dns");
        assert_eq!(json["kind"]["ip_stack"], "dual");
        assert_eq!(json["filters"][0]["protocol"], "tcp");
    }
}
