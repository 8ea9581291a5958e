//! Rewrites a [`model::Resource`] into the [`wire::ResourceView`] shape a
//! peer's reported agent version can parse (C8). A pure function: given a
//! resource and a version, it either produces a view or reports that the
//! resource cannot be expressed for that peer at all.
//!
//! Kept table-driven by version the way legacy wire formats tend to
//! accumulate: one gate for the `internet` singleton, one for the
//! pre-1.2.0 DNS glob encoding, and a filter-expansion step shared by every
//! version new enough to receive a resource at all.

use model::{Filter, Protocol, Resource, ResourceKind};
use semver::Version;
use wire::{FlatFilter, FlatProtocol, ResourceView};

/// The agent version below which `filters` started being sent as a flat
/// `{protocol, port_range_start, port_range_end}` list rather than the
/// legacy ordered-range shape.
pub const FILTERS_EXPANDED_SINCE: Version = Version::new(1, 2, 0);

/// The agent version below which the `internet` resource type does not
/// exist on the peer at all.
pub const INTERNET_RESOURCE_SINCE: Version = Version::new(1, 3, 0);

/// Outcome of adapting one resource for one peer version.
#[derive(Debug, Clone, PartialEq)]
pub enum Adapted {
    /// The resource can be expressed to this peer.
    Cont(ResourceView),
    /// The peer's version cannot represent this resource at all; the
    /// caller must suppress any push that would have carried it.
    Drop,
}

impl Adapted {
    pub fn into_option(self) -> Option<ResourceView> {
        match self {
            Adapted::Cont(view) => Some(view),
            Adapted::Drop => None,
        }
    }
}

/// Adapts `resource` for a peer reporting `peer_version`.
pub fn adapt(resource: &Resource, peer_version: &Version) -> Adapted {
    match &resource.kind {
        ResourceKind::Internet => {
            if *peer_version >= INTERNET_RESOURCE_SINCE {
                Adapted::Cont(ResourceView::Internet { id: resource.id })
            } else {
                Adapted::Drop
            }
        }
        ResourceKind::Dns { address, .. } => {
            let address = if *peer_version >= FILTERS_EXPANDED_SINCE {
                address.clone()
            } else {
                match legacy_dns_glob(address) {
                    Some(a) => a,
                    None => return Adapted::Drop,
                }
            };
            Adapted::Cont(ResourceView::Dns {
                id: resource.id,
                name: resource.name.clone(),
                address,
                filters: Some(expand_filters(&resource.filters)),
            })
        }
        ResourceKind::Ip { address } => Adapted::Cont(ResourceView::Cidr {
            id: resource.id,
            name: resource.name.clone(),
            address: address.to_string(),
            filters: Some(expand_filters(&resource.filters)),
        }),
        ResourceKind::Cidr { address } => Adapted::Cont(ResourceView::Cidr {
            id: resource.id,
            name: resource.name.clone(),
            address: address.to_string(),
            filters: Some(expand_filters(&resource.filters)),
        }),
    }
}

/// Flattens an ordered `Filter` list into one `{protocol, start, end}`
/// entry per explicit port or range; an empty `ports` list (allow-all, or
/// an ICMP filter which carries no ports) becomes a single entry with no
/// port bounds.
pub fn expand_filters(filters: &[Filter]) -> Vec<FlatFilter> {
    filters
        .iter()
        .flat_map(|filter| {
            let protocol = flat_protocol(filter.protocol);
            if filter.ports.is_empty() {
                vec![FlatFilter {
                    protocol,
                    port_range_start: None,
                    port_range_end: None,
                }]
            } else {
                filter
                    .ports
                    .iter()
                    .map(|range| FlatFilter {
                        protocol,
                        port_range_start: Some(range.start),
                        port_range_end: Some(range.end),
                    })
                    .collect()
            }
        })
        .collect()
}

fn flat_protocol(protocol: Protocol) -> FlatProtocol {
    match protocol {
        Protocol::Tcp => FlatProtocol::Tcp,
        Protocol::Udp => FlatProtocol::Udp,
        Protocol::Icmp => FlatProtocol::Icmp,
    }
}

/// Rewrites a current DNS address glob into the two-wildcard-class grammar
/// pre-1.2.0 agents understand, or reports it cannot be represented.
///
/// - A leading `**` encodes as a single `*` (recursive-subdomain match).
/// - A leading single `*` encodes as `?` (single-label match).
/// - `**` or `*` anywhere else is unrepresentable in the legacy grammar.
/// - A `?` anywhere in the source is unrepresentable (the legacy grammar
///   predates that wildcard class).
fn legacy_dns_glob(address: &str) -> Option<String> {
    if address.contains('?') {
        return None;
    }

    let (prefix, rest) = if let Some(rest) = address.strip_prefix("**") {
        ("*", rest)
    } else if let Some(rest) = address.strip_prefix('*') {
        ("?", rest)
    } else {
        ("", address)
    };

    if rest.contains('*') {
        return None;
    }

    Some(format!("{prefix}{rest}"))
}
