//! Reads an ordered stream of row-level database mutations tagged with a
//! monotonic LSN and dispatches translated domain events to PubSub topic
//! subscribers (C1). Hooks are pure: they read a raw [`Change`] and return
//! the typed event(s) and topics it fans out to; they never write back.
//!
//! The producer of the raw [`Change`] log is an external logical-
//! replication reader (out of scope per §1) — this crate only defines the
//! [`ChangeSource`] trait it is consumed through, plus an in-memory test
//! double.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use model::{AccountId, ClientId, GatewayId, PolicyAuthorizationId, Resource, ResourceId, TokenId};
use pubsub::{Bus, Topic};
use serde::Deserialize;

/// One row-level mutation, as read off the replication feed.
#[derive(Debug, Clone, Deserialize)]
pub struct Change {
    pub lsn: i64,
    pub table: String,
    pub op: Op,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

/// A lazy, strictly-increasing-by-`lsn` sequence of [`Change`]s. The core
/// treats its producer as a single totalized log; this trait lets the
/// concrete Postgres logical-replication reader be swapped for a test
/// double without touching dispatch logic.
pub trait ChangeSource: Stream<Item = Change> + Unpin + Send {}
impl<T> ChangeSource for T where T: Stream<Item = Change> + Unpin + Send {}

/// An in-memory [`ChangeSource`] backed by a fixed `Vec`, for tests and for
/// exercising the dispatcher without a real replication connection.
pub fn vec_source(changes: Vec<Change>) -> Pin<Box<dyn ChangeSource>> {
    Box::pin(tokio_stream::iter(changes))
}

/// The typed translations of the raw rows this crate cares about (§4.1).
/// Every variant is `Clone` so the dispatcher can hand the same event to
/// every topic it fans out to.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    PolicyAuthorizationDeleted(PolicyAuthorizationDeleted),
    ResourceUpdated(ResourceUpdated),
    AccountSlugChanged(AccountSlugChanged),
    GatewayDeleted(GatewayDeleted),
    TokenDeleted(TokenDeleted),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyAuthorizationDeleted {
    pub lsn: i64,
    pub account_id: AccountId,
    pub client_id: ClientId,
    pub resource_id: ResourceId,
    pub gateway_id: GatewayId,
    pub policy_authorization_id: PolicyAuthorizationId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUpdated {
    pub lsn: i64,
    pub account_id: AccountId,
    pub resource_id: ResourceId,
    pub old: Resource,
    pub new: Resource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountSlugChanged {
    pub lsn: i64,
    pub account_id: AccountId,
    pub new_slug: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayDeleted {
    pub lsn: i64,
    pub account_id: AccountId,
    pub gateway_id: GatewayId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenDeleted {
    pub lsn: i64,
    pub account_id: AccountId,
    pub token_id: TokenId,
}

impl DomainEvent {
    pub fn lsn(&self) -> i64 {
        match self {
            DomainEvent::PolicyAuthorizationDeleted(e) => e.lsn,
            DomainEvent::ResourceUpdated(e) => e.lsn,
            DomainEvent::AccountSlugChanged(e) => e.lsn,
            DomainEvent::GatewayDeleted(e) => e.lsn,
            DomainEvent::TokenDeleted(e) => e.lsn,
        }
    }

    /// Topics this event fans out to: `account:{id}`, `resource:{id}`,
    /// `gateway:{id}`, `token:{id}`, `socket:{token_id}` as applicable
    /// (§4.1). Not every event publishes on every one of those families —
    /// only the ones meaningful for its row kind.
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            DomainEvent::PolicyAuthorizationDeleted(e) => vec![
                Topic::account(e.account_id),
                Topic::resource(e.resource_id),
                Topic::gateway(e.gateway_id),
            ],
            DomainEvent::ResourceUpdated(e) => {
                vec![Topic::account(e.account_id), Topic::resource(e.resource_id)]
            }
            DomainEvent::AccountSlugChanged(e) => vec![Topic::account(e.account_id)],
            DomainEvent::GatewayDeleted(e) => {
                vec![Topic::account(e.account_id), Topic::gateway(e.gateway_id)]
            }
            DomainEvent::TokenDeleted(e) => vec![
                Topic::account(e.account_id),
                Topic::token(e.token_id),
                Topic::socket(e.token_id),
            ],
        }
    }
}

/// Translates one raw [`Change`] into the domain event it represents, or
/// `None` if this table/op combination carries no event this core reacts
/// to. A pure function: it never issues a write.
pub fn translate(change: &Change) -> Option<DomainEvent> {
    match (change.table.as_str(), change.op) {
        ("policy_authorizations", Op::Delete) => {
            let row: PolicyAuthorizationRow = parse(change.old.as_ref()?)?;
            Some(DomainEvent::PolicyAuthorizationDeleted(
                PolicyAuthorizationDeleted {
                    lsn: change.lsn,
                    account_id: row.account_id,
                    client_id: row.client_id,
                    resource_id: row.resource_id,
                    gateway_id: row.gateway_id,
                    policy_authorization_id: row.id,
                },
            ))
        }
        ("resources", Op::Update) => {
            let old: Resource = parse(change.old.as_ref()?)?;
            let new: Resource = parse(change.new.as_ref()?)?;
            Some(DomainEvent::ResourceUpdated(ResourceUpdated {
                lsn: change.lsn,
                account_id: new.account_id,
                resource_id: new.id,
                old,
                new,
            }))
        }
        ("accounts", Op::Update) => {
            let old: AccountRow = parse(change.old.as_ref()?)?;
            let new: AccountRow = parse(change.new.as_ref()?)?;
            if old.slug == new.slug {
                return None;
            }
            Some(DomainEvent::AccountSlugChanged(AccountSlugChanged {
                lsn: change.lsn,
                account_id: new.id,
                new_slug: new.slug,
            }))
        }
        ("gateways", Op::Delete) => {
            let row: GatewayRow = parse(change.old.as_ref()?)?;
            Some(DomainEvent::GatewayDeleted(GatewayDeleted {
                lsn: change.lsn,
                account_id: row.account_id,
                gateway_id: row.id,
            }))
        }
        ("tokens", Op::Delete) => {
            let row: TokenRow = parse(change.old.as_ref()?)?;
            Some(DomainEvent::TokenDeleted(TokenDeleted {
                lsn: change.lsn,
                account_id: row.account_id,
                token_id: row.id,
            }))
        }
        _ => None,
    }
}

fn parse<T: for<'de> Deserialize<'de>>(value: &serde_json::Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(row) => Some(row),
        Err(error) => {
            tracing::warn!(%error, "change-stream row did not match the expected shape");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyAuthorizationRow {
    id: PolicyAuthorizationId,
    account_id: AccountId,
    client_id: ClientId,
    resource_id: ResourceId,
    gateway_id: GatewayId,
}

#[derive(Debug, Deserialize)]
struct AccountRow {
    id: AccountId,
    slug: String,
}

#[derive(Debug, Deserialize)]
struct GatewayRow {
    id: GatewayId,
    account_id: AccountId,
}

#[derive(Debug, Deserialize)]
struct TokenRow {
    id: TokenId,
    account_id: AccountId,
}

/// Drains `source` to completion, translating and broadcasting each
/// recognised change on the topics it fans out to. Rows the core has no
/// hook for are silently skipped. Runs until the source ends (real
/// deployments pair this with a replication source that never ends).
pub async fn dispatch(mut source: Pin<Box<dyn ChangeSource>>, bus: &Bus<DomainEvent>) {
    while let Some(change) = source.next().await {
        let Some(event) = translate(&change) else {
            continue;
        };
        for topic in event.topics() {
            bus.broadcast(&topic, event.clone());
        }
    }
}
