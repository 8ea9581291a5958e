//! Given a `(client, resource)` request, evaluates active policies, group
//! memberships, and the requesting token's window to produce a
//! [`model::PolicyAuthorization`] or a rejection (C4).
//!
//! Reads go through the [`Store`] trait so a Postgres-backed
//! implementation can be substituted without touching this decision logic;
//! an in-memory implementation lives under `#[cfg(test)]` for unit tests
//! and is reused by the broker's integration tests.

use chrono::{DateTime, Utc};
use model::{ActorId, AccountId, Client, GatewayId, GroupId, MembershipId, Policy, PolicyAuthorization, PolicyAuthorizationId, Resource, ResourceId, Subject};
use thiserror::Error;

/// Reasons a resolve attempt can fail (§4.4). `Display` text is the wire
/// `reason` string a caller uses verbatim when this crosses into
/// `wire::WireError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("not_found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("account_disabled")]
    AccountDisabled,
    #[error("expired")]
    Expired,
    /// A cross-account row was handed to the resolver — Invariant 1/2
    /// violated by the caller. Not a user-facing rejection: callers treat
    /// this as a programming error and fail the channel fast (§7).
    #[error("internal_error")]
    Internal,
}

/// The read/write surface the resolver needs from persistent storage.
pub trait Store {
    /// All policies referencing `resource_id`, enabled or not, in any
    /// account. The resolver itself filters to the requesting account and
    /// to enabled policies — callers should not pre-filter.
    fn policies_for_resource(&self, resource_id: ResourceId) -> Vec<Policy>;

    /// The actor's membership in `group_id`, if any.
    fn membership(&self, actor_id: ActorId, group_id: GroupId) -> Option<MembershipId>;

    fn is_account_active(&self, account_id: AccountId) -> bool;

    fn insert_policy_authorization(&self, authorization: &PolicyAuthorization);
}

/// Runs the §4.4 algorithm: enabled policies on `resource` the subject's
/// actor has a membership for, picking the one with the latest resulting
/// expiry, capped by the token's own window.
pub fn resolve(
    client: &Client,
    resource: &Resource,
    subject: &Subject,
    gateway_id: GatewayId,
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<PolicyAuthorization, Rejection> {
    if resource.account_id != subject.account_id || client.account_id != subject.account_id {
        tracing::error!(
            resource_account = %resource.account_id,
            client_account = %client.account_id,
            subject_account = %subject.account_id,
            "cross-account resolve request"
        );
        return Err(Rejection::Internal);
    }

    if !store.is_account_active(subject.account_id) {
        return Err(Rejection::AccountDisabled);
    }

    if subject.token.is_expired(now) {
        return Err(Rejection::Expired);
    }

    let policies: Vec<Policy> = store
        .policies_for_resource(resource.id)
        .into_iter()
        .filter(|p| p.account_id == subject.account_id && p.is_enabled())
        .collect();

    if policies.is_empty() {
        return Err(Rejection::NotFound);
    }

    let mut best: Option<(Policy, MembershipId, DateTime<Utc>)> = None;
    for policy in policies {
        let Some(membership_id) = store.membership(subject.actor_id, policy.group_id) else {
            continue;
        };
        let candidate_expiry = subject.token.expires_at.min(now + policy.session_duration);

        let replace = match &best {
            None => true,
            Some((_, _, current)) => candidate_expiry > *current,
        };
        if replace {
            best = Some((policy, membership_id, candidate_expiry));
        }
    }

    let (policy, membership_id, expires_at) = best.ok_or(Rejection::Unauthorized)?;

    if expires_at <= now {
        return Err(Rejection::Expired);
    }

    let authorization = PolicyAuthorization {
        id: PolicyAuthorizationId::random(),
        account_id: subject.account_id,
        client_id: client.id,
        resource_id: resource.id,
        gateway_id,
        policy_id: policy.id,
        membership_id,
        token_id: subject.token.id,
        expires_at,
    };

    store.insert_policy_authorization(&authorization);

    Ok(authorization)
}
