//! An in-memory implementation of every read/write surface this crate
//! needs from persistent storage: [`authz::Store`] plus the entity
//! lookups the channels and transport layer perform directly. A real
//! deployment backs this with Postgres; tests and the demo binary use
//! this `DashMap`-backed stand-in (§6.3).

use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use model::{
    Account, AccountId, ActorId, Client, ClientId, Gateway, GatewayId, Group, GroupId, Membership,
    MembershipId, Policy, PolicyAuthorization, PolicyId, Relay, RelayId, Resource, ResourceId,
    Token, TokenId, TokenKind,
};

#[derive(Default)]
pub struct InMemoryStore {
    pub accounts: DashMap<AccountId, Account>,
    pub resources: DashMap<ResourceId, Resource>,
    pub policies: DashMap<PolicyId, Policy>,
    pub groups: DashMap<GroupId, Group>,
    pub memberships: DashMap<MembershipId, Membership>,
    pub clients: DashMap<ClientId, Client>,
    pub gateways: DashMap<GatewayId, Gateway>,
    pub relays: DashMap<RelayId, Relay>,
    pub tokens: DashMap<TokenId, Token>,
    pub policy_authorizations: Mutex<Vec<PolicyAuthorization>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.accounts.get(&id).map(|r| r.clone())
    }

    pub fn client(&self, id: ClientId) -> Option<Client> {
        self.clients.get(&id).map(|r| r.clone())
    }

    pub fn gateway(&self, id: GatewayId) -> Option<Gateway> {
        self.gateways.get(&id).map(|r| r.clone())
    }

    pub fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.resources.get(&id).map(|r| r.clone())
    }

    pub fn token(&self, id: TokenId) -> Option<Token> {
        self.tokens.get(&id).map(|r| r.clone())
    }

    /// Authenticates a bearer token string looked up by equality against
    /// every token row's id (the in-memory stand-in treats the token's
    /// printed id as its secret; a real `Store` would hash a real bearer
    /// secret). Returns the token row if it exists, is of `expected_kind`,
    /// and is not expired.
    pub fn authenticate(&self, token_id: TokenId, expected_kind: TokenKind) -> Option<Token> {
        let token = self.token(token_id)?;
        if token.kind != expected_kind {
            return None;
        }
        if token.is_expired(Utc::now()) {
            return None;
        }
        Some(token)
    }

    /// Active (non-expired) authorizations held by `client_id`, used to
    /// seed a Client Channel's `authorized_resources` push on join.
    pub fn policy_authorizations_for_client(&self, client_id: ClientId) -> Vec<PolicyAuthorization> {
        let now = Utc::now();
        self.policy_authorizations
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|pa| pa.client_id == client_id && pa.expires_at > now)
            .cloned()
            .collect()
    }
}

impl authz::Store for InMemoryStore {
    fn policies_for_resource(&self, resource_id: ResourceId) -> Vec<Policy> {
        self.policies
            .iter()
            .filter(|entry| entry.resource_id == resource_id)
            .map(|entry| entry.clone())
            .collect()
    }

    fn membership(&self, actor_id: ActorId, group_id: GroupId) -> Option<MembershipId> {
        self.memberships
            .iter()
            .find(|entry| entry.actor_id == actor_id && entry.group_id == group_id)
            .map(|entry| entry.id)
    }

    fn is_account_active(&self, account_id: AccountId) -> bool {
        self.account(account_id).map(|a| a.active).unwrap_or(false)
    }

    fn insert_policy_authorization(&self, authorization: &PolicyAuthorization) {
        self.policy_authorizations
            .lock()
            .expect("lock poisoned")
            .push(authorization.clone());
    }
}
