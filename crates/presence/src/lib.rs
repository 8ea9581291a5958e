//! Online-presence tracking for the three connecting roles (C3):
//! Clients, Gateways, and Relays. Each namespace is a
//! `(id -> {metadata, joined_at, holder})` map; when the holder that
//! registered an entry disappears, the entry is removed and a
//! `PresenceDiff` is published on the namespace's per-account topic.
//!
//! Relay presence doubles as a CRDT: a relay's id is a pure function of
//! its `stamp_secret` ([`model::RelayId::from_stamp_secret`]), so a
//! reconnect under the same secret lands on the same key and a restart
//! under a fresh one lands on a new key. The registry itself is agnostic
//! to that — it only needs the holder-ownership rule below to avoid a
//! stale disconnect clobbering a fresher registration.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use model::AccountId;
use pubsub::{Bus, Topic};

/// Identifies the connection (socket/actor) that registered a presence
/// entry. A `leave` only takes effect if its holder still owns the entry —
/// this is what makes a transient relay reconnect (new connection joins
/// under the same id before the old one's disconnect is observed) a no-op
/// rather than a spurious leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

impl HolderId {
    pub fn next() -> Self {
        Self(NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Published on a namespace's per-account topic whenever its membership
/// changes. Carries ids only: interested parties (the Relay Selector, a
/// Gateway Channel wanting to know if a peer Client is online) re-query
/// [`Registry::online_in_account`] for the current full set rather than
/// trust the diff to carry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDiff<Id> {
    pub joins: Vec<Id>,
    pub leaves: Vec<Id>,
}

struct Entry<Meta> {
    meta: Meta,
    joined_at: DateTime<Utc>,
    account_id: AccountId,
    holder: HolderId,
}

/// One presence namespace (Clients, Gateways, or Relays), generic over
/// the id and metadata types it carries.
pub struct Registry<Id, Meta> {
    entries: DashMap<Id, Entry<Meta>>,
    bus: Arc<Bus<PresenceDiff<Id>>>,
}

impl<Id, Meta> Registry<Id, Meta>
where
    Id: Eq + Hash + Clone,
    Meta: Clone,
{
    pub fn new(bus: Arc<Bus<PresenceDiff<Id>>>) -> Self {
        Self {
            entries: DashMap::new(),
            bus,
        }
    }

    /// Registers `id` as online, owned by `holder`, and publishes a join
    /// diff on `topic`. Overwrites any prior entry for `id` regardless of
    /// who held it — the caller is asserting that `holder` is now the
    /// authoritative connection for this id.
    pub fn join(&self, id: Id, account_id: AccountId, meta: Meta, holder: HolderId, topic: &Topic) {
        self.entries.insert(
            id.clone(),
            Entry {
                meta,
                joined_at: Utc::now(),
                account_id,
                holder,
            },
        );
        self.bus.broadcast(
            topic,
            PresenceDiff {
                joins: vec![id],
                leaves: vec![],
            },
        );
    }

    /// Removes `id` iff it is still held by `holder`, publishing a leave
    /// diff on `topic` when it does. A no-op if a different holder has
    /// since replaced the entry (the stale-disconnect case).
    pub fn leave(&self, id: &Id, holder: HolderId, topic: &Topic) {
        let removed = self
            .entries
            .remove_if(id, |_, entry| entry.holder == holder)
            .is_some();

        if removed {
            self.bus.broadcast(
                topic,
                PresenceDiff {
                    joins: vec![],
                    leaves: vec![id.clone()],
                },
            );
        }
    }

    pub fn is_online(&self, id: &Id) -> bool {
        self.entries.contains_key(id)
    }

    pub fn meta(&self, id: &Id) -> Option<Meta> {
        self.entries.get(id).map(|entry| entry.meta.clone())
    }

    pub fn joined_at(&self, id: &Id) -> Option<DateTime<Utc>> {
        self.entries.get(id).map(|entry| entry.joined_at)
    }

    /// All entries currently online within `account_id`, as `(id, meta)`
    /// pairs. No ordering is guaranteed.
    pub fn online_in_account(&self, account_id: &AccountId) -> Vec<(Id, Meta)> {
        self.entries
            .iter()
            .filter(|entry| entry.account_id == *account_id)
            .map(|entry| (entry.key().clone(), entry.value().meta.clone()))
            .collect()
    }

    pub fn subscribe(&self, topic: Topic, subscriber: pubsub::SubscriberId) -> tokio::sync::mpsc::Receiver<PresenceDiff<Id>> {
        self.bus.subscribe(topic, subscriber)
    }
}

#[cfg(test)]
mod tests {
    use model::RelayId;

    use super::*;

    fn account() -> AccountId {
        AccountId::random()
    }

    #[test]
    fn join_publishes_and_tracks_online() {
        let bus = Arc::new(Bus::new(4));
        let registry: Registry<RelayId, ()> = Registry::new(bus.clone());
        let topic = Topic::relay_presence("acc-1");
        let sub = pubsub::SubscriberId::next();
        let mut rx = registry.subscribe(topic.clone(), sub);

        let id = RelayId::from_stamp_secret("s1");
        let acc = account();
        registry.join(id, acc, (), HolderId::next(), &topic);

        assert!(registry.is_online(&id));
        let diff = rx.try_recv().unwrap();
        assert_eq!(diff.joins, vec![id]);
        assert!(diff.leaves.is_empty());
    }

    #[test]
    fn leave_by_the_joining_holder_removes_the_entry() {
        let bus = Arc::new(Bus::new(4));
        let registry: Registry<RelayId, ()> = Registry::new(bus);
        let topic = Topic::relay_presence("acc-1");
        let holder = HolderId::next();
        let id = RelayId::from_stamp_secret("s1");

        registry.join(id, account(), (), holder, &topic);
        registry.leave(&id, holder, &topic);

        assert!(!registry.is_online(&id));
    }

    #[test]
    fn stale_holder_leave_does_not_clobber_a_fresher_join() {
        // Simulates a relay reconnecting with the same stamp_secret before
        // its old connection's disconnect is observed: the new join must
        // survive the old connection's later leave call.
        let bus = Arc::new(Bus::new(4));
        let registry: Registry<RelayId, ()> = Registry::new(bus);
        let topic = Topic::relay_presence("acc-1");
        let old_holder = HolderId::next();
        let new_holder = HolderId::next();
        let id = RelayId::from_stamp_secret("s1");
        let acc = account();

        registry.join(id, acc, (), old_holder, &topic);
        registry.join(id, acc, (), new_holder, &topic);
        registry.leave(&id, old_holder, &topic);

        assert!(registry.is_online(&id));
    }

    #[test]
    fn restart_with_a_new_stamp_secret_is_a_different_id() {
        let old_id = RelayId::from_stamp_secret("s1");
        let new_id = RelayId::from_stamp_secret("s2");

        assert_ne!(old_id, new_id);
    }

    #[test]
    fn online_in_account_excludes_other_accounts() {
        let bus = Arc::new(Bus::new(4));
        let registry: Registry<RelayId, ()> = Registry::new(bus);
        let topic = Topic::relay_presence("acc-1");
        let acc_a = account();
        let acc_b = account();

        registry.join(
            RelayId::from_stamp_secret("a"),
            acc_a,
            (),
            HolderId::next(),
            &topic,
        );
        registry.join(
            RelayId::from_stamp_secret("b"),
            acc_b,
            (),
            HolderId::next(),
            &topic,
        );

        assert_eq!(registry.online_in_account(&acc_a).len(), 1);
    }
}
