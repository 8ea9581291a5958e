//! The fan-out topic broker (C2). A sharded in-memory map `topic ->
//! set<subscriber_sink>`: sinks are bounded mailboxes, and a slow
//! subscriber never blocks a publisher — overflow is dropped silently,
//! because the change-stream carries ground truth and the next relevant
//! event refreshes state (§9 design notes).
//!
//! Delivery is best-effort and in-process only: no queueing across process
//! restarts, no persistence.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// A PubSub topic. The well-known families used by the broker are
/// constructed through the helpers below rather than formatted ad hoc, so a
/// typo in a topic name is a compile-time call-site mistake rather than a
/// silent runtime mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn account(id: impl fmt::Display) -> Self {
        Self(format!("account:{id}"))
    }

    pub fn resource(id: impl fmt::Display) -> Self {
        Self(format!("resource:{id}"))
    }

    pub fn gateway(id: impl fmt::Display) -> Self {
        Self(format!("gateway:{id}"))
    }

    pub fn token(id: impl fmt::Display) -> Self {
        Self(format!("token:{id}"))
    }

    pub fn socket(token_id: impl fmt::Display) -> Self {
        Self(format!("socket:{token_id}"))
    }

    pub fn client(account_id: impl fmt::Display) -> Self {
        Self(format!("client:{account_id}"))
    }

    pub fn actor_clients(actor_id: impl fmt::Display) -> Self {
        Self(format!("actor_clients:{actor_id}"))
    }

    pub fn relay_presence(account_id: impl fmt::Display) -> Self {
        Self(format!("relay_presence:{account_id}"))
    }

    pub fn gateway_presence(account_id: impl fmt::Display) -> Self {
        Self(format!("gateway_presence:{account_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one registration within a topic's subscriber set. Callers
/// mint these from [`SubscriberId::next`] (or reuse a stable id, e.g. a
/// channel actor's own connection id) so re-subscribing under the same id
/// is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The fan-out broker itself, generic over the message type each topic
/// carries.
pub struct Bus<M> {
    topics: DashMap<Topic, DashMap<SubscriberId, mpsc::Sender<M>>>,
    mailbox_capacity: usize,
}

impl<M> Bus<M>
where
    M: Clone,
{
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            mailbox_capacity,
        }
    }

    /// Registers `subscriber` on `topic`, returning the receiving half of a
    /// freshly minted bounded mailbox. Subscribing the same id twice on the
    /// same topic keeps exactly one entry in the subscriber set (the newer
    /// mailbox wins; the caller should not subscribe twice without an
    /// intervening unsubscribe).
    pub fn subscribe(&self, topic: Topic, subscriber: SubscriberId) -> mpsc::Receiver<M> {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        self.topics.entry(topic).or_default().insert(subscriber, tx);
        rx
    }

    /// Removes one registration. A no-op if the subscriber was never
    /// registered on this topic.
    pub fn unsubscribe(&self, topic: &Topic, subscriber: SubscriberId) {
        let Some(mut subs) = self.topics.get_mut(topic) else {
            return;
        };
        subs.remove(&subscriber);
        let is_empty = subs.is_empty();
        drop(subs);
        if is_empty {
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
    }

    /// Delivers `msg` to every current subscriber of `topic`. Best-effort:
    /// a subscriber whose mailbox is full simply does not receive this
    /// message, and the broadcast never blocks on it.
    pub fn broadcast(&self, topic: &Topic, msg: M) {
        let Some(subs) = self.topics.get(topic) else {
            return;
        };
        for tx in subs.value().iter() {
            if tx.value().try_send(msg.clone()).is_err() {
                tracing::debug!(topic = %topic, "dropped message to a full or closed mailbox");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_broadcast_message() {
        let bus: Bus<u32> = Bus::new(4);
        let topic = Topic::account("acc-1");
        let sub = SubscriberId::next();

        let mut rx = bus.subscribe(topic.clone(), sub);
        bus.broadcast(&topic, 42);

        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn broadcast_to_unknown_topic_is_a_no_op() {
        let bus: Bus<u32> = Bus::new(4);

        bus.broadcast(&Topic::account("ghost"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus: Bus<u32> = Bus::new(4);
        let topic = Topic::gateway("gw-1");
        let sub = SubscriberId::next();

        let mut rx = bus.subscribe(topic.clone(), sub);
        bus.unsubscribe(&topic, sub);
        bus.broadcast(&topic, 7);

        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_the_broadcast() {
        let bus: Bus<&'static str> = Bus::new(4);
        let topic = Topic::resource("res-1");

        let mut rx1 = bus.subscribe(topic.clone(), SubscriberId::next());
        let mut rx2 = bus.subscribe(topic.clone(), SubscriberId::next());

        bus.broadcast(&topic, "hello");

        assert_eq!(rx1.recv().await, Some("hello"));
        assert_eq!(rx2.recv().await, Some("hello"));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_overflow_without_blocking_publisher() {
        let bus: Bus<u32> = Bus::new(1);
        let topic = Topic::token("tok-1");
        let mut rx = bus.subscribe(topic.clone(), SubscriberId::next());

        bus.broadcast(&topic, 1);
        bus.broadcast(&topic, 2);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn resubscribing_under_the_same_id_keeps_one_entry() {
        let bus: Bus<u32> = Bus::new(4);
        let topic = Topic::client("acc-1");
        let sub = SubscriberId::next();

        let _rx1 = bus.subscribe(topic.clone(), sub);
        let _rx2 = bus.subscribe(topic.clone(), sub);

        assert_eq!(bus.subscriber_count(&topic), 1);
    }
}
