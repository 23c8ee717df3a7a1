//! Durable per-client session state.
//!
//! The [`Session`] trait is the integration point for an external
//! store; [`MemorySession`] is the reference in-memory
//! implementation.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use mqtt311_protocol::packet::Packet;
use mqtt311_protocol::packet_id::IdCounter;
use mqtt311_protocol::topic::TopicTree;
use mqtt311_protocol::types::{Message, Subscription};
use mqtt311_protocol::Result;

/// Which half of a QoS exchange a stored packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client-to-broker.
    Incoming,
    /// Broker-to-client.
    Outgoing,
}

/// Persistent state for one client id: the two inflight packet maps,
/// the subscription set, the will slot and the packet-id counter.
///
/// Deleting a missing packet or subscription succeeds silently.
pub trait Session: Send + Sync {
    /// Next identifier for outgoing packets.
    fn next_id(&self) -> u16;

    /// Stores a packet, quietly overwriting an entry with the same id.
    fn save_packet(&self, direction: Direction, id: u16, packet: Packet) -> Result<()>;

    /// Retrieves a stored packet by id.
    fn lookup_packet(&self, direction: Direction, id: u16) -> Result<Option<Packet>>;

    /// Removes a stored packet by id.
    fn delete_packet(&self, direction: Direction, id: u16) -> Result<()>;

    /// All stored packets in ascending id order.
    fn all_packets(&self, direction: Direction) -> Result<Vec<Packet>>;

    /// Stores a subscription, quietly overwriting one with the same
    /// topic.
    fn save_subscription(&self, subscription: &Subscription) -> Result<()>;

    /// Matches `topic` against the stored subscriptions; among
    /// multiple matches the one with the highest QoS wins.
    fn lookup_subscription(&self, topic: &str) -> Result<Option<Subscription>>;

    /// Removes the subscription with the given topic filter.
    fn delete_subscription(&self, topic: &str) -> Result<()>;

    /// All stored subscriptions.
    fn all_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Stores the will message.
    fn save_will(&self, will: Message) -> Result<()>;

    /// Retrieves the will message.
    fn lookup_will(&self) -> Result<Option<Message>>;

    /// Removes the will message.
    fn clear_will(&self) -> Result<()>;

    /// Restores the session to an empty, freshly seeded state.
    fn reset(&self) -> Result<()>;
}

#[derive(Default)]
struct SessionState {
    incoming: BTreeMap<u16, Packet>,
    outgoing: BTreeMap<u16, Packet>,
    subscriptions: TopicTree<Subscription>,
    will: Option<Message>,
}

impl SessionState {
    fn packets(&mut self, direction: Direction) -> &mut BTreeMap<u16, Packet> {
        match direction {
            Direction::Incoming => &mut self.incoming,
            Direction::Outgoing => &mut self.outgoing,
        }
    }
}

/// In-memory [`Session`].
pub struct MemorySession {
    counter: IdCounter,
    state: Mutex<SessionState>,
}

impl MemorySession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: IdCounter::new(),
            state: Mutex::new(SessionState::default()),
        }
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for MemorySession {
    fn next_id(&self) -> u16 {
        self.counter.next_id()
    }

    fn save_packet(&self, direction: Direction, id: u16, packet: Packet) -> Result<()> {
        self.state.lock().packets(direction).insert(id, packet);
        Ok(())
    }

    fn lookup_packet(&self, direction: Direction, id: u16) -> Result<Option<Packet>> {
        Ok(self.state.lock().packets(direction).get(&id).cloned())
    }

    fn delete_packet(&self, direction: Direction, id: u16) -> Result<()> {
        self.state.lock().packets(direction).remove(&id);
        Ok(())
    }

    fn all_packets(&self, direction: Direction) -> Result<Vec<Packet>> {
        Ok(self
            .state
            .lock()
            .packets(direction)
            .values()
            .cloned()
            .collect())
    }

    fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.state
            .lock()
            .subscriptions
            .set(&subscription.topic, subscription.clone());
        Ok(())
    }

    fn lookup_subscription(&self, topic: &str) -> Result<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .subscriptions
            .match_topic(topic)
            .into_iter()
            .max_by_key(|s| s.qos))
    }

    fn delete_subscription(&self, topic: &str) -> Result<()> {
        self.state.lock().subscriptions.empty(topic);
        Ok(())
    }

    fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.state.lock().subscriptions.values())
    }

    fn save_will(&self, will: Message) -> Result<()> {
        self.state.lock().will = Some(will);
        Ok(())
    }

    fn lookup_will(&self) -> Result<Option<Message>> {
        Ok(self.state.lock().will.clone())
    }

    fn clear_will(&self) -> Result<()> {
        self.state.lock().will = None;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        *self.state.lock() = SessionState::default();
        self.counter.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt311_protocol::packet::PubRelPacket;
    use mqtt311_protocol::QoS;

    fn pubrel(id: u16) -> Packet {
        Packet::PubRel(PubRelPacket::new(id))
    }

    #[test]
    fn test_packet_store_overwrites_and_orders() {
        let session = MemorySession::new();
        session
            .save_packet(Direction::Outgoing, 3, pubrel(3))
            .unwrap();
        session
            .save_packet(Direction::Outgoing, 1, pubrel(1))
            .unwrap();
        session
            .save_packet(Direction::Outgoing, 2, pubrel(2))
            .unwrap();

        // Overwrite id 3.
        session
            .save_packet(Direction::Outgoing, 3, pubrel(3))
            .unwrap();

        let all = session.all_packets(Direction::Outgoing).unwrap();
        let ids: Vec<u16> = all.iter().filter_map(Packet::packet_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Directions are independent.
        assert!(session.all_packets(Direction::Incoming).unwrap().is_empty());
    }

    #[test]
    fn test_packet_delete_missing_is_noop() {
        let session = MemorySession::new();
        session.delete_packet(Direction::Incoming, 42).unwrap();

        session
            .save_packet(Direction::Incoming, 7, pubrel(7))
            .unwrap();
        session.delete_packet(Direction::Incoming, 7).unwrap();
        assert!(session
            .lookup_packet(Direction::Incoming, 7)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_subscription_replace_and_best_match() {
        let session = MemorySession::new();
        session
            .save_subscription(&Subscription::new("a/+", QoS::AtMostOnce))
            .unwrap();
        session
            .save_subscription(&Subscription::new("a/b", QoS::ExactlyOnce))
            .unwrap();

        let sub = session.lookup_subscription("a/b").unwrap().unwrap();
        assert_eq!(sub.qos, QoS::ExactlyOnce);

        // A new subscribe to an existing topic replaces its QoS.
        session
            .save_subscription(&Subscription::new("a/b", QoS::AtLeastOnce))
            .unwrap();
        let sub = session.lookup_subscription("a/b").unwrap().unwrap();
        assert_eq!(sub.qos, QoS::AtLeastOnce);
        assert_eq!(session.all_subscriptions().unwrap().len(), 2);

        session.delete_subscription("a/b").unwrap();
        let sub = session.lookup_subscription("a/b").unwrap().unwrap();
        assert_eq!(sub.topic, "a/+");

        // Deleting a missing subscription succeeds silently.
        session.delete_subscription("nope").unwrap();
    }

    #[test]
    fn test_will_slot() {
        let session = MemorySession::new();
        assert!(session.lookup_will().unwrap().is_none());

        session
            .save_will(Message::new("w", &b"gone"[..], QoS::AtLeastOnce))
            .unwrap();
        assert_eq!(session.lookup_will().unwrap().unwrap().topic, "w");

        session.clear_will().unwrap();
        assert!(session.lookup_will().unwrap().is_none());
    }

    #[test]
    fn test_reset() {
        let session = MemorySession::new();
        session.next_id();
        session.next_id();
        session
            .save_packet(Direction::Outgoing, 1, pubrel(1))
            .unwrap();
        session
            .save_subscription(&Subscription::new("t", QoS::AtMostOnce))
            .unwrap();
        session
            .save_will(Message::new("w", &b""[..], QoS::AtMostOnce))
            .unwrap();

        session.reset().unwrap();
        assert_eq!(session.next_id(), 1);
        assert!(session.all_packets(Direction::Outgoing).unwrap().is_empty());
        assert!(session.all_subscriptions().unwrap().is_empty());
        assert!(session.lookup_will().unwrap().is_none());
    }
}
