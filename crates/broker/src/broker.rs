//! The Event Broker actor.
//!
//! A single task owns all broker state (subscriber table, per-IP session
//! counts, last-value cache) and is reached only through [`BrokerHandle`]
//! commands, the same "one task owns the mutable state, everyone else
//! sends it messages" shape the arbiter core favors for anything more than
//! a single mutex would comfortably express.

use gpuq_core::{Packet, Topic};
use indexmap::IndexMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long [`BrokerHandle::state`] waits for the actor's reply before
/// giving up, so a stalled or buggy event loop can never wedge a caller.
const STATE_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Topics replayed to a subscriber immediately after it joins, so a client
/// connecting mid-job still sees the current progress/gpu/service state
/// instead of waiting for the next change.
const INIT_REPLAY_TOPICS: [Topic; 3] = [Topic::Progress, Topic::Gpu, Topic::Service];

/// Capacity of each subscriber's outbound channel. A slow reader drops
/// packets rather than backing up the broker, matching the bounded,
/// drop-on-full discipline used throughout this arbiter.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// A snapshot of connected-user counts, published on the `users` topic
/// whenever a subscriber joins or leaves.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsersSnapshot {
    pub users: usize,
    pub sessions: usize,
}

enum Command {
    Subscribe { ip: String, reply: oneshot::Sender<Subscription> },
    Unsubscribe { id: u64, ip: String },
    Publish(Packet),
    StateSnapshot { topic: Topic, reply: oneshot::Sender<Option<Packet>> },
}

/// A live subscription to broker packets.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Packet>,
}

/// A cheap, cloneable handle to a running [`EventBroker`].
#[derive(Clone)]
pub struct BrokerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Subscribe a client connecting from `ip`, bumping that IP's session
    /// count and publishing an updated [`UsersSnapshot`].
    pub async fn subscribe(&self, ip: String) -> Subscription {
        let (reply, recv) = oneshot::channel();
        if self.cmd_tx.send(Command::Subscribe { ip, reply }).await.is_err() {
            // The broker task is gone; hand back a subscription that will
            // simply never receive anything rather than panicking.
            let (_tx, rx) = mpsc::channel(1);
            return Subscription { id: 0, rx };
        }
        recv.await.unwrap_or_else(|_| {
            let (_tx, rx) = mpsc::channel(1);
            Subscription { id: 0, rx }
        })
    }

    /// Drop a subscription, decrementing its IP's session count.
    pub async fn unsubscribe(&self, id: u64, ip: String) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { id, ip }).await;
    }

    /// Broadcast a packet to every current subscriber. Non-ephemeral
    /// packets replace the broker's last-value cache for their topic.
    pub async fn publish(&self, packet: Packet) {
        let _ = self.cmd_tx.send(Command::Publish(packet)).await;
    }

    /// Read the broker's cached last value for `topic`, if any has ever
    /// been published. Waits up to [`STATE_QUERY_TIMEOUT`] for the actor's
    /// reply; a timeout (or a dropped reply) yields `None` rather than
    /// hanging, so this can never deadlock with the event loop.
    pub async fn state(&self, topic: Topic) -> Option<Packet> {
        let (reply, recv) = oneshot::channel();
        if self.cmd_tx.send(Command::StateSnapshot { topic, reply }).await.is_err() {
            return None;
        }
        tokio::time::timeout(STATE_QUERY_TIMEOUT, recv).await.ok()?.ok().flatten()
    }
}

/// The broker's owned state, run as a single task via [`EventBroker::spawn`].
pub struct EventBroker {
    ips: IndexMap<String, usize>,
    subscribers: IndexMap<u64, mpsc::Sender<Packet>>,
    cache: IndexMap<Topic, Packet>,
    next_id: u64,
}

impl EventBroker {
    fn new() -> Self {
        Self { ips: IndexMap::new(), subscribers: IndexMap::new(), cache: IndexMap::new(), next_id: 1 }
    }

    /// Spawn the broker's actor task and return a handle to it.
    pub fn spawn() -> BrokerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let broker = Self::new();
        tokio::spawn(broker.run(cmd_rx));
        BrokerHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Subscribe { ip, reply } => {
                    let id = self.next_id;
                    self.next_id += 1;
                    let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
                    for topic in INIT_REPLAY_TOPICS {
                        if let Some(packet) = self.cache.get(&topic) {
                            if tx.try_send(packet.clone()).is_err() {
                                tracing::warn!(?topic, "init replay dropped, subscriber channel full");
                            }
                        }
                    }
                    self.subscribers.insert(id, tx);
                    *self.ips.entry(ip).or_insert(0) += 1;
                    self.publish_users_snapshot();
                    let _ = reply.send(Subscription { id, rx });
                }
                Command::Unsubscribe { id, ip } => {
                    self.subscribers.shift_remove(&id);
                    if let Some(count) = self.ips.get_mut(&ip) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            self.ips.shift_remove(&ip);
                        }
                    }
                    self.publish_users_snapshot();
                }
                Command::Publish(packet) => self.dispatch(packet),
                Command::StateSnapshot { topic, reply } => {
                    let _ = reply.send(self.cache.get(&topic).cloned());
                }
            }
        }
    }

    fn publish_users_snapshot(&mut self) {
        let snapshot = UsersSnapshot { users: self.ips.len(), sessions: self.subscribers.len() };
        let data = serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null);
        self.dispatch(Packet::new(Topic::Users, data));
    }

    fn dispatch(&mut self, packet: Packet) {
        if !packet.ephemeral {
            self.cache.insert(packet.topic, packet.clone());
        }
        for tx in self.subscribers.values() {
            if tx.try_send(packet.clone()).is_err() {
                tracing::warn!(topic = %packet.topic, "packet dropped, subscriber channel full or closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_bumps_users_snapshot() {
        let broker = EventBroker::spawn();
        let mut sub = broker.subscribe("1.2.3.4".to_string()).await;
        let packet = sub.rx.recv().await.expect("users snapshot");
        assert_eq!(packet.topic, Topic::Users);
        assert_eq!(packet.data["users"], json!(1));
        assert_eq!(packet.data["sessions"], json!(1));
    }

    #[tokio::test]
    async fn new_subscriber_replays_cached_progress() {
        let broker = EventBroker::spawn();
        broker.publish(Packet::new(Topic::Progress, json!({"pct": 42}))).await;
        // Give the actor a beat to process the publish before subscribing.
        tokio::task::yield_now().await;

        let mut sub = broker.subscribe("5.6.7.8".to_string()).await;
        let first = sub.rx.recv().await.expect("replayed progress");
        assert_eq!(first.topic, Topic::Progress);
        assert_eq!(first.data["pct"], json!(42));
    }

    #[tokio::test]
    async fn ephemeral_packets_are_not_cached() {
        let broker = EventBroker::spawn();
        broker.publish(Packet::ephemeral(Topic::Message, json!({"text": "hi"}))).await;
        tokio::task::yield_now().await;
        assert!(broker.state(Topic::Message).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_drops_ip_session_count_to_zero() {
        let broker = EventBroker::spawn();
        let sub = broker.subscribe("9.9.9.9".to_string()).await;
        broker.unsubscribe(sub.id, "9.9.9.9".to_string()).await;
        tokio::task::yield_now().await;

        let mut watcher = broker.subscribe("1.1.1.1".to_string()).await;
        let packet = watcher.rx.recv().await.expect("users snapshot");
        assert_eq!(packet.data["users"], json!(1));
    }
}
