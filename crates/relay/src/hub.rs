//! Group membership and fan-out.
//!
//! Every connection owns one outbox. Groups map a name to the outboxes of
//! their members. A message is pushed onto each member's outbox, so all
//! traffic to one connection is delivered in the order the hub sent it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Identifies one live websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type Outbox = mpsc::UnboundedSender<String>;

#[derive(Default)]
pub struct Hub {
    next_id: AtomicU64,
    groups: RwLock<HashMap<String, HashMap<ConnId, Outbox>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub async fn join(&self, group: &str, conn: ConnId, outbox: Outbox) {
        let mut groups = self.groups.write().await;
        groups.entry(group.to_string()).or_default().insert(conn, outbox);
        debug!(group, %conn, "joined group");
    }

    /// Leave `group`. Leaving a group the connection is not in is a no-op.
    pub async fn leave(&self, group: &str, conn: ConnId) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(&conn);
            if members.is_empty() {
                groups.remove(group);
            }
        }
        debug!(group, %conn, "left group");
    }

    /// Push `text` to every member of `group`; returns how many outboxes
    /// accepted it. An unknown or empty group is not an error.
    pub async fn send_group(&self, group: &str, text: &str) -> usize {
        let groups = self.groups.read().await;
        let Some(members) = groups.get(group) else {
            return 0;
        };
        members
            .values()
            .filter(|outbox| outbox.send(text.to_string()).is_ok())
            .count()
    }

    pub async fn group_size(&self, group: &str) -> usize {
        self.groups.read().await.get(group).map_or(0, HashMap::len)
    }

    /// Group name to member count, for the health endpoint.
    pub async fn snapshot(&self) -> HashMap<String, usize> {
        self.groups
            .read()
            .await
            .iter()
            .map(|(name, members)| (name.clone(), members.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_member_in_order() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.next_conn();
        let b = hub.next_conn();
        hub.join("observers", a, tx_a).await;
        hub.join("observers", b, tx_b).await;

        assert_eq!(hub.send_group("observers", "one").await, 2);
        assert_eq!(hub.send_group("observers", "two").await, 2);
        assert_eq!(rx_a.recv().await.as_deref(), Some("one"));
        assert_eq!(rx_a.recv().await.as_deref(), Some("two"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn leaving_twice_and_unknown_groups_are_harmless() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = hub.next_conn();
        hub.join("client_a", conn, tx).await;
        hub.leave("client_a", conn).await;
        hub.leave("client_a", conn).await;
        hub.leave("never_joined", conn).await;
        assert_eq!(hub.group_size("client_a").await, 0);
        assert_eq!(hub.send_group("client_a", "x").await, 0);
        assert!(hub.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_settle() {
        let hub = std::sync::Arc::new(Hub::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                let conn = hub.next_conn();
                hub.join("station_observers", conn, tx).await;
                hub.leave("station_observers", conn).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(hub.group_size("station_observers").await, 0);
    }
}
