// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Cluster-state watchers: cancellable event streams in commit order. There
//! is no shared listener list to mutate; each watcher owns a channel, and a
//! watcher that cannot keep up is dropped and must re-list.

use std::sync::atomic::{AtomicU64, Ordering};

use config::{get_config, meta::cluster::ClusterEvent, RwHashMap};
use tokio::sync::mpsc;

pub struct WatchHub {
    watchers: RwHashMap<u64, Watcher>,
    next_id: AtomicU64,
}

struct Watcher {
    since_version: u64,
    sender: mpsc::Sender<ClusterEvent>,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchHub {
    pub fn new() -> Self {
        WatchHub {
            watchers: Default::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events with version > `since_version`. Dropping the
    /// receiver cancels the watch.
    pub fn subscribe(&self, since_version: u64) -> (u64, mpsc::Receiver<ClusterEvent>) {
        let capacity = get_config().cluster.watch_channel_size;
        let (sender, receiver) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.insert(
            id,
            Watcher {
                since_version,
                sender,
            },
        );
        log::info!("[MASTER] watcher {id} subscribed since version {since_version}");
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.watchers.remove(&id).is_some() {
            log::info!("[MASTER] watcher {id} unsubscribed");
        }
    }

    /// Deliver committed events, in order, to every live watcher. A closed or
    /// full channel drops the watcher.
    pub fn publish(&self, events: &[ClusterEvent]) {
        if events.is_empty() {
            return;
        }
        let mut doomed = Vec::new();
        for entry in self.watchers.iter() {
            let (id, watcher) = (entry.key(), entry.value());
            for event in events {
                if event.version() <= watcher.since_version {
                    continue;
                }
                if watcher.sender.try_send(event.clone()).is_err() {
                    log::warn!("[MASTER] watcher {id} lagging or closed, dropping it");
                    doomed.push(*id);
                    break;
                }
            }
        }
        for id in doomed {
            self.watchers.remove(&id);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::meta::cluster::ClusterEvent;

    fn event(version: u64) -> ClusterEvent {
        ClusterEvent::IndexCreated {
            version,
            index: "logs".to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_in_commit_order() {
        let hub = WatchHub::new();
        let (_id, mut rx) = hub.subscribe(0);
        hub.publish(&[event(1), event(2)]);
        hub.publish(&[event(3)]);
        let mut versions = Vec::new();
        for _ in 0..3 {
            versions.push(rx.recv().await.unwrap().version());
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_since_version_filters() {
        let hub = WatchHub::new();
        let (_id, mut rx) = hub.subscribe(2);
        hub.publish(&[event(1), event(2), event(3)]);
        assert_eq!(rx.recv().await.unwrap().version(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let hub = WatchHub::new();
        let (id, mut rx) = hub.subscribe(0);
        hub.unsubscribe(id);
        hub.publish(&[event(1)]);
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_removed_on_publish() {
        let hub = WatchHub::new();
        let (_id, rx) = hub.subscribe(0);
        drop(rx);
        hub.publish(&[event(1)]);
        assert_eq!(hub.watcher_count(), 0);
    }
}
