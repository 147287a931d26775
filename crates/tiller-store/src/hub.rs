//! The change notification hub.
//!
//! The hub is the shared change-detection path for a store: one dispatch
//! point per collection, not one poller per subscriber. Stores publish
//! the ids touched by each successful commit while their commit lock is
//! held, so every feed observes batches in durable commit order.
//!
//! The hub is an explicit registry owned by the store implementation and
//! handed to watcher constructors through
//! [`DocumentStore::subscribe`](crate::DocumentStore::subscribe) — there
//! is no process-wide singleton. Dropping a [`ChangeFeed`] releases its
//! subscription.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::schema::Collection;

/// The set of ids that changed in one collection since the previous
/// event on the same feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// The collection the changes occurred in.
    pub collection: Collection,
    /// Ids of the documents inserted, updated or removed.
    pub ids: Vec<String>,
}

type Subscribers = HashMap<Collection, HashMap<Uuid, mpsc::UnboundedSender<ChangeEvent>>>;

/// Per-collection change dispatch registry.
#[derive(Debug, Default)]
pub struct ChangeHub {
    subscribers: Mutex<Subscribers>,
}

impl ChangeHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription to one collection's changes.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, collection: Collection) -> ChangeFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = Uuid::new_v4();
        self.subscribers
            .lock()
            .entry(collection)
            .or_default()
            .insert(token, tx);
        tracing::debug!(%collection, %token, "watch subscription added");
        ChangeFeed {
            collection,
            token,
            rx,
            hub: Arc::clone(self),
        }
    }

    /// Deliver a committed change set to every subscriber of the
    /// collection. Subscribers whose feed has been dropped are pruned.
    pub fn publish(&self, collection: Collection, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        let Some(feeds) = subscribers.get_mut(&collection) else {
            return;
        };
        feeds.retain(|_, tx| {
            tx.send(ChangeEvent {
                collection,
                ids: ids.clone(),
            })
            .is_ok()
        });
    }

    /// The number of live subscriptions to a collection.
    #[must_use]
    pub fn subscriber_count(&self, collection: Collection) -> usize {
        self.subscribers
            .lock()
            .get(&collection)
            .map_or(0, HashMap::len)
    }

    fn unsubscribe(&self, collection: Collection, token: Uuid) {
        let mut subscribers = self.subscribers.lock();
        if let Some(feeds) = subscribers.get_mut(&collection) {
            if feeds.remove(&token).is_some() {
                tracing::debug!(%collection, %token, "watch subscription released");
            }
        }
    }
}

/// An active subscription to one collection's change events.
///
/// The feed is a lazy unbounded sequence: each received event carries the
/// ids changed by one commit. Dropping the feed unsubscribes it from the
/// hub.
#[derive(Debug)]
pub struct ChangeFeed {
    collection: Collection,
    token: Uuid,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    hub: Arc<ChangeHub>,
}

impl ChangeFeed {
    /// The collection this feed observes.
    #[must_use]
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Receive the next change event, suspending until one is published.
    /// Returns `None` if the hub is gone.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Receive a change event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.collection, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = Arc::new(ChangeHub::new());
        let mut feed_a = hub.subscribe(Collection::Machines);
        let mut feed_b = hub.subscribe(Collection::Machines);

        hub.publish(Collection::Machines, vec!["0".into(), "1".into()]);

        for feed in [&mut feed_a, &mut feed_b] {
            let event = feed.recv().await.unwrap();
            assert_eq!(event.collection, Collection::Machines);
            assert_eq!(event.ids, vec!["0".to_string(), "1".to_string()]);
        }
    }

    #[tokio::test]
    async fn publish_is_scoped_to_collection() {
        let hub = Arc::new(ChangeHub::new());
        let mut machines = hub.subscribe(Collection::Machines);
        let mut units = hub.subscribe(Collection::Units);

        hub.publish(Collection::Units, vec!["app/0".into()]);

        assert!(machines.try_recv().is_none());
        assert_eq!(units.recv().await.unwrap().ids, vec!["app/0".to_string()]);
    }

    #[tokio::test]
    async fn drop_releases_subscription() {
        let hub = Arc::new(ChangeHub::new());
        let feed = hub.subscribe(Collection::Machines);
        assert_eq!(hub.subscriber_count(Collection::Machines), 1);
        drop(feed);
        assert_eq!(hub.subscriber_count(Collection::Machines), 0);
    }

    #[tokio::test]
    async fn empty_publish_is_dropped() {
        let hub = Arc::new(ChangeHub::new());
        let mut feed = hub.subscribe(Collection::Machines);
        hub.publish(Collection::Machines, Vec::new());
        assert!(feed.try_recv().is_none());
    }
}
