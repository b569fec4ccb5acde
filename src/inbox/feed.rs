//! Realtime fan-out of inbox item mutations.
//!
//! The server side (`InboxFeed`) broadcasts every insert/update/delete to
//! subscribers scoped to one artisan. The consumer side (`InboxList`) holds
//! the list from the last full fetch and applies live deltas to it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::model::InboxItem;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Messages sent to feed subscribers (and over the WebSocket).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// A new item was created.
    InboxInsert { item: InboxItem },
    /// An existing item changed.
    InboxUpdate { item: InboxItem },
    /// An item was deleted.
    InboxDelete { id: Uuid },
    /// Full list snapshot (sent on connect and after lag).
    InboxSync { items: Vec<InboxItem> },
}

/// A feed message tagged with the artisan it belongs to.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub artisan_id: Uuid,
    pub message: FeedMessage,
}

/// Broadcast hub for inbox mutations.
pub struct InboxFeed {
    tx: broadcast::Sender<FeedEvent>,
}

impl InboxFeed {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self { tx })
    }

    /// Subscribe to mutations of one artisan's items.
    pub fn subscribe(&self, artisan_id: Uuid) -> FeedSubscription {
        FeedSubscription {
            artisan_id,
            rx: self.tx.subscribe(),
        }
    }

    pub fn publish_insert(&self, item: &InboxItem) {
        self.publish(item.artisan_id, FeedMessage::InboxInsert { item: item.clone() });
    }

    pub fn publish_update(&self, item: &InboxItem) {
        self.publish(item.artisan_id, FeedMessage::InboxUpdate { item: item.clone() });
    }

    pub fn publish_delete(&self, artisan_id: Uuid, id: Uuid) {
        self.publish(artisan_id, FeedMessage::InboxDelete { id });
    }

    fn publish(&self, artisan_id: Uuid, message: FeedMessage) {
        // Ok if nobody is listening
        if self.tx.send(FeedEvent { artisan_id, message }).is_err() {
            debug!(artisan_id = %artisan_id, "No feed subscribers");
        }
    }
}

/// Receiver filtered to a single artisan.
pub struct FeedSubscription {
    artisan_id: Uuid,
    rx: broadcast::Receiver<FeedEvent>,
}

impl FeedSubscription {
    pub fn artisan_id(&self) -> Uuid {
        self.artisan_id
    }

    /// Next message for this artisan. Messages for other artisans are skipped.
    pub async fn recv(&mut self) -> Result<FeedMessage, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if event.artisan_id == self.artisan_id {
                return Ok(event.message);
            }
        }
    }
}

/// Consumer-held ordered list of items.
///
/// Order is whatever the last full fetch returned (newest first) with live
/// inserts prepended. Updates replace entries in place and never re-sort.
#[derive(Debug, Clone, Default)]
pub struct InboxList {
    items: Vec<InboxItem>,
}

impl InboxList {
    pub fn from_snapshot(items: Vec<InboxItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[InboxItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Apply one feed message to the list.
    pub fn apply(&mut self, message: FeedMessage) {
        match message {
            FeedMessage::InboxInsert { item } => {
                if !self.items.iter().any(|i| i.id == item.id) {
                    self.items.insert(0, item);
                }
            }
            FeedMessage::InboxUpdate { item } => {
                if let Some(slot) = self.items.iter_mut().find(|i| i.id == item.id) {
                    *slot = item;
                }
            }
            FeedMessage::InboxDelete { id } => {
                self.items.retain(|i| i.id != id);
            }
            FeedMessage::InboxSync { items } => {
                self.items = items;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::model::{FileType, InboxSource, InboxStatus};

    fn make_item(artisan_id: Uuid, text: &str) -> InboxItem {
        InboxItem::new(artisan_id, InboxSource::Manual, FileType::Text, None)
            .unwrap()
            .with_raw_text(text)
    }

    #[test]
    fn insert_prepends() {
        let artisan = Uuid::new_v4();
        let old = make_item(artisan, "old");
        let mut list = InboxList::from_snapshot(vec![old.clone()]);

        let fresh = make_item(artisan, "fresh");
        list.apply(FeedMessage::InboxInsert { item: fresh.clone() });

        assert_eq!(list.len(), 2);
        assert_eq!(list.items()[0].id, fresh.id);
        assert_eq!(list.items()[1].id, old.id);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let item = make_item(Uuid::new_v4(), "x");
        let mut list = InboxList::from_snapshot(vec![item.clone()]);
        list.apply(FeedMessage::InboxInsert { item });
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn update_replaces_in_place_without_resorting() {
        let artisan = Uuid::new_v4();
        let a = make_item(artisan, "a");
        let b = make_item(artisan, "b");
        let c = make_item(artisan, "c");
        let mut list = InboxList::from_snapshot(vec![a.clone(), b.clone(), c.clone()]);

        let mut updated = c.clone();
        updated.status = InboxStatus::Classified;
        updated.updated_at = chrono::Utc::now() + chrono::Duration::seconds(10);
        list.apply(FeedMessage::InboxUpdate { item: updated });

        let ids: Vec<Uuid> = list.items().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(list.items()[2].status, InboxStatus::Classified);
    }

    #[test]
    fn update_of_unknown_item_is_ignored() {
        let mut list = InboxList::default();
        list.apply(FeedMessage::InboxUpdate { item: make_item(Uuid::new_v4(), "x") });
        assert!(list.is_empty());
    }

    #[test]
    fn delete_removes_entry() {
        let artisan = Uuid::new_v4();
        let a = make_item(artisan, "a");
        let b = make_item(artisan, "b");
        let mut list = InboxList::from_snapshot(vec![a.clone(), b.clone()]);
        list.apply(FeedMessage::InboxDelete { id: a.id });
        assert_eq!(list.len(), 1);
        assert_eq!(list.items()[0].id, b.id);
    }

    #[tokio::test]
    async fn subscription_is_scoped_to_artisan() {
        let feed = InboxFeed::new();
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();
        let mut sub = feed.subscribe(mine);

        feed.publish_insert(&make_item(theirs, "not mine"));
        let item = make_item(mine, "mine");
        feed.publish_insert(&item);

        match sub.recv().await.unwrap() {
            FeedMessage::InboxInsert { item: got } => assert_eq!(got.id, item.id),
            other => panic!("Expected InboxInsert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_event_is_delivered() {
        let feed = InboxFeed::new();
        let artisan = Uuid::new_v4();
        let mut sub = feed.subscribe(artisan);
        let id = Uuid::new_v4();
        feed.publish_delete(artisan, id);

        match sub.recv().await.unwrap() {
            FeedMessage::InboxDelete { id: got } => assert_eq!(got, id),
            other => panic!("Expected InboxDelete, got {:?}", other),
        }
    }

    #[test]
    fn feed_message_serialization_tags() {
        let msg = FeedMessage::InboxDelete { id: Uuid::nil() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "inbox_delete");
    }
}
