/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorRef {
    pub id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub media_type: Option<String>,
}

/// A fully displayable feed entry. `viewer_has_liked` is meaningful only
/// when the session was constructed with a viewer identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub author: Option<AuthorRef>,
    pub space: Option<SpaceRef>,
    pub body: String,
    pub media: Vec<MediaRef>,
    pub created_at_ms: i64,
    pub like_count: u64,
    pub comment_count: u64,
    pub viewer_has_liked: bool,
}

/// Field-wise merge shape for `apply_update`. `None` leaves the stored
/// value untouched, which is what lets an optimistic local insert and its
/// remote echo end up with whichever side carried the richer data.
#[derive(Debug, Clone, Default)]
pub struct PostPatch {
    pub author: Option<AuthorRef>,
    pub space: Option<SpaceRef>,
    pub body: Option<String>,
    pub media: Option<Vec<MediaRef>>,
    pub created_at_ms: Option<i64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub viewer_has_liked: Option<bool>,
}

/// Filter-scoped, insertion-ordered feed list. Head = index 0. Freshly
/// announced remote inserts land at the head regardless of their own
/// timestamp; bulk population is applied oldest-first by the caller so the
/// resulting snapshot is newest-first. Invariant: no two entries share an
/// id.
pub struct FeedStore {
    items: Vec<FeedItem>,
    ids: HashSet<String>,
    version_tx: watch::Sender<u64>,
}

impl Default for FeedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedStore {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            items: Vec::new(),
            ids: HashSet::new(),
            version_tx,
        }
    }

    /// Inserts at the head. No-op (returns false) when an item with the
    /// same id is already present; this check holds even when the ledger
    /// fast path was bypassed.
    pub fn apply_insert(&mut self, item: FeedItem) -> bool {
        if self.ids.contains(&item.id) {
            return false;
        }
        self.ids.insert(item.id.clone());
        self.items.insert(0, item);
        self.bump();
        true
    }

    /// Merges `patch` into the existing item. No-op if absent or if the
    /// patch changes nothing.
    pub fn apply_update(&mut self, id: &str, patch: PostPatch) -> bool {
        let Some(item) = self.items.iter_mut().find(|i| i.id == id) else {
            return false;
        };
        let changed = merge(item, patch);
        if changed {
            self.bump();
        }
        changed
    }

    pub fn apply_delete(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.items.retain(|i| i.id != id);
        self.bump();
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Read-only view for the rendering layer, reflecting every `apply_*`
    /// call made so far, in call order.
    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        if self.items.is_empty() {
            return;
        }
        self.items.clear();
        self.ids.clear();
        self.bump();
    }

    /// "Something changed, re-read" signal; the value is a version counter.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    fn bump(&mut self) {
        self.version_tx.send_modify(|v| *v = v.wrapping_add(1));
    }
}

fn merge(item: &mut FeedItem, patch: PostPatch) -> bool {
    let mut changed = false;
    if let Some(v) = patch.author {
        if item.author.as_ref() != Some(&v) {
            item.author = Some(v);
            changed = true;
        }
    }
    if let Some(v) = patch.space {
        if item.space.as_ref() != Some(&v) {
            item.space = Some(v);
            changed = true;
        }
    }
    if let Some(v) = patch.body {
        if item.body != v {
            item.body = v;
            changed = true;
        }
    }
    if let Some(v) = patch.media {
        if item.media != v {
            item.media = v;
            changed = true;
        }
    }
    if let Some(v) = patch.created_at_ms {
        if item.created_at_ms != v {
            item.created_at_ms = v;
            changed = true;
        }
    }
    if let Some(v) = patch.like_count {
        if item.like_count != v {
            item.like_count = v;
            changed = true;
        }
    }
    if let Some(v) = patch.comment_count {
        if item.comment_count != v {
            item.comment_count = v;
            changed = true;
        }
    }
    if let Some(v) = patch.viewer_has_liked {
        if item.viewer_has_liked != v {
            item.viewer_has_liked = v;
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, created_at_ms: i64) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            author: None,
            space: None,
            body: format!("body of {id}"),
            media: Vec::new(),
            created_at_ms,
            like_count: 0,
            comment_count: 0,
            viewer_has_liked: false,
        }
    }

    #[test]
    fn insert_is_idempotent_per_id() {
        let mut store = FeedStore::new();
        assert!(store.apply_insert(item("p1", 10)));
        assert!(!store.apply_insert(item("p1", 10)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn fresh_inserts_land_at_the_head_regardless_of_timestamp() {
        let mut store = FeedStore::new();
        // Bulk page, oldest applied first.
        store.apply_insert(item("p3", 100));
        store.apply_insert(item("p2", 200));
        store.apply_insert(item("p1", 300));
        // Announced later, but older than everything loaded.
        store.apply_insert(item("p0", 50));
        let snap = store.snapshot();
        let ids: Vec<&str> = snap.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3"]);
    }

    #[test]
    fn update_merges_only_supplied_fields() {
        let mut store = FeedStore::new();
        let mut it = item("p1", 10);
        it.like_count = 3;
        store.apply_insert(it);
        let changed = store.apply_update(
            "p1",
            PostPatch {
                body: Some("edited".to_string()),
                ..Default::default()
            },
        );
        assert!(changed);
        let snap = store.snapshot();
        assert_eq!(snap[0].body, "edited");
        assert_eq!(snap[0].like_count, 3);
    }

    #[test]
    fn update_and_delete_on_absent_ids_are_noops() {
        let mut store = FeedStore::new();
        assert!(!store.apply_update("ghost", PostPatch::default()));
        assert!(!store.apply_delete("ghost"));
    }

    #[test]
    fn delete_removes_exactly_one_entry() {
        let mut store = FeedStore::new();
        store.apply_insert(item("p1", 10));
        store.apply_insert(item("p2", 20));
        assert!(store.apply_delete("p1"));
        assert!(!store.contains("p1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn mutations_bump_the_change_signal_exactly_when_something_changed() {
        let mut store = FeedStore::new();
        let rx = store.changes();
        let v0 = *rx.borrow();
        store.apply_insert(item("p1", 10));
        let v1 = *rx.borrow();
        assert_ne!(v0, v1);
        // Duplicate insert changes nothing and must not signal.
        store.apply_insert(item("p1", 10));
        assert_eq!(*rx.borrow(), v1);
        // No-field patch changes nothing either.
        store.apply_update("p1", PostPatch::default());
        assert_eq!(*rx.borrow(), v1);
    }
}
