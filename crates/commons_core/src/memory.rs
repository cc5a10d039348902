/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use commons_protocol::{ChangeNotification, ChangeOp, CommentRow, LikeRow, PostRow, StreamFilter, Table};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{ChannelHandle, ChannelSubscription, PushChannel, RowQuery};
use crate::error::{ChannelError, QueryError};
use crate::store::{AuthorRef, SpaceRef};

/// In-process implementation of both backend seams, used by the dev
/// driver and the test suite. Writes announce themselves on the matching
/// table channel the way the managed platform's push channel would, and
/// the knobs (`set_query_outage`, `set_query_delay_ms`,
/// `drop_connections`, `insert_post_silent`) simulate the failure modes
/// the engine has to absorb.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    posts: HashMap<String, PostRow>,
    authors: HashMap<String, AuthorRef>,
    spaces: HashMap<String, SpaceRef>,
    likes: Vec<LikeRow>,
    comments: Vec<CommentRow>,
    subs: Vec<SubEntry>,
    next_token: u64,
    query_outage: bool,
    query_delay_ms: u64,
}

struct SubEntry {
    token: u64,
    table: Table,
    filter: Option<StreamFilter>,
    tx: mpsc::Sender<ChangeNotification>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn seed_author(&self, id: &str, display_name: Option<&str>, avatar_url: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.authors.insert(
            id.to_string(),
            AuthorRef {
                id: id.to_string(),
                display_name: display_name.map(str::to_string),
                avatar_url: avatar_url.map(str::to_string),
            },
        );
    }

    pub fn seed_space(&self, id: &str, name: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.spaces.insert(
            id.to_string(),
            SpaceRef {
                id: id.to_string(),
                name: name.map(str::to_string),
            },
        );
    }

    /// Stores the row and announces it on the posts channel.
    pub fn insert_post(&self, row: PostRow) {
        let mut inner = self.inner.lock().unwrap();
        inner.posts.insert(row.id.clone(), row.clone());
        let new = serde_json::to_value(&row).ok();
        let space = row.space_id.clone();
        emit(&mut inner, Table::Posts, ChangeOp::Insert, new, None, space.as_deref());
    }

    /// Stores the row without announcing it: a write that happened while
    /// the channel was down, visible only to a later bulk fetch.
    pub fn insert_post_silent(&self, row: PostRow) {
        let mut inner = self.inner.lock().unwrap();
        inner.posts.insert(row.id.clone(), row);
    }

    /// Re-announces an existing row on the posts channel without touching
    /// it: the echo a client sees for its own optimistic write.
    pub fn echo_post(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(row) = inner.posts.get(id).cloned() else {
            return;
        };
        let new = serde_json::to_value(&row).ok();
        emit(&mut inner, Table::Posts, ChangeOp::Insert, new, None, row.space_id.as_deref());
    }

    pub fn update_post(&self, row: PostRow) {
        let mut inner = self.inner.lock().unwrap();
        inner.posts.insert(row.id.clone(), row.clone());
        let new = serde_json::to_value(&row).ok();
        let space = row.space_id.clone();
        emit(&mut inner, Table::Posts, ChangeOp::Update, new, None, space.as_deref());
    }

    pub fn delete_post(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(row) = inner.posts.remove(id) else {
            return;
        };
        let old = Some(serde_json::json!({ "id": id }));
        emit(&mut inner, Table::Posts, ChangeOp::Delete, None, old, row.space_id.as_deref());
    }

    pub fn add_like(&self, like: LikeRow) {
        let mut inner = self.inner.lock().unwrap();
        let new = serde_json::to_value(&like).ok();
        inner.likes.push(like);
        emit(&mut inner, Table::Likes, ChangeOp::Insert, new, None, None);
    }

    pub fn remove_like(&self, like_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.likes.iter().position(|l| l.id == like_id) else {
            return;
        };
        let like = inner.likes.remove(pos);
        let old = serde_json::to_value(&like).ok();
        emit(&mut inner, Table::Likes, ChangeOp::Delete, None, old, None);
    }

    pub fn add_comment(&self, comment: CommentRow) {
        let mut inner = self.inner.lock().unwrap();
        let new = serde_json::to_value(&comment).ok();
        inner.comments.push(comment);
        emit(&mut inner, Table::Comments, ChangeOp::Insert, new, None, None);
    }

    pub fn remove_comment(&self, comment_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.comments.iter().position(|c| c.id == comment_id) else {
            return;
        };
        let comment = inner.comments.remove(pos);
        let old = serde_json::to_value(&comment).ok();
        emit(&mut inner, Table::Comments, ChangeOp::Delete, None, old, None);
    }

    /// Delivers an arbitrary notification to every subscriber of its
    /// table label, filters ignored. For malformed-payload tests.
    pub fn emit_raw(&self, notification: ChangeNotification) {
        let mut inner = self.inner.lock().unwrap();
        inner.subs.retain(|s| !s.tx.is_closed());
        for sub in inner
            .subs
            .iter()
            .filter(|s| s.table.as_str() == notification.table)
        {
            if let Err(e) = sub.tx.try_send(notification.clone()) {
                debug!("dropping raw notification: {e}");
            }
        }
    }

    /// Severs every live subscription without unregistering anything;
    /// subscribers observe their stream closing, like a transport drop.
    pub fn drop_connections(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.subs.clear();
    }

    pub fn live_subscriptions(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.subs.retain(|s| !s.tx.is_closed());
        inner.subs.len()
    }

    /// While on, every query answers `QueryError::Transient`.
    pub fn set_query_outage(&self, on: bool) {
        self.inner.lock().unwrap().query_outage = on;
    }

    /// Artificial latency per query call, for in-flight-cancellation
    /// tests.
    pub fn set_query_delay_ms(&self, ms: u64) {
        self.inner.lock().unwrap().query_delay_ms = ms;
    }

    async fn pause(&self) {
        let ms = self.inner.lock().unwrap().query_delay_ms;
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn guard(&self) -> Result<(), QueryError> {
        if self.inner.lock().unwrap().query_outage {
            return Err(QueryError::Transient("query service offline".to_string()));
        }
        Ok(())
    }
}

fn emit(
    inner: &mut Inner,
    table: Table,
    op: ChangeOp,
    new: Option<serde_json::Value>,
    old: Option<serde_json::Value>,
    space: Option<&str>,
) {
    let notification = ChangeNotification {
        table: table.as_str().to_string(),
        op,
        new,
        old,
    };
    inner.subs.retain(|s| !s.tx.is_closed());
    for sub in inner.subs.iter().filter(|s| s.table == table) {
        // Only the posts channel supports a scope predicate here; likes
        // and comments subscriptions are unscoped.
        if let Some(f) = &sub.filter {
            if f.column == "space_id" && Some(f.value.as_str()) != space {
                continue;
            }
        }
        if let Err(e) = sub.tx.try_send(notification.clone()) {
            debug!("dropping notification for slow subscriber: {e}");
        }
    }
}

#[async_trait]
impl RowQuery for MemoryBackend {
    async fn fetch_post(&self, id: &str) -> Result<Option<PostRow>, QueryError> {
        self.pause().await;
        self.guard()?;
        Ok(self.inner.lock().unwrap().posts.get(id).cloned())
    }

    async fn list_posts(&self, space: Option<&str>, limit: u32) -> Result<Vec<PostRow>, QueryError> {
        self.pause().await;
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<PostRow> = inner
            .posts
            .values()
            .filter(|r| match space {
                Some(s) => r.space_id.as_deref() == Some(s),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn fetch_author(&self, id: &str) -> Result<Option<AuthorRef>, QueryError> {
        self.pause().await;
        self.guard()?;
        Ok(self.inner.lock().unwrap().authors.get(id).cloned())
    }

    async fn fetch_authors(&self, ids: &[String]) -> Result<Vec<AuthorRef>, QueryError> {
        self.pause().await;
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| inner.authors.get(id).cloned())
            .collect())
    }

    async fn fetch_space(&self, id: &str) -> Result<Option<SpaceRef>, QueryError> {
        self.pause().await;
        self.guard()?;
        Ok(self.inner.lock().unwrap().spaces.get(id).cloned())
    }

    async fn fetch_spaces(&self, ids: &[String]) -> Result<Vec<SpaceRef>, QueryError> {
        self.pause().await;
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| inner.spaces.get(id).cloned())
            .collect())
    }

    async fn like_count(&self, post_id: &str) -> Result<u64, QueryError> {
        self.pause().await;
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.likes.iter().filter(|l| l.post_id == post_id).count() as u64)
    }

    async fn comment_count(&self, post_id: &str) -> Result<u64, QueryError> {
        self.pause().await;
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.comments.iter().filter(|c| c.post_id == post_id).count() as u64)
    }

    async fn viewer_has_liked(&self, post_id: &str, viewer_id: &str) -> Result<bool, QueryError> {
        self.pause().await;
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .likes
            .iter()
            .any(|l| l.post_id == post_id && l.user_id == viewer_id))
    }
}

#[async_trait]
impl PushChannel for MemoryBackend {
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<StreamFilter>,
    ) -> Result<ChannelSubscription, ChannelError> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.lock().unwrap();
        inner.next_token += 1;
        let token = inner.next_token;
        inner.subs.push(SubEntry {
            token,
            table,
            filter,
            tx,
        });
        Ok(ChannelSubscription {
            handle: ChannelHandle { table, token },
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: ChannelHandle) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().unwrap();
        inner.subs.retain(|s| s.token != handle.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str, space: Option<&str>, ts: i64) -> PostRow {
        PostRow {
            id: id.to_string(),
            author_id: "u1".to_string(),
            space_id: space.map(str::to_string),
            body: String::new(),
            media: Vec::new(),
            created_at_ms: ts,
        }
    }

    #[tokio::test]
    async fn posts_subscriptions_respect_the_space_predicate() {
        let backend = MemoryBackend::new();
        let mut sub = backend
            .subscribe(Table::Posts, Some(StreamFilter::eq("space_id", "s1")))
            .await
            .expect("subscribe");
        backend.insert_post(post("in", Some("s1"), 1));
        backend.insert_post(post("out", Some("s2"), 2));
        backend.insert_post(post("in2", Some("s1"), 3));

        let first = sub.events.recv().await.expect("first");
        let second = sub.events.recv().await.expect("second");
        let ids: Vec<String> = [first, second]
            .iter()
            .map(|n| {
                n.new
                    .as_ref()
                    .and_then(|v| v.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();
        assert_eq!(ids, vec!["in", "in2"]);
    }

    #[tokio::test]
    async fn drop_connections_closes_the_stream() {
        let backend = MemoryBackend::new();
        let mut sub = backend
            .subscribe(Table::Likes, None)
            .await
            .expect("subscribe");
        backend.drop_connections();
        assert!(sub.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn outage_turns_queries_transient() {
        let backend = MemoryBackend::new();
        backend.insert_post(post("p1", None, 1));
        backend.set_query_outage(true);
        assert!(matches!(
            backend.fetch_post("p1").await,
            Err(QueryError::Transient(_))
        ));
        backend.set_query_outage(false);
        assert!(backend.fetch_post("p1").await.expect("query").is_some());
    }
}
