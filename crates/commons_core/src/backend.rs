/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use commons_protocol::{ChangeNotification, PostRow, StreamFilter, Table};
use tokio::sync::mpsc;

use crate::error::{ChannelError, QueryError};
use crate::store::{AuthorRef, SpaceRef};

/// Row query seam of the managed data platform. Point lookups, filtered
/// list queries and in-set batch lookups; the hydrator is the only caller.
#[async_trait]
pub trait RowQuery: Send + Sync {
    async fn fetch_post(&self, id: &str) -> Result<Option<PostRow>, QueryError>;

    /// Posts for `space` (all spaces when `None`), newest first, at most
    /// `limit` rows.
    async fn list_posts(&self, space: Option<&str>, limit: u32) -> Result<Vec<PostRow>, QueryError>;

    async fn fetch_author(&self, id: &str) -> Result<Option<AuthorRef>, QueryError>;
    async fn fetch_authors(&self, ids: &[String]) -> Result<Vec<AuthorRef>, QueryError>;
    async fn fetch_space(&self, id: &str) -> Result<Option<SpaceRef>, QueryError>;
    async fn fetch_spaces(&self, ids: &[String]) -> Result<Vec<SpaceRef>, QueryError>;

    /// Authoritative materialized aggregates. Always re-read, never
    /// locally incremented.
    async fn like_count(&self, post_id: &str) -> Result<u64, QueryError>;
    async fn comment_count(&self, post_id: &str) -> Result<u64, QueryError>;

    async fn viewer_has_liked(&self, post_id: &str, viewer_id: &str) -> Result<bool, QueryError>;
}

/// Teardown token for one live table subscription. Consumed by
/// `PushChannel::unsubscribe`, so a handle can be torn down exactly once.
#[derive(Debug)]
pub struct ChannelHandle {
    pub table: Table,
    pub token: u64,
}

/// One live subscription: the teardown handle plus the notification
/// stream. The stream ending (`recv` returning `None`) means the channel
/// dropped the subscription.
pub struct ChannelSubscription {
    pub handle: ChannelHandle,
    pub events: mpsc::Receiver<ChangeNotification>,
}

/// Push-notification seam of the managed data platform; one independent
/// subscription per table, optionally scoped by an equality predicate.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(
        &self,
        table: Table,
        filter: Option<StreamFilter>,
    ) -> Result<ChannelSubscription, ChannelError>;

    async fn unsubscribe(&self, handle: ChannelHandle) -> Result<(), ChannelError>;
}
