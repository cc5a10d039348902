/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use commons_protocol::{ChangeNotification, PostRow, StreamFilter, Table};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::AggregateMerger;
use crate::backend::{ChannelSubscription, PushChannel};
use crate::controller::FeedShared;
use crate::error::{ChannelError, QueryError, SyncError};
use crate::feed_event::{normalize, FeedEvent};
use crate::hydrate::Hydrator;
use crate::retry::next_backoff;
use crate::store::{FeedItem, MediaRef, PostPatch};

/// Everything the dispatch task needs to route events: session state, the
/// hydrator and merger, and the reconnect policy.
#[derive(Clone)]
pub(crate) struct DispatchCtx {
    pub(crate) shared: Arc<FeedShared>,
    pub(crate) hydrator: Arc<Hydrator>,
    pub(crate) merger: Arc<AggregateMerger>,
    pub(crate) reconnect_base_ms: u64,
    pub(crate) reconnect_max_ms: u64,
    pub(crate) catchup_limit: u32,
}

/// Owns the lifecycle of the three table subscriptions (posts, likes,
/// comments). Idle -> attach -> Active -> detach -> Idle; a detach joins
/// the dispatch task before returning, so after a filter switch begins no
/// event from the old filter can reach the store. Channel drops while
/// Active trigger automatic re-subscription with backoff plus one
/// corrective bulk hydrate.
pub struct SubscriptionManager {
    channel: Arc<dyn PushChannel>,
    state: TokioMutex<ManagerState>,
}

enum ManagerState {
    Idle,
    Active {
        shutdown_tx: watch::Sender<bool>,
        join: JoinHandle<()>,
    },
}

impl SubscriptionManager {
    pub(crate) fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel,
            state: TokioMutex::new(ManagerState::Idle),
        }
    }

    /// Idle -> Active. Subscribes all three tables (posts scoped to the
    /// space, likes/comments unscoped) and spawns the dispatch task.
    /// Attach while Active is a contract violation.
    pub(crate) async fn attach(&self, space: Option<String>, ctx: DispatchCtx) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if matches!(*state, ManagerState::Active { .. }) {
            return Err(SyncError::ContractViolation("attach while active"));
        }
        let streams = subscribe_all(&self.channel, space.as_deref()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        ctx.shared.metrics.set_connected(true);
        let join = tokio::spawn(run_dispatch(
            self.channel.clone(),
            ctx,
            space,
            streams,
            shutdown_rx,
        ));
        *state = ManagerState::Active { shutdown_tx, join };
        Ok(())
    }

    /// Active -> Idle. Completes only after the dispatch task has stopped
    /// and every channel handle is torn down. Detach while Idle is a
    /// contract violation.
    pub(crate) async fn detach(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let prev = std::mem::replace(&mut *state, ManagerState::Idle);
        let ManagerState::Active { shutdown_tx, join } = prev else {
            return Err(SyncError::ContractViolation("detach while idle"));
        };
        let _ = shutdown_tx.send(true);
        if let Err(e) = join.await {
            warn!("dispatch task ended abnormally: {e:#}");
        }
        Ok(())
    }

    pub(crate) async fn is_active(&self) -> bool {
        matches!(*self.state.lock().await, ManagerState::Active { .. })
    }
}

struct TableStreams {
    posts: ChannelSubscription,
    likes: ChannelSubscription,
    comments: ChannelSubscription,
}

async fn subscribe_all(
    channel: &Arc<dyn PushChannel>,
    space: Option<&str>,
) -> Result<TableStreams, ChannelError> {
    let posts_filter = space.map(|s| StreamFilter::eq("space_id", s));
    let posts = channel.subscribe(Table::Posts, posts_filter).await?;
    let likes = match channel.subscribe(Table::Likes, None).await {
        Ok(v) => v,
        Err(e) => {
            teardown(channel, posts).await;
            return Err(e);
        }
    };
    let comments = match channel.subscribe(Table::Comments, None).await {
        Ok(v) => v,
        Err(e) => {
            teardown(channel, posts).await;
            teardown(channel, likes).await;
            return Err(e);
        }
    };
    Ok(TableStreams {
        posts,
        likes,
        comments,
    })
}

async fn teardown(channel: &Arc<dyn PushChannel>, sub: ChannelSubscription) {
    // Best-effort: the channel may already consider the handle gone.
    if let Err(e) = channel.unsubscribe(sub.handle).await {
        debug!("unsubscribe failed: {e:#}");
    }
}

async fn teardown_all(channel: &Arc<dyn PushChannel>, streams: TableStreams) {
    teardown(channel, streams.posts).await;
    teardown(channel, streams.likes).await;
    teardown(channel, streams.comments).await;
}

async fn run_dispatch(
    channel: Arc<dyn PushChannel>,
    ctx: DispatchCtx,
    space: Option<String>,
    mut streams: TableStreams,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let lost = pump(&ctx, &mut streams, &mut shutdown).await;
        teardown_all(&channel, streams).await;
        if !lost {
            ctx.shared.metrics.set_connected(false);
            return;
        }

        ctx.shared.metrics.set_last_error("push channel dropped".to_string());
        ctx.shared.metrics.set_connected(false);
        ctx.shared.metrics.reconnect();
        info!("push channel dropped, resubscribing");

        let mut attempt: u32 = 1;
        streams = loop {
            let delay = next_backoff(attempt, ctx.reconnect_base_ms, ctx.reconnect_max_ms);
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match subscribe_all(&channel, space.as_deref()).await {
                Ok(s) => break s,
                Err(e) => {
                    warn!("resubscribe failed: {e:#}");
                    attempt = attempt.saturating_add(1);
                }
            }
        };
        ctx.shared.metrics.set_connected(true);

        // Catch up on whatever was missed while disconnected. Reintroduced
        // ids go through the store presence check, so items the session
        // already holds are refreshed, never duplicated.
        tokio::select! {
            _ = shutdown.changed() => {
                teardown_all(&channel, streams).await;
                ctx.shared.metrics.set_connected(false);
                return;
            }
            res = catch_up(&ctx, space.as_deref()) => {
                if let Err(e) = res {
                    warn!("reconnect catch-up failed: {e:#}");
                    ctx.shared.metrics.mark_stale();
                }
            }
        }
    }
}

/// Pumps notifications until shutdown (returns false) or a closed stream
/// (returns true). The shutdown watch is only ever signaled to stop, so
/// any completion of `changed` ends the loop; an in-flight handler is
/// cancelled at its next await point, which is safe because the session
/// state it may have half-touched is discarded right after a detach.
async fn pump(
    ctx: &DispatchCtx,
    streams: &mut TableStreams,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        let raw = tokio::select! {
            _ = shutdown.changed() => return false,
            ev = streams.posts.events.recv() => match ev {
                Some(n) => n,
                None => return true,
            },
            ev = streams.likes.events.recv() => match ev {
                Some(n) => n,
                None => return true,
            },
            ev = streams.comments.events.recv() => match ev {
                Some(n) => n,
                None => return true,
            },
        };
        tokio::select! {
            _ = shutdown.changed() => return false,
            _ = handle_notification(ctx, raw) => {}
        }
    }
}

async fn handle_notification(ctx: &DispatchCtx, raw: ChangeNotification) {
    ctx.shared.metrics.event_seen();
    let Some(event) = normalize(&raw) else {
        ctx.shared.metrics.event_dropped();
        return;
    };
    match event {
        FeedEvent::PostInserted { id, row } => insert_post(ctx, id, row).await,
        FeedEvent::PostUpdated { id, row } => {
            ctx.shared
                .store
                .lock()
                .unwrap()
                .apply_update(&id, patch_from_row(&row));
        }
        FeedEvent::PostDeleted { id } => {
            ctx.shared.store.lock().unwrap().apply_delete(&id);
        }
        event @ (FeedEvent::LikeChanged { .. } | FeedEvent::CommentChanged { .. }) => {
            if let Err(e) = ctx.merger.apply_count_event(&ctx.shared.store, &event).await {
                warn!("aggregate refresh failed: {e:#}");
                ctx.shared.metrics.mark_stale();
            }
        }
    }
}

async fn insert_post(ctx: &DispatchCtx, id: String, row: PostRow) {
    let first_seen = ctx.shared.ledger.lock().unwrap().mark_seen(&id);
    let present = ctx.shared.store.lock().unwrap().contains(&id);
    if !first_seen || present {
        // Echo of an item this session already materialized (optimistic
        // local insert, bulk fetch, or a hydration still in flight): merge
        // the server-assigned row fields instead of re-hydrating.
        ctx.shared.metrics.duplicate_suppressed();
        ctx.shared
            .store
            .lock()
            .unwrap()
            .apply_update(&id, patch_from_row(&row));
        return;
    }
    match ctx.hydrator.hydrate_one(&id, ctx.shared.viewer.as_deref()).await {
        Ok(item) => {
            ctx.shared.metrics.hydration_ok();
            ctx.shared.store.lock().unwrap().apply_insert(item);
        }
        Err(QueryError::NotFound(_)) => {
            debug!(post = %id, "row vanished before hydration landed");
        }
        Err(e) => {
            warn!(post = %id, "hydration failed: {e:#}");
            ctx.shared.metrics.hydration_failed();
            ctx.shared.metrics.mark_stale();
        }
    }
}

async fn catch_up(ctx: &DispatchCtx, space: Option<&str>) -> Result<(), QueryError> {
    let items = ctx
        .hydrator
        .hydrate_many(space, ctx.shared.viewer.as_deref(), ctx.catchup_limit)
        .await?;
    let mut ledger = ctx.shared.ledger.lock().unwrap();
    let mut store = ctx.shared.store.lock().unwrap();
    for item in items.into_iter().rev() {
        ledger.mark_seen(&item.id);
        if store.contains(&item.id) {
            store.apply_update(&item.id, patch_from_item(&item));
        } else {
            store.apply_insert(item);
        }
    }
    Ok(())
}

/// Patch carrying the fields a raw posts row can speak for. Author and
/// space stay untouched; the row only holds their ids.
fn patch_from_row(row: &PostRow) -> PostPatch {
    PostPatch {
        body: Some(row.body.clone()),
        media: Some(
            row.media
                .iter()
                .map(|url| MediaRef {
                    url: url.clone(),
                    media_type: None,
                })
                .collect(),
        ),
        created_at_ms: Some(row.created_at_ms),
        ..Default::default()
    }
}

/// Full refresh patch from a rehydrated item (reconnect catch-up). A
/// degraded author/space lookup leaves the previously known value alone.
fn patch_from_item(item: &FeedItem) -> PostPatch {
    PostPatch {
        author: item.author.clone(),
        space: item.space.clone(),
        body: Some(item.body.clone()),
        media: Some(item.media.clone()),
        created_at_ms: Some(item.created_at_ms),
        like_count: Some(item.like_count),
        comment_count: Some(item.comment_count),
        viewer_has_liked: Some(item.viewer_has_liked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SeenLedger;
    use crate::memory::MemoryBackend;
    use crate::metrics::FeedMetrics;
    use crate::store::FeedStore;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;

    fn ctx(backend: &Arc<MemoryBackend>) -> DispatchCtx {
        let query: Arc<dyn crate::backend::RowQuery> = backend.clone();
        DispatchCtx {
            shared: Arc::new(FeedShared {
                store: Mutex::new(FeedStore::new()),
                ledger: Mutex::new(SeenLedger::new()),
                epoch: AtomicU64::new(0),
                viewer: None,
                metrics: Arc::new(FeedMetrics::new()),
            }),
            hydrator: Arc::new(Hydrator::new(query.clone(), 1)),
            merger: Arc::new(AggregateMerger::new(query, 1)),
            reconnect_base_ms: 10,
            reconnect_max_ms: 50,
            catchup_limit: 10,
        }
    }

    #[tokio::test]
    async fn attach_while_active_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SubscriptionManager::new(backend.clone());
        let c = ctx(&backend);
        manager.attach(None, c.clone()).await.expect("first attach");
        let err = manager.attach(None, c).await.expect_err("second attach");
        assert!(matches!(err, SyncError::ContractViolation(_)));
        manager.detach().await.expect("detach");
    }

    #[tokio::test]
    async fn detach_while_idle_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SubscriptionManager::new(backend.clone());
        let err = manager.detach().await.expect_err("idle detach");
        assert!(matches!(err, SyncError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn detach_tears_down_every_subscription() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = SubscriptionManager::new(backend.clone());
        manager.attach(Some("s1".to_string()), ctx(&backend)).await.expect("attach");
        assert_eq!(backend.live_subscriptions(), 3);
        assert!(manager.is_active().await);
        manager.detach().await.expect("detach");
        assert_eq!(backend.live_subscriptions(), 0);
        assert!(!manager.is_active().await);
    }
}
