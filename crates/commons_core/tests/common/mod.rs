/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use commons_core::controller::FeedConfig;
use commons_core::store::FeedItem;
use commons_protocol::{CommentRow, LikeRow, PostRow};
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub fn post(id: &str, author: &str, space: Option<&str>, ts: i64) -> PostRow {
    PostRow {
        id: id.to_string(),
        author_id: author.to_string(),
        space_id: space.map(str::to_string),
        body: format!("body of {id}"),
        media: Vec::new(),
        created_at_ms: ts,
    }
}

pub fn like(id: &str, post_id: &str, user_id: &str) -> LikeRow {
    LikeRow {
        id: id.to_string(),
        post_id: post_id.to_string(),
        user_id: user_id.to_string(),
    }
}

pub fn comment(id: &str, post_id: &str, author_id: &str, ts: i64) -> CommentRow {
    CommentRow {
        id: id.to_string(),
        post_id: post_id.to_string(),
        author_id: author_id.to_string(),
        body: format!("comment {id}"),
        created_at_ms: ts,
    }
}

/// Fast backoffs so reconnect paths finish inside a test run.
pub fn fast_config() -> FeedConfig {
    FeedConfig {
        page_limit: 50,
        hydrate_attempts: 1,
        reconnect_base_backoff_ms: 10,
        reconnect_max_backoff_ms: 50,
    }
}

pub fn ids(snapshot: &[FeedItem]) -> Vec<String> {
    snapshot.iter().map(|i| i.id.clone()).collect()
}

/// Waits (bounded) until `cond` holds, re-checking on every store change
/// signal. Panics with `what` on timeout.
pub async fn wait_until<F>(changes: &mut watch::Receiver<u64>, what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        changes.borrow_and_update();
        if cond() {
            return;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            panic!("timed out waiting for: {what}");
        }
        match tokio::time::timeout(left, changes.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => panic!("store change signal closed while waiting for: {what}"),
            Err(_) => panic!("timed out waiting for: {what}"),
        }
    }
}
