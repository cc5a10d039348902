/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::{Arc, Mutex};

use crate::backend::RowQuery;
use crate::error::QueryError;
use crate::feed_event::FeedEvent;
use crate::retry::with_retry;
use crate::store::{FeedStore, PostPatch};

/// Folds like/comment change events into the cached aggregate fields of an
/// existing feed item. The count is always re-read from the backend's
/// materialized aggregate: local increment/decrement under concurrent
/// events from multiple users is not idempotent, the authoritative re-read
/// is. Events for posts the store does not hold (another space, already
/// deleted) are no-ops and skip the query entirely.
pub struct AggregateMerger {
    query: Arc<dyn RowQuery>,
    attempts: u32,
}

impl AggregateMerger {
    pub fn new(query: Arc<dyn RowQuery>, attempts: u32) -> Self {
        Self { query, attempts }
    }

    pub async fn apply_count_event(
        &self,
        store: &Mutex<FeedStore>,
        event: &FeedEvent,
    ) -> Result<(), QueryError> {
        let (post_id, likes) = match event {
            FeedEvent::LikeChanged { post_id, .. } => (post_id.as_str(), true),
            FeedEvent::CommentChanged { post_id, .. } => (post_id.as_str(), false),
            _ => return Ok(()),
        };

        if !store.lock().unwrap().contains(post_id) {
            return Ok(());
        }

        let patch = if likes {
            let n = with_retry(|| self.query.like_count(post_id), self.attempts).await?;
            PostPatch {
                like_count: Some(n),
                ..Default::default()
            }
        } else {
            let n = with_retry(|| self.query.comment_count(post_id), self.attempts).await?;
            PostPatch {
                comment_count: Some(n),
                ..Default::default()
            }
        };

        // The item may have been deleted while the count was in flight;
        // apply_update is a no-op then.
        store.lock().unwrap().apply_update(post_id, patch);
        Ok(())
    }
}
