/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use commons_protocol::PostRow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::RowQuery;
use crate::error::QueryError;
use crate::retry::with_retry;
use crate::store::{AuthorRef, FeedItem, MediaRef, SpaceRef};

/// Turns bare row identifiers into fully displayable feed items via the
/// row query service. The base row is essential; author and space lookups
/// degrade to `None` placeholders and aggregate reads degrade to zero, so
/// a flaky side-fetch never blocks an item from appearing. Transient
/// failures are retried with backoff before anything surfaces.
pub struct Hydrator {
    query: Arc<dyn RowQuery>,
    attempts: u32,
}

impl Hydrator {
    pub fn new(query: Arc<dyn RowQuery>, attempts: u32) -> Self {
        Self { query, attempts }
    }

    /// Hydrates a single post. Absence of the base row is a hard
    /// `QueryError::NotFound`; everything else degrades per field.
    pub async fn hydrate_one(&self, id: &str, viewer: Option<&str>) -> Result<FeedItem, QueryError> {
        let row = with_retry(|| self.query.fetch_post(id), self.attempts)
            .await?
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;

        let author = match with_retry(|| self.query.fetch_author(&row.author_id), self.attempts).await {
            Ok(v) => v,
            Err(e) => {
                debug!(author = %row.author_id, "author lookup degraded: {e:#}");
                None
            }
        };
        let space = match row.space_id.as_deref() {
            Some(space_id) => match with_retry(|| self.query.fetch_space(space_id), self.attempts).await {
                Ok(v) => v,
                Err(e) => {
                    debug!(space = %space_id, "space lookup degraded: {e:#}");
                    None
                }
            },
            None => None,
        };

        Ok(self.finish_item(row, author, space, viewer).await)
    }

    /// Bulk path for initial load, filter change and reconnect catch-up.
    /// Authors and spaces are resolved with in-set batch lookups; the
    /// degrade policy applies per item. Returns newest-first.
    pub async fn hydrate_many(
        &self,
        space: Option<&str>,
        viewer: Option<&str>,
        limit: u32,
    ) -> Result<Vec<FeedItem>, QueryError> {
        let rows = with_retry(|| self.query.list_posts(space, limit), self.attempts).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut author_ids: Vec<String> = rows.iter().map(|r| r.author_id.clone()).collect();
        author_ids.sort();
        author_ids.dedup();
        let authors: HashMap<String, AuthorRef> =
            match with_retry(|| self.query.fetch_authors(&author_ids), self.attempts).await {
                Ok(list) => list.into_iter().map(|a| (a.id.clone(), a)).collect(),
                Err(e) => {
                    debug!("author batch lookup degraded: {e:#}");
                    HashMap::new()
                }
            };

        let mut space_ids: Vec<String> = rows.iter().filter_map(|r| r.space_id.clone()).collect();
        space_ids.sort();
        space_ids.dedup();
        let spaces: HashMap<String, SpaceRef> = if space_ids.is_empty() {
            HashMap::new()
        } else {
            match with_retry(|| self.query.fetch_spaces(&space_ids), self.attempts).await {
                Ok(list) => list.into_iter().map(|s| (s.id.clone(), s)).collect(),
                Err(e) => {
                    debug!("space batch lookup degraded: {e:#}");
                    HashMap::new()
                }
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let author = authors.get(&row.author_id).cloned();
            let space = row.space_id.as_ref().and_then(|sid| spaces.get(sid).cloned());
            items.push(self.finish_item(row, author, space, viewer).await);
        }
        Ok(items)
    }

    /// Aggregate counts and viewer state, then assembly. Counts degrade to
    /// zero, viewer state to false.
    async fn finish_item(
        &self,
        row: PostRow,
        author: Option<AuthorRef>,
        space: Option<SpaceRef>,
        viewer: Option<&str>,
    ) -> FeedItem {
        let like_count = match with_retry(|| self.query.like_count(&row.id), self.attempts).await {
            Ok(n) => n,
            Err(e) => {
                debug!(post = %row.id, "like count degraded: {e:#}");
                0
            }
        };
        let comment_count = match with_retry(|| self.query.comment_count(&row.id), self.attempts).await {
            Ok(n) => n,
            Err(e) => {
                debug!(post = %row.id, "comment count degraded: {e:#}");
                0
            }
        };
        let viewer_has_liked = match viewer {
            Some(viewer_id) => {
                match with_retry(|| self.query.viewer_has_liked(&row.id, viewer_id), self.attempts).await {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(post = %row.id, "viewer like state degraded: {e:#}");
                        false
                    }
                }
            }
            None => false,
        };

        FeedItem {
            id: row.id,
            author,
            space,
            body: row.body,
            media: row
                .media
                .into_iter()
                .map(|url| MediaRef {
                    url,
                    media_type: None,
                })
                .collect(),
            created_at_ms: row.created_at_ms,
            like_count,
            comment_count,
            viewer_has_liked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use commons_protocol::LikeRow;

    fn post(id: &str, author: &str, space: Option<&str>, ts: i64) -> PostRow {
        PostRow {
            id: id.to_string(),
            author_id: author.to_string(),
            space_id: space.map(str::to_string),
            body: format!("body {id}"),
            media: vec![format!("https://cdn.test/{id}.png")],
            created_at_ms: ts,
        }
    }

    #[tokio::test]
    async fn hydrate_one_resolves_all_side_fetches() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_author("u1", Some("Alice"), None);
        backend.seed_space("s1", Some("general"));
        backend.insert_post(post("p1", "u1", Some("s1"), 1000));
        backend.add_like(LikeRow {
            id: "l1".to_string(),
            post_id: "p1".to_string(),
            user_id: "viewer".to_string(),
        });

        let hydrator = Hydrator::new(backend, 2);
        let item = hydrator.hydrate_one("p1", Some("viewer")).await.expect("hydrates");
        assert_eq!(item.author.as_ref().and_then(|a| a.display_name.as_deref()), Some("Alice"));
        assert_eq!(item.space.as_ref().map(|s| s.id.as_str()), Some("s1"));
        assert_eq!(item.like_count, 1);
        assert!(item.viewer_has_liked);
        assert_eq!(item.media.len(), 1);
    }

    #[tokio::test]
    async fn missing_author_degrades_to_placeholder() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_post(post("p1", "ghost", None, 1000));
        let hydrator = Hydrator::new(backend, 2);
        let item = hydrator.hydrate_one("p1", None).await.expect("hydrates");
        assert!(item.author.is_none());
        assert!(item.space.is_none());
        assert!(!item.viewer_has_liked);
    }

    #[tokio::test]
    async fn missing_base_row_is_a_hard_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let hydrator = Hydrator::new(backend, 2);
        let err = hydrator.hydrate_one("nope", None).await.expect_err("hard failure");
        assert!(matches!(err, QueryError::NotFound(_)));
    }

    #[tokio::test]
    async fn hydrate_many_returns_newest_first_within_the_space() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed_author("u1", Some("Alice"), None);
        backend.seed_space("s1", Some("general"));
        backend.insert_post(post("p1", "u1", Some("s1"), 300));
        backend.insert_post(post("p2", "u1", Some("s1"), 100));
        backend.insert_post(post("p3", "u1", Some("s1"), 200));
        backend.insert_post(post("other", "u1", Some("s2"), 400));

        let hydrator = Hydrator::new(backend, 2);
        let items = hydrator.hydrate_many(Some("s1"), None, 10).await.expect("bulk");
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3", "p2"]);
    }
}
