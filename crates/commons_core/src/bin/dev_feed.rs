/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use commons_core::controller::{FeedConfig, FeedController};
use commons_core::memory::MemoryBackend;
use commons_protocol::{CommentRow, LikeRow, PostRow};
use std::sync::Arc;
use std::time::Duration;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn post(id: &str, author: &str, space: &str, body: &str, age_ms: i64) -> PostRow {
    PostRow {
        id: id.to_string(),
        author_id: author.to_string(),
        space_id: Some(space.to_string()),
        body: body.to_string(),
        media: Vec::new(),
        created_at_ms: now_ms() - age_ms,
    }
}

fn print_feed(label: &str, controller: &FeedController) {
    println!("-- {label} --");
    for item in controller.snapshot() {
        let author = item
            .author
            .as_ref()
            .and_then(|a| a.display_name.as_deref())
            .unwrap_or("?");
        println!(
            "  [{}] {} by {} (likes {}, comments {}{})",
            item.id,
            item.body,
            author,
            item.like_count,
            item.comment_count,
            if item.viewer_has_liked { ", liked" } else { "" }
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let backend = Arc::new(MemoryBackend::new());
    backend.seed_author("alice", Some("Alice"), None);
    backend.seed_author("bob", Some("Bob"), None);
    backend.seed_space("general", Some("General"));
    backend.seed_space("random", Some("Random"));
    backend.insert_post(post("p1", "alice", "general", "welcome to the feed", 60_000));
    backend.insert_post(post("p2", "bob", "general", "second post", 30_000));
    backend.insert_post(post("p3", "bob", "random", "off topic", 10_000));

    let controller = FeedController::new(
        backend.clone(),
        backend.clone(),
        Some("alice".to_string()),
        FeedConfig::default(),
    );

    controller.select_space(Some("general".to_string())).await?;
    print_feed("general after bulk hydrate", &controller);

    let mut changes = controller.changes();

    backend.insert_post(post("p4", "alice", "general", "hot off the press", 0));
    backend.add_like(LikeRow {
        id: "l1".to_string(),
        post_id: "p2".to_string(),
        user_id: "alice".to_string(),
    });
    backend.add_comment(CommentRow {
        id: "c1".to_string(),
        post_id: "p1".to_string(),
        author_id: "bob".to_string(),
        body: "nice one".to_string(),
        created_at_ms: now_ms(),
    });

    // Wait for the dispatch loop to fold the events in.
    for _ in 0..3 {
        if tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .is_err()
        {
            break;
        }
    }
    print_feed("general after live events", &controller);

    controller.select_space(Some("random".to_string())).await?;
    print_feed("random after switch", &controller);

    println!("metrics: {}", controller.metrics().snapshot_json());

    controller.close().await?;
    Ok(())
}
