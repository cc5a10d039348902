/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use commons_protocol::{ChangeNotification, ChangeOp, PostRow, Table};
use tracing::warn;

/// Canonical form of a raw change notification. Likes/comments events
/// carry the owning post id so the aggregate merger can target it.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    PostInserted { id: String, row: PostRow },
    PostUpdated { id: String, row: PostRow },
    PostDeleted { id: String },
    LikeChanged { post_id: String, op: ChangeOp },
    CommentChanged { post_id: String, op: ChangeOp },
}

/// Converts a raw notification into a `FeedEvent`. Insert/update must
/// carry `new`; delete must carry at least the identifiers in `old`.
/// Malformed notifications are dropped with a warn and never become an
/// error in the dispatch loop.
pub fn normalize(raw: &ChangeNotification) -> Option<FeedEvent> {
    let Some(table) = Table::parse(&raw.table) else {
        warn!(table = %raw.table, "dropping notification for unknown table");
        return None;
    };

    match table {
        Table::Posts => normalize_post(raw),
        Table::Likes => normalize_counted(raw, table).map(|post_id| FeedEvent::LikeChanged {
            post_id,
            op: raw.op,
        }),
        Table::Comments => normalize_counted(raw, table).map(|post_id| FeedEvent::CommentChanged {
            post_id,
            op: raw.op,
        }),
    }
}

fn normalize_post(raw: &ChangeNotification) -> Option<FeedEvent> {
    match raw.op {
        ChangeOp::Insert | ChangeOp::Update => {
            let Some(new) = raw.new.as_ref() else {
                warn!(op = ?raw.op, "dropping posts notification without new row");
                return None;
            };
            let row: PostRow = match serde_json::from_value(new.clone()) {
                Ok(row) => row,
                Err(e) => {
                    warn!("dropping malformed posts row: {e:#}");
                    return None;
                }
            };
            if row.id.trim().is_empty() {
                warn!("dropping posts notification with empty id");
                return None;
            }
            let id = row.id.clone();
            Some(match raw.op {
                ChangeOp::Insert => FeedEvent::PostInserted { id, row },
                _ => FeedEvent::PostUpdated { id, row },
            })
        }
        ChangeOp::Delete => {
            let id = raw
                .old
                .as_ref()
                .and_then(|v| v.get("id"))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty());
            let Some(id) = id else {
                warn!("dropping posts delete without old.id");
                return None;
            };
            Some(FeedEvent::PostDeleted { id: id.to_string() })
        }
    }
}

/// Extracts the owning post id of a likes/comments notification: from
/// `new` on insert/update, from `old` on delete.
fn normalize_counted(raw: &ChangeNotification, table: Table) -> Option<String> {
    let side = match raw.op {
        ChangeOp::Insert | ChangeOp::Update => raw.new.as_ref(),
        ChangeOp::Delete => raw.old.as_ref(),
    };
    let post_id = side
        .and_then(|v| v.get("post_id"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match post_id {
        Some(id) => Some(id.to_string()),
        None => {
            warn!(table = table.as_str(), op = ?raw.op, "dropping notification without owning post id");
            None
        }
    }
}
