/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// The three feed tables a backend emits row-level change notifications for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Posts,
    Likes,
    Comments,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Posts => "posts",
            Table::Likes => "likes",
            Table::Comments => "comments",
        }
    }

    pub fn parse(label: &str) -> Option<Table> {
        match label.trim() {
            "posts" => Some(Table::Posts),
            "likes" => Some(Table::Likes),
            "comments" => Some(Table::Comments),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Raw row-level change notification as delivered by the push channel.
/// `new` carries the row after an insert/update, `old` what the backend
/// retains of the row after a delete (at minimum its identifiers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub op: ChangeOp,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

/// Equality predicate a subscription may scope a table stream with
/// (e.g. `space_id = <id>` for the posts channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFilter {
    pub column: String,
    pub value: String,
}

impl StreamFilter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRow {
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub space_id: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub media: Vec<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikeRow {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    #[serde(default)]
    pub body: String,
    pub created_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_labels_round_trip() {
        for t in [Table::Posts, Table::Likes, Table::Comments] {
            assert_eq!(Table::parse(t.as_str()), Some(t));
        }
        assert_eq!(Table::parse("chat_messages"), None);
    }

    #[test]
    fn notification_tolerates_missing_payload_sides() {
        let raw = r#"{"table":"posts","op":"DELETE","old":{"id":"p1"}}"#;
        let n: ChangeNotification = serde_json::from_str(raw).expect("parse");
        assert_eq!(n.op, ChangeOp::Delete);
        assert!(n.new.is_none());
        assert_eq!(
            n.old.as_ref().and_then(|v| v.get("id")).and_then(|v| v.as_str()),
            Some("p1")
        );
    }
}
