/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Per-filter-session record of feed item ids already materialized, used to
/// suppress re-hydration of items the session already knows about (bulk
/// fetch, local optimistic insert, or a previously handled remote insert).
///
/// Ids are marked seen before the asynchronous hydration for them completes,
/// which closes the window where two insert notifications for the same row
/// would both trigger a hydration. Entries live until `reset`; the ledger is
/// discarded wholesale when the active space changes.
#[derive(Debug, Default)]
pub struct SeenLedger {
    entries: HashMap<String, i64>,
}

impl SeenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Marks `id` as seen. Returns true when the id was not seen before;
    /// repeated calls are no-ops that keep the original insertion time.
    pub fn mark_seen(&mut self, id: &str) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), now_ms());
        true
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
