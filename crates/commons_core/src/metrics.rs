/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Out-of-band feed health counters. `connected` is the reconnecting
/// indicator, `stale` flags that the visible list may be missing data
/// (hydration gave up after its retries). The rendering layer polls
/// `snapshot_json`.
#[derive(Default)]
pub struct FeedMetrics {
    pub connected: AtomicBool,
    pub stale: AtomicBool,
    pub events_seen: AtomicU64,
    pub events_dropped: AtomicU64,
    pub duplicates_suppressed: AtomicU64,
    pub hydrations: AtomicU64,
    pub hydration_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_change_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, v: bool) {
        self.connected.store(v, Ordering::Relaxed);
        self.last_change_ms.store(now_ms(), Ordering::Relaxed);
        if v {
            let mut g = self.last_error.lock().unwrap();
            *g = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    pub fn clear_stale(&self) {
        self.stale.store(false, Ordering::Relaxed);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn set_last_error(&self, err: String) {
        let mut g = self.last_error.lock().unwrap();
        *g = Some(err);
    }

    pub fn event_seen(&self) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hydration_ok(&self) {
        self.hydrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hydration_failed(&self) {
        self.hydration_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self.last_error.lock().unwrap().clone();
        serde_json::json!({
            "ts_ms": now_ms(),
            "channel": {
                "connected": self.connected.load(Ordering::Relaxed),
                "reconnects": self.reconnects.load(Ordering::Relaxed),
                "last_change_ms": self.last_change_ms.load(Ordering::Relaxed),
                "last_error": last_error,
            },
            "feed": {
                "possibly_stale": self.stale.load(Ordering::Relaxed),
                "events_seen": self.events_seen.load(Ordering::Relaxed),
                "events_dropped": self.events_dropped.load(Ordering::Relaxed),
                "duplicates_suppressed": self.duplicates_suppressed.load(Ordering::Relaxed),
                "hydrations": self.hydrations.load(Ordering::Relaxed),
                "hydration_failures": self.hydration_failures.load(Ordering::Relaxed),
            },
        })
    }
}
