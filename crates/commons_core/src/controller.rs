/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as TokioMutex};
use tracing::warn;

use crate::aggregate::AggregateMerger;
use crate::backend::{PushChannel, RowQuery};
use crate::error::SyncError;
use crate::hydrate::Hydrator;
use crate::ledger::SeenLedger;
use crate::metrics::FeedMetrics;
use crate::store::{FeedItem, FeedStore};
use crate::subscription::{DispatchCtx, SubscriptionManager};

fn default_page_limit() -> u32 {
    50
}

fn default_hydrate_attempts() -> u32 {
    4
}

fn default_reconnect_base_backoff_ms() -> u64 {
    500
}

fn default_reconnect_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Page size of the bulk hydrate on load, filter change and reconnect
    /// catch-up.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_hydrate_attempts")]
    pub hydrate_attempts: u32,
    #[serde(default = "default_reconnect_base_backoff_ms")]
    pub reconnect_base_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            hydrate_attempts: default_hydrate_attempts(),
            reconnect_base_backoff_ms: default_reconnect_base_backoff_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
        }
    }
}

/// Session state shared between the controller and the dispatch task.
/// Store and ledger are owned by exactly one controller per viewing
/// session; the epoch counter tags bulk hydrations so a result from a
/// superseded filter switch is recognized and discarded.
pub(crate) struct FeedShared {
    pub(crate) store: Mutex<FeedStore>,
    pub(crate) ledger: Mutex<SeenLedger>,
    pub(crate) epoch: AtomicU64,
    pub(crate) viewer: Option<String>,
    pub(crate) metrics: Arc<FeedMetrics>,
}

struct SwitchState {
    attached: bool,
    space: Option<String>,
}

/// Top-level coordinator of one feed viewing session. On every filter
/// change: detach subscriptions, discard store and ledger, bulk hydrate,
/// populate, re-attach. Exposes the snapshot/changes contract to the
/// rendering layer and the local-action bridge to the surrounding app.
pub struct FeedController {
    shared: Arc<FeedShared>,
    hydrator: Arc<Hydrator>,
    merger: Arc<AggregateMerger>,
    subs: SubscriptionManager,
    switch: TokioMutex<SwitchState>,
    cfg: FeedConfig,
}

impl FeedController {
    pub fn new(
        query: Arc<dyn RowQuery>,
        channel: Arc<dyn PushChannel>,
        viewer: Option<String>,
        cfg: FeedConfig,
    ) -> Self {
        let shared = Arc::new(FeedShared {
            store: Mutex::new(FeedStore::new()),
            ledger: Mutex::new(SeenLedger::new()),
            epoch: AtomicU64::new(0),
            viewer,
            metrics: Arc::new(FeedMetrics::new()),
        });
        Self {
            shared,
            hydrator: Arc::new(Hydrator::new(query.clone(), cfg.hydrate_attempts)),
            merger: Arc::new(AggregateMerger::new(query, cfg.hydrate_attempts)),
            subs: SubscriptionManager::new(channel),
            switch: TokioMutex::new(SwitchState {
                attached: false,
                space: None,
            }),
            cfg,
        }
    }

    /// Switches the feed to `space` (`None` = all spaces). Ordering is
    /// mandatory: detach, discard, hydrate + populate, attach. The bulk
    /// page must be in the ledger and store before subscriptions go live.
    /// A switch issued while a previous one is still hydrating supersedes
    /// it; the stale page never lands.
    pub async fn select_space(&self, space: Option<String>) -> Result<(), SyncError> {
        let epoch = {
            let mut sw = self.switch.lock().await;
            let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            if sw.attached {
                self.subs.detach().await?;
                sw.attached = false;
            }
            self.shared.store.lock().unwrap().clear();
            self.shared.ledger.lock().unwrap().reset();
            self.shared.metrics.clear_stale();
            sw.space = space.clone();
            epoch
        };

        // The switch lock is released across the bulk fetch so a newer
        // select_space can supersede this one.
        let hydrated = self
            .hydrator
            .hydrate_many(space.as_deref(), self.shared.viewer.as_deref(), self.cfg.page_limit)
            .await;

        let mut sw = self.switch.lock().await;
        if self.shared.epoch.load(Ordering::SeqCst) != epoch {
            // A newer switch owns the feed now; this page is stale.
            return Ok(());
        }

        let hydrate_err = match hydrated {
            Ok(items) => {
                let mut ledger = self.shared.ledger.lock().unwrap();
                let mut store = self.shared.store.lock().unwrap();
                // Oldest first, so head insertion leaves the page newest
                // first and later remote inserts still land on top.
                for item in items.into_iter().rev() {
                    ledger.mark_seen(&item.id);
                    store.apply_insert(item);
                }
                None
            }
            Err(e) => {
                warn!("bulk hydrate failed: {e:#}");
                self.shared.metrics.set_last_error(format!("{e:#}"));
                self.shared.metrics.mark_stale();
                Some(e)
            }
        };

        self.subs.attach(space.clone(), self.dispatch_ctx()).await?;
        sw.attached = true;
        sw.space = space;

        match hydrate_err {
            None => Ok(()),
            Some(e) => Err(SyncError::Hydration(e)),
        }
    }

    /// Local-action bridge: the app calls this synchronously when the
    /// viewer creates a post, bypassing hydration. The later echo of the
    /// same row through the push channel is absorbed by the ledger/store
    /// presence check and only merges server-assigned fields.
    pub fn note_local_insert(&self, item: FeedItem) {
        let mut ledger = self.shared.ledger.lock().unwrap();
        let mut store = self.shared.store.lock().unwrap();
        ledger.mark_seen(&item.id);
        store.apply_insert(item);
    }

    /// Read-only view for the rendering layer.
    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.shared.store.lock().unwrap().snapshot()
    }

    /// "Something changed, re-read" signal paired with `snapshot`.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.store.lock().unwrap().changes()
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        self.shared.metrics.clone()
    }

    pub async fn space(&self) -> Option<String> {
        self.switch.lock().await.space.clone()
    }

    pub async fn is_attached(&self) -> bool {
        self.subs.is_active().await
    }

    /// Ends the viewing session: strands any in-flight hydration and
    /// tears the subscriptions down. The last snapshot stays readable.
    pub async fn close(&self) -> Result<(), SyncError> {
        let mut sw = self.switch.lock().await;
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if sw.attached {
            self.subs.detach().await?;
            sw.attached = false;
        }
        Ok(())
    }

    fn dispatch_ctx(&self) -> DispatchCtx {
        DispatchCtx {
            shared: self.shared.clone(),
            hydrator: self.hydrator.clone(),
            merger: self.merger.clone(),
            reconnect_base_ms: self.cfg.reconnect_base_backoff_ms,
            reconnect_max_ms: self.cfg.reconnect_max_backoff_ms,
            catchup_limit: self.cfg.page_limit,
        }
    }
}
