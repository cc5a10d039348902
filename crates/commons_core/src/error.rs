/*
 * SPDX-FileCopyrightText: 2026 Commons Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Failure classes of the row query service. Only `Transient` is retried;
/// `NotFound` on the base row is a hard failure for the caller.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("row not found: {0}")]
    NotFound(String),
    #[error("query service unreachable: {0}")]
    Transient(String),
    #[error("malformed row payload: {0}")]
    Malformed(String),
}

impl QueryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transient(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("subscribe failed for {table}: {reason}")]
    Subscribe { table: &'static str, reason: String },
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Attach while active or detach while idle. Indicates a bug in the
    /// calling lifecycle, never tolerated silently.
    #[error("subscription contract violated: {0}")]
    ContractViolation(&'static str),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Bulk hydration exhausted its retries. The feed keeps serving what it
    /// has and is flagged possibly-stale; the caller may retry the switch.
    #[error("feed hydration failed: {0}")]
    Hydration(#[from] QueryError),
}
