//! Four-layer guard chain evaluated for every change in either direction
//!
//! 1. origin echo: the same side wrote the row within the cooldown
//! 2. content hash: the candidate content equals the last synchronized content
//! 3. mutual exclusion: the other direction holds the row lock
//! 4. last-write-wins arbiter
//!
//! Only the arbiter produces a conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::hash::content_hash;
use crate::coordination::{LockAttempt, RowLease, RowLocks};
use crate::error::Result;
use crate::models::{CellValue, Direction, Origin, RowMetadata};

/// Why a change was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Written by the same side within the cooldown window
    Echo,
    /// Content hash matches the last synchronized content
    Unchanged,
    /// Not newer than the row (same origin or equal timestamp)
    Stale,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the last-write-wins comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    Apply,
    Conflict,
    Stale,
}

/// Compare an incoming change against the row's last write.
///
/// Newer always applies. Older from the other side is a conflict; older from
/// the same side, and any tie, is stale.
pub const fn arbitrate(
    incoming_origin: Origin,
    incoming_timestamp: i64,
    row_origin: Origin,
    row_timestamp: i64,
) -> Arbitration {
    let delta = incoming_timestamp.saturating_sub(row_timestamp);
    if delta > 0 {
        Arbitration::Apply
    } else if delta < 0 && !same_origin(incoming_origin, row_origin) {
        Arbitration::Conflict
    } else {
        Arbitration::Stale
    }
}

const fn same_origin(a: Origin, b: Origin) -> bool {
    matches!(
        (a, b),
        (Origin::External, Origin::External)
            | (Origin::Store, Origin::Store)
            | (Origin::System, Origin::System)
    )
}

/// Whether the row was last written by the same side within `cooldown`.
pub fn is_echo(incoming_origin: Origin, row: &RowMetadata, now: i64, cooldown: Duration) -> bool {
    let cooldown_ms = i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX);
    incoming_origin == row.last_modified_by
        && now.saturating_sub(row.last_modified_at) < cooldown_ms
}

/// A change about to pass through the chain
#[derive(Debug, Clone, Copy)]
pub struct IncomingChange<'a> {
    pub document_id: &'a str,
    pub direction: Direction,
    /// Edit time of the change (unix ms)
    pub timestamp: i64,
    /// Full synchronized content the row would have after the change
    pub values: &'a BTreeMap<String, CellValue>,
}

/// What to do with a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    /// The other direction holds the row; retry later
    Requeue { holder: Direction },
    /// Write the change; `content_hash` covers `IncomingChange::values`
    Apply {
        lease: Option<RowLease>,
        content_hash: String,
    },
    /// Record a conflict and leave the row alone
    Conflict { lease: Option<RowLease> },
}

impl Decision {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Skip(_) => "skip",
            Self::Requeue { .. } => "requeue",
            Self::Apply { .. } => "apply",
            Self::Conflict { .. } => "conflict",
        }
    }
}

/// The guard chain with its cooldown and lock manager
#[derive(Clone)]
pub struct GuardChain {
    locks: RowLocks,
    cooldown: Duration,
}

impl GuardChain {
    pub const fn new(locks: RowLocks, cooldown: Duration) -> Self {
        Self { locks, cooldown }
    }

    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Run the four guards in order against the row's current metadata.
    pub async fn evaluate(
        &self,
        change: &IncomingChange<'_>,
        row: &RowMetadata,
        now: i64,
    ) -> Result<Decision> {
        let decision = self.decide(change, row, now).await?;
        match &decision {
            Decision::Skip(reason) => tracing::debug!(
                document = %change.document_id,
                row = row.row_number,
                direction = %change.direction,
                reason = %reason,
                "Change skipped"
            ),
            Decision::Requeue { holder } => tracing::debug!(
                document = %change.document_id,
                row = row.row_number,
                direction = %change.direction,
                holder = %holder,
                "Row locked by other direction"
            ),
            other => tracing::debug!(
                document = %change.document_id,
                row = row.row_number,
                direction = %change.direction,
                decision = other.label(),
                "Change evaluated"
            ),
        }
        Ok(decision)
    }

    async fn decide(
        &self,
        change: &IncomingChange<'_>,
        row: &RowMetadata,
        now: i64,
    ) -> Result<Decision> {
        let origin = change.direction.origin();

        if is_echo(origin, row, now, self.cooldown) {
            return Ok(Decision::Skip(SkipReason::Echo));
        }

        let hash = content_hash(change.values);
        if row.content_hash.as_deref() == Some(hash.as_str()) {
            return Ok(Decision::Skip(SkipReason::Unchanged));
        }

        let lease = match self
            .locks
            .acquire(change.document_id, row.row_number, change.direction)
            .await?
        {
            LockAttempt::Acquired(lease) => Some(lease),
            LockAttempt::HeldBySameDirection => None,
            LockAttempt::Contended { holder } => return Ok(Decision::Requeue { holder }),
        };

        match arbitrate(origin, change.timestamp, row.last_modified_by, row.last_modified_at) {
            Arbitration::Apply => Ok(Decision::Apply {
                lease,
                content_hash: hash,
            }),
            Arbitration::Conflict => Ok(Decision::Conflict { lease }),
            Arbitration::Stale => {
                self.release(lease).await;
                Ok(Decision::Skip(SkipReason::Stale))
            }
        }
    }

    /// Keep a lease from [`GuardChain::evaluate`] alive; `false` once it lapsed.
    pub async fn renew(&self, lease: &RowLease) -> Result<bool> {
        self.locks.renew(lease).await
    }

    /// Release a lease obtained from [`GuardChain::evaluate`]; failures are logged.
    pub async fn release(&self, lease: Option<RowLease>) {
        let Some(lease) = lease else {
            return;
        };
        if let Err(error) = self.locks.release(&lease).await {
            tracing::warn!(key = %lease.key(), error = %error, "Failed to release row lock");
        }
    }
}
