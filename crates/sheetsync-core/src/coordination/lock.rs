//! Advisory per-row locks
//!
//! A lock value records which direction holds the row, the holder's
//! transaction id and when it was taken. Locks expire on their own; release
//! is a compare-and-delete on the exact value so a holder whose lock expired
//! and was re-taken never releases the new holder's lock.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::CoordinationStore;
use crate::error::Result;
use crate::models::Direction;
use crate::util::now_millis;

/// An acquired row lock; release it once the guarded write is done
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLease {
    key: String,
    token: String,
    pub direction: Direction,
    pub transaction_id: Uuid,
    pub acquired_at: i64,
}

impl RowLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Outcome of a lock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(RowLease),
    /// A live lock from the same direction; storage-level compare-and-set
    /// orders those writers
    HeldBySameDirection,
    /// A live lock from the other pipeline
    Contended { holder: Direction },
}

/// Row lock manager over a coordination store
#[derive(Clone)]
pub struct RowLocks {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

fn lock_key(document_id: &str, row_number: u32) -> String {
    format!("lock:{document_id}:{row_number}")
}

fn holder_direction(value: &str) -> Option<Direction> {
    value.split(':').next().and_then(|prefix| prefix.parse().ok())
}

impl RowLocks {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn acquire(
        &self,
        document_id: &str,
        row_number: u32,
        direction: Direction,
    ) -> Result<LockAttempt> {
        let key = lock_key(document_id, row_number);
        let transaction_id = Uuid::now_v7();
        let acquired_at = now_millis();
        let token = format!("{direction}:{transaction_id}:{acquired_at}");

        // Two rounds: the holder may expire between our failed set and the read.
        for _ in 0..2 {
            if self.store.set_if_absent(&key, &token, self.ttl).await? {
                return Ok(LockAttempt::Acquired(RowLease {
                    key,
                    token,
                    direction,
                    transaction_id,
                    acquired_at,
                }));
            }

            let Some(current) = self.store.get(&key).await? else {
                continue;
            };
            return Ok(match holder_direction(&current) {
                Some(holder) if holder == direction => LockAttempt::HeldBySameDirection,
                Some(holder) => LockAttempt::Contended { holder },
                None => {
                    tracing::warn!(key = %key, value = %current, "Unrecognized lock value");
                    LockAttempt::Contended {
                        holder: direction.opposite(),
                    }
                }
            });
        }

        Ok(LockAttempt::Contended {
            holder: direction.opposite(),
        })
    }

    /// Restart the lease's TTL.
    ///
    /// Returns `false` when the lock already expired or changed hands; the
    /// lease no longer protects the row.
    pub async fn renew(&self, lease: &RowLease) -> Result<bool> {
        let renewed = self
            .store
            .extend_if_equals(&lease.key, &lease.token, self.ttl)
            .await?;
        if !renewed {
            tracing::debug!(key = %lease.key, "Lease lapsed before renewal");
        }
        Ok(renewed)
    }

    /// Release a lease; a no-op when the lock expired or changed hands.
    pub async fn release(&self, lease: &RowLease) -> Result<()> {
        if !self.store.delete_if_equals(&lease.key, &lease.token).await? {
            tracing::debug!(key = %lease.key, "Lease already expired or taken over");
        }
        Ok(())
    }
}
