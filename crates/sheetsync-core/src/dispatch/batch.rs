//! Per-destination batch accumulator
//!
//! Items are grouped by key. A group flushes when it reaches `max_size`
//! items or when `max_wait` has passed since its first item, whichever
//! comes first. Each group is handed out exactly once; a flush never takes
//! items from another group.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_size: usize,
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Deadline,
    Shutdown,
}

impl FlushReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Deadline => "deadline",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub key: String,
    pub items: Vec<T>,
    pub reason: FlushReason,
}

struct Pending<T> {
    items: Vec<T>,
    deadline: Instant,
}

pub struct BatchAccumulator<T> {
    config: BatchConfig,
    groups: HashMap<String, Pending<T>>,
}

impl<T> BatchAccumulator<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: BatchConfig {
                max_size: config.max_size.max(1),
                ..config
            },
            groups: HashMap::new(),
        }
    }

    /// Add an item; returns the group's batch when this item fills it.
    pub fn push(&mut self, key: &str, item: T, now: Instant) -> Option<Batch<T>> {
        let max_wait = self.config.max_wait;
        let group = self
            .groups
            .entry(key.to_string())
            .or_insert_with(|| Pending {
                items: Vec::new(),
                deadline: now + max_wait,
            });
        group.items.push(item);

        if group.items.len() < self.config.max_size {
            return None;
        }
        self.groups.remove(key).map(|pending| Batch {
            key: key.to_string(),
            items: pending.items,
            reason: FlushReason::Size,
        })
    }

    /// Remove and return every group whose deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Vec<Batch<T>> {
        let due: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| {
                self.groups.remove(&key).map(|pending| Batch {
                    key,
                    items: pending.items,
                    reason: FlushReason::Deadline,
                })
            })
            .collect()
    }

    /// Remove and return every group regardless of deadline.
    pub fn drain(&mut self) -> Vec<Batch<T>> {
        self.groups
            .drain()
            .map(|(key, pending)| Batch {
                key,
                items: pending.items,
                reason: FlushReason::Shutdown,
            })
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.groups.values().map(|pending| pending.deadline).min()
    }

    /// Total items waiting across groups
    pub fn len(&self) -> usize {
        self.groups.values().map(|pending| pending.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn accumulator(max_size: usize) -> BatchAccumulator<u32> {
        BatchAccumulator::new(BatchConfig {
            max_size,
            max_wait: Duration::from_secs(5),
        })
    }

    #[test]
    fn flushes_exactly_once_when_size_reached() {
        let now = Instant::now();
        let mut batches = accumulator(3);

        assert!(batches.push("doc", 1, now).is_none());
        assert!(batches.push("doc", 2, now).is_none());
        let batch = batches.push("doc", 3, now).unwrap();

        assert_eq!(batch.items, vec![1, 2, 3]);
        assert_eq!(batch.reason, FlushReason::Size);
        assert!(batches.is_empty());
        assert!(batches.take_due(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn size_flush_leaves_other_groups_pending() {
        let now = Instant::now();
        let mut batches = accumulator(2);

        batches.push("a", 1, now);
        batches.push("b", 10, now);
        let batch = batches.push("a", 2, now).unwrap();

        assert_eq!(batch.key, "a");
        assert_eq!(batches.len(), 1);
        let remaining = batches.take_due(now + Duration::from_secs(5));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].items, vec![10]);
        assert_eq!(remaining[0].reason, FlushReason::Deadline);
    }

    #[test]
    fn deadline_runs_from_first_item() {
        let start = Instant::now();
        let mut batches = accumulator(50);

        batches.push("doc", 1, start);
        batches.push("doc", 2, start + Duration::from_secs(4));

        assert_eq!(batches.next_deadline(), Some(start + Duration::from_secs(5)));
        assert!(batches.take_due(start + Duration::from_millis(4_999)).is_empty());
        let due = batches.take_due(start + Duration::from_secs(5));
        assert_eq!(due[0].items, vec![1, 2]);
        assert_eq!(batches.next_deadline(), None);
    }

    #[test]
    fn items_after_a_flush_open_a_new_group() {
        let start = Instant::now();
        let mut batches = accumulator(2);

        batches.push("doc", 1, start);
        batches.push("doc", 2, start);
        batches.push("doc", 3, start + Duration::from_secs(3));

        assert_eq!(batches.next_deadline(), Some(start + Duration::from_secs(8)));
        let drained = batches.drain();
        assert_eq!(drained[0].items, vec![3]);
        assert_eq!(drained[0].reason, FlushReason::Shutdown);
    }
}
