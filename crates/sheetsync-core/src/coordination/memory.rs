//! In-process coordination store for a single instance and tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CoordinationStore, WindowCount};
use crate::error::Result;

#[derive(Debug, Clone)]
struct ExpiringValue {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct CounterWindow {
    started_at: Instant,
    count: u64,
}

#[derive(Default)]
struct State {
    values: HashMap<String, ExpiringValue>,
    counters: HashMap<String, CounterWindow>,
}

/// Coordination store backed by process memory
#[derive(Clone, Default)]
pub struct MemoryCoordinationStore {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        if let Some(existing) = guard.values.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        guard.values.insert(
            key.to_string(),
            ExpiringValue {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let guard = self.state.lock().await;
        Ok(guard
            .values
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state.lock().await.values.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let matches = guard
            .values
            .get(key)
            .is_some_and(|entry| entry.expires_at > now && entry.value == value);
        if matches {
            guard.values.remove(key);
        }
        Ok(matches)
    }

    async fn extend_if_equals(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        match guard.values.get_mut(key) {
            Some(entry) if entry.expires_at > now && entry.value == value => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.counters.entry(key.to_string()).or_insert(CounterWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= window {
            entry.started_at = now;
            entry.count = 0;
        }

        entry.count += 1;
        Ok(WindowCount {
            count: entry.count,
            resets_in: window.saturating_sub(now.duration_since(entry.started_at)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_ttl() {
        let store = MemoryCoordinationStore::new();
        assert!(store.set_if_absent("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_if_absent("lock", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(store.get("lock").await.unwrap(), None);
        assert!(store.set_if_absent("lock", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_if_equals_only_removes_own_value() {
        let store = MemoryCoordinationStore::new();
        store.set_if_absent("lock", "a", Duration::from_secs(5)).await.unwrap();

        assert!(!store.delete_if_equals("lock", "b").await.unwrap());
        assert!(store.delete_if_equals("lock", "a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_window_resets_after_window() {
        let store = MemoryCoordinationStore::new();
        let window = Duration::from_secs(60);

        assert_eq!(store.incr_window("w", window).await.unwrap().count, 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        let second = store.incr_window("w", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.resets_in, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.incr_window("w", window).await.unwrap().count, 1);
    }
}
