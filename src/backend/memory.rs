//! Process-local backend.
//!
//! Holds values and lists in mutex-guarded maps with `Instant`-based expiry.
//! Every primitive runs under a single lock acquisition, so conditional
//! operations are atomic across tasks sharing one instance.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{glob_regex, Backend, NO_EXPIRY_TTL_MILLIS};
use crate::error::BackendError;

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, ValueEntry>,
    lists: HashMap<String, VecDeque<String>>,
}

impl State {
    /// Returns the live entry for `key`, dropping it if it has expired.
    fn live_value(&mut self, key: &str) -> Option<&mut ValueEntry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|e| !e.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }
}

/// In-memory implementation of [`Backend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn append_to_list(&self, key: &str, values: &[String]) -> Result<(), BackendError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn peek_first_n(&self, key: &str, n: usize) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(key)
            .map(|list| list.iter().take(n).cloned().collect())
            .unwrap_or_default())
    }

    async fn trim_first_n(&self, key: &str, n: usize) -> Result<(), BackendError> {
        if n == 0 {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if let Some(list) = state.lists.get_mut(key) {
            let n = n.min(list.len());
            list.drain(..n);
            if list.is_empty() {
                state.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<usize, BackendError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn has_at_least_n(&self, key: &str, n: usize) -> Result<bool, BackendError> {
        if n == 0 {
            return Ok(true);
        }
        Ok(self.count(key).await? >= n)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        if state.live_value(key).is_some() {
            return Ok(false);
        }

        state.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: expiry_from(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut state = self.state.lock().await;
        Ok(state.live_value(key).map(|e| e.value.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        let owned = state.live_value(key).is_some_and(|e| e.value == expected);
        if owned {
            state.values.remove(key);
        }
        Ok(owned)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        match state.live_value(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expiry_from(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let matcher = glob_regex(pattern)?;
        let now = Instant::now();
        let state = self.state.lock().await;

        let mut keys: Vec<String> = state
            .values
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key)
            .chain(state.lists.keys())
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn time_to_live_millis(&self, key: &str) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.live_value(key) {
            return Ok(match entry.expires_at {
                Some(at) => at.saturating_duration_since(Instant::now()).as_millis() as u64,
                None => NO_EXPIRY_TTL_MILLIS,
            });
        }

        if state.lists.contains_key(key) {
            return Ok(NO_EXPIRY_TTL_MILLIS);
        }
        Ok(0)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        let had_value = state.values.remove(key).is_some();
        let had_list = state.lists.remove(key).is_some();
        Ok(had_value || had_list)
    }

    async fn flush_all(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.values.clear();
        state.lists.clear();
        Ok(())
    }
}

/// A zero TTL means no expiry.
fn expiry_from(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Some(Instant::now() + ttl)
    }
}
