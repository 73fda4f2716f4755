use super::StatusStore;
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use reportq_core::Result;
use std::collections::HashMap;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    journal: Vec<(String, String)>,
    #[cfg(test)]
    unavailable: bool,
}

/// In-process [`StatusStore`] with lazy expiry.
///
/// Every successful write is also appended to a journal so callers can inspect
/// the exact order in which snapshots were persisted.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All successful writes as `(key, value)` pairs, oldest first.
    pub fn journal(&self) -> Vec<(String, String)> {
        self.inner.lock().journal.clone()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every call fail until switched back.
    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    #[cfg(test)]
    fn check_available(inner: &Inner) -> Result<()> {
        if inner.unavailable {
            return Err(reportq_core::Error::Store {
                context: "store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        #[cfg(test)]
        Self::check_available(&inner)?;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        inner.journal.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        #[cfg(test)]
        Self::check_available(&inner)?;
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
