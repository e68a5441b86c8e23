//! A map of async mutexes keyed by an arbitrary value.
//!
//! Entries are reference counted: a waiter is registered before the map lock
//! is released, and the entry is removed when the last guard for a key is
//! dropped. The map therefore only ever holds keys that are currently locked
//! or awaited, no matter how many distinct keys a long build touches.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
  lock: Arc<AsyncMutex<()>>,
  waiters: usize,
}

pub struct KeyedMutex<K: Eq + Hash + Clone> {
  entries: Arc<Mutex<HashMap<K, Entry>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
  fn default() -> Self {
    Self {
      entries: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Lock `key`, waiting for any other holder of the same key.
  pub async fn lock(&self, key: K) -> KeyedGuard<K> {
    let lock = {
      let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
      let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
        lock: Arc::new(AsyncMutex::new(())),
        waiters: 0,
      });
      entry.waiters += 1;
      entry.lock.clone()
    };

    // Built before waiting so a dropped `lock` future still unregisters.
    let mut keyed = KeyedGuard {
      key: Some(key),
      entries: self.entries.clone(),
      guard: None,
    };
    keyed.guard = Some(lock.lock_owned().await);
    keyed
  }

  /// Number of keys currently locked or awaited.
  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Holds a key's lock until dropped.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
  key: Option<K>,
  entries: Arc<Mutex<HashMap<K, Entry>>>,
  guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
  fn drop(&mut self) {
    // Release the async lock before touching the waiter count.
    self.guard.take();

    let Some(key) = self.key.take() else {
      return;
    };
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = entries.get_mut(&key) {
      entry.waiters -= 1;
      if entry.waiters == 0 {
        entries.remove(&key);
      }
    }
  }
}
