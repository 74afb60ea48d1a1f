//! Process-wide key/value store.
//!
//! The store is the only surface the FSM threads and hardware pollers share.
//! Each key owns its own slot lock, so a single `get`/`set`/`update` is atomic
//! without serializing unrelated keys. There are no multi-key transactions.
//!
//! Every write that changes a value bumps a global sequence number and wakes
//! threads parked in [`SharedStore::wait_for_change`], which lets FSM loops
//! react to writes instead of sleeping a full tick.

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreResult;

type Slot = Arc<Mutex<Value>>;

#[derive(Default)]
struct Inner {
    slots: RwLock<HashMap<String, Slot>>,
    seq: Mutex<u64>,
    changed: Condvar,
}

/// Cloneable handle to the shared store.
///
/// All clones address the same map.
#[derive(Clone, Default)]
pub struct SharedStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("keys", &self.inner.slots.read().len())
            .field("version", &self.version())
            .finish()
    }
}

impl SharedStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &str) -> Option<Slot> {
        self.inner.slots.read().get(path).cloned()
    }

    fn slot_or_insert(&self, path: &str) -> Slot {
        if let Some(slot) = self.slot(path) {
            return slot;
        }
        self.inner
            .slots
            .write()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Value::Null)))
            .clone()
    }

    fn notify(&self) {
        let mut seq = self.inner.seq.lock();
        *seq = seq.wrapping_add(1);
        self.inner.changed.notify_all();
    }

    /// Read a value, or `default` when the key has never been written.
    ///
    /// A key explicitly set to `null` reads as `null`, not as `default`.
    pub fn get(&self, path: &str, default: Value) -> Value {
        match self.slot(path) {
            Some(slot) => slot.lock().clone(),
            None => default,
        }
    }

    /// Read a value; `None` when absent or `null`.
    pub fn get_opt(&self, path: &str) -> Option<Value> {
        self.slot(path)
            .map(|slot| slot.lock().clone())
            .filter(|v| !v.is_null())
    }

    /// Write a value.
    pub fn set(&self, path: &str, value: impl Into<Value>) {
        let value = value.into();
        let slot = self.slot_or_insert(path);
        let changed = {
            let mut current = slot.lock();
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        };
        if changed {
            self.notify();
        }
    }

    /// Set a key to `null`.
    pub fn clear(&self, path: &str) {
        self.set(path, Value::Null);
    }

    /// Atomic read-modify-write of one key.
    ///
    /// The closure sees `null` for a key that was never written. Waiters are
    /// only woken when the closure actually changed the value.
    pub fn update<R>(&self, path: &str, f: impl FnOnce(&mut Value) -> R) -> R {
        let slot = self.slot_or_insert(path);
        let (out, changed) = {
            let mut current = slot.lock();
            let before = current.clone();
            let out = f(&mut current);
            let changed = *current != before;
            (out, changed)
        };
        if changed {
            self.notify();
        }
        out
    }

    /// Whether the key is absent or `null`.
    pub fn is_empty_at(&self, path: &str) -> bool {
        self.get_opt(path).is_none()
    }

    // ─── Typed helpers ──────────────────────────────────────────────

    /// Boolean value, `None` when absent or not a boolean.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get_opt(path).and_then(|v| v.as_bool())
    }

    /// Integer value, `None` when absent or not an integer.
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get_opt(path).and_then(|v| v.as_i64())
    }

    /// Float value (integers widen), `None` when absent or not numeric.
    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get_opt(path).and_then(|v| v.as_f64())
    }

    /// String value, `None` when absent or not a string.
    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get_opt(path)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Decode a structured value. `Ok(None)` when absent or `null`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> StoreResult<Option<T>> {
        match self.get_opt(path) {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a structured value.
    pub fn set_as<T: Serialize>(&self, path: &str, value: &T) -> StoreResult<()> {
        self.set(path, serde_json::to_value(value)?);
        Ok(())
    }

    // ─── Change notification ────────────────────────────────────────

    /// Current write sequence number.
    pub fn version(&self) -> u64 {
        *self.inner.seq.lock()
    }

    /// Block until the sequence moves past `since` or `timeout` elapses.
    ///
    /// Returns the sequence number observed on wake-up.
    pub fn wait_for_change(&self, since: u64, timeout: Duration) -> u64 {
        let mut seq = self.inner.seq.lock();
        if *seq == since {
            let _ = self.inner.changed.wait_for(&mut seq, timeout);
        }
        *seq
    }

    // ─── Observers ──────────────────────────────────────────────────

    /// Sorted keys under a path prefix (`"io/di"` matches `"io/di/door_closed"`).
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_end_matches('/');
        let mut keys: Vec<String> = self
            .inner
            .slots
            .read()
            .keys()
            .filter(|k| {
                prefix.is_empty()
                    || k.as_str() == prefix
                    || k.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
            })
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Point-in-time copy of all non-null values.
    ///
    /// Each key is read atomically; the snapshot as a whole is not.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let slots: Vec<(String, Slot)> = self
            .inner
            .slots
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(k, s)| {
                let v = s.lock().clone();
                (!v.is_null()).then_some((k, v))
            })
            .collect()
    }
}
