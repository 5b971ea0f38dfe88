//! The in-memory keyspace: string values with optional absolute expiry, and
//! stream values with blocking-read support.

pub mod stream;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

pub use stream::{IdSpec, RangeBound, StreamEntry, StreamId, StreamValue, StreamWaiters};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[derive(Debug, Clone)]
pub struct StringValue {
    pub data: Vec<u8>,
    pub expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Str(StringValue),
    Stream(StreamValue),
}

pub struct Store {
    inner: Mutex<HashMap<String, Value>>,
    waiters: StreamWaiters,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            waiters: StreamWaiters::new(),
        }
    }

    pub fn set(&self, key: &str, data: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), Value::Str(StringValue { data, expires_at_ms: None }));
    }

    /// Stores `key` with an optional absolute expiry. An expiry already in
    /// the past is rejected rather than silently ignored.
    pub fn set_with(&self, key: &str, data: Vec<u8>, expires_at_ms: Option<i64>) -> bool {
        if let Some(exp) = expires_at_ms {
            if exp <= now_ms() {
                return false;
            }
        }
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), Value::Str(StringValue { data, expires_at_ms }));
        true
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(Value::Str(s)) => {
                if let Some(exp) = s.expires_at_ms {
                    if now_ms() >= exp {
                        return None;
                    }
                }
                Some(s.data.clone())
            }
            _ => None,
        }
    }

    pub fn incr(&self, key: &str) -> Result<i64, String> {
        let mut map = self.inner.lock().unwrap();
        let expired = matches!(map.get(key), Some(Value::Str(s)) if s.expires_at_ms.is_some_and(|e| now_ms() >= e));
        if expired {
            map.remove(key);
        }
        match map.get(key) {
            None => {
                map.insert(
                    key.to_string(),
                    Value::Str(StringValue { data: b"1".to_vec(), expires_at_ms: None }),
                );
                Ok(1)
            }
            Some(Value::Str(s)) => {
                let text = std::str::from_utf8(&s.data)
                    .map_err(|_| "ERR value is not an integer or out of range".to_string())?;
                let current: i64 = text
                    .parse()
                    .map_err(|_| "ERR value is not an integer or out of range".to_string())?;
                let next = current
                    .checked_add(1)
                    .ok_or_else(|| "ERR value is not an integer or out of range".to_string())?;
                let expires_at_ms = s.expires_at_ms;
                map.insert(
                    key.to_string(),
                    Value::Str(StringValue {
                        data: next.to_string().into_bytes(),
                        expires_at_ms,
                    }),
                );
                Ok(next)
            }
            Some(Value::Stream(_)) => {
                Err("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
            }
        }
    }

    pub fn keys_all(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    pub fn type_of(&self, key: &str) -> &'static str {
        match self.inner.lock().unwrap().get(key) {
            Some(Value::Str(s)) => {
                if let Some(exp) = s.expires_at_ms {
                    if now_ms() >= exp {
                        return "none";
                    }
                }
                "string"
            }
            Some(Value::Stream(_)) => "stream",
            None => "none",
        }
    }

    pub fn xadd(
        &self,
        key: &str,
        id_spec_text: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> Result<StreamId, String> {
        let spec = stream::parse_id_spec(id_spec_text)?;
        let now = now_ms();
        let mut map = self.inner.lock().unwrap();
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Stream(StreamValue::default()));
        let stream_value = match entry {
            Value::Stream(s) => s,
            Value::Str(_) => {
                return Err("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
            }
        };
        let id = stream_value.resolve_id(spec, now)?;
        let previous_last_id = stream_value.last_id;
        stream_value.entries.push(StreamEntry { id, fields });
        stream_value.last_id = id;
        drop(map);
        self.waiters.publish(key, format!("{key},{previous_last_id}"));
        Ok(id)
    }

    pub fn xrange(&self, key: &str, lower: &str, upper: &str) -> Result<Vec<StreamEntry>, String> {
        let lo = stream::parse_range_bound(lower)?.resolve();
        let hi = stream::parse_range_bound(upper)?.resolve();
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(Value::Stream(s)) => Ok(s
                .entries
                .iter()
                .filter(|e| e.id >= lo && e.id <= hi)
                .cloned()
                .collect()),
            Some(Value::Str(_)) => {
                Err("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Entries strictly after `cursor`, used both for an immediate XREAD
    /// and for re-checking a stream once a blocking waiter wakes.
    pub fn xread_after(&self, key: &str, cursor: StreamId) -> Vec<StreamEntry> {
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(Value::Stream(s)) => s.entries.iter().filter(|e| e.id > cursor).cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn current_last_id(&self, key: &str) -> StreamId {
        let map = self.inner.lock().unwrap();
        match map.get(key) {
            Some(Value::Stream(s)) => s.last_id,
            _ => StreamId::ZERO,
        }
    }

    /// Registers a blocking-XREAD waiter for `key`. The caller is
    /// responsible for checking for already-available entries before (or
    /// after giving up on) this receiver.
    pub fn subscribe(&self, key: &str) -> oneshot::Receiver<String> {
        self.waiters.register(key)
    }

    pub fn unsubscribe(&self, key: &str) {
        self.waiters.unregister(key);
    }

    pub fn apply_replicated_set(&self, key: &str, data: Vec<u8>, expires_at_ms: Option<i64>) {
        self.set_with(key, data, expires_at_ms);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_respects_expiry() {
        let store = Store::new();
        store.set_with("k", b"v".to_vec(), Some(now_ms() - 1));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn set_with_past_expiry_is_rejected() {
        let store = Store::new();
        let stored = store.set_with("k", b"v".to_vec(), Some(now_ms() - 1000));
        assert!(!stored);
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn incr_on_missing_key_starts_at_one() {
        let store = Store::new();
        assert_eq!(store.incr("counter").unwrap(), 1);
        assert_eq!(store.incr("counter").unwrap(), 2);
    }

    #[test]
    fn incr_on_non_numeric_string_errors() {
        let store = Store::new();
        store.set("k", b"not-a-number".to_vec());
        let err = store.incr("k").unwrap_err();
        assert!(err.contains("not an integer"));
    }

    #[test]
    fn type_of_reports_none_for_expired_key() {
        let store = Store::new();
        store.set_with("k", b"v".to_vec(), Some(now_ms() + 100_000));
        assert_eq!(store.type_of("k"), "string");
    }

    #[test]
    fn xadd_rejects_non_increasing_explicit_ids() {
        let store = Store::new();
        store.xadd("s", "5-5", Vec::new()).unwrap();
        let err = store.xadd("s", "5-5", Vec::new()).unwrap_err();
        assert!(err.contains("equal or smaller"));
    }

    #[test]
    fn xadd_rejects_zero_zero() {
        let store = Store::new();
        let err = store.xadd("s", "0-0", Vec::new()).unwrap_err();
        assert!(err.contains("greater than 0-0"));
    }

    #[test]
    fn xrange_is_inclusive_and_ordered() {
        let store = Store::new();
        store.xadd("s", "1-1", vec![("a".into(), b"1".to_vec())]).unwrap();
        store.xadd("s", "2-1", vec![("a".into(), b"2".to_vec())]).unwrap();
        store.xadd("s", "3-1", vec![("a".into(), b"3".to_vec())]).unwrap();
        let entries = store.xrange("s", "2-1", "3-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, StreamId { ms: 2, seq: 1 });
    }
}
