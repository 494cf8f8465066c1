//! A numbered database: the primary map, the expires map, the evicted-shell
//! map and the swap bookkeeping that hangs off them.

use std::collections::HashSet;
use std::collections::VecDeque;

use crate::dict::Dict;
use crate::swap::ScsQueue;
use crate::types::{Key, Object, ValueKind};

/// Placeholder for a key whose value lives in the backing store, or that
/// merely carries a swap queue while I/O is pending.
#[derive(Debug)]
pub struct Shell {
    pub kind: ValueKind,
    pub lru: i64,
    /// True when the live value is actually swapped out. A shell with
    /// `evicted == false` only exists to anchor `scs`.
    pub evicted: bool,
    pub scs: Option<ScsQueue>,
}

#[derive(Debug, Default)]
pub struct Db {
    pub id: usize,
    pub dict: Dict<Object>,
    pub expires: Dict<i64>,
    pub evict: Dict<Shell>,
    /// key -> packed (hold_count, swap_count); see the swap module.
    pub hold_keys: Dict<i64>,
    /// Keys to evict once the command that held them finishes.
    pub evict_asap: VecDeque<Key>,
    /// Keys in the middle of an outbound MIGRATE.
    pub migrating: HashSet<Key>,
    /// EWMA of sampled TTLs, maintained by the active expire cycle.
    pub avg_ttl: i64,
    pub expires_cursor: u64,
    /// Rough bytes held by materialized values; refreshed by cron and
    /// nudged on add/remove in between.
    pub mem_used: usize,
}

impl Db {
    pub fn new(id: usize) -> Self {
        Db { id, ..Db::default() }
    }

    /// Number of keys visible to DBSIZE: materialized plus evicted.
    pub fn size(&self) -> usize {
        self.dict.len() + self.evict.iter().filter(|(_, s)| s.evicted).count()
    }

    pub fn add(&mut self, key: Key, obj: Object) {
        self.mem_used += key.len() + obj.approx_size();
        self.dict.insert(key, obj);
    }

    /// Remove a key from the primary and expires maps. Does not touch the
    /// backing store; callers route that through the swap pipeline.
    pub fn remove_key(&mut self, key: &[u8]) -> Option<Object> {
        let obj = self.dict.remove(key)?;
        self.expires.remove(key);
        self.mem_used = self.mem_used.saturating_sub(key.len() + obj.approx_size());
        Some(obj)
    }

    /// Drop an evicted cold marker (shell without a queue).
    pub fn remove_cold(&mut self, key: &[u8]) -> bool {
        match self.evict.get(key) {
            Some(shell) if shell.evicted && shell.scs.is_none() => {
                self.evict.remove(key);
                self.expires.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn set_expire(&mut self, key: Key, at_ms: i64) {
        self.expires.insert(key, at_ms);
    }

    pub fn get_expire(&self, key: &[u8]) -> Option<i64> {
        self.expires.get(key).copied()
    }

    pub fn remove_expire(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_some()
    }

    pub fn is_expired(&self, key: &[u8], now: i64) -> bool {
        matches!(self.expires.get(key), Some(&at) if at <= now)
    }

    /// Whether the key exists at all: hot, or cold behind a shell.
    pub fn key_present(&self, key: &[u8]) -> bool {
        self.dict.contains(key)
            || matches!(self.evict.get(key), Some(shell) if shell.evicted)
    }

    pub fn kind_of(&self, key: &[u8]) -> Option<ValueKind> {
        if let Some(obj) = self.dict.get(key) {
            return Some(obj.value.kind());
        }
        match self.evict.get(key) {
            Some(shell) if shell.evicted => Some(shell.kind),
            _ => None,
        }
    }

    pub fn recompute_mem(&mut self) {
        self.mem_used = self
            .dict
            .iter()
            .map(|(k, o)| k.len() + o.approx_size())
            .sum();
    }

    /// Wipe every table. The caller is responsible for having drained the
    /// swap queues first (FLUSHDB queues at the global scope).
    pub fn flush(&mut self) -> usize {
        let removed = self.size();
        self.dict.clear();
        self.expires.clear();
        self.evict.clear();
        self.hold_keys.clear();
        self.evict_asap.clear();
        self.migrating.clear();
        self.avg_ttl = 0;
        self.expires_cursor = 0;
        self.mem_used = 0;
        removed
    }

    /// One incremental SCAN step over the primary map (hot keys) plus the
    /// evicted shells, honoring the reversed-bit cursor contract of the
    /// underlying tables.
    ///
    /// Cold keys are enumerated from the shell table after the hot table
    /// finishes, with the shell cursor offset by a tag bit so one opaque
    /// cursor serves both.
    pub fn scan_step(
        &self,
        cursor: u64,
        out: &mut Vec<Key>,
        type_filter: Option<ValueKind>,
        now: i64,
    ) -> u64 {
        const COLD_TAG: u64 = 1 << 63;
        let mut push = |key: &Key, kind: ValueKind| {
            if type_filter.map_or(true, |t| t == kind) && !self.is_expired(key, now) {
                out.push(key.clone());
            }
        };
        if cursor & COLD_TAG == 0 {
            let next = self.dict.scan(cursor, |k, o| push(k, o.value.kind()));
            if next != 0 {
                return next;
            }
            // Hot table finished; move to the cold table.
            let next = self.evict.scan(0, |k, s| {
                if s.evicted {
                    push(k, s.kind)
                }
            });
            return if next == 0 { 0 } else { next | COLD_TAG };
        }
        let next = self.evict.scan(cursor & !COLD_TAG, |k, s| {
            if s.evicted {
                push(k, s.kind)
            }
        });
        if next == 0 {
            0
        } else {
            next | COLD_TAG
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::types::{StrVal, Value};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn obj(s: &str) -> Object {
        Object::new(Value::Str(StrVal::from_bytes(b(s))), 0)
    }

    #[test]
    fn add_remove_and_size() {
        let mut db = Db::new(0);
        db.add(b("k"), obj("v"));
        db.set_expire(b("k"), 1000);
        assert_eq!(db.size(), 1);
        assert!(db.key_present(b"k"));
        assert!(db.is_expired(b"k", 1000));
        assert!(!db.is_expired(b"k", 999));
        let removed = db.remove_key(b"k").unwrap();
        assert_eq!(removed.value, Value::Str(StrVal::Raw(b("v"))));
        assert_eq!(db.get_expire(b"k"), None);
        assert_eq!(db.size(), 0);
    }

    #[test]
    fn cold_keys_count_and_scan() {
        let mut db = Db::new(0);
        db.add(b("hot"), obj("v"));
        db.evict.insert(
            b("cold"),
            Shell { kind: ValueKind::Str, lru: 0, evicted: true, scs: None },
        );
        assert_eq!(db.size(), 2);
        assert_eq!(db.kind_of(b"cold"), Some(ValueKind::Str));

        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            cursor = db.scan_step(cursor, &mut keys, None, 0);
            if cursor == 0 {
                break;
            }
        }
        keys.sort();
        assert_eq!(keys, vec![b("cold"), b("hot")]);
    }

    #[test]
    fn shell_without_eviction_is_invisible() {
        let mut db = Db::new(0);
        db.add(b("k"), obj("v"));
        db.evict.insert(
            b("k"),
            Shell { kind: ValueKind::Str, lru: 0, evicted: false, scs: Some(ScsQueue::new()) },
        );
        // Anchoring a queue must not double-count the key.
        assert_eq!(db.size(), 1);
        assert!(!db.remove_cold(b"k"));
    }

    #[test]
    fn flush_clears_everything() {
        let mut db = Db::new(0);
        db.add(b("a"), obj("1"));
        db.add(b("b"), obj("2"));
        db.set_expire(b("a"), 99);
        assert_eq!(db.flush(), 2);
        assert_eq!(db.size(), 0);
        assert_eq!(db.get_expire(b"a"), None);
        assert_eq!(db.mem_used, 0);
    }
}
