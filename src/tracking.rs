//! Client-side caching support: the invalidation table.
//!
//! Default mode remembers exactly which client read which key and
//! invalidates on write. Broadcast mode skips the per-key bookkeeping:
//! writes are collected per registered prefix and flushed once per loop
//! iteration.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use rand::Rng;

use crate::resp::Reply;
use crate::server::Server;
use crate::types::{ErrorKind, Key, ServerError, ServerResult};

#[derive(Debug, Default)]
pub struct Tracking {
    /// key -> clients that read it while tracking.
    pub table: HashMap<Key, HashSet<u64>>,
    /// prefix -> broadcast-mode clients registered for it.
    pub prefixes: HashMap<Bytes, HashSet<u64>>,
    /// Keys modified this loop iteration, per prefix, with the last writer
    /// (for NOLOOP suppression). Flushed from the before-sleep hook.
    pub pending_bcast: HashMap<Bytes, HashMap<Key, Option<u64>>>,
    pub max_keys: usize,
}

impl Tracking {
    pub fn new(max_keys: usize) -> Self {
        Tracking { max_keys, ..Tracking::default() }
    }

    pub fn remember_read(&mut self, key: Key, cid: u64) {
        self.table.entry(key).or_default().insert(cid);
    }

    pub fn drop_client(&mut self, cid: u64) {
        self.table.retain(|_, clients| {
            clients.remove(&cid);
            !clients.is_empty()
        });
        self.prefixes.retain(|_, clients| {
            clients.remove(&cid);
            !clients.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

impl Server {
    /// Record that a tracking client read `key` (default mode only;
    /// broadcast clients rely on their prefixes).
    pub fn track_read(&mut self, cid: u64, key: &Key) {
        let c = self.client(cid);
        if c.tracking && !c.tracking_bcast && c.protover >= 3 {
            self.tracking.remember_read(key.clone(), cid);
        }
    }

    /// A write landed on `key`: push invalidations to direct readers and
    /// stage broadcast notifications. `writer` suppresses NOLOOP echoes.
    pub fn tracking_invalidate(&mut self, key: &Key, writer: Option<u64>) {
        if let Some(readers) = self.tracking.table.remove(key) {
            for cid in readers {
                if writer == Some(cid) && self.client_exists(cid) && self.client(cid).tracking_noloop
                {
                    continue;
                }
                self.send_invalidation(cid, std::slice::from_ref(key));
            }
        }
        let matching: Vec<Bytes> = self
            .tracking
            .prefixes
            .keys()
            .filter(|prefix| key.starts_with(&prefix[..]))
            .cloned()
            .collect();
        for prefix in matching {
            self.tracking
                .pending_bcast
                .entry(prefix)
                .or_default()
                .insert(key.clone(), writer);
        }
    }

    fn send_invalidation(&mut self, cid: u64, keys: &[Key]) {
        if !self.client_exists(cid) || self.client(cid).protover < 3 {
            return;
        }
        let frame = Reply::Push(vec![
            Reply::bulk(&b"invalidate"[..]),
            Reply::Array(keys.iter().cloned().map(Reply::Bulk).collect()),
        ]);
        self.push_reply_to(cid, &frame);
    }

    /// Flush broadcast-mode invalidations collected during this loop
    /// iteration; called once per reactor pass.
    pub fn tracking_flush_bcast(&mut self) {
        if self.tracking.pending_bcast.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.tracking.pending_bcast);
        for (prefix, keys) in pending {
            let Some(clients) = self.tracking.prefixes.get(&prefix) else { continue };
            let clients: Vec<u64> = clients.iter().copied().collect();
            for cid in clients {
                if !self.client_exists(cid) {
                    continue;
                }
                let noloop = self.client(cid).tracking_noloop;
                let batch: Vec<Key> = keys
                    .iter()
                    .filter(|(_, writer)| !(noloop && **writer == Some(cid)))
                    .map(|(k, _)| k.clone())
                    .collect();
                if !batch.is_empty() {
                    self.send_invalidation(cid, &batch);
                }
            }
        }
    }

    /// Enforce the configured table bound by evicting random tracked keys,
    /// telling their readers. Effort scales how many keys go per call.
    pub fn tracking_limit_used_slots(&mut self) {
        let max = self.tracking.max_keys;
        if max == 0 {
            return;
        }
        let effort = self.config.active_expire_effort as usize;
        let mut budget = 5 * effort;
        let mut rng = rand::thread_rng();
        while self.tracking.table.len() > max && budget > 0 {
            budget -= 1;
            let idx = rng.gen_range(0..self.tracking.table.len());
            let Some(key) = self.tracking.table.keys().nth(idx).cloned() else { break };
            if let Some(readers) = self.tracking.table.remove(&key) {
                for cid in readers {
                    self.send_invalidation(cid, std::slice::from_ref(&key));
                }
            }
        }
    }

    /// `CLIENT TRACKING on|off [BCAST] [PREFIX p]... [NOLOOP]`
    pub fn client_tracking(&mut self, cid: u64, argv: &[Bytes]) -> ServerResult<Reply> {
        if argv.len() < 3 {
            return Err(ServerError::syntax());
        }
        let enable = match argv[2].to_ascii_lowercase().as_slice() {
            b"on" => true,
            b"off" => false,
            _ => return Err(ServerError::syntax()),
        };
        let mut bcast = false;
        let mut noloop = false;
        let mut prefixes: Vec<Bytes> = Vec::new();
        let mut i = 3;
        while i < argv.len() {
            match argv[i].to_ascii_uppercase().as_slice() {
                b"BCAST" => {
                    bcast = true;
                    i += 1;
                }
                b"NOLOOP" => {
                    noloop = true;
                    i += 1;
                }
                b"PREFIX" if i + 1 < argv.len() => {
                    prefixes.push(argv[i + 1].clone());
                    i += 2;
                }
                _ => return Err(ServerError::syntax()),
            }
        }
        if !bcast && !prefixes.is_empty() {
            return Err(ServerError::new(
                ErrorKind::Generic,
                "PREFIX option requires BCAST mode",
            ));
        }
        if enable && self.client(cid).protover < 3 {
            return Err(ServerError::new(
                ErrorKind::Generic,
                "tracking requires the RESP3 protocol, see HELLO",
            ));
        }

        if !enable {
            self.tracking.drop_client(cid);
            let c = self.client_mut(cid);
            c.tracking = false;
            c.tracking_bcast = false;
            c.tracking_noloop = false;
            c.tracking_prefixes.clear();
            return Ok(Reply::Ok);
        }

        // A client's registered prefixes must not shadow one another.
        let existing = self.client(cid).tracking_prefixes.clone();
        for p in &prefixes {
            for q in existing.iter().chain(prefixes.iter().filter(|q| *q != p)) {
                if p.starts_with(&q[..]) || q.starts_with(&p[..]) {
                    return Err(ServerError::new(
                        ErrorKind::Generic,
                        format!(
                            "The prefix '{}' overlaps with an existing prefix '{}'",
                            String::from_utf8_lossy(p),
                            String::from_utf8_lossy(q)
                        ),
                    ));
                }
            }
        }

        for p in &prefixes {
            self.tracking.prefixes.entry(p.clone()).or_default().insert(cid);
        }
        let c = self.client_mut(cid);
        c.tracking = true;
        c.tracking_bcast = c.tracking_bcast || bcast;
        c.tracking_noloop = c.tracking_noloop || noloop;
        c.tracking_prefixes.extend(prefixes);
        Ok(Reply::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn remember_and_drop() {
        let mut t = Tracking::new(10);
        t.remember_read(b("k"), 1);
        t.remember_read(b("k"), 2);
        assert_eq!(t.len(), 1);
        t.drop_client(1);
        assert_eq!(t.table.get(&b("k")[..]).unwrap().len(), 1);
        t.drop_client(2);
        assert_eq!(t.len(), 0);
    }
}
