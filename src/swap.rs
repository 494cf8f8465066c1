//! The swap pipeline: per-key serialization of background I/O.
//!
//! A command that needs a cold value (or wants to push one out) does not
//! block the loop. Dispatch analyzes the command's swap intents against the
//! keyspace; if I/O is required the client parks on the key's swap queue
//! (SCS) and the reactor moves on. Completions resume parked clients
//! strictly in arrival order, and a queue head whose re-analysis needs no
//! further I/O runs immediately. Queues form a two-level forest: per-key
//! queues under one global root used by whole-database operations.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command;
use crate::connection::{HoldMode, SwapCb};
use crate::db::Shell;
use crate::resp::Reply;
use crate::server::Server;
use crate::swap_io::{SwapAction, SwapCompletion, SwapJob};
use crate::types::{ErrorKind, Key, Object, ServerError, StrVal, Value, ValueKind};

pub const SWAP_TYPES: usize = 4;

/// Overhead charged per in-flight swap on top of the payload bytes.
const SWAP_MEM_INFLIGHT_BASE: usize = 512;

const SWAP_RL_DELAY_SLOW: i64 = 1;
const SWAP_RL_DELAY_STOP: i64 = 10;

/// What a command wants swapped, before the keyspace is consulted.
#[derive(Debug, Clone, Default)]
pub struct SwapIntent {
    pub key: Option<Key>,
    pub subkey: Option<Key>,
    pub val: Option<Bytes>,
}

impl SwapIntent {
    pub fn whole_key(key: Key) -> Self {
        SwapIntent { key: Some(key), subkey: None, val: None }
    }

    pub fn global() -> Self {
        SwapIntent::default()
    }
}

/// A suspended client parked on a queue.
#[derive(Debug, Clone)]
pub struct SwapClient {
    pub client: u64,
    pub intent: SwapIntent,
}

/// Per-key FIFO. Sub-key queues would hang below these; whole-key swaps
/// keep everything at this level.
#[derive(Debug, Default)]
pub struct ScsQueue {
    pub clients: VecDeque<SwapClient>,
}

impl ScsQueue {
    pub fn new() -> Self {
        ScsQueue::default()
    }
}

#[derive(Debug, Default)]
pub struct ScsRoot {
    pub clients: VecDeque<SwapClient>,
    /// Live per-key queues below the root.
    pub nchild: usize,
}

impl ScsRoot {
    pub fn tree_blocking(&self) -> bool {
        !self.clients.is_empty() || self.nchild > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SwapStat {
    pub started: u64,
    pub finished: u64,
    pub last_start_time: i64,
    pub last_finish_time: i64,
    pub started_rawkey_bytes: u64,
    pub started_rawval_bytes: u64,
    pub finished_rawkey_bytes: u64,
    pub finished_rawval_bytes: u64,
}

/// Keyspace mutation to apply when the I/O lands, before the client runs.
#[derive(Debug)]
pub enum DataCb {
    SwapIn { key: Key },
    SwapOut { key: Key },
    None,
}

#[derive(Debug)]
pub struct PendingSwap {
    pub db: usize,
    pub key: Option<Key>,
    pub client: u64,
    pub action: SwapAction,
    pub data_cb: DataCb,
    pub swap_memory: usize,
}

#[derive(Debug, Default)]
pub struct SwapState {
    pub root: ScsRoot,
    pub stats: [SwapStat; SWAP_TYPES],
    /// Estimated bytes tied up in in-flight swaps; drives rate limiting.
    pub swap_memory: u64,
    pub inflight: std::collections::HashMap<u64, PendingSwap>,
    pub next_io_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlState {
    No,
    Slow,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Dirty value: swap-out I/O started.
    SuccSwapped,
    /// Clean value freed in place, no I/O.
    SuccFreed,
    FailAbsent,
    FailEvicted,
    FailSwapping,
    FailHeld,
}

impl EvictOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictOutcome::SuccSwapped => "swapped",
            EvictOutcome::SuccFreed => "freed",
            EvictOutcome::FailAbsent => "absent",
            EvictOutcome::FailEvicted => "evicted",
            EvictOutcome::FailSwapping => "swapping",
            EvictOutcome::FailHeld => "held",
        }
    }
}

// ------------------------------------------------------------ raw codec

/// Raw key in the backing store: value type name + key bytes.
pub fn encode_rawkey(kind: ValueKind, key: &[u8]) -> Bytes {
    let name = kind.type_name().as_bytes();
    let mut out = BytesMut::with_capacity(name.len() + key.len());
    out.put_slice(name);
    out.put_slice(key);
    out.freeze()
}

const TAG_STR: u8 = 0;
const TAG_LIST: u8 = 1;
const TAG_SET: u8 = 2;
const TAG_ZSET: u8 = 3;
const TAG_HASH: u8 = 4;
const TAG_STREAM: u8 = 5;

fn put_bytes(out: &mut BytesMut, b: &[u8]) {
    out.put_u32_le(b.len() as u32);
    out.put_slice(b);
}

fn take_bytes(buf: &mut &[u8]) -> Option<Bytes> {
    if buf.len() < 4 {
        return None;
    }
    let len = (&buf[..4]).get_u32_le() as usize;
    buf.advance(4);
    if buf.len() < len {
        return None;
    }
    let out = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Some(out)
}

/// Serialize a value for the backing store (and RESTORE payloads).
pub fn encode_value(value: &Value) -> Bytes {
    let mut out = BytesMut::new();
    match value {
        Value::Str(s) => {
            out.put_u8(TAG_STR);
            put_bytes(&mut out, &s.to_bytes());
        }
        Value::List(items) => {
            out.put_u8(TAG_LIST);
            out.put_u32_le(items.len() as u32);
            for item in items {
                put_bytes(&mut out, item);
            }
        }
        Value::Set(items) => {
            out.put_u8(TAG_SET);
            out.put_u32_le(items.len() as u32);
            for item in items {
                put_bytes(&mut out, item);
            }
        }
        Value::ZSet(z) => {
            out.put_u8(TAG_ZSET);
            out.put_u32_le(z.len() as u32);
            for (member, score) in z.iter() {
                put_bytes(&mut out, member);
                out.put_f64_le(score);
            }
        }
        Value::Hash(map) => {
            out.put_u8(TAG_HASH);
            out.put_u32_le(map.len() as u32);
            for (field, val) in map {
                put_bytes(&mut out, field);
                put_bytes(&mut out, val);
            }
        }
        Value::Stream(s) => {
            out.put_u8(TAG_STREAM);
            out.put_u64_le(s.last_id.0);
            out.put_u64_le(s.last_id.1);
            out.put_u32_le(s.entries.len() as u32);
            for entry in &s.entries {
                out.put_u64_le(entry.id.0);
                out.put_u64_le(entry.id.1);
                out.put_u32_le(entry.fields.len() as u32);
                for (field, val) in &entry.fields {
                    put_bytes(&mut out, field);
                    put_bytes(&mut out, val);
                }
            }
        }
    }
    out.freeze()
}

pub fn decode_value(raw: &[u8]) -> Option<Value> {
    let mut buf = raw;
    if buf.is_empty() {
        return None;
    }
    let tag = buf[0];
    buf.advance(1);
    let take_count = |buf: &mut &[u8]| -> Option<u32> {
        if buf.len() < 4 {
            return None;
        }
        let n = (&buf[..4]).get_u32_le();
        buf.advance(4);
        Some(n)
    };
    match tag {
        TAG_STR => Some(Value::Str(StrVal::from_bytes(take_bytes(&mut buf)?))),
        TAG_LIST => {
            let n = take_count(&mut buf)?;
            let mut items = VecDeque::with_capacity(n as usize);
            for _ in 0..n {
                items.push_back(take_bytes(&mut buf)?);
            }
            Some(Value::List(items))
        }
        TAG_SET => {
            let n = take_count(&mut buf)?;
            let mut items = std::collections::HashSet::with_capacity(n as usize);
            for _ in 0..n {
                items.insert(take_bytes(&mut buf)?);
            }
            Some(Value::Set(items))
        }
        TAG_ZSET => {
            let n = take_count(&mut buf)?;
            let mut z = crate::zset::ZSet::new();
            for _ in 0..n {
                let member = take_bytes(&mut buf)?;
                if buf.len() < 8 {
                    return None;
                }
                let score = (&buf[..8]).get_f64_le();
                buf.advance(8);
                z.insert(member, score);
            }
            Some(Value::ZSet(z))
        }
        TAG_HASH => {
            let n = take_count(&mut buf)?;
            let mut map = std::collections::HashMap::with_capacity(n as usize);
            for _ in 0..n {
                let field = take_bytes(&mut buf)?;
                let val = take_bytes(&mut buf)?;
                map.insert(field, val);
            }
            Some(Value::Hash(map))
        }
        TAG_STREAM => {
            if buf.len() < 16 {
                return None;
            }
            let last0 = (&buf[..8]).get_u64_le();
            buf.advance(8);
            let last1 = (&buf[..8]).get_u64_le();
            buf.advance(8);
            let n = take_count(&mut buf)?;
            let mut entries = Vec::with_capacity(n as usize);
            for _ in 0..n {
                if buf.len() < 16 {
                    return None;
                }
                let id0 = (&buf[..8]).get_u64_le();
                buf.advance(8);
                let id1 = (&buf[..8]).get_u64_le();
                buf.advance(8);
                let nf = take_count(&mut buf)?;
                let mut fields = Vec::with_capacity(nf as usize);
                for _ in 0..nf {
                    let field = take_bytes(&mut buf)?;
                    let val = take_bytes(&mut buf)?;
                    fields.push((field, val));
                }
                entries.push(crate::types::StreamEntry { id: (id0, id1), fields });
            }
            Some(Value::Stream(crate::types::Stream { last_id: (last0, last1), entries }))
        }
        _ => None,
    }
}

// ------------------------------------------------------ analysis result

enum Ana {
    Nop,
    Proceed { action: SwapAction, rawkey: Bytes, rawval: Option<Bytes>, data_cb: DataCb },
}

impl Server {
    // ------------------------------------------------------ hold/unhold

    // (hold_count, swap_count) packed into one signed 64-bit word.
    fn hc_hold_count(hc: i64) -> i64 {
        hc & 0xffff_ffff
    }

    fn hc_swap_count(hc: i64) -> i64 {
        hc >> 32
    }

    pub fn client_hold_key(&mut self, cid: u64, key: &Key, swap: i64) {
        let dbid = self.client(cid).db;
        if self.client(cid).hold_keys.contains_key(key) {
            return;
        }
        self.client_mut(cid).hold_keys.insert(key.clone(), swap as u32);
        match self.dbs[dbid].hold_keys.get_mut(key) {
            Some(hc) => {
                *hc += (swap << 32) + 1;
                tracing::trace!(key = ?key, hc = *hc, "hold");
            }
            None => {
                self.dbs[dbid].hold_keys.insert(key.clone(), (swap << 32) + 1);
            }
        }
    }

    pub fn client_unhold_key(&mut self, cid: u64, key: &Key) {
        if self.client_mut(cid).hold_keys.remove(key).is_none() {
            return;
        }
        let dbid = self.client(cid).db;
        let Some(&hc) = self.dbs[dbid].hold_keys.get(key) else { return };
        let hc = hc - 1;
        if Self::hc_hold_count(hc) > 0 {
            *self.dbs[dbid].hold_keys.get_mut(key).expect("held key") = hc;
        } else {
            self.db_unhold_key(dbid, key, hc);
        }
    }

    fn db_unhold_key(&mut self, dbid: usize, key: &Key, hc: i64) {
        self.dbs[dbid].hold_keys.remove(key);
        // Evict right after the command finishes when a background save is
        // running, so swapped-in keys do not balloon copy-on-write.
        if Self::hc_swap_count(hc) > 0 && self.active_child {
            self.dbs[dbid].evict_asap.push_back(key.clone());
        }
    }

    pub fn client_unhold_keys(&mut self, cid: u64) {
        let keys: Vec<Key> = self.client(cid).hold_keys.keys().cloned().collect();
        for key in keys {
            self.client_unhold_key(cid, &key);
        }
    }

    pub fn key_is_held(&self, dbid: usize, key: &[u8]) -> bool {
        self.dbs[dbid].hold_keys.contains(key)
    }

    // ------------------------------------------------------- scs access

    fn scs_blocking(&self, dbid: usize, key: &[u8]) -> bool {
        match self.dbs[dbid].evict.get(key) {
            Some(shell) => shell.scs.as_ref().map_or(false, |q| !q.clients.is_empty()),
            None => false,
        }
    }

    fn scs_push(&mut self, dbid: usize, key: &Key, sc: SwapClient) {
        let now = self.mstime;
        let db = &mut self.dbs[dbid];
        match db.evict.get_mut(key) {
            Some(shell) => {
                if shell.scs.is_none() {
                    shell.scs = Some(ScsQueue::new());
                    self.swap.root.nchild += 1;
                }
                shell.scs.as_mut().expect("just set").clients.push_back(sc);
            }
            None => {
                let (kind, lru) = db
                    .dict
                    .get(key)
                    .map(|o| (o.value.kind(), o.lru))
                    .unwrap_or((ValueKind::Str, now));
                let mut queue = ScsQueue::new();
                queue.clients.push_back(sc);
                db.evict.insert(
                    key.clone(),
                    Shell { kind, lru, evicted: false, scs: Some(queue) },
                );
                self.swap.root.nchild += 1;
            }
        }
    }

    fn scs_peek(&self, dbid: usize, level: &Option<Key>) -> Option<SwapClient> {
        match level {
            None => self.swap.root.clients.front().cloned(),
            Some(key) => self.dbs[dbid]
                .evict
                .get(key)
                .and_then(|s| s.scs.as_ref())
                .and_then(|q| q.clients.front().cloned()),
        }
    }

    fn scs_pop(&mut self, dbid: usize, level: &Option<Key>) {
        match level {
            None => {
                self.swap.root.clients.pop_front();
            }
            Some(key) => {
                if let Some(shell) = self.dbs[dbid].evict.get_mut(key) {
                    if let Some(q) = shell.scs.as_mut() {
                        q.clients.pop_front();
                    }
                }
            }
        }
    }

    fn scs_is_empty(&self, dbid: usize, key: &[u8]) -> bool {
        self.dbs[dbid]
            .evict
            .get(key)
            .and_then(|s| s.scs.as_ref())
            .map_or(true, |q| q.clients.is_empty())
    }

    /// Release a drained per-key queue; drops anchor shells that exist
    /// only for the queue.
    fn scs_detach(&mut self, dbid: usize, key: &[u8]) {
        let mut drop_shell = false;
        if let Some(shell) = self.dbs[dbid].evict.get_mut(key) {
            if shell.scs.take().is_some() {
                self.swap.root.nchild -= 1;
            }
            drop_shell = !shell.evicted;
        }
        if drop_shell {
            self.dbs[dbid].evict.remove(key);
        }
    }

    fn scs_dump(&self, dbid: usize, key: &[u8]) -> String {
        let mut out = String::from("[");
        if let Some(queue) = self.dbs[dbid].evict.get(key).and_then(|s| s.scs.as_ref()) {
            for (i, sc) in queue.clients.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let name = self
                    .client_exists(sc.client)
                    .then(|| self.client(sc.client).argv.first().cloned())
                    .flatten()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .unwrap_or_default();
                out.push_str(&format!("({}:{})", sc.client, name));
            }
        }
        out.push(']');
        out
    }

    // --------------------------------------------------------- analysis

    /// Re-evaluate one intent against the keyspace and decide the concrete
    /// action, applying free transitions (clean swap-out) on the spot.
    fn swap_ana(&mut self, cid: u64, dbid: usize, intent: &SwapIntent) -> Ana {
        let Some(key) = intent.key.as_ref() else { return Ana::Nop };
        let now = self.mstime;
        let cmd_action = self
            .client(cid)
            .argv
            .first()
            .and_then(|name| command::lookup_command(name))
            .map_or(SwapAction::Nop, |spec| spec.swap_action);

        let value_kind = self.dbs[dbid].dict.get(key).map(|o| o.value.kind());
        let (shell_kind, evicted) = match self.dbs[dbid].evict.get(key) {
            Some(shell) => (Some(shell.kind), shell.evicted),
            None => (None, false),
        };
        let Some(kind) = value_kind.or(shell_kind) else { return Ana::Nop };
        let rawkey = encode_rawkey(kind, key);

        // Deletes win over the expired-materialization special case: a
        // DEL-action client wants the cold copy gone, not loaded.
        if cmd_action == SwapAction::Del {
            return Ana::Proceed {
                action: SwapAction::Del,
                rawkey,
                rawval: None,
                data_cb: DataCb::None,
            };
        }
        if evicted && (self.dbs[dbid].is_expired(key, now) || cmd_action == SwapAction::Get) {
            return Ana::Proceed {
                action: SwapAction::Get,
                rawkey,
                rawval: None,
                data_cb: DataCb::SwapIn { key: key.clone() },
            };
        }
        match cmd_action {
            SwapAction::Put if value_kind.is_some() => {
                let dirty = self.dbs[dbid].dict.get(key).map_or(false, |o| o.dirty);
                if !dirty {
                    // Clean values drop out of memory with no I/O.
                    self.db_swap_out_apply(dbid, key);
                    return Ana::Nop;
                }
                let rawval = self.dbs[dbid].dict.get(key).map(|o| encode_value(&o.value));
                Ana::Proceed {
                    action: SwapAction::Put,
                    rawkey,
                    rawval,
                    data_cb: DataCb::SwapOut { key: key.clone() },
                }
            }
            _ => Ana::Nop,
        }
    }

    /// Start the I/O for one intent if analysis says so. Returns true when
    /// an async swap is now in flight for `cid`.
    fn proceed_swap(&mut self, cid: u64, dbid: usize, intent: &SwapIntent) -> bool {
        if !self.client_exists(cid) {
            return false;
        }
        let ana = self.swap_ana(cid, dbid, intent);
        let Ana::Proceed { action, rawkey, rawval, data_cb } = ana else {
            return false;
        };
        let swap_memory = SWAP_MEM_INFLIGHT_BASE
            + rawkey.len()
            + rawval.as_ref().map_or(0, |v| v.len())
            + intent.key.as_ref().map_or(0, |k| k.len());
        self.swap.swap_memory += swap_memory as u64;

        let stat = &mut self.swap.stats[action.index()];
        stat.started += 1;
        stat.last_start_time = self.mstime;
        stat.started_rawkey_bytes += rawkey.len() as u64;
        stat.started_rawval_bytes += rawval.as_ref().map_or(0, |v| v.len() as u64);

        let id = self.swap.next_io_id;
        self.swap.next_io_id += 1;
        self.swap.inflight.insert(
            id,
            PendingSwap {
                db: dbid,
                key: intent.key.clone(),
                client: cid,
                action,
                data_cb,
                swap_memory,
            },
        );
        self.pipes.submit(SwapJob { id, action, rawkey, rawval });
        true
    }

    /// Queue (or start) the swaps for a client's intents; returns how many
    /// the client now waits on.
    pub fn client_swap_swaps(&mut self, cid: u64, intents: Vec<SwapIntent>) -> usize {
        let dbid = self.client(cid).db;
        let mut nswaps = 0usize;
        for intent in intents {
            let oswaps = nswaps;
            match intent.key.clone() {
                None => {
                    // Global scope: park on the root, or run synchronously
                    // when nothing in the whole tree is pending.
                    if self.swap.root.tree_blocking() {
                        self.swap.root.clients.push_back(SwapClient { client: cid, intent });
                        nswaps += 1;
                    } else if self.proceed_swap(cid, dbid, &intent) {
                        self.swap.root.clients.push_back(SwapClient { client: cid, intent });
                        nswaps += 1;
                    }
                }
                Some(key) => {
                    if self.scs_blocking(dbid, &key) {
                        self.scs_push(dbid, &key, SwapClient { client: cid, intent: intent.clone() });
                        nswaps += 1;
                    } else if self.proceed_swap(cid, dbid, &intent) {
                        self.scs_push(dbid, &key, SwapClient { client: cid, intent: intent.clone() });
                        nswaps += 1;
                    }
                    let need = nswaps > oswaps;
                    let hold = match self.client(cid).hold_mode {
                        HoldMode::Cmd => true,
                        HoldMode::Evict => need,
                        HoldMode::Repl => true,
                    };
                    if hold {
                        self.client_hold_key(cid, &key, (nswaps - oswaps) as i64);
                    }
                    tracing::debug!(
                        client = cid,
                        key = %String::from_utf8_lossy(&key),
                        queued = need,
                        scs = %self.scs_dump(dbid, &key),
                        "swap"
                    );
                }
            }
        }
        if nswaps == 0 && self.client(cid).hold_mode == HoldMode::Cmd {
            self.client_unhold_keys(cid);
        }
        self.client_mut(cid).swapping_count = nswaps as u32;
        nswaps
    }

    /// Normal-client entry: analyze the current command and park if I/O is
    /// needed. Returns the number of pending swaps (0 = run now).
    pub fn dispatch_swap(&mut self, cid: u64) -> usize {
        let intents = command::get_swaps(self, cid);
        self.client_mut(cid).swap_cb = SwapCb::Command;
        let n = self.client_swap_swaps(cid, intents);
        if n > 0 {
            self.swap_rate_limit(cid);
        }
        n
    }

    // ------------------------------------------------------- completion

    /// Apply one finished I/O: keyspace mutation, head client callback,
    /// then pop-and-run every successive head that needs no new I/O,
    /// climbing to the root when the key queue drains.
    pub fn swap_finished(&mut self, comp: SwapCompletion) {
        let Some(pending) = self.swap.inflight.remove(&comp.id) else {
            tracing::warn!(id = comp.id, "completion for unknown swap");
            return;
        };
        self.swap.swap_memory = self.swap.swap_memory.saturating_sub(pending.swap_memory as u64);
        let stat = &mut self.swap.stats[comp.action.index()];
        stat.finished += 1;
        stat.last_finish_time = self.mstime;
        stat.finished_rawkey_bytes += comp.rawkey.len() as u64;
        stat.finished_rawval_bytes += comp.rawval.as_ref().map_or(0, |v| v.len() as u64);

        match &comp.result {
            Ok(()) => match pending.data_cb {
                DataCb::SwapIn { ref key } => {
                    if let Some(raw) = comp.rawval.as_ref() {
                        self.db_swap_in_apply(pending.db, key, raw);
                    }
                }
                DataCb::SwapOut { ref key } => {
                    self.db_swap_out_apply(pending.db, key);
                }
                DataCb::None => {}
            },
            Err(e) => {
                tracing::warn!(
                    action = comp.action.name(),
                    error = %e,
                    "swap backend error"
                );
                // The key stays unmaterialized; the originating command
                // fails, later clients re-analyze and retry or re-fail.
                if self.client_exists(pending.client) {
                    self.client_mut(pending.client).swap_error = Some(ServerError::new(
                        ErrorKind::Io,
                        format!("swap {} failed: {}", comp.action.name(), e),
                    ));
                }
            }
        }

        self.scs_resume(pending.db, pending.key.clone(), pending.client);
    }

    fn scs_resume(&mut self, dbid: usize, origin: Option<Key>, expected: u64) {
        // The completed swap belongs to the queue head; run its callback
        // before popping so anything it enqueues lands behind it.
        if let Some(head) = self.scs_peek(dbid, &origin) {
            debug_assert_eq!(head.client, expected);
            self.run_swap_client_cb(head.client, head.intent.key.clone());
            self.scs_pop(dbid, &origin);
        }

        let mut level = origin;
        loop {
            loop {
                let Some(next) = self.scs_peek(dbid, &level) else { break };
                if self.proceed_swap(next.client, dbid, &next.intent) {
                    // New I/O in flight; this head stays put until it lands.
                    return;
                }
                self.run_swap_client_cb(next.client, next.intent.key.clone());
                self.scs_pop(dbid, &level);
            }
            match level.take() {
                None => return, // the root is never released
                Some(key) => {
                    if self.scs_is_empty(dbid, &key) {
                        self.scs_detach(dbid, &key);
                        if self.swap.root.nchild > 0 {
                            // Sibling queues still block the root.
                            return;
                        }
                        // level is now None: drain the root next.
                    } else {
                        return;
                    }
                }
            }
        }
    }

    fn run_swap_client_cb(&mut self, cid: u64, key: Option<Key>) {
        if !self.client_exists(cid) {
            return;
        }
        match self.client(cid).swap_cb {
            SwapCb::Command => {
                let c = self.client_mut(cid);
                c.swapping_count = c.swapping_count.saturating_sub(1);
                let done = c.swapping_count == 0;
                if done {
                    c.swapping = false;
                }
                let defered = c.defered_closing;
                if done && defered {
                    self.free_client_final(cid);
                } else if done {
                    self.continue_process_command(cid);
                }
            }
            SwapCb::Unhold => {
                if let Some(key) = key {
                    self.client_unhold_key(cid, &key);
                }
            }
            SwapCb::Expire => {
                if let Some(key) = key {
                    let dbid = self.client(cid).db;
                    self.client_unhold_key(cid, &key);
                    self.rocks_delete(dbid, &key);
                    self.delete_expired_and_propagate(dbid, &key);
                }
            }
            SwapCb::ReplWorker => {
                let c = self.client_mut(cid);
                c.swapping_count = c.swapping_count.saturating_sub(1);
                if c.swapping_count == 0 {
                    c.repl_swapping = false;
                }
                self.process_finished_repl_commands();
                self.retry_blocked_repl_clients();
            }
        }
    }

    // ------------------------------------------------- keyspace effects

    /// Move a key from the shell table into the primary map using the
    /// decoded cold value.
    pub fn db_swap_in_apply(&mut self, dbid: usize, key: &Key, raw: &[u8]) {
        let Some(value) = decode_value(raw) else {
            tracing::warn!(key = %String::from_utf8_lossy(key), "undecodable cold value");
            return;
        };
        let mut lru = self.mstime;
        let mut shell_state = None;
        if let Some(shell) = self.dbs[dbid].evict.get(key) {
            lru = shell.lru;
            shell_state = Some(shell.scs.is_some());
        }
        match shell_state {
            // Keep the shell as the queue anchor.
            Some(true) => {
                self.dbs[dbid].evict.get_mut(key).expect("shell checked").evicted = false;
            }
            Some(false) => {
                self.dbs[dbid].evict.remove(key);
            }
            None => {}
        }
        let size = key.len() + value.approx_size();
        self.dbs[dbid].dict.insert(key.clone(), Object { value, dirty: false, lru });
        self.dbs[dbid].mem_used += size;
    }

    /// Move a key from the primary map into the shell table (the value has
    /// been written out, or was clean).
    pub fn db_swap_out_apply(&mut self, dbid: usize, key: &Key) {
        let db = &mut self.dbs[dbid];
        let Some(obj) = db.dict.remove(key) else { return };
        db.mem_used = db.mem_used.saturating_sub(key.len() + obj.approx_size());
        let kind = obj.value.kind();
        let lru = obj.lru;
        match db.evict.get_mut(key) {
            Some(shell) => {
                shell.evicted = true;
                shell.kind = kind;
                shell.lru = lru;
            }
            None => {
                db.evict.insert(key.clone(), Shell { kind, lru, evicted: true, scs: None });
            }
        }
    }

    // ------------------------------------------------- derived entries

    /// Queue a backing-store delete for `key` through the per-db internal
    /// delete client. Must run while the key (or its shell) still exists so
    /// analysis can type the raw key.
    pub fn rocks_delete(&mut self, dbid: usize, key: &Key) -> usize {
        let cid = self.rksdel_clients[dbid];
        self.client_mut(cid).argv = vec![Bytes::from_static(b"rksdel"), key.clone()];
        self.client_mut(cid).swap_cb = SwapCb::Unhold;
        self.client_swap_swaps(cid, vec![SwapIntent::whole_key(key.clone())])
    }

    /// Expire `key`: cold keys are first materialized through a GET swap
    /// (the expire callback then deletes and propagates); hot keys expire
    /// synchronously. Returns the number of swaps started.
    pub fn db_expire(&mut self, dbid: usize, key: &Key) -> usize {
        let cid = self.rksget_clients[dbid];
        self.client_mut(cid).argv = vec![Bytes::from_static(b"rksget"), key.clone()];
        self.client_mut(cid).swap_cb = SwapCb::Expire;
        let nswap = if self.in_swap_cb {
            0
        } else {
            self.client_swap_swaps(cid, vec![SwapIntent::whole_key(key.clone())])
        };
        if nswap == 0 {
            self.client_unhold_key(cid, key);
            self.rocks_delete(dbid, key);
            self.delete_expired_and_propagate(dbid, key);
        }
        nswap
    }

    /// Lazy expiration on access: the caller is about to read or write the
    /// key. Memory state goes now; the backing-store delete is queued.
    pub fn expire_if_needed(&mut self, dbid: usize, key: &Key) -> bool {
        let now = self.mstime;
        if !self.dbs[dbid].is_expired(key, now) {
            return false;
        }
        self.rocks_delete(dbid, key);
        self.delete_expired_and_propagate(dbid, key);
        true
    }

    /// Drop every in-memory trace of a key: the live value, its expire,
    /// and the cold marker. A shell that anchors a live swap queue stays,
    /// with its evicted flag cleared, until the queue drains.
    fn forget_key_memory(&mut self, dbid: usize, key: &Key) {
        self.dbs[dbid].remove_key(key);
        self.dbs[dbid].remove_expire(key);
        let mut action = None;
        if let Some(shell) = self.dbs[dbid].evict.get(key) {
            if shell.evicted {
                action = Some(shell.scs.is_some());
            }
        }
        match action {
            Some(true) => {
                self.dbs[dbid].evict.get_mut(key).expect("shell checked").evicted = false;
            }
            Some(false) => {
                self.dbs[dbid].evict.remove(key);
            }
            None => {}
        }
    }

    pub fn delete_expired_and_propagate(&mut self, dbid: usize, key: &Key) {
        self.forget_key_memory(dbid, key);
        self.stat_expired += 1;
        self.signal_modified(dbid, key);
        self.notify_keyspace_event(crate::notify::NOTIFY_EXPIRED, "expired", key, dbid);
    }

    /// Delete a key from memory and schedule the backing-store delete.
    /// Returns true when something was removed.
    pub fn db_delete_key(&mut self, dbid: usize, key: &[u8]) -> bool {
        let key = Bytes::copy_from_slice(key);
        if !self.dbs[dbid].key_present(&key) {
            return false;
        }
        self.rocks_delete(dbid, &key);
        self.forget_key_memory(dbid, &key);
        true
    }

    // -------------------------------------------------------- eviction

    /// Try to push one key out of memory.
    pub fn db_evict(&mut self, dbid: usize, key: &Key) -> EvictOutcome {
        if !self.swap.root.clients.is_empty() {
            return EvictOutcome::FailSwapping;
        }
        if !self.dbs[dbid].dict.contains(key) {
            return EvictOutcome::FailAbsent;
        }
        if self.key_is_held(dbid, key) || self.dbs[dbid].migrating.contains(key) {
            return EvictOutcome::FailHeld;
        }
        if let Some(shell) = self.dbs[dbid].evict.get(key) {
            return if shell.evicted {
                EvictOutcome::FailEvicted
            } else {
                EvictOutcome::FailSwapping
            };
        }
        let cid = self.evict_clients[dbid];
        self.client_mut(cid).argv = vec![Bytes::from_static(b"evict"), key.clone()];
        self.client_mut(cid).swap_cb = SwapCb::Unhold;
        let nswap = self.client_swap_swaps(cid, vec![SwapIntent::whole_key(key.clone())]);
        if nswap == 0 {
            EvictOutcome::SuccFreed
        } else {
            EvictOutcome::SuccSwapped
        }
    }

    /// Run the deferred eviction list of every database.
    pub fn evict_asap(&mut self) -> usize {
        let mut evicted = 0;
        for dbid in 0..self.dbs.len() {
            let mut pending: Vec<Key> = self.dbs[dbid].evict_asap.drain(..).collect();
            for key in pending.drain(..) {
                match self.db_evict(dbid, &key) {
                    EvictOutcome::FailHeld | EvictOutcome::FailSwapping => {
                        // Busy; try again next pass.
                        self.dbs[dbid].evict_asap.push_back(key);
                    }
                    EvictOutcome::SuccFreed | EvictOutcome::SuccSwapped => evicted += 1,
                    _ => {}
                }
            }
        }
        evicted
    }

    // ------------------------------------------------------ rate limit

    pub fn swap_rate_limit_state(&self) -> RlState {
        if self.swap.swap_memory < self.config.swap_memory_slowdown {
            RlState::No
        } else if self.swap.swap_memory < self.config.swap_memory_stop {
            RlState::Slow
        } else {
            RlState::Stop
        }
    }

    /// Record a read-deferral deadline on the client when swap memory runs
    /// hot. Returns the delay in ms.
    pub fn swap_rate_limit(&mut self, cid: u64) -> i64 {
        let delay = match self.swap_rate_limit_state() {
            RlState::No => 0,
            RlState::Slow => {
                let over = self.swap.swap_memory - self.config.swap_memory_slowdown;
                let span =
                    (self.config.swap_memory_stop - self.config.swap_memory_slowdown).max(1);
                let pct = over as f64 / span as f64;
                SWAP_RL_DELAY_SLOW
                    + (pct * (SWAP_RL_DELAY_STOP - SWAP_RL_DELAY_SLOW) as f64) as i64
            }
            RlState::Stop => SWAP_RL_DELAY_STOP,
        };
        if delay > 0 {
            self.client_mut(cid).swap_rl_until = self.mstime + delay;
            tracing::debug!(
                client = cid,
                swap_memory = self.swap.swap_memory,
                delay,
                "swap rate limit"
            );
        } else {
            self.client_mut(cid).swap_rl_until = 0;
        }
        delay
    }

    pub fn swaps_in_flight(&self) -> usize {
        self.swap.inflight.len()
    }
}

/// Internal EVICT pseudo-command; reachable only from detached clients.
pub fn evict_command(srv: &mut Server, cid: u64) -> crate::types::ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let mut nevict = 0i64;
    for key in &argv[1..] {
        let outcome = srv.db_evict(dbid, key);
        tracing::info!(key = %String::from_utf8_lossy(key), outcome = outcome.as_str(), "evict");
        if matches!(outcome, EvictOutcome::SuccFreed | EvictOutcome::SuccSwapped) {
            nevict += 1;
        }
    }
    Ok(Reply::Int(nevict))
}

/// Internal RKSDEL pseudo-command body; the interesting work happens in
/// the swap analysis its dispatch triggers.
pub fn rksdel_command(_srv: &mut Server, _cid: u64) -> crate::types::ServerResult<Reply> {
    Ok(Reply::Ok)
}

/// Internal RKSGET pseudo-command body.
pub fn rksget_command(_srv: &mut Server, _cid: u64) -> crate::types::ServerResult<Reply> {
    Ok(Reply::Ok)
}
