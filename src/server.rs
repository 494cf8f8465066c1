//! The server: global state, client lifecycle, the event handlers wired
//! into the reactor, and cron.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Interest, Registry, Token, Waker};
use rand::Rng;

use crate::acl::{self, Acl};
use crate::command;
use crate::config::{Config, MaxmemoryPolicy};
use crate::connection::{Client, HoldMode};
use crate::db::Db;
use crate::expire::ExpireCycleState;
use crate::migrate::MigrateThread;
use crate::pubsub::PubSub;
use crate::reactor::{Reactor, Readiness, TimerAction};
use crate::repl::ReplState;
use crate::resp::Reply;
use crate::slowlog::BoundedLog;
use crate::swap::{EvictOutcome, SwapState};
use crate::swap_io::SwapPipes;
use crate::tracking::Tracking;
use crate::types::Key;
use crate::util::mstime;

const LISTENER_TOKEN: Token = Token(0);
pub const WAKER_TOKEN: Token = Token(1);
/// Client ids start here so they never collide with the fixed tokens.
const CLIENT_TOKEN_BASE: usize = 16;

/// Keys examined per eviction sampling round.
const EVICTION_SAMPLES: usize = 5;
/// Eviction attempts per cron tick, so a huge overshoot cannot stall the
/// loop.
const EVICTION_ATTEMPTS_PER_CALL: usize = 64;

pub struct Server {
    pub config: Config,
    pub dbs: Vec<Db>,
    clients: Vec<Option<Client>>,
    free_slots: Vec<usize>,
    connected_clients: usize,
    listener: Option<TcpListener>,

    pub acl: Acl,
    pub swap: SwapState,
    pub pipes: SwapPipes,
    pub migrate_thread: MigrateThread,
    pub repl: ReplState,
    pub pubsub: PubSub,
    pub tracking: Tracking,
    pub slowlog: BoundedLog,
    pub fatlog: BoundedLog,
    pub notify_flags: u32,
    pub expire_state: ExpireCycleState,
    pub slave_keys_with_expire: HashMap<Key, u64>,

    /// Per-db detached clients driving internal swap operations.
    pub evict_clients: Vec<u64>,
    pub rksdel_clients: Vec<u64>,
    pub rksget_clients: Vec<u64>,

    /// Cached wall clock in ms, refreshed once per loop pass.
    pub mstime: i64,
    pub dirty: u64,
    pub stat_commands: u64,
    pub stat_expired: u64,
    pub stat_expired_time_cap_reached: u64,
    pub stat_connections_received: u64,
    pub stat_connections_rejected: u64,

    pub in_swap_cb: bool,
    /// A background save is running (keys swap back out asap after use).
    pub active_child: bool,
    pub replica_mode: bool,
    pub current_client: Option<u64>,
    /// The wall clock moved backward since the last cron tick; expiration
    /// treats sampled deadlines as due for this tick.
    pub clock_skewed: bool,

    /// Clients whose reads were deferred by swap back-pressure.
    rl_deferred: Vec<u64>,
}

impl Server {
    /// Build the server against the reactor's registry (the waker that the
    /// helper threads use must target the poll we will run).
    pub fn new(config: Config, registry: &Registry) -> io::Result<Self> {
        let waker = Arc::new(Waker::new(registry, WAKER_TOKEN)?);
        let pipes = SwapPipes::new(config.swap_pipes, waker.clone());
        let migrate_thread = MigrateThread::new(waker);

        let mut server = Server {
            dbs: (0..config.databases).map(Db::new).collect(),
            clients: Vec::new(),
            free_slots: Vec::new(),
            connected_clients: 0,
            listener: None,
            acl: Acl::new(),
            swap: SwapState::default(),
            pipes,
            migrate_thread,
            repl: ReplState::default(),
            pubsub: PubSub::default(),
            tracking: Tracking::new(config.tracking_table_max_keys),
            slowlog: BoundedLog::new(config.slowlog_log_slower_than, config.slowlog_max_len),
            fatlog: BoundedLog::new(config.fatlog_log_bigger_than, config.fatlog_max_len),
            notify_flags: config.notify_flags,
            expire_state: ExpireCycleState::default(),
            slave_keys_with_expire: HashMap::new(),
            evict_clients: Vec::new(),
            rksdel_clients: Vec::new(),
            rksget_clients: Vec::new(),
            mstime: mstime(),
            dirty: 0,
            stat_commands: 0,
            stat_expired: 0,
            stat_expired_time_cap_reached: 0,
            stat_connections_received: 0,
            stat_connections_rejected: 0,
            in_swap_cb: false,
            active_child: false,
            replica_mode: false,
            current_client: None,
            clock_skewed: false,
            rl_deferred: Vec::new(),
            config,
        };

        // Internal per-db clients for eviction, backing-store deletes and
        // expire materialization.
        for dbid in 0..server.dbs.len() {
            for list in ["evict", "rksdel", "rksget"] {
                let cid = server.create_detached_client();
                {
                    let c = server.client_mut(cid);
                    c.db = dbid;
                    c.hold_mode = HoldMode::Evict;
                }
                match list {
                    "evict" => server.evict_clients.push(cid),
                    "rksdel" => server.rksdel_clients.push(cid),
                    _ => server.rksget_clients.push(cid),
                }
            }
        }

        // Replica worker pool.
        for _ in 0..server.config.repl_workers {
            let cid = server.create_detached_client();
            server.client_mut(cid).hold_mode = HoldMode::Repl;
            server.repl.workers_free.push_back(cid);
        }

        if let Some(path) = server.config.acl_filename.clone() {
            match acl::load_acl_file(&mut server.acl, &path) {
                Ok(()) => tracing::info!(path = %path, "ACL file loaded"),
                Err(e) => tracing::warn!(path = %path, error = %e, "ACL file not loaded"),
            }
        }

        Ok(server)
    }

    // ------------------------------------------------- client accessors

    pub fn client(&self, cid: u64) -> &Client {
        self.clients[cid as usize].as_ref().expect("live client")
    }

    pub fn client_mut(&mut self, cid: u64) -> &mut Client {
        self.clients[cid as usize].as_mut().expect("live client")
    }

    pub fn client_exists(&self, cid: u64) -> bool {
        self.clients.get(cid as usize).map_or(false, |c| c.is_some())
    }

    pub fn existing_client(&self, cid: u64) -> Option<u64> {
        self.client_exists(cid).then_some(cid)
    }

    pub fn argv(&self, cid: u64) -> Vec<Bytes> {
        self.client(cid).argv.clone()
    }

    pub fn create_detached_client(&mut self) -> u64 {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.clients.push(None);
                self.clients.len() - 1
            }
        };
        self.clients[slot] = Some(Client::detached(slot as u64));
        slot as u64
    }

    /// Detached client that keeps its replies around; used by tests and
    /// introspection.
    pub fn create_mock_client(&mut self) -> u64 {
        let cid = self.create_detached_client();
        self.client_mut(cid).capture_replies = true;
        cid
    }

    pub fn push_reply_to(&mut self, cid: u64, reply: &Reply) {
        if self.client_exists(cid) {
            self.client_mut(cid).add_reply(reply);
        }
    }

    /// Run one command on a client exactly as dispatch would; returns
    /// false when the client suspended.
    pub fn execute(&mut self, cid: u64, argv: Vec<Bytes>) -> bool {
        self.client_mut(cid).argv = argv;
        command::process_command(self, cid)
    }

    // -------------------------------------------------------- lifecycle

    /// Tear a client down, or defer if swaps for it are still in flight.
    pub fn free_client(&mut self, cid: u64) {
        if !self.client_exists(cid) {
            return;
        }
        if self.client(cid).is_master {
            self.repl_client_gone(cid);
        }
        self.pubsub.drop_client(cid);
        self.tracking.drop_client(cid);
        // Close the socket now either way; the callbacks skip replies for
        // a defered-closing client but still apply keyspace effects.
        if let Some(conn) = self.client_mut(cid).conn.take() {
            drop(conn);
            self.connected_clients = self.connected_clients.saturating_sub(1);
        }
        if self.client(cid).swapping_count > 0 || self.client(cid).migrating {
            self.client_mut(cid).defered_closing = true;
            return;
        }
        self.free_client_final(cid);
    }

    pub fn free_client_final(&mut self, cid: u64) {
        if !self.client_exists(cid) {
            return;
        }
        self.pubsub.drop_client(cid);
        self.tracking.drop_client(cid);
        if let Some(conn) = self.client_mut(cid).conn.take() {
            drop(conn);
            self.connected_clients = self.connected_clients.saturating_sub(1);
        }
        self.clients[cid as usize] = None;
        self.free_slots.push(cid as usize);
    }

    // ------------------------------------------------- modification hooks

    /// Every keyspace write funnels through here: dirty accounting plus
    /// client-side-caching invalidation.
    pub fn signal_modified(&mut self, _dbid: usize, key: &Key) {
        self.dirty += 1;
        let writer = self.current_client;
        self.tracking_invalidate(key, writer);
    }

    /// FLUSHDB/FLUSHALL: every tracked key is gone.
    pub fn tracking_invalidate_all(&mut self) {
        let keys: Vec<Key> = self.tracking.table.keys().cloned().collect();
        for key in keys {
            self.tracking_invalidate(&key, None);
        }
    }

    // ------------------------------------------------------ suspensions

    /// Resume a command that parked on the swap pipeline.
    pub fn continue_process_command(&mut self, cid: u64) {
        self.client_mut(cid).swapping = false;
        let io_error = self.client_mut(cid).swap_error.take();
        self.in_swap_cb = true;
        match io_error {
            Some(e) => self.push_reply_to(cid, &Reply::Error(e)),
            None => command::call_command(self, cid),
        }
        self.in_swap_cb = false;
        self.client_unhold_keys(cid);
        // Pipelined requests may already sit parsed in the input buffer.
        self.process_input_buffer(cid);
    }

    /// Resume a client that waited on the migrate helper thread.
    pub fn finish_suspended(&mut self, cid: u64, reply: Reply) {
        self.push_reply_to(cid, &reply);
        self.client_mut(cid).migrating = false;
        if self.client(cid).defered_closing && self.client(cid).swapping_count == 0 {
            self.free_client_final(cid);
            return;
        }
        self.process_input_buffer(cid);
    }

    // ------------------------------------------------------- event loop

    pub fn run(&mut self, reactor: &mut Reactor<Server>) -> io::Result<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad bind: {}", e)))?;
        let mut listener = TcpListener::bind(addr)?;
        reactor.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some(listener);
        tracing::info!(addr = %addr, "listening");

        let period = self.cron_period_ms();
        reactor.add_timer(
            period,
            Box::new(|srv: &mut Server| {
                srv.server_cron();
                TimerAction::Again(srv.cron_period_ms())
            }),
            None,
        );
        reactor.set_before_sleep(Box::new(|registry, srv: &mut Server| {
            srv.before_sleep(registry);
        }));
        reactor.set_after_sleep(Box::new(|_registry, srv: &mut Server| {
            srv.mstime = mstime();
        }));

        reactor.run(self, |r, srv, token, ready| srv.handle_event(r, token, ready))
    }

    pub fn cron_period_ms(&self) -> u64 {
        (1000 / self.config.hz.max(1) as u64).max(1)
    }

    fn handle_event(&mut self, reactor: &mut Reactor<Server>, token: Token, ready: Readiness) {
        match token {
            LISTENER_TOKEN => self.accept_clients(reactor.registry()),
            WAKER_TOKEN => self.drain_io(),
            Token(n) if n >= CLIENT_TOKEN_BASE => {
                let cid = (n - CLIENT_TOKEN_BASE) as u64;
                if !self.client_exists(cid) {
                    return;
                }
                // Reads before writes unless this connection's barrier flag
                // reverses the order (reply-flushed-before-read semantics).
                if self.client(cid).barrier {
                    if ready.writable {
                        self.handle_writable(reactor.registry(), cid);
                    }
                    if ready.readable && self.client_exists(cid) {
                        self.handle_readable(cid);
                    }
                } else {
                    if ready.readable {
                        self.handle_readable(cid);
                    }
                    if ready.writable && self.client_exists(cid) {
                        self.handle_writable(reactor.registry(), cid);
                    }
                }
            }
            _ => {}
        }
    }

    fn accept_clients(&mut self, registry: &Registry) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, addr)) => {
                    self.stat_connections_received += 1;
                    if self.connected_clients >= self.config.maxclients {
                        self.stat_connections_rejected += 1;
                        use std::io::Write;
                        let _ = stream.write(b"-ERR max number of clients reached\r\n");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let slot = match self.free_slots.pop() {
                        Some(slot) => slot,
                        None => {
                            self.clients.push(None);
                            self.clients.len() - 1
                        }
                    };
                    let token = Token(slot + CLIENT_TOKEN_BASE);
                    if registry.register(&mut stream, token, Interest::READABLE).is_err() {
                        self.free_slots.push(slot);
                        continue;
                    }
                    self.connected_clients += 1;
                    let mut client = Client::connected(slot as u64, stream, token, addr);
                    // Only a passwordless default user skips AUTH.
                    client.authenticated = self
                        .acl
                        .find_user("default")
                        .map_or(false, |u| u.enabled && u.nopass);
                    self.clients[slot] = Some(client);
                    tracing::debug!(client = slot, addr = %addr, "accepted");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, cid: u64) {
        if self.client(cid).rate_limited(self.mstime) {
            // Do not even read; the deferred list re-drives this client
            // once the deadline passes.
            if !self.rl_deferred.contains(&cid) {
                self.rl_deferred.push(cid);
            }
            return;
        }
        self.read_and_process(cid);
    }

    fn read_and_process(&mut self, cid: u64) {
        loop {
            match self.client_mut(cid).read_some() {
                Ok(0) => {
                    self.free_client(cid);
                    return;
                }
                Ok(_) => {
                    if self.client(cid).inbuf.len() >= 64 * 1024 {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(client = cid, error = %e, "read error");
                    self.free_client(cid);
                    return;
                }
            }
        }
        self.process_input_buffer(cid);
    }

    /// Parse and run requests until input runs dry or the head-of-line
    /// command suspends.
    pub fn process_input_buffer(&mut self, cid: u64) {
        loop {
            if !self.client_exists(cid) {
                return;
            }
            {
                let c = self.client(cid);
                if c.swapping || c.migrating || c.should_close || c.defered_closing {
                    return;
                }
            }
            let parsed = {
                let c = self.client_mut(cid);
                match c.parser.parse(&mut c.inbuf) {
                    Ok(Some(argv)) => argv,
                    Ok(None) => return,
                    Err(e) => {
                        c.should_close = true;
                        let reply = Reply::Error(e);
                        self.push_reply_to(cid, &reply);
                        return;
                    }
                }
            };
            if parsed.is_empty() {
                continue;
            }
            self.client_mut(cid).argv = parsed;
            if !command::process_command(self, cid) {
                return;
            }
        }
    }

    fn handle_writable(&mut self, registry: &Registry, cid: u64) {
        match self.client_mut(cid).write_pending() {
            Ok(true) => {
                if self.client(cid).should_close {
                    self.free_client(cid);
                } else {
                    self.set_write_interest(registry, cid, false);
                }
            }
            Ok(false) => self.set_write_interest(registry, cid, true),
            Err(e) => {
                tracing::debug!(client = cid, error = %e, "write error");
                self.free_client(cid);
            }
        }
    }

    fn set_write_interest(&mut self, registry: &Registry, cid: u64, on: bool) {
        let c = self.client_mut(cid);
        if c.write_interest == on {
            return;
        }
        let token = c.token;
        if let (Some(conn), Some(token)) = (c.conn.as_mut(), token) {
            let interest = if on {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if registry.reregister(conn, token, interest).is_ok() {
                c.write_interest = on;
            }
        }
    }

    /// Drain helper-thread completions (swap pipes and migrate jobs).
    pub fn drain_io(&mut self) {
        self.mstime = mstime();
        for completion in self.pipes.drain_completions() {
            self.swap_finished(completion);
        }
        for done in self.migrate_thread.drain_completions() {
            self.migrate_finished(done);
        }
    }

    /// Test/pump helper: block until no swap or migrate work is in flight.
    pub fn settle_io(&mut self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            self.drain_io();
            if self.swap.inflight.is_empty() && self.migrate_thread.outstanding() == 0 {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // -------------------------------------------------------------- cron

    fn before_sleep(&mut self, registry: &Registry) {
        self.mstime = mstime();
        self.drain_io();
        self.active_expire_cycle(true);
        self.evict_asap();
        self.tracking_flush_bcast();

        // Re-drive clients whose rate-limit deadline passed.
        if !self.rl_deferred.is_empty() {
            let now = self.mstime;
            let deferred = std::mem::take(&mut self.rl_deferred);
            for cid in deferred {
                if !self.client_exists(cid) {
                    continue;
                }
                if self.client(cid).rate_limited(now) {
                    self.rl_deferred.push(cid);
                } else {
                    self.read_and_process(cid);
                }
            }
        }

        // Flush pending replies; short writes arm write interest.
        let ids: Vec<u64> = self.live_client_ids();
        for cid in ids {
            if !self.client_exists(cid) {
                continue;
            }
            if self.client(cid).has_pending_output() {
                self.handle_writable(registry, cid);
            } else if self.client(cid).should_close && self.client(cid).conn.is_some() {
                self.free_client(cid);
            }
        }
    }

    fn live_client_ids(&self) -> Vec<u64> {
        self.clients
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i as u64))
            .collect()
    }

    pub fn server_cron(&mut self) {
        let now = mstime();
        self.clock_skewed = now < self.mstime;
        self.mstime = now;
        for db in &mut self.dbs {
            db.recompute_mem();
        }
        if self.replica_mode {
            self.expire_replica_tracked_keys();
        } else {
            self.active_expire_cycle(false);
        }
        self.evict_asap();
        self.perform_evictions();
        self.tracking_limit_used_slots();
        tracing::trace!(
            clients = self.connected_clients,
            swap_inflight = self.swap.inflight.len(),
            swap_memory = self.swap.swap_memory,
            "cron"
        );
    }

    // --------------------------------------------------------- maxmemory

    pub fn used_memory(&self) -> u64 {
        self.dbs.iter().map(|db| db.mem_used as u64).sum()
    }

    /// OOM gate for DENYOOM commands: try to evict first, then reject if
    /// still over budget with nothing we are allowed to push out.
    pub fn reject_on_oom(&mut self) -> bool {
        if self.config.maxmemory == 0 || self.used_memory() <= self.config.maxmemory {
            return false;
        }
        if self.config.maxmemory_policy == MaxmemoryPolicy::NoEviction {
            return true;
        }
        // Evictions are swap-outs whose memory frees asynchronously; the
        // write is allowed to proceed while they land.
        self.perform_evictions();
        false
    }

    /// Push values out to the backing store until under `maxmemory` or out
    /// of candidates/attempts. Swapped-out memory frees asynchronously, so
    /// the attempt bound matters.
    pub fn perform_evictions(&mut self) {
        if self.config.maxmemory == 0 || self.config.maxmemory_policy == MaxmemoryPolicy::NoEviction
        {
            return;
        }
        let mut attempts = 0;
        while self.used_memory() > self.config.maxmemory && attempts < EVICTION_ATTEMPTS_PER_CALL {
            attempts += 1;
            let Some((dbid, key)) = self.pick_eviction_candidate() else { break };
            match self.db_evict(dbid, &key) {
                EvictOutcome::SuccFreed | EvictOutcome::SuccSwapped => {}
                EvictOutcome::FailHeld => {
                    // Retry after the holding command finishes.
                    self.dbs[dbid].evict_asap.push_back(key);
                }
                _ => {}
            }
        }
    }

    fn pick_eviction_candidate(&mut self) -> Option<(usize, Key)> {
        let policy = self.config.maxmemory_policy;
        let mut rng = rand::thread_rng();
        // Find a database with evictable keys.
        let start = rng.gen_range(0..self.dbs.len());
        for off in 0..self.dbs.len() {
            let dbid = (start + off) % self.dbs.len();
            let db = &self.dbs[dbid];
            if db.dict.is_empty() {
                continue;
            }
            let volatile = policy.is_volatile();
            let mut best: Option<(Key, i64)> = None;
            for _ in 0..EVICTION_SAMPLES {
                let candidate = if volatile {
                    db.expires.random_entry(&mut rng).map(|(k, _)| k.clone())
                } else {
                    db.dict.random_entry(&mut rng).map(|(k, _)| k.clone())
                };
                let Some(key) = candidate else { break };
                if !db.dict.contains(&key) {
                    continue;
                }
                let rank = match policy {
                    MaxmemoryPolicy::AllkeysRandom | MaxmemoryPolicy::VolatileRandom => 0,
                    MaxmemoryPolicy::AllkeysLru | MaxmemoryPolicy::VolatileLru => {
                        db.dict.get(&key).map_or(i64::MAX, |o| o.lru)
                    }
                    MaxmemoryPolicy::VolatileTtl => db.get_expire(&key).unwrap_or(i64::MAX),
                    MaxmemoryPolicy::NoEviction => return None,
                };
                match &best {
                    Some((_, best_rank)) if *best_rank <= rank && rank != 0 => {}
                    _ => best = Some((key, rank)),
                }
                if rank == 0 {
                    // Random policies take the first hit.
                    break;
                }
            }
            if let Some((key, _)) = best {
                return Some((dbid, key));
            }
        }
        None
    }
}
