//! Active expiration: the incremental, budgeted sweep of the expires maps,
//! plus the EXPIRE/TTL command family.

use crate::notify::NOTIFY_GENERIC;
use crate::resp::Reply;
use crate::server::Server;
use crate::types::{Key, ServerResult};
use crate::util::{parse_i64, ustime};

const KEYS_PER_LOOP: usize = 20;
const FAST_DURATION_US: i64 = 1000;
const SLOW_TIME_PERC: i64 = 25;
const ACCEPTABLE_STALE: i64 = 10;

/// pow(0.98, n) for n in 1..=16: the running-average weights applied when
/// the TTL stats are folded in batches of up to 16 iterations.
const AVG_TTL_FACTOR: [f64; 16] = [
    0.98, 0.9604, 0.941192, 0.922368, 0.903921, 0.885842, 0.868126, 0.850763, 0.833748, 0.817073,
    0.800731, 0.784717, 0.769022, 0.753642, 0.738569, 0.723798,
];

#[derive(Debug, Default)]
pub struct ExpireCycleState {
    current_db: usize,
    pub timelimit_exit: bool,
    last_fast_cycle_us: i64,
    /// EWMA of the stale-key percentage observed by past cycles.
    pub stale_perc: f64,
}

impl Server {
    /// One expiration pass. The slow flavor runs from cron at `hz`; the
    /// fast flavor runs from before-sleep with a 1ms-ish budget.
    pub fn active_expire_cycle(&mut self, fast: bool) {
        let effort = (self.config.active_expire_effort as i64 - 1).clamp(0, 9);
        let keys_per_loop = KEYS_PER_LOOP + KEYS_PER_LOOP / 4 * effort as usize;
        let fast_duration = FAST_DURATION_US + FAST_DURATION_US / 4 * effort;
        let slow_time_perc = SLOW_TIME_PERC + 2 * effort;
        let acceptable_stale = ACCEPTABLE_STALE - effort;

        let start = ustime();
        if fast {
            // Fast cycles only help when the last slow cycle ran out of
            // budget or staleness is piling up, and never back to back.
            if !self.expire_state.timelimit_exit
                && self.expire_state.stale_perc < acceptable_stale as f64
            {
                return;
            }
            if start < self.expire_state.last_fast_cycle_us + fast_duration * 2 {
                return;
            }
            self.expire_state.last_fast_cycle_us = start;
        }

        let mut dbs_per_call = 16.min(self.dbs.len());
        if self.expire_state.timelimit_exit {
            dbs_per_call = self.dbs.len();
        }

        let timelimit = if fast {
            fast_duration
        } else {
            (slow_time_perc * 1_000_000 / self.config.hz as i64 / 100).max(1)
        };
        self.expire_state.timelimit_exit = false;

        let mut total_sampled = 0usize;
        let mut total_expired = 0usize;
        let mut iteration = 0u64;

        let mut dbs_performed = 0;
        let mut visited = 0;
        while dbs_performed < dbs_per_call
            && !self.expire_state.timelimit_exit
            && visited < self.dbs.len()
        {
            let dbid = self.expire_state.current_db % self.dbs.len();
            // Advance immediately so a budget exit resumes at the next db.
            self.expire_state.current_db += 1;
            visited += 1;

            if self.dbs[dbid].expires.is_empty() {
                self.dbs[dbid].avg_ttl = 0;
                continue;
            }
            dbs_performed += 1;

            let mut ttl_sum: i64 = 0;
            let mut ttl_samples: usize = 0;
            let mut update_avg_ttl_times = 0usize;
            loop {
                iteration += 1;
                let now = self.mstime;
                let num = self.dbs[dbid].expires.len().min(keys_per_loop);

                // Sample buckets from the cursor; empty buckets are cheap
                // but still bounded at 20x the target.
                let mut sampled_keys: Vec<(Key, i64)> = Vec::with_capacity(num);
                let max_buckets = num * 20;
                let mut checked_buckets = 0;
                let mut db_done = false;
                while sampled_keys.len() < num && checked_buckets < max_buckets {
                    let cursor = self.dbs[dbid].expires_cursor;
                    let next = self.dbs[dbid].expires.scan(cursor, |k, &at| {
                        sampled_keys.push((k.clone(), at));
                    });
                    self.dbs[dbid].expires_cursor = next;
                    checked_buckets += 1;
                    if next == 0 {
                        db_done = true;
                        break;
                    }
                }

                let mut sampled = 0usize;
                let mut expired = 0usize;
                let prev_ttl_samples = ttl_samples;
                // A backward wall-clock jump forces sampled deadlines due,
                // like the reactor does with its timers, so scheduled
                // expiration is never delayed indefinitely.
                let skewed = self.clock_skewed;
                for (key, at) in sampled_keys {
                    sampled += 1;
                    let ttl = at - now;
                    if ttl <= 0 || skewed {
                        if self.dbs[dbid].expires.contains(&key) {
                            self.db_expire(dbid, &key);
                            expired += 1;
                        }
                    } else {
                        ttl_sum += ttl;
                        ttl_samples += 1;
                    }
                }
                total_sampled += sampled;
                total_expired += expired;
                if ttl_samples > prev_ttl_samples {
                    update_avg_ttl_times += 1;
                }

                let repeat = !db_done
                    && sampled > 0
                    && (expired * 100 / sampled) as i64 > acceptable_stale;

                if iteration & 0xf == 0 || !repeat {
                    if ttl_samples > 0 {
                        let avg_ttl = ttl_sum / ttl_samples as i64;
                        let db = &mut self.dbs[dbid];
                        if db.avg_ttl == 0 {
                            db.avg_ttl = avg_ttl;
                        } else {
                            let n = update_avg_ttl_times.clamp(1, 16);
                            db.avg_ttl = avg_ttl
                                + ((db.avg_ttl - avg_ttl) as f64 * AVG_TTL_FACTOR[n - 1]) as i64;
                        }
                        update_avg_ttl_times = 0;
                        ttl_sum = 0;
                        ttl_samples = 0;
                    }
                    if iteration & 0xf == 0 && ustime() - start > timelimit {
                        self.expire_state.timelimit_exit = true;
                        self.stat_expired_time_cap_reached += 1;
                        break;
                    }
                }
                if !repeat {
                    break;
                }
            }
        }

        if total_sampled > 0 {
            let current = (total_expired * 100) as f64 / total_sampled as f64;
            self.expire_state.stale_perc =
                current * 0.05 + self.expire_state.stale_perc * 0.95;
        }
    }

    /// Writable replicas expire the keys they created locally instead of
    /// waiting for a master DEL that will never come.
    pub fn remember_replica_key_with_expire(&mut self, dbid: usize, key: &Key) {
        if !self.replica_mode {
            return;
        }
        let entry = self.slave_keys_with_expire.entry(key.clone()).or_insert(0);
        *entry |= 1 << dbid.min(63);
    }

    pub fn expire_replica_tracked_keys(&mut self) {
        if self.slave_keys_with_expire.is_empty() {
            return;
        }
        let now = self.mstime;
        let snapshot: Vec<(Key, u64)> =
            self.slave_keys_with_expire.iter().map(|(k, &bits)| (k.clone(), bits)).collect();
        for (key, bits) in snapshot {
            let mut remaining = bits;
            for dbid in 0..self.dbs.len().min(64) {
                if bits & (1 << dbid) == 0 {
                    continue;
                }
                match self.dbs[dbid].get_expire(&key) {
                    Some(at) if at <= now => {
                        self.db_expire(dbid, &key);
                        remaining &= !(1 << dbid);
                    }
                    Some(_) => {}
                    None => remaining &= !(1 << dbid),
                }
            }
            if remaining == 0 {
                self.slave_keys_with_expire.remove(&key);
            } else {
                self.slave_keys_with_expire.insert(key, remaining);
            }
        }
    }
}

// ---------------------------------------------------------------- commands

#[derive(Debug, Clone, Copy)]
enum ExpireUnit {
    Seconds,
    Millis,
}

fn expire_generic(
    srv: &mut Server,
    cid: u64,
    unit: ExpireUnit,
    absolute: bool,
) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let n = parse_i64(&argv[2])?;

    let ms = match unit {
        ExpireUnit::Seconds => n.saturating_mul(1000),
        ExpireUnit::Millis => n,
    };
    let when = if absolute { ms } else { srv.mstime.saturating_add(ms) };

    srv.expire_if_needed(dbid, &key);
    if !srv.dbs[dbid].key_present(&key) {
        return Ok(Reply::Int(0));
    }

    // A deadline already in the past still goes through the expires map,
    // so the key dies exactly once through the expire path (lazy access or
    // the next active cycle) with a single `expired` notification.
    srv.dbs[dbid].set_expire(key.clone(), when);
    srv.remember_replica_key_with_expire(dbid, &key);
    srv.signal_modified(dbid, &key);
    srv.notify_keyspace_event(NOTIFY_GENERIC, "expire", &key, dbid);
    Ok(Reply::Int(1))
}

pub fn expire_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    expire_generic(srv, cid, ExpireUnit::Seconds, false)
}

pub fn pexpire_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    expire_generic(srv, cid, ExpireUnit::Millis, false)
}

pub fn expireat_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    expire_generic(srv, cid, ExpireUnit::Seconds, true)
}

pub fn pexpireat_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    expire_generic(srv, cid, ExpireUnit::Millis, true)
}

fn ttl_generic(srv: &mut Server, cid: u64, in_seconds: bool) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    srv.expire_if_needed(dbid, &key);
    if !srv.dbs[dbid].key_present(&key) {
        return Ok(Reply::Int(-2));
    }
    let Some(at) = srv.dbs[dbid].get_expire(&key) else {
        return Ok(Reply::Int(-1));
    };
    let remaining = (at - srv.mstime).max(0);
    Ok(Reply::Int(if in_seconds { (remaining + 999) / 1000 } else { remaining }))
}

pub fn ttl_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    ttl_generic(srv, cid, true)
}

pub fn pttl_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    ttl_generic(srv, cid, false)
}

pub fn persist_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    srv.expire_if_needed(dbid, &key);
    if !srv.dbs[dbid].key_present(&key) {
        return Ok(Reply::Int(0));
    }
    if srv.dbs[dbid].remove_expire(&key) {
        srv.signal_modified(dbid, &key);
        srv.notify_keyspace_event(NOTIFY_GENERIC, "persist", &key, dbid);
        Ok(Reply::Int(1))
    } else {
        Ok(Reply::Int(0))
    }
}
