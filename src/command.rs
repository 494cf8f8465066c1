//! The command table and the dispatch pipeline.
//!
//! Dispatch runs: lookup, arity, authentication, ACL, out-of-memory gate,
//! MULTI queueing, swap analysis, handler. A handler never blocks; when
//! swap analysis finds pending I/O the client suspends and the pipeline
//! resumes it later.

use std::collections::HashMap;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::acl::AclDenied;
use crate::resp::Reply;
use crate::server::Server;
use crate::swap::SwapIntent;
use crate::swap_io::SwapAction;
use crate::types::{ErrorKind, ServerError};
use crate::util::ustime;
use crate::{acl, bits, connection, expire, migrate, pubsub, slowlog, string, swap, zset};

pub type Handler = fn(&mut Server, u64) -> crate::types::ServerResult<Reply>;

pub mod flags {
    pub const WRITE: u32 = 1 << 0;
    pub const READONLY: u32 = 1 << 1;
    pub const DENYOOM: u32 = 1 << 2;
    pub const ADMIN: u32 = 1 << 3;
    pub const PUBSUB: u32 = 1 << 4;
    /// Runs before authentication (AUTH, HELLO).
    pub const NOAUTH: u32 = 1 << 5;
    pub const FAST: u32 = 1 << 6;
    /// Pipeline plumbing; never accepted from a network client.
    pub const INTERNAL: u32 = 1 << 7;
}

pub mod cat {
    pub const KEYSPACE: u32 = 1 << 0;
    pub const READ: u32 = 1 << 1;
    pub const WRITE: u32 = 1 << 2;
    pub const STRING: u32 = 1 << 3;
    pub const BITMAP: u32 = 1 << 4;
    pub const SORTEDSET: u32 = 1 << 5;
    pub const PUBSUB: u32 = 1 << 6;
    pub const ADMIN: u32 = 1 << 7;
    pub const FAST: u32 = 1 << 8;
    pub const SLOW: u32 = 1 << 9;
    pub const DANGEROUS: u32 = 1 << 10;
    pub const CONNECTION: u32 = 1 << 11;
    pub const TRANSACTION: u32 = 1 << 12;
}

/// Categories are presentational: ACL rules resolve them against command
/// flags at evaluation time.
pub const CATEGORIES: &[(&str, u32)] = &[
    ("keyspace", cat::KEYSPACE),
    ("read", cat::READ),
    ("write", cat::WRITE),
    ("string", cat::STRING),
    ("bitmap", cat::BITMAP),
    ("sortedset", cat::SORTEDSET),
    ("pubsub", cat::PUBSUB),
    ("admin", cat::ADMIN),
    ("fast", cat::FAST),
    ("slow", cat::SLOW),
    ("dangerous", cat::DANGEROUS),
    ("connection", cat::CONNECTION),
    ("transaction", cat::TRANSACTION),
];

pub fn category_flag(name: &str) -> Option<u32> {
    CATEGORIES.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

/// How dispatch finds the key arguments of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetKeys {
    None,
    /// first/last/step over argv.
    Range,
    /// destination + NUMKEYS-prefixed source list (ZUNIONSTORE shape).
    Store,
    /// MIGRATE: single key argument or trailing KEYS clause.
    Migrate,
}

/// Which swap intents dispatch generates before the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetSwaps {
    None,
    /// One whole-key intent per key argument.
    Keys,
    /// One global-scope intent (whole-database operations).
    Global,
}

pub struct CommandSpec {
    pub name: &'static str,
    pub handler: Handler,
    /// Exact when positive, minimum when negative.
    pub arity: i32,
    pub flags: u32,
    pub first_key: i32,
    pub last_key: i32,
    pub key_step: i32,
    pub getkeys: GetKeys,
    pub swap_action: SwapAction,
    pub getswaps: GetSwaps,
    pub categories: u32,
}

macro_rules! spec {
    ($name:literal, $handler:path, $arity:expr, $flags:expr,
     ($first:expr, $last:expr, $step:expr),
     $getkeys:expr, $action:expr, $getswaps:expr, $cats:expr) => {
        CommandSpec {
            name: $name,
            handler: $handler,
            arity: $arity,
            flags: $flags,
            first_key: $first,
            last_key: $last,
            key_step: $step,
            getkeys: $getkeys,
            swap_action: $action,
            getswaps: $getswaps,
            categories: $cats,
        }
    };
}

use self::flags::*;
use self::GetKeys as K;
use self::GetSwaps as S;
use crate::swap_io::SwapAction as A;

#[rustfmt::skip]
static COMMAND_LIST: &[CommandSpec] = &[
    // strings
    spec!("get", string::get_command, 2, READONLY | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::STRING | cat::FAST),
    spec!("set", string::set_command, -3, WRITE | DENYOOM, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::SLOW),
    spec!("getset", string::getset_command, 3, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::FAST),
    spec!("append", string::append_command, 3, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::FAST),
    spec!("strlen", string::strlen_command, 2, READONLY | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::STRING | cat::FAST),
    spec!("incr", string::incr_command, 2, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::FAST),
    spec!("decr", string::decr_command, 2, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::FAST),
    spec!("incrby", string::incrby_command, 3, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::FAST),
    spec!("decrby", string::decrby_command, 3, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::STRING | cat::FAST),
    // generic keyspace
    spec!("del", string::del_command, -2, WRITE, (1, -1, 1), K::Range, A::Del, S::Keys, cat::KEYSPACE | cat::WRITE | cat::SLOW),
    spec!("unlink", string::unlink_command, -2, WRITE | FAST, (1, -1, 1), K::Range, A::Del, S::Keys, cat::KEYSPACE | cat::WRITE | cat::FAST),
    spec!("exists", string::exists_command, -2, READONLY | FAST, (1, -1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::READ | cat::FAST),
    spec!("type", string::type_command, 2, READONLY | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::READ | cat::FAST),
    spec!("scan", string::scan_command, -2, READONLY, (0, 0, 0), K::None, A::Nop, S::None, cat::KEYSPACE | cat::READ | cat::SLOW),
    spec!("expire", expire::expire_command, 3, WRITE | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::WRITE | cat::FAST),
    spec!("pexpire", expire::pexpire_command, 3, WRITE | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::WRITE | cat::FAST),
    spec!("expireat", expire::expireat_command, 3, WRITE | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::WRITE | cat::FAST),
    spec!("pexpireat", expire::pexpireat_command, 3, WRITE | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::WRITE | cat::FAST),
    spec!("ttl", expire::ttl_command, 2, READONLY | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::READ | cat::FAST),
    spec!("pttl", expire::pttl_command, 2, READONLY | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::READ | cat::FAST),
    spec!("persist", expire::persist_command, 2, WRITE | FAST, (1, 1, 1), K::Range, A::Nop, S::None, cat::KEYSPACE | cat::WRITE | cat::FAST),
    spec!("dbsize", connection::dbsize_command, 1, READONLY | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::KEYSPACE | cat::READ | cat::FAST),
    spec!("flushdb", connection::flushdb_command, -1, WRITE, (0, 0, 0), K::None, A::Nop, S::Global, cat::KEYSPACE | cat::WRITE | cat::SLOW | cat::DANGEROUS),
    spec!("flushall", connection::flushall_command, -1, WRITE, (0, 0, 0), K::None, A::Nop, S::Global, cat::KEYSPACE | cat::WRITE | cat::SLOW | cat::DANGEROUS),
    // connection
    spec!("select", connection::select_command, 2, FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::CONNECTION | cat::FAST),
    spec!("auth", connection::auth_command, -2, NOAUTH | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::CONNECTION | cat::FAST),
    spec!("hello", connection::hello_command, -1, NOAUTH | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::CONNECTION | cat::FAST),
    spec!("ping", string::ping_command, -1, FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::CONNECTION | cat::FAST),
    spec!("echo", string::echo_command, 2, FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::CONNECTION | cat::FAST),
    spec!("client", connection::client_command, -2, (0), (0, 0, 0), K::None, A::Nop, S::None, cat::CONNECTION | cat::SLOW),
    // transactions
    spec!("multi", connection::multi_command, 1, FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::TRANSACTION | cat::FAST),
    spec!("exec", connection::exec_command, 1, (0), (0, 0, 0), K::None, A::Get, S::Keys, cat::TRANSACTION | cat::SLOW),
    spec!("discard", connection::discard_command, 1, FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::TRANSACTION | cat::FAST),
    // acl & logs
    spec!("acl", acl::acl_command, -2, ADMIN, (0, 0, 0), K::None, A::Nop, S::None, cat::ADMIN | cat::SLOW | cat::DANGEROUS),
    spec!("slowlog", slowlog::slowfatlog_command, -2, ADMIN, (0, 0, 0), K::None, A::Nop, S::None, cat::ADMIN | cat::SLOW),
    spec!("fatlog", slowlog::slowfatlog_command, -2, ADMIN, (0, 0, 0), K::None, A::Nop, S::None, cat::ADMIN | cat::SLOW),
    // pubsub
    spec!("subscribe", pubsub::subscribe_command, -2, PUBSUB | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::PUBSUB | cat::FAST),
    spec!("unsubscribe", pubsub::unsubscribe_command, -1, PUBSUB | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::PUBSUB | cat::FAST),
    spec!("psubscribe", pubsub::psubscribe_command, -2, PUBSUB | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::PUBSUB | cat::FAST),
    spec!("punsubscribe", pubsub::punsubscribe_command, -1, PUBSUB | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::PUBSUB | cat::FAST),
    spec!("publish", pubsub::publish_command, 3, PUBSUB | FAST, (0, 0, 0), K::None, A::Nop, S::None, cat::PUBSUB | cat::FAST),
    // bits
    spec!("bitcount", bits::bitcount_command, -2, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::BITMAP | cat::SLOW),
    spec!("bitpos", bits::bitpos_command, -3, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::BITMAP | cat::SLOW),
    spec!("getbit", bits::getbit_command, 3, READONLY | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::BITMAP | cat::FAST),
    spec!("setbit", bits::setbit_command, 4, WRITE | DENYOOM, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::BITMAP | cat::SLOW),
    spec!("bitop", bits::bitop_command, -4, WRITE | DENYOOM, (2, -1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::BITMAP | cat::SLOW),
    spec!("bitfield", bits::bitfield_command, -2, WRITE | DENYOOM, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::BITMAP | cat::SLOW),
    // sorted sets
    spec!("zadd", zset::zadd_command, -4, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::FAST),
    spec!("zincrby", zset::zincrby_command, 4, WRITE | DENYOOM | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::FAST),
    spec!("zscore", zset::zscore_command, 3, READONLY | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::FAST),
    spec!("zcard", zset::zcard_command, 2, READONLY | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::FAST),
    spec!("zrem", zset::zrem_command, -3, WRITE | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::FAST),
    spec!("zcount", zset::zcount_command, 4, READONLY | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::FAST),
    spec!("zrange", zset::zrange_command, -4, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::SLOW),
    spec!("zrevrange", zset::zrevrange_command, -4, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::SLOW),
    spec!("zrangebyscore", zset::zrangebyscore_command, -4, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::SLOW),
    spec!("zrevrangebyscore", zset::zrevrangebyscore_command, -4, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::SLOW),
    spec!("zrangebylex", zset::zrangebylex_command, -4, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::SLOW),
    spec!("zrevrangebylex", zset::zrevrangebylex_command, -4, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::READ | cat::SORTEDSET | cat::SLOW),
    spec!("zpopmin", zset::zpopmin_command, -2, WRITE | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::FAST),
    spec!("zpopmax", zset::zpopmax_command, -2, WRITE | FAST, (1, 1, 1), K::Range, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::FAST),
    spec!("zunionstore", zset::zunionstore_command, -4, WRITE | DENYOOM, (1, 1, 1), K::Store, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::SLOW),
    spec!("zinterstore", zset::zinterstore_command, -4, WRITE | DENYOOM, (1, 1, 1), K::Store, A::Get, S::Keys, cat::WRITE | cat::SORTEDSET | cat::SLOW),
    // migration
    spec!("migrate", migrate::migrate_command, -6, WRITE | ADMIN, (3, 3, 1), K::Migrate, A::Get, S::Keys, cat::KEYSPACE | cat::WRITE | cat::SLOW | cat::DANGEROUS),
    spec!("restore", migrate::restore_command, -4, WRITE | DENYOOM, (1, 1, 1), K::Range, A::Del, S::Keys, cat::KEYSPACE | cat::WRITE | cat::SLOW | cat::DANGEROUS),
    spec!("dump", migrate::dump_command, 2, READONLY, (1, 1, 1), K::Range, A::Get, S::Keys, cat::KEYSPACE | cat::READ | cat::SLOW),
    // internal swap plumbing; never received from clients
    spec!("evict", swap::evict_command, -2, WRITE | INTERNAL, (1, -1, 1), K::Range, A::Put, S::Keys, cat::KEYSPACE),
    spec!("rksget", swap::rksget_command, -2, READONLY | INTERNAL, (1, -1, 1), K::Range, A::Get, S::Keys, cat::KEYSPACE),
    spec!("rksdel", swap::rksdel_command, -2, WRITE | INTERNAL, (1, -1, 1), K::Range, A::Del, S::Keys, cat::KEYSPACE),
];

static COMMANDS: Lazy<HashMap<&'static str, &'static CommandSpec>> = Lazy::new(|| {
    COMMAND_LIST.iter().map(|spec| (spec.name, spec)).collect()
});

pub fn lookup_command(name: &[u8]) -> Option<&'static CommandSpec> {
    let lower = name.to_ascii_lowercase();
    COMMANDS.get(std::str::from_utf8(&lower).ok()?).copied()
}

pub fn all_commands() -> impl Iterator<Item = &'static CommandSpec> {
    COMMAND_LIST.iter()
}

fn arity_ok(arity: i32, argc: usize) -> bool {
    if arity >= 0 {
        argc == arity as usize
    } else {
        argc >= (-arity) as usize
    }
}

/// Key argv positions for ACL checks and swap intent generation.
pub fn command_key_positions(spec: &CommandSpec, argv: &[Bytes]) -> Vec<usize> {
    match spec.getkeys {
        GetKeys::None => Vec::new(),
        GetKeys::Range => {
            if spec.first_key <= 0 {
                return Vec::new();
            }
            let first = spec.first_key as usize;
            let last = if spec.last_key < 0 {
                (argv.len() as i32 + spec.last_key) as usize
            } else {
                spec.last_key as usize
            };
            let step = (spec.key_step.max(1)) as usize;
            let mut out = Vec::new();
            let mut i = first;
            while i <= last && i < argv.len() {
                out.push(i);
                i += step;
            }
            out
        }
        GetKeys::Store => {
            let mut out = vec![1];
            if let Some(n) = argv
                .get(2)
                .and_then(|a| std::str::from_utf8(a).ok())
                .and_then(|s| s.parse::<usize>().ok())
            {
                for i in 3..(3 + n).min(argv.len()) {
                    out.push(i);
                }
            }
            out
        }
        GetKeys::Migrate => {
            let mut out = Vec::new();
            if argv.len() > 3 && !argv[3].is_empty() {
                out.push(3);
            }
            if let Some(pos) = argv.iter().position(|a| a.eq_ignore_ascii_case(b"keys")) {
                for i in (pos + 1)..argv.len() {
                    out.push(i);
                }
            }
            out
        }
    }
}

/// Swap intents for the client's current command, per its getswaps policy.
pub fn get_swaps(srv: &Server, cid: u64) -> Vec<SwapIntent> {
    let argv = &srv.client(cid).argv;
    let Some(spec) = argv.first().and_then(|n| lookup_command(n)) else {
        return Vec::new();
    };
    match spec.getswaps {
        GetSwaps::None => Vec::new(),
        GetSwaps::Global => vec![SwapIntent::global()],
        GetSwaps::Keys => {
            // EXEC swaps for every key its queued commands touch.
            if spec.name == "exec" {
                let mut intents = Vec::new();
                let mut seen = std::collections::HashSet::new();
                if let Some(cmds) = &srv.client(cid).multi {
                    for cmd in cmds {
                        if let Some(inner) = cmd.first().and_then(|n| lookup_command(n)) {
                            for pos in command_key_positions(inner, cmd) {
                                if seen.insert(cmd[pos].clone()) {
                                    intents.push(SwapIntent::whole_key(cmd[pos].clone()));
                                }
                            }
                        }
                    }
                }
                return intents;
            }
            let mut seen = std::collections::HashSet::new();
            command_key_positions(spec, argv)
                .into_iter()
                .filter(|&pos| seen.insert(argv[pos].clone()))
                .map(|pos| SwapIntent::whole_key(argv[pos].clone()))
                .collect()
        }
    }
}

/// Full dispatch for one parsed request. Returns false when the client
/// suspended (swap or migrate) and input processing must stop.
pub fn process_command(srv: &mut Server, cid: u64) -> bool {
    let argv = srv.client(cid).argv.clone();
    if argv.is_empty() {
        return true;
    }

    if srv.client(cid).is_master {
        return matches!(srv.repl_dispatch(cid), crate::repl::ReplDispatch::Dispatched);
    }

    let Some(spec) = lookup_command(&argv[0]) else {
        flag_multi_error(srv, cid);
        srv.push_reply_to(cid, &Reply::Error(ServerError::unknown_command(&argv[0])));
        return true;
    };
    if spec.flags & flags::INTERNAL != 0 && srv.client(cid).conn.is_some() {
        flag_multi_error(srv, cid);
        srv.push_reply_to(cid, &Reply::Error(ServerError::unknown_command(&argv[0])));
        return true;
    }
    if !arity_ok(spec.arity, argv.len()) {
        flag_multi_error(srv, cid);
        srv.push_reply_to(cid, &Reply::Error(ServerError::wrong_arity(spec.name)));
        return true;
    }
    if !srv.client(cid).authenticated && spec.flags & flags::NOAUTH == 0 {
        srv.push_reply_to(
            cid,
            &Reply::Error(ServerError::new(ErrorKind::NoAuth, "Authentication required.")),
        );
        return true;
    }
    if let Err((reason, keypos)) = srv.acl_check(cid, spec, &argv) {
        srv.add_acl_log_entry(cid, reason, keypos);
        flag_multi_error(srv, cid);
        let detail = match reason {
            AclDenied::Cmd => format!(
                "this user has no permissions to run the '{}' command or its subcommand",
                spec.name
            ),
            _ => "this user has no permissions to access one of the keys used as arguments"
                .to_string(),
        };
        srv.push_reply_to(cid, &Reply::Error(ServerError::new(ErrorKind::NoPerm, detail)));
        return true;
    }
    if spec.flags & flags::DENYOOM != 0 && srv.reject_on_oom() {
        srv.push_reply_to(
            cid,
            &Reply::Error(ServerError::new(
                ErrorKind::OutOfMemory,
                "command not allowed when used memory > 'maxmemory'.",
            )),
        );
        return true;
    }

    // Inside MULTI everything but the transaction verbs queues up.
    if srv.client(cid).multi.is_some()
        && !matches!(spec.name, "multi" | "exec" | "discard")
    {
        srv.client_mut(cid).multi.as_mut().expect("in multi").push(argv);
        srv.push_reply_to(cid, &Reply::simple("QUEUED"));
        return true;
    }

    let nswaps = srv.dispatch_swap(cid);
    if nswaps > 0 {
        srv.client_mut(cid).swapping = true;
        return false;
    }

    call_command(srv, cid);
    !srv.client(cid).migrating && !srv.client(cid).should_close
}

fn flag_multi_error(srv: &mut Server, cid: u64) {
    if srv.client(cid).multi.is_some() {
        srv.client_mut(cid).multi_error = true;
    }
}

/// Invoke the handler plus the after-call work: reply, dirty counting is
/// handled by the handlers, slow/fat log sampling here.
pub fn call_command(srv: &mut Server, cid: u64) {
    let argv = srv.client(cid).argv.clone();
    let Some(spec) = argv.first().and_then(|n| lookup_command(n)) else {
        return;
    };
    let start = ustime();
    srv.client_mut(cid).reply_bytes = 0;

    let prev = srv.current_client.replace(cid);
    let reply = match (spec.handler)(srv, cid) {
        Ok(reply) => reply,
        Err(e) => Reply::Error(e),
    };
    srv.current_client = prev;
    srv.push_reply_to(cid, &reply);

    let duration = ustime() - start;
    let peer = srv.client(cid).peer_id();
    let cname = srv.client(cid).name.clone().unwrap_or_default();
    let now_s = srv.mstime / 1000;
    srv.slowlog.push_if_needed(&argv, duration, peer.clone(), cname.clone(), now_s);
    let reply_bytes = srv.client(cid).reply_bytes as i64;
    srv.fatlog.push_if_needed(&argv, reply_bytes, peer, cname, now_s);
    srv.stat_commands += 1;
}

/// Replica workers apply commands with no reply and no log sampling; the
/// ordering machinery already vetted them.
pub fn call_replicated(srv: &mut Server, wid: u64) {
    let argv = srv.client(wid).argv.clone();
    let Some(spec) = argv.first().and_then(|n| lookup_command(n)) else {
        return;
    };
    if !arity_ok(spec.arity, argv.len()) {
        return;
    }
    let prev = srv.current_client.replace(wid);
    if let Err(e) = (spec.handler)(srv, wid) {
        tracing::warn!(cmd = spec.name, error = %e, "replicated command failed");
    }
    srv.current_client = prev;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup_command(b"GET").is_some());
        assert!(lookup_command(b"get").is_some());
        assert!(lookup_command(b"GeT").is_some());
        assert!(lookup_command(b"nope").is_none());
    }

    #[test]
    fn arity_conventions() {
        assert!(arity_ok(2, 2));
        assert!(!arity_ok(2, 3));
        assert!(arity_ok(-2, 2));
        assert!(arity_ok(-2, 7));
        assert!(!arity_ok(-2, 1));
    }

    #[test]
    fn range_key_positions() {
        let spec = lookup_command(b"del").unwrap();
        let argv = vec![b("DEL"), b("a"), b("b"), b("c")];
        assert_eq!(command_key_positions(spec, &argv), vec![1, 2, 3]);
        let spec = lookup_command(b"get").unwrap();
        let argv = vec![b("GET"), b("k")];
        assert_eq!(command_key_positions(spec, &argv), vec![1]);
    }

    #[test]
    fn store_key_positions() {
        let spec = lookup_command(b"zunionstore").unwrap();
        let argv = vec![b("ZUNIONSTORE"), b("dest"), b("2"), b("a"), b("b"), b("WEIGHTS")];
        assert_eq!(command_key_positions(spec, &argv), vec![1, 3, 4]);
    }

    #[test]
    fn migrate_key_positions() {
        let spec = lookup_command(b"migrate").unwrap();
        let single = vec![b("MIGRATE"), b("h"), b("1"), b("k"), b("0"), b("100")];
        assert_eq!(command_key_positions(spec, &single), vec![3]);
        let multi = vec![
            b("MIGRATE"), b("h"), b("1"), b(""), b("0"), b("100"), b("KEYS"), b("x"), b("y"),
        ];
        assert_eq!(command_key_positions(spec, &multi), vec![7, 8]);
    }

    #[test]
    fn every_command_has_a_category() {
        for spec in all_commands() {
            assert!(spec.categories != 0, "{} lacks categories", spec.name);
        }
    }

    #[test]
    fn internal_commands_carry_the_flag() {
        for name in ["evict", "rksget", "rksdel"] {
            let spec = lookup_command(name.as_bytes()).unwrap();
            assert!(spec.flags & flags::INTERNAL != 0);
        }
    }
}
