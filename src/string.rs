//! String commands: GET/SET and friends, plus the INCR family.

use bytes::Bytes;

use crate::notify::{NOTIFY_GENERIC, NOTIFY_KEY_MISS, NOTIFY_STRING};
use crate::resp::Reply;
use crate::server::Server;
use crate::types::{ErrorKind, Object, ServerError, ServerResult, StrVal, Value, ValueKind};
use crate::util::{parse_i64, stringmatch};

/// Read the string at `key`; `Ok(None)` on a miss (emitting the keymiss
/// notification), error on a non-string value.
fn read_string(srv: &mut Server, cid: u64, dbid: usize, key: &Bytes) -> ServerResult<Option<Bytes>> {
    srv.expire_if_needed(dbid, key);
    let now = srv.mstime;
    match srv.dbs[dbid].dict.get_mut(key) {
        Some(obj) => {
            obj.lru = now;
            match &obj.value {
                Value::Str(s) => {
                    let bytes = s.to_bytes();
                    srv.track_read(cid, key);
                    Ok(Some(bytes))
                }
                _ => Err(ServerError::wrong_type()),
            }
        }
        None => {
            srv.notify_keyspace_event(NOTIFY_KEY_MISS, "keymiss", key, dbid);
            Ok(None)
        }
    }
}

pub fn get_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    Ok(match read_string(srv, cid, dbid, &argv[1])? {
        Some(bytes) => Reply::Bulk(bytes),
        None => Reply::Nil,
    })
}

pub fn strlen_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    Ok(Reply::Int(
        read_string(srv, cid, dbid, &argv[1])?.map_or(0, |b| b.len() as i64),
    ))
}

pub fn set_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let value = argv[2].clone();

    let mut expire_at: Option<i64> = None;
    let (mut nx, mut xx, mut keepttl) = (false, false, false);
    let mut i = 3;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"NX" => nx = true,
            b"XX" => xx = true,
            b"KEEPTTL" => keepttl = true,
            b"EX" | b"PX" if i + 1 < argv.len() => {
                let n = parse_i64(&argv[i + 1])?;
                if n <= 0 {
                    return Err(ServerError::new(
                        ErrorKind::Generic,
                        "invalid expire time in 'set' command",
                    ));
                }
                let ms = if argv[i].eq_ignore_ascii_case(b"EX") { n.saturating_mul(1000) } else { n };
                expire_at = Some(srv.mstime + ms);
                i += 1;
            }
            _ => return Err(ServerError::syntax()),
        }
        i += 1;
    }
    if nx && xx {
        return Err(ServerError::syntax());
    }

    srv.expire_if_needed(dbid, &key);
    let exists = srv.dbs[dbid].key_present(&key);
    if (nx && exists) || (xx && !exists) {
        return Ok(Reply::Nil);
    }

    let now = srv.mstime;
    let old_ttl = srv.dbs[dbid].get_expire(&key);
    srv.dbs[dbid].remove_key(&key);
    srv.dbs[dbid].remove_cold(&key);
    srv.dbs[dbid].add(key.clone(), Object::new(Value::Str(StrVal::from_bytes(value)), now));
    match (expire_at, old_ttl) {
        (Some(at), _) => srv.dbs[dbid].set_expire(key.clone(), at),
        (None, Some(at)) if keepttl => srv.dbs[dbid].set_expire(key.clone(), at),
        _ => {}
    }
    srv.signal_modified(dbid, &key);
    srv.notify_keyspace_event(NOTIFY_STRING, "set", &key, dbid);
    Ok(Reply::Ok)
}

pub fn getset_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let old = read_string(srv, cid, dbid, &key)?;
    let now = srv.mstime;
    srv.dbs[dbid].remove_key(&key);
    srv.dbs[dbid].remove_cold(&key);
    srv.dbs[dbid].add(
        key.clone(),
        Object::new(Value::Str(StrVal::from_bytes(argv[2].clone())), now),
    );
    srv.signal_modified(dbid, &key);
    srv.notify_keyspace_event(NOTIFY_STRING, "set", &key, dbid);
    Ok(match old {
        Some(bytes) => Reply::Bulk(bytes),
        None => Reply::Nil,
    })
}

pub fn append_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    srv.expire_if_needed(dbid, &key);
    let now = srv.mstime;

    let len = match srv.dbs[dbid].dict.get_mut(&key) {
        Some(obj) => {
            let Value::Str(s) = &mut obj.value else {
                return Err(ServerError::wrong_type());
            };
            let mut joined = s.to_bytes().to_vec();
            joined.extend_from_slice(&argv[2]);
            let len = joined.len();
            *s = StrVal::Raw(Bytes::from(joined));
            obj.dirty = true;
            obj.lru = now;
            len
        }
        None => {
            let len = argv[2].len();
            srv.dbs[dbid].add(
                key.clone(),
                Object::new(Value::Str(StrVal::from_bytes(argv[2].clone())), now),
            );
            len
        }
    };
    srv.signal_modified(dbid, &key);
    srv.notify_keyspace_event(NOTIFY_STRING, "append", &key, dbid);
    Ok(Reply::Int(len as i64))
}

fn incr_generic(srv: &mut Server, cid: u64, delta: i64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    srv.expire_if_needed(dbid, &key);
    let now = srv.mstime;

    let current = match srv.dbs[dbid].dict.get(&key) {
        Some(obj) => match &obj.value {
            Value::Str(StrVal::Int(n)) => *n,
            Value::Str(StrVal::Raw(raw)) => parse_i64(raw)?,
            _ => return Err(ServerError::wrong_type()),
        },
        None => 0,
    };
    let next = current.checked_add(delta).ok_or_else(|| {
        ServerError::new(ErrorKind::Generic, "increment or decrement would overflow")
    })?;

    match srv.dbs[dbid].dict.get_mut(&key) {
        Some(obj) => {
            obj.value = Value::Str(StrVal::Int(next));
            obj.dirty = true;
            obj.lru = now;
        }
        None => {
            srv.dbs[dbid].add(key.clone(), Object::new(Value::Str(StrVal::Int(next)), now));
        }
    }
    srv.signal_modified(dbid, &key);
    srv.notify_keyspace_event(NOTIFY_STRING, if delta >= 0 { "incrby" } else { "decrby" }, &key, dbid);
    Ok(Reply::Int(next))
}

pub fn incr_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    incr_generic(srv, cid, 1)
}

pub fn decr_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    incr_generic(srv, cid, -1)
}

pub fn incrby_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let delta = parse_i64(&argv[2])?;
    incr_generic(srv, cid, delta)
}

pub fn decrby_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let delta = parse_i64(&argv[2])?;
    incr_generic(srv, cid, delta.checked_neg().ok_or_else(|| {
        ServerError::new(ErrorKind::Generic, "decrement would overflow")
    })?)
}

pub fn echo_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    Ok(Reply::Bulk(argv[1].clone()))
}

pub fn ping_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    match argv.len() {
        1 => Ok(Reply::simple("PONG")),
        2 => Ok(Reply::Bulk(argv[1].clone())),
        _ => Err(ServerError::wrong_arity("ping")),
    }
}

/// `del`/`unlink`-style generic deletes live here with the strings since
/// they share the notification plumbing.
pub fn del_generic(srv: &mut Server, cid: u64, event: &str) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let mut removed = 0i64;
    for key in &argv[1..] {
        srv.expire_if_needed(dbid, key);
        if srv.db_delete_key(dbid, key) {
            removed += 1;
            srv.signal_modified(dbid, key);
            srv.notify_keyspace_event(NOTIFY_GENERIC, event, key, dbid);
        }
    }
    Ok(Reply::Int(removed))
}

pub fn del_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    del_generic(srv, cid, "del")
}

pub fn unlink_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    del_generic(srv, cid, "unlink")
}

pub fn exists_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let mut found = 0i64;
    for key in &argv[1..] {
        srv.expire_if_needed(dbid, key);
        if srv.dbs[dbid].key_present(key) {
            found += 1;
        }
    }
    Ok(Reply::Int(found))
}

pub fn type_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    srv.expire_if_needed(dbid, &argv[1]);
    Ok(match srv.dbs[dbid].kind_of(&argv[1]) {
        Some(kind) => Reply::simple(kind.type_name()),
        None => Reply::simple("none"),
    })
}

/// SCAN cursor [MATCH pat] [COUNT n] [TYPE t]
pub fn scan_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let cursor = std::str::from_utf8(&argv[1])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ServerError::new(
            ErrorKind::Generic,
            "invalid cursor",
        ))?;

    let mut pattern: Option<Bytes> = None;
    let mut count = 10usize;
    let mut type_filter = None;
    let mut i = 2;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"MATCH" if i + 1 < argv.len() => {
                pattern = Some(argv[i + 1].clone());
                i += 2;
            }
            b"COUNT" if i + 1 < argv.len() => {
                let n = parse_i64(&argv[i + 1])?;
                if n < 1 {
                    return Err(ServerError::syntax());
                }
                count = n as usize;
                i += 2;
            }
            b"TYPE" if i + 1 < argv.len() => {
                let name = argv[i + 1].to_ascii_lowercase();
                type_filter = Some(match name.as_slice() {
                    b"string" => ValueKind::Str,
                    b"list" => ValueKind::List,
                    b"set" => ValueKind::Set,
                    b"zset" => ValueKind::ZSet,
                    b"hash" => ValueKind::Hash,
                    b"stream" => ValueKind::Stream,
                    _ => return Err(ServerError::syntax()),
                });
                i += 2;
            }
            _ => return Err(ServerError::syntax()),
        }
    }

    let now = srv.mstime;
    let mut keys = Vec::new();
    let mut cursor = cursor;
    // Walk buckets until we have roughly COUNT keys or wrap around.
    loop {
        cursor = srv.dbs[dbid].scan_step(cursor, &mut keys, type_filter, now);
        if cursor == 0 || keys.len() >= count {
            break;
        }
    }
    if let Some(pat) = &pattern {
        keys.retain(|k| stringmatch(pat, k));
    }

    Ok(Reply::Array(vec![
        Reply::bulk(cursor.to_string().into_bytes()),
        Reply::Array(keys.into_iter().map(Reply::Bulk).collect()),
    ]))
}
