//! Key migration: MIGRATE/RESTORE and the helper thread that keeps their
//! blocking socket I/O and payload decoding off the reactor.
//!
//! The reactor pushes jobs under a mutex; the helper thread performs them
//! and signals completions back through the poll wakeup. A migrating
//! client suspends exactly like a swapping one and resumes when its job
//! completes.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use crc16::{State, XMODEM};

use crate::notify::NOTIFY_GENERIC;
use crate::resp::Reply;
use crate::server::Server;
use crate::swap::{decode_value, encode_value};
use crate::types::{ErrorKind, Key, Object, ServerError, ServerResult, Value};
use crate::util::parse_i64;

/// Serialized value plus a crc16 footer, the RESTORE payload format.
pub fn encode_payload(value: &Value) -> Bytes {
    let body = encode_value(value);
    let mut out = BytesMut::with_capacity(body.len() + 2);
    out.put_slice(&body);
    out.put_u16(State::<XMODEM>::calculate(&body));
    out.freeze()
}

/// Verify the checksum and decode; `None` for damaged payloads.
pub fn decode_payload(raw: &[u8]) -> Option<Value> {
    if raw.len() < 2 {
        return None;
    }
    let (body, footer) = raw.split_at(raw.len() - 2);
    let expect = u16::from_be_bytes([footer[0], footer[1]]);
    if State::<XMODEM>::calculate(body) != expect {
        return None;
    }
    decode_value(body)
}

#[derive(Debug)]
pub struct MigrateEntry {
    pub key: Key,
    /// Remaining ttl in ms, 0 for none.
    pub ttl_ms: i64,
    pub payload: Bytes,
}

#[derive(Debug)]
enum Job {
    Migrate {
        client: u64,
        host: String,
        port: u16,
        dest_db: usize,
        timeout_ms: u64,
        replace: bool,
        copy: bool,
        entries: Vec<MigrateEntry>,
    },
    Restore {
        client: u64,
        payload: Bytes,
    },
}

#[derive(Debug)]
pub enum MigrateDone {
    Migrate {
        client: u64,
        keys: Vec<Key>,
        copy: bool,
        result: Result<(), String>,
    },
    Restore {
        client: u64,
        value: Option<Box<Value>>,
    },
}

struct Shared {
    jobs: Mutex<Jobs>,
    cond: Condvar,
}

struct Jobs {
    migrate: VecDeque<Job>,
    restore: VecDeque<Job>,
    shutdown: bool,
}

pub struct MigrateThread {
    shared: Arc<Shared>,
    completions: Arc<Mutex<Vec<MigrateDone>>>,
    /// Jobs pushed but not yet drained as completions.
    outstanding: Arc<std::sync::atomic::AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl MigrateThread {
    pub fn new(waker: Arc<mio::Waker>) -> Self {
        let shared = Arc::new(Shared {
            jobs: Mutex::new(Jobs {
                migrate: VecDeque::new(),
                restore: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let completions: Arc<Mutex<Vec<MigrateDone>>> = Arc::new(Mutex::new(Vec::new()));
        let t_shared = shared.clone();
        let t_completions = completions.clone();
        let handle = std::thread::Builder::new()
            .name("migrate".to_string())
            .spawn(move || thread_main(t_shared, t_completions, waker))
            .expect("spawn migrate thread");
        MigrateThread {
            shared,
            completions,
            outstanding: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            handle: Some(handle),
        }
    }

    fn push(&self, job: Job) {
        self.outstanding.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut jobs = self.shared.jobs.lock().unwrap();
        match &job {
            Job::Migrate { .. } => jobs.migrate.push_back(job),
            Job::Restore { .. } => jobs.restore.push_back(job),
        }
        self.shared.cond.notify_one();
    }

    pub fn drain_completions(&self) -> Vec<MigrateDone> {
        let done = std::mem::take(&mut *self.completions.lock().unwrap());
        self.outstanding.fetch_sub(done.len(), std::sync::atomic::Ordering::SeqCst);
        done
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Drop for MigrateThread {
    fn drop(&mut self) {
        self.shared.jobs.lock().unwrap().shutdown = true;
        self.shared.cond.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn thread_main(shared: Arc<Shared>, completions: Arc<Mutex<Vec<MigrateDone>>>, waker: Arc<mio::Waker>) {
    loop {
        let job = {
            let mut jobs = shared.jobs.lock().unwrap();
            loop {
                if let Some(job) = jobs.migrate.pop_front() {
                    break job;
                }
                if let Some(job) = jobs.restore.pop_front() {
                    break job;
                }
                if jobs.shutdown {
                    return;
                }
                jobs = shared.cond.wait(jobs).unwrap();
            }
        };

        let done = match job {
            Job::Migrate { client, host, port, dest_db, timeout_ms, replace, copy, entries } => {
                let keys = entries.iter().map(|e| e.key.clone()).collect();
                let result =
                    run_migrate(&host, port, dest_db, timeout_ms, replace, &entries);
                MigrateDone::Migrate { client, keys, copy, result }
            }
            Job::Restore { client, payload } => MigrateDone::Restore {
                client,
                value: decode_payload(&payload).map(Box::new),
            },
        };
        completions.lock().unwrap().push(done);
        let _ = waker.wake();
    }
}

fn put_bulk(out: &mut BytesMut, arg: &[u8]) {
    out.put_u8(b'$');
    out.put_slice(itoa::Buffer::new().format(arg.len()).as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(arg);
    out.put_slice(b"\r\n");
}

fn encode_command(args: &[&[u8]]) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(b'*');
    out.put_slice(itoa::Buffer::new().format(args.len()).as_bytes());
    out.put_slice(b"\r\n");
    for arg in args {
        put_bulk(&mut out, arg);
    }
    out
}

/// Read one reply line; enough for the +OK / -ERR answers RESTORE gives.
fn read_reply_line(sock: &mut TcpStream) -> Result<String, String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match sock.read(&mut byte) {
            Ok(0) => return Err("connection closed by target instance".to_string()),
            Ok(_) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                line.push(byte[0]);
                if line.len() > 4096 {
                    return Err("oversized reply from target instance".to_string());
                }
            }
            Err(e) => return Err(format!("error or timeout reading from target instance: {}", e)),
        }
    }
}

fn run_migrate(
    host: &str,
    port: u16,
    dest_db: usize,
    timeout_ms: u64,
    replace: bool,
    entries: &[MigrateEntry],
) -> Result<(), String> {
    let timeout = Duration::from_millis(timeout_ms.max(1));
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("can't resolve target: {}", e))?
        .next()
        .ok_or_else(|| "can't resolve target".to_string())?;
    let mut sock = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| format!("error or timeout connecting to the target instance: {}", e))?;
    sock.set_read_timeout(Some(timeout)).map_err(|e| e.to_string())?;
    sock.set_write_timeout(Some(timeout)).map_err(|e| e.to_string())?;
    let _ = sock.set_nodelay(true);

    let db_arg = dest_db.to_string();
    let select = encode_command(&[b"SELECT", db_arg.as_bytes()]);
    sock.write_all(&select)
        .map_err(|e| format!("error or timeout writing to target instance: {}", e))?;
    let line = read_reply_line(&mut sock)?;
    if !line.starts_with('+') {
        return Err(format!("target answered SELECT with: {}", line));
    }

    for entry in entries {
        let ttl_arg = entry.ttl_ms.max(0).to_string();
        let mut args: Vec<&[u8]> =
            vec![b"RESTORE", &entry.key, ttl_arg.as_bytes(), &entry.payload];
        if replace {
            args.push(b"REPLACE");
        }
        let frame = encode_command(&args);
        sock.write_all(&frame)
            .map_err(|e| format!("error or timeout writing to target instance: {}", e))?;
        let line = read_reply_line(&mut sock)?;
        if !line.starts_with('+') {
            return Err(format!("target answered RESTORE with: {}", line));
        }
    }
    Ok(())
}

// -------------------------------------------------------------- commands

pub fn migrate_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let host = String::from_utf8_lossy(&argv[1]).into_owned();
    let port = parse_i64(&argv[2])? as u16;
    let dest_db = parse_i64(&argv[4])?;
    let timeout_ms = parse_i64(&argv[5])?.max(0) as u64;
    if !(0..64).contains(&dest_db) {
        return Err(ServerError::new(ErrorKind::Generic, "invalid destination database"));
    }

    let (mut copy, mut replace) = (false, false);
    let mut keys: Vec<Key> = Vec::new();
    let mut i = 6;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"COPY" => copy = true,
            b"REPLACE" => replace = true,
            b"KEYS" => {
                if !argv[3].is_empty() {
                    return Err(ServerError::new(
                        ErrorKind::Generic,
                        "When using MIGRATE KEYS option, the key argument must be set to the empty string",
                    ));
                }
                keys.extend(argv[i + 1..].iter().cloned());
                i = argv.len();
            }
            _ => return Err(ServerError::syntax()),
        }
        i += 1;
    }
    if keys.is_empty() {
        if argv[3].is_empty() {
            return Err(ServerError::syntax());
        }
        keys.push(argv[3].clone());
    }

    // Keys were materialized by the swap phase; encode whatever exists.
    let now = srv.mstime;
    let mut entries = Vec::new();
    for key in &keys {
        srv.expire_if_needed(dbid, key);
        let Some(obj) = srv.dbs[dbid].dict.get(key) else { continue };
        let ttl_ms = srv.dbs[dbid].get_expire(key).map_or(0, |at| (at - now).max(1));
        entries.push(MigrateEntry { key: key.clone(), ttl_ms, payload: encode_payload(&obj.value) });
    }
    if entries.is_empty() {
        return Ok(Reply::simple("NOKEY"));
    }
    for entry in &entries {
        srv.dbs[dbid].migrating.insert(entry.key.clone());
    }

    srv.client_mut(cid).migrating = true;
    let job = Job::Migrate {
        client: cid,
        host,
        port,
        dest_db: dest_db as usize,
        timeout_ms,
        replace,
        copy,
        entries,
    };
    srv.migrate_thread.push(job);
    // Reply comes from the completion handler.
    Ok(Reply::None)
}

pub fn restore_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let ttl = parse_i64(&argv[2])?;
    if ttl < 0 {
        return Err(ServerError::new(ErrorKind::Generic, "Invalid TTL value, must be >= 0"));
    }
    let replace = match argv.len() {
        4 => false,
        5 if argv[4].eq_ignore_ascii_case(b"replace") => true,
        _ => return Err(ServerError::syntax()),
    };

    srv.expire_if_needed(dbid, &key);
    if srv.dbs[dbid].key_present(&key) {
        if !replace {
            return Err(ServerError::new(
                ErrorKind::BusyKey,
                "Target key name already exists.",
            ));
        }
        srv.db_delete_key(dbid, &key);
    }

    // Payload decoding is CPU work; hand it to the helper thread. The ttl
    // is applied at completion from the stashed argv.
    srv.client_mut(cid).migrating = true;
    srv.migrate_thread.push(Job::Restore { client: cid, payload: argv[3].clone() });
    Ok(Reply::None)
}

pub fn dump_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    srv.expire_if_needed(dbid, &argv[1]);
    match srv.dbs[dbid].dict.get(&argv[1]) {
        Some(obj) => Ok(Reply::Bulk(encode_payload(&obj.value))),
        None => Ok(Reply::Nil),
    }
}

impl Server {
    /// Apply one helper-thread completion: finish the suspended client and
    /// the keyspace side effects.
    pub fn migrate_finished(&mut self, done: MigrateDone) {
        match done {
            MigrateDone::Migrate { client, keys, copy, result } => {
                let Some(cid) = self.existing_client(client) else { return };
                let dbid = self.client(cid).db;
                for key in &keys {
                    self.dbs[dbid].migrating.remove(key);
                }
                match result {
                    Ok(()) => {
                        if !copy {
                            for key in &keys {
                                if self.db_delete_key(dbid, key) {
                                    self.signal_modified(dbid, key);
                                    self.notify_keyspace_event(NOTIFY_GENERIC, "del", key, dbid);
                                }
                            }
                        }
                        self.finish_suspended(cid, Reply::Ok);
                    }
                    Err(e) => {
                        self.finish_suspended(
                            cid,
                            Reply::Error(ServerError::new(ErrorKind::Io, e)),
                        );
                    }
                }
            }
            MigrateDone::Restore { client, value } => {
                let Some(cid) = self.existing_client(client) else { return };
                let dbid = self.client(cid).db;
                let argv = self.client(cid).argv.clone();
                match value {
                    Some(value) if argv.len() >= 4 => {
                        let key = argv[1].clone();
                        let ttl = parse_i64(&argv[2]).unwrap_or(0);
                        let now = self.mstime;
                        self.dbs[dbid].add(key.clone(), Object::new(*value, now));
                        if ttl > 0 {
                            self.dbs[dbid].set_expire(key.clone(), now + ttl);
                        }
                        self.signal_modified(dbid, &key);
                        self.notify_keyspace_event(NOTIFY_GENERIC, "restore", &key, dbid);
                        self.finish_suspended(cid, Reply::Ok);
                    }
                    _ => {
                        self.finish_suspended(
                            cid,
                            Reply::Error(ServerError::new(
                                ErrorKind::Generic,
                                "Bad data format or checksum mismatch",
                            )),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrVal;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn payload_round_trip() {
        let value = Value::Str(StrVal::Raw(b("hello")));
        let payload = encode_payload(&value);
        assert_eq!(decode_payload(&payload), Some(value));
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let value = Value::Str(StrVal::Raw(b("hello")));
        let mut payload = encode_payload(&value).to_vec();
        let mid = payload.len() / 2;
        payload[mid] ^= 0x40;
        assert_eq!(decode_payload(&payload), None);
        assert_eq!(decode_payload(b""), None);
        assert_eq!(decode_payload(b"x"), None);
    }

    #[test]
    fn command_encoding_is_resp() {
        let frame = encode_command(&[b"SELECT", b"0"]);
        assert_eq!(&frame[..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n");
    }
}
