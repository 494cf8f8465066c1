//! Per-client connection state: buffers, reply queue, authentication and
//! the swap-pipeline attachment points.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Token;

use crate::parser::RequestParser;
use crate::resp::{encode_reply, Reply};
use crate::types::Key;

/// How a client's held keys are released; mirrors who drives the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldMode {
    /// Normal command flow: unhold everything when the command finishes.
    Cmd,
    /// Internal eviction/expiration clients: unhold per-key on completion.
    Evict,
    /// Replica worker clients: unhold when the ordered executor retires the
    /// command.
    Repl,
}

/// What to do when one of this client's swaps completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapCb {
    /// Resume the suspended command when the last swap lands.
    Command,
    /// Replica worker: mark ready, then drain the ordered FIFO.
    ReplWorker,
    /// Just release the hold (internal eviction clients).
    Unhold,
    /// Release the hold, then delete the expired key and propagate.
    Expire,
}

/// Reply bytes read per read event; the reactor loops while the socket
/// stays readable.
const READ_CHUNK: usize = 16 * 1024;

pub struct Client {
    pub id: u64,
    /// Detached (internal or mock) clients have no socket.
    pub conn: Option<TcpStream>,
    pub token: Option<Token>,
    pub addr: Option<SocketAddr>,
    pub name: Option<Bytes>,

    pub db: usize,
    pub user: String,
    pub authenticated: bool,
    pub protover: u8,

    pub inbuf: BytesMut,
    pub parser: RequestParser,
    /// Outbound reply chunks plus the write offset into the front chunk.
    pub out: VecDeque<Bytes>,
    pub out_pos: usize,
    /// Running total queued this command, sampled by the fat log.
    pub reply_bytes: usize,
    pub argv: Vec<Bytes>,

    /// Write-before-read ordering for this connection's events.
    pub barrier: bool,
    pub write_interest: bool,
    pub should_close: bool,
    /// Keep encoded replies even without a socket (mock clients).
    pub capture_replies: bool,

    // ---- swap pipeline ----
    pub swapping_count: u32,
    pub swap_cb: SwapCb,
    pub swapping: bool,
    pub defered_closing: bool,
    pub swap_error: Option<crate::types::ServerError>,
    pub swap_rl_until: i64,
    pub hold_mode: HoldMode,
    pub hold_keys: HashMap<Key, u32>,
    /// Awaiting a migrate job completion (not a swap, but suspends the
    /// same way).
    pub migrating: bool,

    // ---- replication ----
    pub is_master: bool,
    pub repl_client: Option<u64>,
    pub repl_swapping: bool,
    pub repl_cmd_discarded: bool,

    // ---- transactions ----
    pub multi: Option<Vec<Vec<Bytes>>>,
    pub multi_error: bool,

    // ---- pubsub / tracking ----
    pub sub_channels: HashSet<Bytes>,
    pub sub_patterns: HashSet<Bytes>,
    pub tracking: bool,
    pub tracking_bcast: bool,
    pub tracking_noloop: bool,
    pub tracking_prefixes: Vec<Bytes>,
}

impl Client {
    pub fn detached(id: u64) -> Self {
        Client {
            id,
            conn: None,
            token: None,
            addr: None,
            name: None,
            db: 0,
            user: "default".to_string(),
            authenticated: true,
            protover: 2,
            inbuf: BytesMut::new(),
            parser: RequestParser::new(),
            out: VecDeque::new(),
            out_pos: 0,
            reply_bytes: 0,
            argv: Vec::new(),
            barrier: false,
            write_interest: false,
            should_close: false,
            capture_replies: false,
            swapping_count: 0,
            swap_cb: SwapCb::Command,
            swapping: false,
            defered_closing: false,
            swap_error: None,
            swap_rl_until: 0,
            hold_mode: HoldMode::Cmd,
            hold_keys: HashMap::new(),
            migrating: false,
            is_master: false,
            repl_client: None,
            repl_swapping: false,
            repl_cmd_discarded: false,
            multi: None,
            multi_error: false,
            sub_channels: HashSet::new(),
            sub_patterns: HashSet::new(),
            tracking: false,
            tracking_bcast: false,
            tracking_noloop: false,
            tracking_prefixes: Vec::new(),
        }
    }

    pub fn connected(id: u64, conn: TcpStream, token: Token, addr: SocketAddr) -> Self {
        let mut c = Client::detached(id);
        c.conn = Some(conn);
        c.token = Some(token);
        c.addr = Some(addr);
        c
    }

    pub fn peer_id(&self) -> String {
        match self.addr {
            Some(addr) => addr.to_string(),
            None => format!("internal:{}", self.id),
        }
    }

    /// Encode a reply onto the outbound queue. Detached clients discard
    /// replies (internal clients never read them).
    pub fn add_reply(&mut self, reply: &Reply) {
        if matches!(reply, Reply::None) {
            return;
        }
        let mut buf = BytesMut::new();
        encode_reply(&mut buf, reply, self.protover);
        self.reply_bytes += buf.len();
        if self.conn.is_some() || self.capture_replies {
            self.out.push_back(buf.freeze());
        }
    }

    /// Drain captured reply bytes (mock clients in tests).
    pub fn take_output(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in self.out.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.out_pos = 0;
        out
    }

    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Read once into the input buffer. `Ok(0)` means the peer closed.
    pub fn read_some(&mut self) -> io::Result<usize> {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(0),
        };
        let mut chunk = [0u8; READ_CHUNK];
        match conn.read(&mut chunk) {
            Ok(n) => {
                self.inbuf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }

    /// Flush queued reply chunks. Returns true once the queue is drained;
    /// false means the socket is full and write interest should stay on.
    pub fn write_pending(&mut self) -> io::Result<bool> {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => {
                self.out.clear();
                self.out_pos = 0;
                return Ok(true);
            }
        };
        while let Some(front) = self.out.front() {
            match conn.write(&front[self.out_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out_pos += n;
                    if self.out_pos >= front.len() {
                        self.out.pop_front();
                        self.out_pos = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Rate-limit check: reads for this client are deferred while the swap
    /// back-pressure deadline lies in the future.
    pub fn rate_limited(&self, now: i64) -> bool {
        self.swap_rl_until > 0 && self.swap_rl_until >= now
    }
}


// -------------------------------------------------- connection commands

use crate::server::Server;
use crate::types::{ErrorKind, ServerError, ServerResult};

pub fn select_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let index = crate::util::parse_i64(&argv[1])?;
    if index < 0 || index as usize >= srv.dbs.len() {
        return Err(ServerError::new(ErrorKind::Generic, "DB index is out of range"));
    }
    srv.client_mut(cid).db = index as usize;
    Ok(Reply::Ok)
}

pub fn dbsize_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let dbid = srv.client(cid).db;
    Ok(Reply::Int(srv.dbs[dbid].size() as i64))
}

/// FLUSHDB [ASYNC] -- only runs once the global swap queue let it through,
/// so every per-key queue is drained by now.
pub fn flushdb_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    if argv.len() > 2 || (argv.len() == 2 && !argv[1].eq_ignore_ascii_case(b"async")) {
        return Err(ServerError::syntax());
    }
    let dbid = srv.client(cid).db;
    let removed = srv.dbs[dbid].flush();
    srv.tracking_invalidate_all();
    srv.dirty += removed as u64;
    tracing::info!(db = dbid, removed, "flushdb");
    Ok(Reply::Ok)
}

pub fn flushall_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    if argv.len() > 2 || (argv.len() == 2 && !argv[1].eq_ignore_ascii_case(b"async")) {
        return Err(ServerError::syntax());
    }
    let mut removed = 0;
    for dbid in 0..srv.dbs.len() {
        removed += srv.dbs[dbid].flush();
    }
    srv.tracking_invalidate_all();
    srv.dirty += removed as u64;
    tracing::info!(removed, "flushall");
    Ok(Reply::Ok)
}

pub fn auth_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let (user, pass): (&[u8], &[u8]) = match argv.len() {
        2 => (b"default", &argv[1]),
        3 => (&argv[1], &argv[2]),
        _ => return Err(ServerError::wrong_arity("auth")),
    };
    srv.authenticate_client(cid, user, pass)?;
    Ok(Reply::Ok)
}

pub fn hello_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let mut protover = srv.client(cid).protover;
    let mut i = 1;
    if argv.len() > 1 {
        protover = match crate::util::parse_i64(&argv[1]) {
            Ok(2) => 2,
            Ok(3) => 3,
            _ => {
                return Err(ServerError::new(
                    ErrorKind::Generic,
                    "NOPROTO unsupported protocol version",
                ))
            }
        };
        i = 2;
    }
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"AUTH" if i + 2 < argv.len() => {
                let user = argv[i + 1].clone();
                let pass = argv[i + 2].clone();
                srv.authenticate_client(cid, &user, &pass)?;
                i += 3;
            }
            b"SETNAME" if i + 1 < argv.len() => {
                srv.client_mut(cid).name = Some(argv[i + 1].clone());
                i += 2;
            }
            _ => return Err(ServerError::syntax()),
        }
    }
    if !srv.client(cid).authenticated {
        return Err(ServerError::new(ErrorKind::NoAuth, "HELLO must be called with the client already authenticated, otherwise the HELLO AUTH <user> <pass> option can be used to authenticate the client and select the RESP protocol version at the same time"));
    }
    srv.client_mut(cid).protover = protover;
    Ok(Reply::Map(vec![
        (Reply::bulk(&b"server"[..]), Reply::bulk(&b"riptide"[..])),
        (
            Reply::bulk(&b"version"[..]),
            Reply::bulk(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
        ),
        (Reply::bulk(&b"proto"[..]), Reply::Int(protover as i64)),
        (Reply::bulk(&b"id"[..]), Reply::Int(cid as i64)),
        (Reply::bulk(&b"mode"[..]), Reply::bulk(&b"standalone"[..])),
        (
            Reply::bulk(&b"role"[..]),
            Reply::bulk(if srv.replica_mode { &b"replica"[..] } else { &b"master"[..] }),
        ),
        (Reply::bulk(&b"modules"[..]), Reply::Array(vec![])),
    ]))
}

pub fn client_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    match argv[1].to_ascii_uppercase().as_slice() {
        b"ID" if argv.len() == 2 => Ok(Reply::Int(cid as i64)),
        b"GETNAME" if argv.len() == 2 => Ok(match &srv.client(cid).name {
            Some(name) => Reply::Bulk(name.clone()),
            None => Reply::bulk(&b""[..]),
        }),
        b"SETNAME" if argv.len() == 3 => {
            if argv[2].iter().any(|b| *b == b' ' || *b == b'\n') {
                return Err(ServerError::new(
                    ErrorKind::Generic,
                    "Client names cannot contain spaces, newlines or special characters.",
                ));
            }
            srv.client_mut(cid).name = Some(argv[2].clone());
            Ok(Reply::Ok)
        }
        b"TRACKING" => srv.client_tracking(cid, &argv),
        other => Err(ServerError::new(
            ErrorKind::Generic,
            format!(
                "Unknown subcommand or wrong number of arguments for '{}'",
                String::from_utf8_lossy(other)
            ),
        )),
    }
}

pub fn multi_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    if srv.client(cid).multi.is_some() {
        return Err(ServerError::new(ErrorKind::Generic, "MULTI calls can not be nested"));
    }
    let c = srv.client_mut(cid);
    c.multi = Some(Vec::new());
    c.multi_error = false;
    Ok(Reply::Ok)
}

pub fn discard_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    if srv.client_mut(cid).multi.take().is_none() {
        return Err(ServerError::new(ErrorKind::Generic, "DISCARD without MULTI"));
    }
    srv.client_mut(cid).multi_error = false;
    Ok(Reply::Ok)
}

/// EXEC runs the queued commands back to back; dispatch already swapped in
/// every key the batch touches.
pub fn exec_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let Some(cmds) = srv.client_mut(cid).multi.take() else {
        return Err(ServerError::new(ErrorKind::Generic, "EXEC without MULTI"));
    };
    if std::mem::take(&mut srv.client_mut(cid).multi_error) {
        return Err(ServerError::new(
            ErrorKind::Generic,
            "EXECABORT Transaction discarded because of previous errors.",
        ));
    }
    let mut results = Vec::with_capacity(cmds.len());
    for cmd in cmds {
        srv.client_mut(cid).argv = cmd.clone();
        let reply = match cmd.first().and_then(|n| crate::command::lookup_command(n)) {
            Some(spec) => match (spec.handler)(srv, cid) {
                Ok(reply) => reply,
                Err(e) => Reply::Error(e),
            },
            None => Reply::Error(crate::types::ServerError::unknown_command(
                cmd.first().map(|b| &b[..]).unwrap_or(b""),
            )),
        };
        results.push(reply);
    }
    Ok(Reply::Array(results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_clients_swallow_replies() {
        let mut c = Client::detached(1);
        c.add_reply(&Reply::Ok);
        assert!(!c.has_pending_output());
        assert_eq!(c.reply_bytes, 5);
        assert!(c.write_pending().unwrap());
    }

    #[test]
    fn rate_limit_window() {
        let mut c = Client::detached(1);
        assert!(!c.rate_limited(100));
        c.swap_rl_until = 110;
        assert!(c.rate_limited(100));
        assert!(c.rate_limited(110));
        assert!(!c.rate_limited(111));
    }
}
