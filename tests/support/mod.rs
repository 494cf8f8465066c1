//! Shared harness for the integration tests: an in-process server driven
//! through mock clients, with helpers to pump background swap I/O.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;

use riptide::config::Config;
use riptide::reactor::Reactor;
use riptide::server::Server;

pub struct TestServer {
    pub server: Server,
    // Owns the poll the helper-thread waker targets.
    _reactor: Reactor<Server>,
}

pub fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn argv(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|p| b(p)).collect()
}

pub fn server() -> TestServer {
    server_with(Config::default())
}

pub fn server_with(config: Config) -> TestServer {
    let reactor: Reactor<Server> = Reactor::new().expect("reactor");
    let server = Server::new(config, reactor.registry()).expect("server");
    TestServer { server, _reactor: reactor }
}

impl TestServer {
    pub fn mock(&mut self) -> u64 {
        self.server.create_mock_client()
    }

    /// Run one command to completion (pumping swap I/O if it suspends) and
    /// return the raw reply bytes.
    pub fn run(&mut self, cid: u64, parts: &[&str]) -> Vec<u8> {
        let done = self.server.execute(cid, argv(parts));
        if !done {
            assert!(self.settle(), "swap I/O did not settle");
        }
        self.server.client_mut(cid).take_output()
    }

    /// Like `run` but with binary-safe arguments.
    pub fn run_raw(&mut self, cid: u64, parts: Vec<Bytes>) -> Vec<u8> {
        let done = self.server.execute(cid, parts);
        if !done {
            assert!(self.settle(), "swap I/O did not settle");
        }
        self.server.client_mut(cid).take_output()
    }

    pub fn settle(&mut self) -> bool {
        self.server.settle_io(Duration::from_secs(5))
    }

    /// Force a value out to the backing store and wait for it to land.
    pub fn evict_key(&mut self, dbid: usize, key: &str) {
        let outcome = self.server.db_evict(dbid, &b(key));
        assert!(
            matches!(
                outcome,
                riptide::swap::EvictOutcome::SuccSwapped | riptide::swap::EvictOutcome::SuccFreed
            ),
            "evict failed: {:?}",
            outcome
        );
        assert!(self.settle());
        assert!(self.server.dbs[dbid].evict.get(&b(key)[..]).map_or(false, |s| s.evicted));
        assert!(self.server.dbs[dbid].dict.get(&b(key)[..]).is_none());
    }
}

/// Assert the reply is exactly an integer frame `:n`.
pub fn assert_int(reply: &[u8], n: i64) {
    assert_eq!(
        String::from_utf8_lossy(reply),
        format!(":{}\r\n", n),
        "expected integer {}",
        n
    );
}

pub fn assert_ok(reply: &[u8]) {
    assert_eq!(&reply[..], b"+OK\r\n");
}

pub fn assert_nil(reply: &[u8]) {
    assert_eq!(&reply[..], b"$-1\r\n");
}

pub fn assert_bulk(reply: &[u8], value: &str) {
    assert_eq!(
        String::from_utf8_lossy(reply),
        format!("${}\r\n{}\r\n", value.len(), value)
    );
}

pub fn assert_error_tag(reply: &[u8], tag: &str) {
    let text = String::from_utf8_lossy(reply);
    assert!(
        text.starts_with(&format!("-{}", tag)),
        "expected -{} error, got {:?}",
        tag,
        text
    );
}
