//! End-to-end coverage of the swap pipeline: cold reads, per-key queueing,
//! hold semantics, back-pressure and the keyspace invariants.

mod support;

use support::*;

use riptide::config::Config;
use riptide::swap::EvictOutcome;
use riptide::swap_io::SwapAction;

fn get_stat(ts: &TestServer, action: SwapAction) -> (u64, u64) {
    let stat = ts.server.swap.stats[action.index()];
    (stat.started, stat.finished)
}

#[test]
fn cold_get_triggers_swap_and_materializes() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "hello"]));
    ts.evict_key(0, "a");

    let (started_before, _) = get_stat(&ts, SwapAction::Get);
    let reply = ts.run(c, &["GET", "a"]);
    assert_bulk(&reply, "hello");

    let (started, finished) = get_stat(&ts, SwapAction::Get);
    assert_eq!(started - started_before, 1);
    assert_eq!(finished, started);
    // Materialized: back in the primary map, no evicted shell left.
    assert!(ts.server.dbs[0].dict.get(b"a").is_some());
    assert!(ts.server.dbs[0].evict.get(b"a").is_none());
}

#[test]
fn dict_and_evict_stay_disjoint() {
    let mut ts = server();
    let c = ts.mock();
    for i in 0..8 {
        let key = format!("k{}", i);
        assert_ok(&ts.run(c, &["SET", &key, "v"]));
        if i % 2 == 0 {
            ts.evict_key(0, &key);
        }
    }
    for db in &ts.server.dbs {
        for (key, shell) in db.evict.iter() {
            if shell.evicted {
                assert!(db.dict.get(&key[..]).is_none(), "{:?} in both tables", key);
            }
        }
    }
    // DBSIZE counts hot + cold exactly once each.
    assert_int(&ts.run(c, &["DBSIZE"]), 8);
}

#[test]
fn head_of_line_same_key_single_get() {
    let mut ts = server();
    let c1 = ts.mock();
    let c2 = ts.mock();
    assert_ok(&ts.run(c1, &["SET", "x", "10"]));
    ts.evict_key(0, "x");

    let (started_before, _) = get_stat(&ts, SwapAction::Get);
    // Both clients hit the evicted key; the second parks behind the first.
    assert!(!ts.server.execute(c1, argv(&["INCR", "x"])));
    assert!(!ts.server.execute(c2, argv(&["INCR", "x"])));
    assert!(ts.settle());

    assert_int(&ts.server.client_mut(c1).take_output(), 11);
    assert_int(&ts.server.client_mut(c2).take_output(), 12);
    let (started, _) = get_stat(&ts, SwapAction::Get);
    assert_eq!(started - started_before, 1, "only one GET for both commands");
}

#[test]
fn at_most_one_swap_in_flight_per_key() {
    let mut ts = server();
    let clients: Vec<u64> = (0..4).map(|_| ts.mock()).collect();
    let c = clients[0];
    assert_ok(&ts.run(c, &["SET", "hot", "v"]));
    ts.evict_key(0, "hot");

    for &cid in &clients {
        ts.server.execute(cid, argv(&["GET", "hot"]));
    }
    // Every in-flight swap targets a distinct key.
    let mut keys: Vec<_> = ts
        .server
        .swap
        .inflight
        .values()
        .filter_map(|p| p.key.clone())
        .collect();
    let before = keys.len();
    keys.dedup();
    assert_eq!(keys.len(), before);
    assert!(ts.server.swap.inflight.len() <= 1);
    assert!(ts.settle());
    for &cid in &clients {
        assert_bulk(&ts.server.client_mut(cid).take_output(), "v");
    }
}

#[test]
fn held_keys_never_evict() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "pinned", "v"]));
    let key = b("pinned");
    ts.server.client_hold_key(c, &key, 0);
    assert_eq!(ts.server.db_evict(0, &key), EvictOutcome::FailHeld);
    ts.server.client_unhold_key(c, &key);
    assert!(matches!(
        ts.server.db_evict(0, &key),
        EvictOutcome::SuccSwapped | EvictOutcome::SuccFreed
    ));
    assert!(ts.settle());
}

#[test]
fn clean_values_evict_without_io() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "v"]));
    ts.evict_key(0, "a");
    // Swap it back in: the materialized value is clean now.
    assert_bulk(&ts.run(c, &["GET", "a"]), "v");

    let (put_started_before, _) = get_stat(&ts, SwapAction::Put);
    assert_eq!(ts.server.db_evict(0, &b("a")), EvictOutcome::SuccFreed);
    let (put_started, _) = get_stat(&ts, SwapAction::Put);
    assert_eq!(put_started, put_started_before, "clean swap-out needs no PUT");
    assert!(ts.server.dbs[0].evict.get(b"a").map_or(false, |s| s.evicted));
}

#[test]
fn del_of_cold_key_cleans_backing_store() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "v"]));
    ts.evict_key(0, "a");
    assert_int(&ts.run(c, &["DEL", "a"]), 1);
    assert!(ts.settle());
    assert_nil(&ts.run(c, &["GET", "a"]));
    assert!(ts.server.dbs[0].evict.get(b"a").is_none());
    assert!(!ts.server.dbs[0].key_present(b"a"));
}

#[test]
fn flushdb_waits_for_key_queues_then_runs() {
    let mut ts = server();
    let c1 = ts.mock();
    let c2 = ts.mock();
    assert_ok(&ts.run(c1, &["SET", "a", "v"]));
    ts.evict_key(0, "a");

    // c1 blocks on a cold read; c2's FLUSHDB must queue at the root.
    assert!(!ts.server.execute(c1, argv(&["GET", "a"])));
    assert!(!ts.server.execute(c2, argv(&["FLUSHDB"])));
    assert!(!ts.server.swap.root.clients.is_empty() || ts.server.swap.root.nchild > 0);

    assert!(ts.settle());
    assert_bulk(&ts.server.client_mut(c1).take_output(), "v");
    assert_ok(&ts.server.client_mut(c2).take_output());
    assert_eq!(ts.server.dbs[0].size(), 0);
    assert_eq!(ts.server.swap.root.nchild, 0);
}

#[test]
fn rate_limit_records_deferral_deadline() {
    let mut config = Config::default();
    config.swap_memory_slowdown = 0;
    config.swap_memory_stop = 0;
    let mut ts = server_with(config);
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "v"]));
    ts.evict_key(0, "a");

    let before = ts.server.mstime;
    assert!(!ts.server.execute(c, argv(&["GET", "a"])));
    // At the stop threshold the client gets the maximum 10ms hint.
    let until = ts.server.client(c).swap_rl_until;
    assert!(until >= before + 10, "rl_until {} vs now {}", until, before);
    assert!(ts.server.client(c).rate_limited(before));
    assert!(ts.settle());
}

#[test]
fn swap_error_reaches_client_but_queue_survives() {
    let mut ts = server();
    let c1 = ts.mock();
    let c2 = ts.mock();
    // Fabricate a cold marker with no backing-store entry: the GET fails.
    ts.server.dbs[0].evict.insert(
        b("ghost"),
        riptide::db::Shell {
            kind: riptide::types::ValueKind::Str,
            lru: 0,
            evicted: true,
            scs: None,
        },
    );
    assert!(!ts.server.execute(c1, argv(&["GET", "ghost"])));
    assert!(!ts.server.execute(c2, argv(&["GET", "ghost"])));
    assert!(ts.settle());

    assert_error_tag(&ts.server.client_mut(c1).take_output(), "IOERR");
    // The second client retried (another GET) and failed the same way
    // rather than hanging.
    assert_error_tag(&ts.server.client_mut(c2).take_output(), "IOERR");
    assert_eq!(ts.server.swap.root.nchild, 0);
}

#[test]
fn disconnect_mid_swap_applies_data_but_skips_reply() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "v"]));
    ts.evict_key(0, "a");

    assert!(!ts.server.execute(c, argv(&["GET", "a"])));
    ts.server.free_client(c);
    assert!(ts.server.client_exists(c), "teardown defers while swapping");
    assert!(ts.server.client(c).defered_closing);
    assert!(ts.settle());

    // Client slot reclaimed, yet the keyspace mutation landed.
    assert!(!ts.server.client_exists(c));
    assert!(ts.server.dbs[0].dict.get(b"a").is_some());
}

#[test]
fn pipelined_requests_wait_for_suspended_head() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "1"]));
    ts.evict_key(0, "a");

    // Feed two pipelined commands through the input buffer: the first
    // suspends on the cold key, the second must not run early.
    ts.server
        .client_mut(c)
        .inbuf
        .extend_from_slice(b"*2\r\n$4\r\nINCR\r\n$1\r\na\r\n*2\r\n$4\r\nINCR\r\n$1\r\na\r\n");
    ts.server.process_input_buffer(c);
    assert!(ts.server.client(c).swapping);
    assert!(ts.settle());
    let out = ts.server.client_mut(c).take_output();
    assert_eq!(&out[..], b":2\r\n:3\r\n");
}

#[test]
fn evict_asap_retries_after_unhold() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "busy", "v"]));
    let key = b("busy");
    ts.server.client_hold_key(c, &key, 1);
    ts.server.active_child = true;
    ts.server.client_unhold_key(c, &key);
    // swap_count > 0 at unhold during a background save queues the key.
    assert!(ts.server.dbs[0].evict_asap.contains(&key));
    ts.server.evict_asap();
    assert!(ts.settle());
    assert!(ts.server.dbs[0].evict.get(&key[..]).map_or(false, |s| s.evicted));
}
