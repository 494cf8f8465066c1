//! Active expiration: budgeted sampling, cold-key expiry through the swap
//! pipeline, clock skew, and the writable-replica side table.

mod support;

use support::*;

use riptide::config::Config;

#[test]
fn active_cycle_reaps_expired_keys() {
    let mut ts = server();
    let c = ts.mock();
    for i in 0..30 {
        let key = format!("k{}", i);
        assert_ok(&ts.run(c, &["SET", &key, "v"]));
        assert_int(&ts.run(c, &["PEXPIREAT", &key, "1"]), 1);
    }
    for i in 0..5 {
        assert_ok(&ts.run(c, &["SET", &format!("live{}", i), "v"]));
    }

    // Everything is long past due; a few cycles must reap all of it.
    for _ in 0..50 {
        ts.server.active_expire_cycle(false);
        assert!(ts.settle());
        if ts.server.stat_expired >= 30 {
            break;
        }
    }
    assert_eq!(ts.server.stat_expired, 30);
    assert_int(&ts.run(c, &["DBSIZE"]), 5);
    for db in &ts.server.dbs {
        assert_eq!(db.expires.len(), 0);
    }
}

#[test]
fn cold_expired_keys_go_through_the_pipeline() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "cold", "v"]));
    ts.evict_key(0, "cold");
    // Expire applies to the cold key without materializing it...
    assert_int(&ts.run(c, &["PEXPIRE", "cold", "1"]), 1);
    assert!(ts.server.dbs[0].dict.get(b"cold").is_none());
    std::thread::sleep(std::time::Duration::from_millis(5));
    ts.server.mstime = riptide::util::mstime();

    let (get_started, _) = {
        let s = ts.server.swap.stats[riptide::swap_io::SwapAction::Get.index()];
        (s.started, s.finished)
    };
    ts.server.active_expire_cycle(false);
    assert!(ts.settle());
    // ...but expiring it does: the value swaps in first, then dies.
    let s = ts.server.swap.stats[riptide::swap_io::SwapAction::Get.index()];
    assert_eq!(s.started, get_started + 1);
    assert!(!ts.server.dbs[0].key_present(b"cold"));
    assert_eq!(ts.server.stat_expired, 1);
}

#[test]
fn budget_exit_flag_resumes_next_tick() {
    let mut ts = server();
    let c = ts.mock();
    for i in 0..2000 {
        let key = format!("k{}", i);
        assert_ok(&ts.run(c, &["SET", &key, "v"]));
        assert_int(&ts.run(c, &["PEXPIREAT", &key, "1"]), 1);
    }
    let mut cycles = 0;
    while ts.server.dbs[0].expires.len() > 0 && cycles < 500 {
        ts.server.active_expire_cycle(false);
        assert!(ts.settle());
        cycles += 1;
    }
    assert_eq!(ts.server.dbs[0].expires.len(), 0);
    assert!(cycles >= 1);
}

#[test]
fn avg_ttl_ewma_tracks_unexpired_keys() {
    let mut ts = server();
    let c = ts.mock();
    for i in 0..64 {
        let key = format!("k{}", i);
        assert_ok(&ts.run(c, &["SET", &key, "v"]));
        assert_int(&ts.run(c, &["EXPIRE", &key, "1000"]), 1);
    }
    ts.server.active_expire_cycle(false);
    let avg = ts.server.dbs[0].avg_ttl;
    assert!(avg > 900_000 && avg <= 1_000_000, "avg_ttl {}", avg);
}

#[test]
fn backward_clock_skew_forces_sampled_keys_due() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "k1", "v"]));
    assert_int(&ts.run(c, &["EXPIRE", "k1", "100"]), 1);

    ts.server.clock_skewed = true;
    for _ in 0..10 {
        ts.server.active_expire_cycle(false);
        assert!(ts.settle());
        if ts.server.stat_expired > 0 {
            break;
        }
    }
    assert_eq!(ts.server.stat_expired, 1);
    assert_nil(&ts.run(c, &["GET", "k1"]));
}

#[test]
fn fast_cycle_is_rate_limited() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "k", "v"]));
    assert_int(&ts.run(c, &["PEXPIREAT", "k", "1"]), 1);
    // Fresh server: no budget exit recorded and no staleness estimate, so
    // the fast path declines to run.
    ts.server.active_expire_cycle(true);
    assert_eq!(ts.server.stat_expired, 0);
    // The slow path takes it.
    ts.server.active_expire_cycle(false);
    assert!(ts.settle());
    assert_eq!(ts.server.stat_expired, 1);
}

#[test]
fn writable_replica_side_table_expires_locally() {
    let mut ts = server();
    ts.server.replica_mode = true;
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "local", "v"]));
    assert_int(&ts.run(c, &["PEXPIRE", "local", "30"]), 1);
    assert!(ts.server.slave_keys_with_expire.contains_key(b"local".as_slice()));

    std::thread::sleep(std::time::Duration::from_millis(40));
    ts.server.mstime = riptide::util::mstime();
    ts.server.expire_replica_tracked_keys();
    assert!(ts.settle());
    assert!(!ts.server.dbs[0].key_present(b"local"));
    assert!(!ts.server.slave_keys_with_expire.contains_key(b"local".as_slice()));
}

#[test]
fn expire_on_evicted_key_keeps_expires_invariant() {
    let mut ts = server();
    let c = ts.mock();
    assert_ok(&ts.run(c, &["SET", "a", "v"]));
    assert_int(&ts.run(c, &["EXPIRE", "a", "500"]), 1);
    ts.evict_key(0, "a");
    // Eviction must keep the ttl: every expires entry points at a key in
    // dict or evict.
    assert!(ts.server.dbs[0].get_expire(b"a").is_some());
    assert!(ts.server.dbs[0].key_present(b"a"));
    let out = ts.run(c, &["TTL", "a"]);
    let ttl: i64 =
        String::from_utf8_lossy(&out).trim_start_matches(':').trim_end().parse().unwrap();
    assert!(ttl > 0 && ttl <= 500);
}

#[test]
fn config_effort_bounds() {
    let mut config = Config::default();
    config.active_expire_effort = 10;
    let mut ts = server_with(config);
    let c = ts.mock();
    for i in 0..100 {
        let key = format!("k{}", i);
        assert_ok(&ts.run(c, &["SET", &key, "v"]));
        assert_int(&ts.run(c, &["PEXPIREAT", &key, "1"]), 1);
    }
    for _ in 0..100 {
        ts.server.active_expire_cycle(false);
        assert!(ts.settle());
        if ts.server.stat_expired >= 100 {
            break;
        }
    }
    assert_eq!(ts.server.stat_expired, 100);
}
