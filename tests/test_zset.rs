//! Sorted-set command surface, driven through full dispatch.

mod support;

use support::*;

#[test]
fn zadd_zscore_round_trip() {
    let mut ts = server();
    let c = ts.mock();
    assert_int(&ts.run(c, &["ZADD", "z", "1.5", "a", "2", "b"]), 2);
    assert_bulk(&ts.run(c, &["ZSCORE", "z", "a"]), "1.5");
    assert_bulk(&ts.run(c, &["ZSCORE", "z", "b"]), "2");
    assert_nil(&ts.run(c, &["ZSCORE", "z", "missing"]));
    assert_nil(&ts.run(c, &["ZSCORE", "nokey", "a"]));
    assert_int(&ts.run(c, &["ZCARD", "z"]), 2);
}

#[test]
fn zadd_flags() {
    let mut ts = server();
    let c = ts.mock();
    assert_int(&ts.run(c, &["ZADD", "z", "1", "m"]), 1);
    // NX refuses updates, XX refuses inserts.
    assert_int(&ts.run(c, &["ZADD", "z", "NX", "9", "m"]), 0);
    assert_bulk(&ts.run(c, &["ZSCORE", "z", "m"]), "1");
    assert_int(&ts.run(c, &["ZADD", "z", "XX", "5", "new"]), 0);
    assert_int(&ts.run(c, &["ZCARD", "z"]), 1);
    // XX on a missing key is a no-op.
    assert_int(&ts.run(c, &["ZADD", "ghost", "XX", "1", "m"]), 0);
    assert_int(&ts.run(c, &["EXISTS", "ghost"]), 0);
    // CH counts changes, INCR returns the new score.
    assert_int(&ts.run(c, &["ZADD", "z", "CH", "2", "m"]), 1);
    assert_bulk(&ts.run(c, &["ZADD", "z", "INCR", "3", "m"]), "5");
    assert_error_tag(&ts.run(c, &["ZADD", "z", "NX", "XX", "1", "m"]), "ERR");
}

#[test]
fn zincrby_and_zrem() {
    let mut ts = server();
    let c = ts.mock();
    assert_bulk(&ts.run(c, &["ZINCRBY", "z", "2.5", "m"]), "2.5");
    assert_bulk(&ts.run(c, &["ZINCRBY", "z", "-0.5", "m"]), "2");
    assert_int(&ts.run(c, &["ZREM", "z", "m", "missing"]), 1);
    // Removing the last member deletes the key.
    assert_int(&ts.run(c, &["EXISTS", "z"]), 0);
}

#[test]
fn zrange_and_rev_variants() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]);
    let out = ts.run(c, &["ZRANGE", "z", "0", "-1"]);
    assert_eq!(&out[..], b"*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
    let out = ts.run(c, &["ZREVRANGE", "z", "0", "0"]);
    assert_eq!(&out[..], b"*1\r\n$1\r\nc\r\n");
    let out = ts.run(c, &["ZRANGE", "z", "0", "0", "WITHSCORES"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\na\r\n$1\r\n1\r\n");
    let out = ts.run(c, &["ZRANGE", "z", "5", "9"]);
    assert_eq!(&out[..], b"*0\r\n");
}

#[test]
fn zrangebyscore_bounds_and_limit() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z", "1", "a", "2", "b", "3", "c", "4", "d"]);
    let out = ts.run(c, &["ZRANGEBYSCORE", "z", "(1", "3"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\nb\r\n$1\r\nc\r\n");
    let out = ts.run(c, &["ZRANGEBYSCORE", "z", "-inf", "+inf", "LIMIT", "1", "2"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\nb\r\n$1\r\nc\r\n");
    // REV variants take max first.
    let out = ts.run(c, &["ZREVRANGEBYSCORE", "z", "+inf", "(2"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\nd\r\n$1\r\nc\r\n");
    assert_int(&ts.run(c, &["ZCOUNT", "z", "2", "3"]), 2);
    assert_error_tag(&ts.run(c, &["ZRANGEBYSCORE", "z", "nope", "3"]), "ERR");
}

#[test]
fn zrangebylex() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z", "0", "a", "0", "b", "0", "c", "0", "d"]);
    let out = ts.run(c, &["ZRANGEBYLEX", "z", "[b", "(d"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\nb\r\n$1\r\nc\r\n");
    let out = ts.run(c, &["ZRANGEBYLEX", "z", "-", "+"]);
    assert_eq!(&out[..], b"*4\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n$1\r\nd\r\n");
    let out = ts.run(c, &["ZREVRANGEBYLEX", "z", "+", "[c"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\nd\r\n$1\r\nc\r\n");
    assert_error_tag(&ts.run(c, &["ZRANGEBYLEX", "z", "b", "+"]), "ERR");
}

#[test]
fn zpop_both_ends() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z", "1", "a", "2", "b", "3", "c"]);
    let out = ts.run(c, &["ZPOPMIN", "z"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\na\r\n$1\r\n1\r\n");
    let out = ts.run(c, &["ZPOPMAX", "z", "2"]);
    assert_eq!(&out[..], b"*4\r\n$1\r\nc\r\n$1\r\n3\r\n$1\r\nb\r\n$1\r\n2\r\n");
    // Popped empty: the key is gone.
    assert_int(&ts.run(c, &["EXISTS", "z"]), 0);
    let out = ts.run(c, &["ZPOPMIN", "z"]);
    assert_eq!(&out[..], b"*0\r\n");
}

#[test]
fn zunionstore_weights_and_aggregate() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z1", "1", "a", "2", "b"]);
    ts.run(c, &["ZADD", "z2", "10", "b", "20", "c"]);
    assert_int(&ts.run(c, &["ZUNIONSTORE", "dest", "2", "z1", "z2"]), 3);
    assert_bulk(&ts.run(c, &["ZSCORE", "dest", "b"]), "12");

    assert_int(
        &ts.run(c, &["ZUNIONSTORE", "dest", "2", "z1", "z2", "WEIGHTS", "2", "1"]),
        3,
    );
    assert_bulk(&ts.run(c, &["ZSCORE", "dest", "b"]), "14");

    assert_int(
        &ts.run(c, &["ZUNIONSTORE", "dest", "2", "z1", "z2", "AGGREGATE", "MAX"]),
        3,
    );
    assert_bulk(&ts.run(c, &["ZSCORE", "dest", "b"]), "10");
}

#[test]
fn zinterstore_intersects() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z1", "1", "a", "2", "b"]);
    ts.run(c, &["ZADD", "z2", "10", "b", "20", "c"]);
    assert_int(&ts.run(c, &["ZINTERSTORE", "dest", "2", "z1", "z2"]), 1);
    assert_bulk(&ts.run(c, &["ZSCORE", "dest", "b"]), "12");
    // Empty intersection removes the destination.
    ts.run(c, &["ZADD", "z3", "1", "zzz"]);
    assert_int(&ts.run(c, &["ZINTERSTORE", "dest", "2", "z1", "z3"]), 0);
    assert_int(&ts.run(c, &["EXISTS", "dest"]), 0);
}

#[test]
fn plain_sets_join_stores_with_score_one() {
    let mut ts = server();
    let c = ts.mock();
    // Build a set value through RESTORE (no set command family here).
    let mut set = std::collections::HashSet::new();
    set.insert(support::b("x"));
    let payload = riptide::migrate::encode_payload(&riptide::types::Value::Set(set));
    let mut args = argv(&["RESTORE", "s", "0"]);
    args.push(payload.into());
    assert_ok(&ts.run_raw(c, args));

    ts.run(c, &["ZADD", "z", "5", "x"]);
    assert_int(&ts.run(c, &["ZUNIONSTORE", "dest", "2", "s", "z"]), 1);
    assert_bulk(&ts.run(c, &["ZSCORE", "dest", "x"]), "6");
}

#[test]
fn cold_zset_materializes_for_range() {
    let mut ts = server();
    let c = ts.mock();
    ts.run(c, &["ZADD", "z", "1", "a", "2", "b"]);
    ts.evict_key(0, "z");
    let out = ts.run(c, &["ZRANGEBYSCORE", "z", "1", "2"]);
    assert_eq!(&out[..], b"*2\r\n$1\r\na\r\n$1\r\nb\r\n");
    assert!(ts.server.dbs[0].dict.get(b"z").is_some());
}
