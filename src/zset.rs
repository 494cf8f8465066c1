//! Sorted sets: the ordered structure plus the ZADD/ZRANGE command family.
//!
//! All range commands funnel into one generic routine parameterized by
//! rank/score/lex, direction, WITHSCORES and LIMIT.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;

use crate::notify::NOTIFY_ZSET;
use crate::resp::{format_double, Reply};
use crate::server::Server;
use crate::types::{ErrorKind, Object, ServerError, ServerResult, Value};
use crate::util::parse_f64;

/// A member ordered by (score, member-bytes). Scores are never NaN.
#[derive(Debug, Clone)]
struct ScoreKey {
    score: f64,
    member: Bytes,
}

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == std::cmp::Ordering::Equal
            && self.member == other.member
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZSet {
    map: HashMap<Bytes, f64>,
    sorted: BTreeSet<ScoreKey>,
}

impl PartialEq for ZSet {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl ZSet {
    pub fn new() -> Self {
        ZSet::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.map.get(member).copied()
    }

    /// Insert or update; returns true when the member is new.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        match self.map.insert(member.clone(), score) {
            Some(old) => {
                self.sorted.remove(&ScoreKey { score: old, member: member.clone() });
                self.sorted.insert(ScoreKey { score, member });
                false
            }
            None => {
                self.sorted.insert(ScoreKey { score, member });
                true
            }
        }
    }

    pub fn remove(&mut self, member: &[u8]) -> Option<f64> {
        let score = self.map.remove(member)?;
        self.sorted.remove(&ScoreKey { score, member: Bytes::copy_from_slice(member) });
        Some(score)
    }

    fn nth(&self, rank: usize, reverse: bool) -> Option<&ScoreKey> {
        if reverse {
            self.sorted.iter().rev().nth(rank)
        } else {
            self.sorted.iter().nth(rank)
        }
    }

    /// Members at ranks `start..=stop` (already normalized, inclusive).
    pub fn range_by_rank(&self, start: usize, stop: usize, reverse: bool) -> Vec<(Bytes, f64)> {
        let take = stop + 1 - start;
        let collect = |it: &mut dyn Iterator<Item = &ScoreKey>| {
            it.skip(start)
                .take(take)
                .map(|sk| (sk.member.clone(), sk.score))
                .collect()
        };
        if reverse {
            collect(&mut self.sorted.iter().rev())
        } else {
            collect(&mut self.sorted.iter())
        }
    }

    fn in_score_range(&self, range: &ScoreRange, sk: &ScoreKey) -> bool {
        let lo = if range.min_excl { sk.score > range.min } else { sk.score >= range.min };
        let hi = if range.max_excl { sk.score < range.max } else { sk.score <= range.max };
        lo && hi
    }

    pub fn range_by_score(
        &self,
        range: &ScoreRange,
        reverse: bool,
        offset: usize,
        count: i64,
    ) -> Vec<(Bytes, f64)> {
        let mut out = Vec::new();
        let mut skipped = 0;
        let mut push = |sk: &ScoreKey| -> bool {
            if skipped < offset {
                skipped += 1;
                return true;
            }
            if count >= 0 && out.len() as i64 >= count {
                return false;
            }
            out.push((sk.member.clone(), sk.score));
            true
        };
        if reverse {
            for sk in self.sorted.iter().rev() {
                if !self.in_score_range(range, sk) {
                    if sk.score < range.min {
                        break;
                    }
                    continue;
                }
                if !push(sk) {
                    break;
                }
            }
        } else {
            for sk in self.sorted.iter() {
                if !self.in_score_range(range, sk) {
                    if sk.score > range.max {
                        break;
                    }
                    continue;
                }
                if !push(sk) {
                    break;
                }
            }
        }
        out
    }

    pub fn count_in_score_range(&self, range: &ScoreRange) -> usize {
        self.sorted.iter().filter(|sk| self.in_score_range(range, sk)).count()
    }

    fn in_lex_range(range: &LexRange, member: &Bytes) -> bool {
        let lo = match &range.min {
            LexBound::NegInf => true,
            LexBound::PosInf => false,
            LexBound::Incl(b) => member >= b,
            LexBound::Excl(b) => member > b,
        };
        let hi = match &range.max {
            LexBound::NegInf => false,
            LexBound::PosInf => true,
            LexBound::Incl(b) => member <= b,
            LexBound::Excl(b) => member < b,
        };
        lo && hi
    }

    pub fn range_by_lex(
        &self,
        range: &LexRange,
        reverse: bool,
        offset: usize,
        count: i64,
    ) -> Vec<(Bytes, f64)> {
        let mut out = Vec::new();
        let mut skipped = 0;
        let iter: Box<dyn Iterator<Item = &ScoreKey>> = if reverse {
            Box::new(self.sorted.iter().rev())
        } else {
            Box::new(self.sorted.iter())
        };
        for sk in iter {
            if !Self::in_lex_range(range, &sk.member) {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if count >= 0 && out.len() as i64 >= count {
                break;
            }
            out.push((sk.member.clone(), sk.score));
        }
        out
    }

    pub fn pop_min(&mut self, count: usize) -> Vec<(Bytes, f64)> {
        let mut out = Vec::new();
        for _ in 0..count {
            let Some(first) = self.sorted.iter().next().cloned() else { break };
            self.sorted.remove(&first);
            self.map.remove(&first.member);
            out.push((first.member, first.score));
        }
        out
    }

    pub fn pop_max(&mut self, count: usize) -> Vec<(Bytes, f64)> {
        let mut out = Vec::new();
        for _ in 0..count {
            let Some(last) = self.sorted.iter().next_back().cloned() else { break };
            self.sorted.remove(&last);
            self.map.remove(&last.member);
            out.push((last.member, last.score));
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, f64)> {
        self.sorted.iter().map(|sk| (&sk.member, sk.score))
    }

    pub fn approx_size(&self) -> usize {
        self.map.keys().map(|m| 2 * m.len() + 48).sum::<usize>() + 64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScoreRange {
    pub min: f64,
    pub min_excl: bool,
    pub max: f64,
    pub max_excl: bool,
}

#[derive(Debug, Clone)]
pub enum LexBound {
    NegInf,
    PosInf,
    Incl(Bytes),
    Excl(Bytes),
}

#[derive(Debug, Clone)]
pub struct LexRange {
    pub min: LexBound,
    pub max: LexBound,
}

fn bad_score_range() -> ServerError {
    ServerError::new(ErrorKind::Generic, "min or max is not a float")
}

fn parse_score_bound(arg: &[u8]) -> ServerResult<(f64, bool)> {
    if let Some(rest) = arg.strip_prefix(b"(") {
        Ok((parse_f64(rest).map_err(|_| bad_score_range())?, true))
    } else {
        Ok((parse_f64(arg).map_err(|_| bad_score_range())?, false))
    }
}

pub fn parse_score_range(min: &[u8], max: &[u8]) -> ServerResult<ScoreRange> {
    let (min, min_excl) = parse_score_bound(min)?;
    let (max, max_excl) = parse_score_bound(max)?;
    Ok(ScoreRange { min, min_excl, max, max_excl })
}

fn parse_lex_bound(arg: &[u8]) -> ServerResult<LexBound> {
    match arg.first() {
        Some(b'-') if arg.len() == 1 => Ok(LexBound::NegInf),
        Some(b'+') if arg.len() == 1 => Ok(LexBound::PosInf),
        Some(b'[') => Ok(LexBound::Incl(Bytes::copy_from_slice(&arg[1..]))),
        Some(b'(') => Ok(LexBound::Excl(Bytes::copy_from_slice(&arg[1..]))),
        _ => Err(ServerError::new(ErrorKind::Generic, "min or max not valid string range item")),
    }
}

pub fn parse_lex_range(min: &[u8], max: &[u8]) -> ServerResult<LexRange> {
    Ok(LexRange { min: parse_lex_bound(min)?, max: parse_lex_bound(max)? })
}

// ---------------------------------------------------------------- commands

/// Fetch the sorted set at `key` for reading; `Ok(None)` when missing.
fn read_zset<'a>(srv: &'a Server, dbid: usize, key: &[u8]) -> ServerResult<Option<&'a ZSet>> {
    match srv.dbs[dbid].dict.get(key) {
        None => Ok(None),
        Some(obj) => match &obj.value {
            Value::ZSet(z) => Ok(Some(z)),
            _ => Err(ServerError::wrong_type()),
        },
    }
}

pub fn zadd_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();

    let (mut nx, mut xx, mut ch, mut incr) = (false, false, false, false);
    let mut i = 2;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"NX" => nx = true,
            b"XX" => xx = true,
            b"CH" => ch = true,
            b"INCR" => incr = true,
            _ => break,
        }
        i += 1;
    }
    if nx && xx {
        return Err(ServerError::new(
            ErrorKind::Generic,
            "XX and NX options at the same time are not compatible",
        ));
    }
    if i == argv.len() || (argv.len() - i) % 2 != 0 {
        return Err(ServerError::syntax());
    }
    let mut pairs = Vec::new();
    while i < argv.len() {
        pairs.push((parse_f64(&argv[i])?, argv[i + 1].clone()));
        i += 2;
    }
    if incr && pairs.len() != 1 {
        return Err(ServerError::new(
            ErrorKind::Generic,
            "INCR option supports a single increment-element pair",
        ));
    }

    srv.expire_if_needed(dbid, &key);
    let now = srv.mstime;
    let exists = srv.dbs[dbid].dict.contains(&key);
    if !exists {
        if xx {
            // XX on a missing key is a no-op.
            return Ok(if incr { Reply::Nil } else { Reply::Int(0) });
        }
        srv.dbs[dbid].add(key.clone(), Object::new(Value::ZSet(ZSet::new()), now));
    }

    let obj = srv.dbs[dbid].dict.get_mut(&key).expect("zset just ensured");
    let zset = match &mut obj.value {
        Value::ZSet(z) => z,
        _ => return Err(ServerError::wrong_type()),
    };

    let (mut added, mut changed) = (0i64, 0i64);
    let mut incr_result = None;
    for (score, member) in pairs {
        let existing = zset.score(&member);
        if nx && existing.is_some() {
            if incr {
                incr_result = Some(None);
            }
            continue;
        }
        if xx && existing.is_none() {
            if incr {
                incr_result = Some(None);
            }
            continue;
        }
        let new_score = if incr {
            let base = existing.unwrap_or(0.0);
            let sum = base + score;
            if sum.is_nan() {
                return Err(ServerError::new(ErrorKind::Generic, "resulting score is not a number (NaN)"));
            }
            sum
        } else {
            score
        };
        let is_new = zset.insert(member, new_score);
        if is_new {
            added += 1;
        } else if existing != Some(new_score) {
            changed += 1;
        }
        if incr {
            incr_result = Some(Some(new_score));
        }
    }

    obj.dirty = true;
    if added > 0 || changed > 0 {
        srv.signal_modified(dbid, &key);
        srv.notify_keyspace_event(NOTIFY_ZSET, "zadd", &key, dbid);
    }
    if incr {
        return Ok(match incr_result {
            Some(Some(score)) => Reply::bulk(format_double(score).into_bytes()),
            _ => Reply::Nil,
        });
    }
    Ok(Reply::Int(if ch { added + changed } else { added }))
}

pub fn zincrby_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let delta = parse_f64(&argv[2])?;
    let member = argv[3].clone();

    srv.expire_if_needed(dbid, &key);
    let now = srv.mstime;
    if !srv.dbs[dbid].dict.contains(&key) {
        srv.dbs[dbid].add(key.clone(), Object::new(Value::ZSet(ZSet::new()), now));
    }
    let obj = srv.dbs[dbid].dict.get_mut(&key).expect("zset just ensured");
    let zset = match &mut obj.value {
        Value::ZSet(z) => z,
        _ => return Err(ServerError::wrong_type()),
    };
    let score = zset.score(&member).unwrap_or(0.0) + delta;
    if score.is_nan() {
        return Err(ServerError::new(ErrorKind::Generic, "resulting score is not a number (NaN)"));
    }
    zset.insert(member, score);
    obj.dirty = true;
    srv.signal_modified(dbid, &key);
    srv.notify_keyspace_event(NOTIFY_ZSET, "zincr", &key, dbid);
    Ok(Reply::bulk(format_double(score).into_bytes()))
}

pub fn zscore_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    srv.expire_if_needed(dbid, &argv[1]);
    match read_zset(srv, dbid, &argv[1])? {
        Some(z) => Ok(match z.score(&argv[2]) {
            Some(s) => Reply::bulk(format_double(s).into_bytes()),
            None => Reply::Nil,
        }),
        None => Ok(Reply::Nil),
    }
}

pub fn zcard_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    srv.expire_if_needed(dbid, &argv[1]);
    Ok(Reply::Int(read_zset(srv, dbid, &argv[1])?.map_or(0, |z| z.len() as i64)))
}

pub fn zrem_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    srv.expire_if_needed(dbid, &key);

    let mut removed = 0i64;
    let mut emptied = false;
    if let Some(obj) = srv.dbs[dbid].dict.get_mut(&key) {
        let zset = match &mut obj.value {
            Value::ZSet(z) => z,
            _ => return Err(ServerError::wrong_type()),
        };
        for member in &argv[2..] {
            if zset.remove(member).is_some() {
                removed += 1;
            }
        }
        obj.dirty = true;
        emptied = zset.is_empty();
    }
    if removed > 0 {
        srv.signal_modified(dbid, &key);
        srv.notify_keyspace_event(NOTIFY_ZSET, "zrem", &key, dbid);
        if emptied {
            srv.db_delete_key(dbid, &key);
            srv.notify_keyspace_event(crate::notify::NOTIFY_GENERIC, "del", &key, dbid);
        }
    }
    Ok(Reply::Int(removed))
}

pub fn zcount_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    srv.expire_if_needed(dbid, &argv[1]);
    let range = parse_score_range(&argv[2], &argv[3])?;
    Ok(Reply::Int(
        read_zset(srv, dbid, &argv[1])?.map_or(0, |z| z.count_in_score_range(&range) as i64),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBy {
    Rank,
    Score,
    Lex,
}

/// The shared implementation behind the six range commands.
pub fn zrange_generic(
    srv: &mut Server,
    cid: u64,
    by: RangeBy,
    reverse: bool,
) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    srv.expire_if_needed(dbid, &argv[1]);

    let mut withscores = false;
    let mut offset = 0usize;
    let mut count = -1i64;
    let mut i = 4;
    while i < argv.len() {
        let opt = argv[i].to_ascii_uppercase();
        if opt == b"WITHSCORES" && by != RangeBy::Lex {
            withscores = true;
            i += 1;
        } else if opt == b"LIMIT" && by != RangeBy::Rank && i + 2 < argv.len() {
            offset = crate::util::parse_i64(&argv[i + 1])?.max(0) as usize;
            count = crate::util::parse_i64(&argv[i + 2])?;
            i += 3;
        } else {
            return Err(ServerError::syntax());
        }
    }

    let Some(zset) = read_zset(srv, dbid, &argv[1])? else {
        return Ok(Reply::Array(vec![]));
    };

    let entries = match by {
        RangeBy::Rank => {
            let len = zset.len() as i64;
            let mut start = crate::util::parse_i64(&argv[2])?;
            let mut stop = crate::util::parse_i64(&argv[3])?;
            if start < 0 {
                start += len;
            }
            if stop < 0 {
                stop += len;
            }
            start = start.max(0);
            if start > stop || start >= len {
                Vec::new()
            } else {
                zset.range_by_rank(start as usize, stop.min(len - 1) as usize, reverse)
            }
        }
        RangeBy::Score => {
            // REV variants take (max, min) argument order.
            let (min, max) = if reverse { (&argv[3], &argv[2]) } else { (&argv[2], &argv[3]) };
            let range = parse_score_range(min, max)?;
            zset.range_by_score(&range, reverse, offset, count)
        }
        RangeBy::Lex => {
            let (min, max) = if reverse { (&argv[3], &argv[2]) } else { (&argv[2], &argv[3]) };
            let range = parse_lex_range(min, max)?;
            zset.range_by_lex(&range, reverse, offset, count)
        }
    };

    let mut out = Vec::with_capacity(entries.len() * if withscores { 2 } else { 1 });
    for (member, score) in entries {
        out.push(Reply::Bulk(member));
        if withscores {
            out.push(Reply::bulk(format_double(score).into_bytes()));
        }
    }
    Ok(Reply::Array(out))
}

pub fn zrange_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zrange_generic(srv, cid, RangeBy::Rank, false)
}

pub fn zrevrange_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zrange_generic(srv, cid, RangeBy::Rank, true)
}

pub fn zrangebyscore_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zrange_generic(srv, cid, RangeBy::Score, false)
}

pub fn zrevrangebyscore_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zrange_generic(srv, cid, RangeBy::Score, true)
}

pub fn zrangebylex_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zrange_generic(srv, cid, RangeBy::Lex, false)
}

pub fn zrevrangebylex_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zrange_generic(srv, cid, RangeBy::Lex, true)
}

fn zpop_generic(srv: &mut Server, cid: u64, min: bool) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let count = if argv.len() > 2 {
        let n = crate::util::parse_i64(&argv[2])?;
        if n < 0 {
            return Err(ServerError::new(ErrorKind::Generic, "value is out of range, must be positive"));
        }
        n as usize
    } else {
        1
    };
    srv.expire_if_needed(dbid, &key);

    let mut popped = Vec::new();
    let mut emptied = false;
    if let Some(obj) = srv.dbs[dbid].dict.get_mut(&key) {
        let zset = match &mut obj.value {
            Value::ZSet(z) => z,
            _ => return Err(ServerError::wrong_type()),
        };
        popped = if min { zset.pop_min(count) } else { zset.pop_max(count) };
        obj.dirty = true;
        emptied = zset.is_empty();
    }
    if !popped.is_empty() {
        srv.signal_modified(dbid, &key);
        srv.notify_keyspace_event(NOTIFY_ZSET, if min { "zpopmin" } else { "zpopmax" }, &key, dbid);
        if emptied {
            srv.db_delete_key(dbid, &key);
            srv.notify_keyspace_event(crate::notify::NOTIFY_GENERIC, "del", &key, dbid);
        }
    }
    let mut out = Vec::with_capacity(popped.len() * 2);
    for (member, score) in popped {
        out.push(Reply::Bulk(member));
        out.push(Reply::bulk(format_double(score).into_bytes()));
    }
    Ok(Reply::Array(out))
}

pub fn zpopmin_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zpop_generic(srv, cid, true)
}

pub fn zpopmax_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zpop_generic(srv, cid, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Min,
    Max,
}

fn zstore_generic(srv: &mut Server, cid: u64, inter: bool) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let dest = argv[1].clone();
    let numkeys = crate::util::parse_i64(&argv[2])?;
    if numkeys <= 0 {
        return Err(ServerError::new(
            ErrorKind::Generic,
            "at least 1 input key is needed for ZUNIONSTORE/ZINTERSTORE",
        ));
    }
    let numkeys = numkeys as usize;
    if argv.len() < 3 + numkeys {
        return Err(ServerError::syntax());
    }
    let keys: Vec<Bytes> = argv[3..3 + numkeys].to_vec();

    let mut weights = vec![1.0; numkeys];
    let mut aggregate = Aggregate::Sum;
    let mut i = 3 + numkeys;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"WEIGHTS" => {
                if argv.len() < i + 1 + numkeys {
                    return Err(ServerError::syntax());
                }
                for (w, arg) in weights.iter_mut().zip(&argv[i + 1..i + 1 + numkeys]) {
                    *w = parse_f64(arg)
                        .map_err(|_| ServerError::new(ErrorKind::Generic, "weight value is not a float"))?;
                }
                i += 1 + numkeys;
            }
            b"AGGREGATE" => {
                if argv.len() <= i + 1 {
                    return Err(ServerError::syntax());
                }
                aggregate = match argv[i + 1].to_ascii_uppercase().as_slice() {
                    b"SUM" => Aggregate::Sum,
                    b"MIN" => Aggregate::Min,
                    b"MAX" => Aggregate::Max,
                    _ => return Err(ServerError::syntax()),
                };
                i += 2;
            }
            _ => return Err(ServerError::syntax()),
        }
    }

    // Collect each source as member -> weighted score. Plain sets join in
    // with score 1 like the other aggregation inputs.
    let mut sources: Vec<HashMap<Bytes, f64>> = Vec::with_capacity(numkeys);
    for (key, weight) in keys.iter().zip(&weights) {
        srv.expire_if_needed(dbid, key);
        let mut source = HashMap::new();
        if let Some(obj) = srv.dbs[dbid].dict.get(key) {
            match &obj.value {
                Value::ZSet(z) => {
                    for (member, score) in z.iter() {
                        source.insert(member.clone(), score * weight);
                    }
                }
                Value::Set(s) => {
                    for member in s {
                        source.insert(member.clone(), *weight);
                    }
                }
                _ => return Err(ServerError::wrong_type()),
            }
        }
        sources.push(source);
    }

    let agg = |acc: f64, v: f64| match aggregate {
        Aggregate::Sum => {
            let sum = acc + v;
            // inf + -inf aggregates to 0 rather than NaN.
            if sum.is_nan() {
                0.0
            } else {
                sum
            }
        }
        Aggregate::Min => acc.min(v),
        Aggregate::Max => acc.max(v),
    };

    let mut result = ZSet::new();
    if inter {
        let (first, rest) = sources.split_first().expect("numkeys >= 1");
        'member: for (member, &score) in first {
            let mut acc = score;
            for other in rest {
                match other.get(member) {
                    Some(&v) => acc = agg(acc, v),
                    None => continue 'member,
                }
            }
            result.insert(member.clone(), acc);
        }
    } else {
        for source in &sources {
            for (member, &score) in source {
                let acc = match result.score(member) {
                    Some(existing) => agg(existing, score),
                    None => score,
                };
                result.insert(member.clone(), acc);
            }
        }
    }

    let len = result.len() as i64;
    let event = if inter { "zinterstore" } else { "zunionstore" };
    srv.db_delete_key(dbid, &dest);
    if len > 0 {
        let now = srv.mstime;
        srv.dbs[dbid].add(dest.clone(), Object::new(Value::ZSet(result), now));
        srv.signal_modified(dbid, &dest);
        srv.notify_keyspace_event(NOTIFY_ZSET, event, &dest, dbid);
    } else {
        srv.signal_modified(dbid, &dest);
        srv.notify_keyspace_event(crate::notify::NOTIFY_GENERIC, "del", &dest, dbid);
    }
    Ok(Reply::Int(len))
}

pub fn zunionstore_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zstore_generic(srv, cid, false)
}

pub fn zinterstore_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    zstore_generic(srv, cid, true)
}
