//! Bit operations over string values: BITCOUNT, BITPOS, BITOP, GETBIT,
//! SETBIT and the BITFIELD machine.

use bytes::Bytes;

use crate::notify::NOTIFY_STRING;
use crate::resp::Reply;
use crate::server::Server;
use crate::types::{ErrorKind, Object, ServerError, ServerResult, StrVal, Value};
use crate::util::parse_i64;

/// 512 MB value cap puts bit offsets below 2^32.
const MAX_BIT_OFFSET: i64 = 4 * 1024 * 1024 * 1024 - 1;

pub fn popcount(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}

fn bad_bit_offset() -> ServerError {
    ServerError::new(ErrorKind::Generic, "bit offset is not an integer or out of range")
}

fn parse_bit_offset(arg: &[u8]) -> ServerResult<u64> {
    let n = parse_i64(arg).map_err(|_| bad_bit_offset())?;
    if !(0..=MAX_BIT_OFFSET).contains(&n) {
        return Err(bad_bit_offset());
    }
    Ok(n as u64)
}

/// Fetch a copy of the string bytes at `key` (empty when missing).
fn string_copy(srv: &mut Server, dbid: usize, key: &Bytes) -> ServerResult<Vec<u8>> {
    srv.expire_if_needed(dbid, key);
    match srv.dbs[dbid].dict.get(key) {
        Some(obj) => match &obj.value {
            Value::Str(s) => Ok(s.to_bytes().to_vec()),
            _ => Err(ServerError::wrong_type()),
        },
        None => Ok(Vec::new()),
    }
}

/// Store mutated bytes back, creating or overwriting the string value.
fn store_string(srv: &mut Server, dbid: usize, key: &Bytes, bytes: Vec<u8>, event: &str) {
    let now = srv.mstime;
    match srv.dbs[dbid].dict.get_mut(key) {
        Some(obj) => {
            obj.value = Value::Str(StrVal::Raw(Bytes::from(bytes)));
            obj.dirty = true;
            obj.lru = now;
        }
        None => {
            srv.dbs[dbid].add(
                key.clone(),
                Object::new(Value::Str(StrVal::Raw(Bytes::from(bytes))), now),
            );
        }
    }
    srv.signal_modified(dbid, key);
    srv.notify_keyspace_event(NOTIFY_STRING, event, key, dbid);
}

/// Normalize [start, end] byte indexes (negative = from the end) against
/// `len`; `None` when the range is empty.
fn normalize_range(len: usize, mut start: i64, mut end: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if start < 0 {
        start += len;
    }
    if end < 0 {
        end += len;
    }
    start = start.max(0);
    if len == 0 || start > end || start >= len {
        return None;
    }
    end = end.min(len - 1);
    Some((start as usize, end as usize))
}

pub fn bitcount_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let bytes = string_copy(srv, dbid, &argv[1])?;
    let (start, end) = match argv.len() {
        2 => (0i64, -1i64),
        4 => (parse_i64(&argv[2])?, parse_i64(&argv[3])?),
        _ => return Err(ServerError::syntax()),
    };
    Ok(Reply::Int(match normalize_range(bytes.len(), start, end) {
        Some((s, e)) => popcount(&bytes[s..=e]) as i64,
        None => 0,
    }))
}

pub fn bitpos_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let bit = match parse_i64(&argv[2])? {
        0 => false,
        1 => true,
        _ => {
            return Err(ServerError::new(
                ErrorKind::Generic,
                "The bit argument must be 1 or 0.",
            ))
        }
    };
    let bytes = string_copy(srv, dbid, &argv[1])?;
    let end_given = argv.len() >= 5;
    let (start, end) = match argv.len() {
        3 => (0i64, -1i64),
        4 => (parse_i64(&argv[3])?, -1i64),
        5 => (parse_i64(&argv[3])?, parse_i64(&argv[4])?),
        _ => return Err(ServerError::syntax()),
    };

    if bytes.is_empty() {
        // A missing key is an endless run of zero bits.
        return Ok(Reply::Int(if bit { -1 } else { 0 }));
    }
    let Some((s, e)) = normalize_range(bytes.len(), start, end) else {
        return Ok(Reply::Int(-1));
    };
    for (i, &byte) in bytes[s..=e].iter().enumerate() {
        let probe = if bit { byte } else { !byte };
        if probe != 0 {
            let bitpos = probe.leading_zeros() as usize;
            return Ok(Reply::Int(((s + i) * 8 + bitpos) as i64));
        }
    }
    // Looking for a clear bit with an open-ended range: the first bit past
    // the string qualifies, since the value is conceptually zero-padded.
    if !bit && !end_given {
        return Ok(Reply::Int((bytes.len() * 8) as i64));
    }
    Ok(Reply::Int(-1))
}

pub fn getbit_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let offset = parse_bit_offset(&argv[2])?;
    let bytes = string_copy(srv, dbid, &argv[1])?;
    let byte = (offset >> 3) as usize;
    let bit = 7 - (offset & 7);
    Ok(Reply::Int(if byte < bytes.len() {
        ((bytes[byte] >> bit) & 1) as i64
    } else {
        0
    }))
}

pub fn setbit_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();
    let offset = parse_bit_offset(&argv[2])?;
    let value = match parse_i64(&argv[3])? {
        0 => 0u8,
        1 => 1u8,
        _ => {
            return Err(ServerError::new(
                ErrorKind::Generic,
                "bit is not an integer or out of range",
            ))
        }
    };
    let mut bytes = string_copy(srv, dbid, &key)?;
    let byte = (offset >> 3) as usize;
    if byte >= bytes.len() {
        bytes.resize(byte + 1, 0);
    }
    let bit = 7 - (offset & 7);
    let old = (bytes[byte] >> bit) & 1;
    bytes[byte] = (bytes[byte] & !(1 << bit)) | (value << bit);
    store_string(srv, dbid, &key, bytes, "setbit");
    Ok(Reply::Int(old as i64))
}

pub fn bitop_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let op = argv[1].to_ascii_uppercase();
    let dest = argv[2].clone();
    let srckeys = &argv[3..];

    if op == b"NOT" && srckeys.len() != 1 {
        return Err(ServerError::new(
            ErrorKind::Generic,
            "BITOP NOT must be called with a single source key.",
        ));
    }
    let mut sources = Vec::with_capacity(srckeys.len());
    for key in srckeys {
        sources.push(string_copy(srv, dbid, key)?);
    }
    let maxlen = sources.iter().map(|s| s.len()).max().unwrap_or(0);

    let result: Vec<u8> = match op.as_slice() {
        b"NOT" => sources[0].iter().map(|b| !b).collect(),
        b"AND" | b"OR" | b"XOR" => {
            let mut out = vec![0u8; maxlen];
            for (i, slot) in out.iter_mut().enumerate() {
                let mut acc: Option<u8> = None;
                for src in &sources {
                    let byte = src.get(i).copied().unwrap_or(0);
                    acc = Some(match (acc, op.as_slice()) {
                        (None, _) => byte,
                        (Some(a), b"AND") => a & byte,
                        (Some(a), b"OR") => a | byte,
                        (Some(a), _) => a ^ byte,
                    });
                }
                *slot = acc.unwrap_or(0);
            }
            out
        }
        _ => return Err(ServerError::syntax()),
    };

    let len = result.len() as i64;
    if result.is_empty() {
        if srv.db_delete_key(dbid, &dest) {
            srv.signal_modified(dbid, &dest);
            srv.notify_keyspace_event(crate::notify::NOTIFY_GENERIC, "del", &dest, dbid);
        }
    } else {
        srv.dbs[dbid].remove_key(&dest);
        srv.dbs[dbid].remove_cold(&dest);
        store_string(srv, dbid, &dest, result, "set");
    }
    Ok(Reply::Int(len))
}

// ---------------------------------------------------------------- bitfield

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overflow {
    Wrap,
    Sat,
    Fail,
}

#[derive(Debug, Clone, Copy)]
struct FieldType {
    signed: bool,
    bits: u8,
}

fn parse_field_type(arg: &[u8]) -> ServerResult<FieldType> {
    let err = || ServerError::new(
        ErrorKind::Generic,
        "Invalid bitfield type. Use something like i16 u8. Note that u64 is not supported but i64 is.",
    );
    let (signed, digits) = match arg.first() {
        Some(b'i') => (true, &arg[1..]),
        Some(b'u') => (false, &arg[1..]),
        _ => return Err(err()),
    };
    let bits = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u8>().ok())
        .ok_or_else(err)?;
    let max = if signed { 64 } else { 63 };
    if bits == 0 || bits > max {
        return Err(err());
    }
    Ok(FieldType { signed, bits })
}

/// `#n` offsets address the n-th field of this width.
fn parse_field_offset(arg: &[u8], bits: u8) -> ServerResult<u64> {
    let (mult, digits): (u64, &[u8]) = if arg.first() == Some(&b'#') {
        (bits as u64, &arg[1..])
    } else {
        (1, arg)
    };
    let n = parse_i64(digits).map_err(|_| bad_bit_offset())?;
    if n < 0 {
        return Err(bad_bit_offset());
    }
    let offset = (n as u64).checked_mul(mult).ok_or_else(bad_bit_offset)?;
    if offset.saturating_add(bits as u64) > (MAX_BIT_OFFSET as u64 + 1) {
        return Err(bad_bit_offset());
    }
    Ok(offset)
}

fn get_raw(bytes: &[u8], offset: u64, bits: u8) -> u64 {
    let mut value = 0u64;
    for i in 0..bits as u64 {
        let pos = offset + i;
        let byte = (pos >> 3) as usize;
        let bit = 7 - (pos & 7);
        let b = if byte < bytes.len() { (bytes[byte] >> bit) & 1 } else { 0 };
        value = (value << 1) | b as u64;
    }
    value
}

fn set_raw(bytes: &mut Vec<u8>, offset: u64, bits: u8, value: u64) {
    let last_byte = ((offset + bits as u64 - 1) >> 3) as usize;
    if last_byte >= bytes.len() {
        bytes.resize(last_byte + 1, 0);
    }
    for i in 0..bits as u64 {
        let pos = offset + i;
        let byte = (pos >> 3) as usize;
        let bit = 7 - (pos & 7);
        let v = ((value >> (bits as u64 - 1 - i)) & 1) as u8;
        bytes[byte] = (bytes[byte] & !(1 << bit)) | (v << bit);
    }
}

fn field_to_i64(raw: u64, ft: FieldType) -> i64 {
    if ft.signed {
        if ft.bits == 64 {
            raw as i64
        } else if raw & (1 << (ft.bits - 1)) != 0 {
            // Sign extend.
            (raw | (u64::MAX << ft.bits)) as i64
        } else {
            raw as i64
        }
    } else {
        raw as i64
    }
}

/// Apply the overflow policy to `current + incr` (or a plain store when
/// `incr_mode` is false); `None` means FAIL suppressed the write.
fn apply_overflow(
    current: i64,
    operand: i64,
    ft: FieldType,
    overflow: Overflow,
    incr_mode: bool,
) -> Option<i64> {
    let wide = if incr_mode { current as i128 + operand as i128 } else { operand as i128 };
    let (min, max): (i128, i128) = if ft.signed {
        (-(1i128 << (ft.bits - 1)), (1i128 << (ft.bits - 1)) - 1)
    } else {
        (0, (1i128 << ft.bits) - 1)
    };
    if wide >= min && wide <= max {
        return Some(wide as i64);
    }
    match overflow {
        Overflow::Fail => None,
        Overflow::Sat => Some(if wide < min { min as i64 } else { max as i64 }),
        Overflow::Wrap => {
            let span = 1i128 << ft.bits;
            let wrapped = ((wide - min).rem_euclid(span)) + min;
            Some(wrapped as i64)
        }
    }
}

pub fn bitfield_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let dbid = srv.client(cid).db;
    let key = argv[1].clone();

    enum Op {
        Get(FieldType, u64),
        Set(FieldType, u64, i64),
        IncrBy(FieldType, u64, i64),
    }

    let mut ops: Vec<(Op, Overflow)> = Vec::new();
    let mut overflow = Overflow::Wrap;
    let mut i = 2;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"OVERFLOW" if i + 1 < argv.len() => {
                overflow = match argv[i + 1].to_ascii_uppercase().as_slice() {
                    b"WRAP" => Overflow::Wrap,
                    b"SAT" => Overflow::Sat,
                    b"FAIL" => Overflow::Fail,
                    _ => {
                        return Err(ServerError::new(
                            ErrorKind::Generic,
                            "Invalid OVERFLOW type specified",
                        ))
                    }
                };
                i += 2;
            }
            b"GET" if i + 2 < argv.len() => {
                let ft = parse_field_type(&argv[i + 1])?;
                let off = parse_field_offset(&argv[i + 2], ft.bits)?;
                ops.push((Op::Get(ft, off), overflow));
                i += 3;
            }
            b"SET" if i + 3 < argv.len() => {
                let ft = parse_field_type(&argv[i + 1])?;
                let off = parse_field_offset(&argv[i + 2], ft.bits)?;
                let v = parse_i64(&argv[i + 3])?;
                ops.push((Op::Set(ft, off, v), overflow));
                i += 4;
            }
            b"INCRBY" if i + 3 < argv.len() => {
                let ft = parse_field_type(&argv[i + 1])?;
                let off = parse_field_offset(&argv[i + 2], ft.bits)?;
                let v = parse_i64(&argv[i + 3])?;
                ops.push((Op::IncrBy(ft, off, v), overflow));
                i += 4;
            }
            _ => return Err(ServerError::syntax()),
        }
    }

    let mut bytes = string_copy(srv, dbid, &key)?;
    let mut replies = Vec::with_capacity(ops.len());
    let mut wrote = false;
    for (op, overflow) in ops {
        match op {
            Op::Get(ft, off) => {
                let cur = field_to_i64(get_raw(&bytes, off, ft.bits), ft);
                replies.push(Reply::Int(cur));
            }
            Op::Set(ft, off, v) => {
                let cur = field_to_i64(get_raw(&bytes, off, ft.bits), ft);
                match apply_overflow(cur, v, ft, overflow, false) {
                    Some(stored) => {
                        set_raw(&mut bytes, off, ft.bits, stored as u64);
                        wrote = true;
                        replies.push(Reply::Int(cur));
                    }
                    None => replies.push(Reply::Nil),
                }
            }
            Op::IncrBy(ft, off, v) => {
                let cur = field_to_i64(get_raw(&bytes, off, ft.bits), ft);
                match apply_overflow(cur, v, ft, overflow, true) {
                    Some(next) => {
                        set_raw(&mut bytes, off, ft.bits, next as u64);
                        wrote = true;
                        replies.push(Reply::Int(next));
                    }
                    None => replies.push(Reply::Nil),
                }
            }
        }
    }

    if wrote {
        store_string(srv, dbid, &key, bytes, "setbit");
    }
    Ok(Reply::Array(replies))
}
