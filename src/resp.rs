//! Reply representation and RESP2/RESP3 encoding.
//!
//! Handlers build a [`Reply`] tree; the connection layer serializes it with
//! the protocol version the client negotiated through `HELLO`.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::ServerError;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`
    Ok,
    Simple(Cow<'static, str>),
    Error(ServerError),
    Int(i64),
    Bulk(Bytes),
    /// Null bulk: `$-1` in RESP2, `_` in RESP3.
    Nil,
    Array(Vec<Reply>),
    /// `%` in RESP3, flattened array in RESP2.
    Map(Vec<(Reply, Reply)>),
    /// `~` in RESP3, plain array in RESP2.
    Set(Vec<Reply>),
    /// `,` in RESP3, bulk string in RESP2.
    Double(f64),
    /// `>` push frame in RESP3, plain array in RESP2 (pubsub traffic).
    Push(Vec<Reply>),
    /// The handler already replied (or deliberately replies later).
    None,
}

impl Reply {
    pub fn bulk(bytes: impl Into<Bytes>) -> Reply {
        Reply::Bulk(bytes.into())
    }

    pub fn simple(s: impl Into<Cow<'static, str>>) -> Reply {
        Reply::Simple(s.into())
    }
}

/// Formats a double the way the wire expects: integral values print without
/// a fractional part, infinities print as `inf`/`-inf`.
pub fn format_double(v: f64) -> String {
    if v.is_infinite() {
        return if v > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if v == v.trunc() && v.abs() < 1e17 {
        itoa::Buffer::new().format(v as i64).to_string()
    } else {
        ryu::Buffer::new().format(v).to_string()
    }
}

fn put_len(out: &mut BytesMut, marker: u8, len: usize) {
    out.put_u8(marker);
    out.put_slice(itoa::Buffer::new().format(len).as_bytes());
    out.put_slice(b"\r\n");
}

/// Serialize one reply for the given protocol version (2 or 3).
pub fn encode_reply(out: &mut BytesMut, reply: &Reply, protover: u8) {
    match reply {
        Reply::Ok => out.put_slice(b"+OK\r\n"),
        Reply::Simple(s) => {
            out.put_u8(b'+');
            out.put_slice(s.as_bytes());
            out.put_slice(b"\r\n");
        }
        Reply::Error(e) => {
            out.put_u8(b'-');
            out.put_slice(e.wire().as_bytes());
            out.put_slice(b"\r\n");
        }
        Reply::Int(n) => {
            out.put_u8(b':');
            out.put_slice(itoa::Buffer::new().format(*n).as_bytes());
            out.put_slice(b"\r\n");
        }
        Reply::Bulk(b) => {
            put_len(out, b'$', b.len());
            out.put_slice(b);
            out.put_slice(b"\r\n");
        }
        Reply::Nil => {
            if protover >= 3 {
                out.put_slice(b"_\r\n");
            } else {
                out.put_slice(b"$-1\r\n");
            }
        }
        Reply::Array(items) => {
            put_len(out, b'*', items.len());
            for item in items {
                encode_reply(out, item, protover);
            }
        }
        Reply::Map(pairs) => {
            if protover >= 3 {
                put_len(out, b'%', pairs.len());
            } else {
                put_len(out, b'*', pairs.len() * 2);
            }
            for (k, v) in pairs {
                encode_reply(out, k, protover);
                encode_reply(out, v, protover);
            }
        }
        Reply::Set(items) => {
            put_len(out, if protover >= 3 { b'~' } else { b'*' }, items.len());
            for item in items {
                encode_reply(out, item, protover);
            }
        }
        Reply::Double(v) => {
            if protover >= 3 {
                out.put_u8(b',');
                out.put_slice(format_double(*v).as_bytes());
                out.put_slice(b"\r\n");
            } else {
                let s = format_double(*v);
                put_len(out, b'$', s.len());
                out.put_slice(s.as_bytes());
                out.put_slice(b"\r\n");
            }
        }
        Reply::Push(items) => {
            put_len(out, if protover >= 3 { b'>' } else { b'*' }, items.len());
            for item in items {
                encode_reply(out, item, protover);
            }
        }
        Reply::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    fn enc(reply: &Reply, protover: u8) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_reply(&mut out, reply, protover);
        out.to_vec()
    }

    #[test]
    fn basic_frames() {
        assert_eq!(enc(&Reply::Ok, 2), b"+OK\r\n");
        assert_eq!(enc(&Reply::Int(-3), 2), b":-3\r\n");
        assert_eq!(enc(&Reply::bulk(&b"ab"[..]), 2), b"$2\r\nab\r\n");
        assert_eq!(enc(&Reply::Nil, 2), b"$-1\r\n");
        assert_eq!(enc(&Reply::Nil, 3), b"_\r\n");
        assert_eq!(
            enc(&Reply::Error(ServerError::new(ErrorKind::NoPerm, "nope")), 2),
            b"-NOPERM nope\r\n"
        );
    }

    #[test]
    fn aggregate_frames_downgrade_to_resp2() {
        let map = Reply::Map(vec![(Reply::bulk(&b"a"[..]), Reply::Int(1))]);
        assert_eq!(enc(&map, 3), b"%1\r\n$1\r\na\r\n:1\r\n");
        assert_eq!(enc(&map, 2), b"*2\r\n$1\r\na\r\n:1\r\n");

        let push = Reply::Push(vec![Reply::bulk(&b"invalidate"[..])]);
        assert_eq!(enc(&push, 3), b">1\r\n$10\r\ninvalidate\r\n");
        assert_eq!(enc(&push, 2), b"*1\r\n$10\r\ninvalidate\r\n");
    }

    #[test]
    fn double_formatting() {
        assert_eq!(format_double(1.0), "1");
        assert_eq!(format_double(1.5), "1.5");
        assert_eq!(format_double(f64::INFINITY), "inf");
        assert_eq!(format_double(f64::NEG_INFINITY), "-inf");
        assert_eq!(enc(&Reply::Double(2.5), 3), b",2.5\r\n");
        assert_eq!(enc(&Reply::Double(2.5), 2), b"$3\r\n2.5\r\n");
    }
}
