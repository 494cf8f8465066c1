//! Restartable parsing of client requests.
//!
//! Requests arrive as RESP multibulk frames (`*N` then `$len` bulks). The
//! parser keeps combine partial-parse state per connection so a frame split
//! across reads picks up where it left off: `parse` returns `Ok(None)` when
//! the buffer is short and must be re-fed once more bytes arrive.
//!
//! A whitespace-separated inline fallback is accepted for humans poking at
//! the port; it carries no guarantees.

use bytes::{Buf, Bytes, BytesMut};
use combine::{
    error::StreamError,
    parser::{
        byte::{byte, crlf},
        combinator::{any_send_sync_partial_state, AnySendSyncPartialState},
        range::{recognize, take},
        repeat::count_min_max,
    },
    satisfy, skip_many,
    stream::{PartialStream, RangeStream, StreamErrorFor},
    ParseError, Parser,
};

use crate::types::{ErrorKind, ServerError, ServerResult};

/// Hard caps mirroring the wire limits: bulks up to 512 MB, frames up to
/// 1M arguments, inline lines up to 64 KB.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_MULTIBULK: i64 = 1024 * 1024;
const MAX_INLINE_LEN: usize = 64 * 1024;

fn line<'a, I>() -> impl Parser<I, Output = Vec<u8>, PartialState = AnySendSyncPartialState> + use<'a, I>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    // The recognized range has to be converted to an owned `Vec<u8>` before
    // `.skip(crlf())`: combine's sequencing combinators stash the first
    // parser's output in `PartialState` in case the second parser needs a
    // restart, and `any_send_sync_partial_state` requires that stashed value
    // to be `'static`, which a borrowed `&'a [u8]` never is.
    any_send_sync_partial_state(
        recognize(skip_many(satisfy(|b: u8| b != b'\r')))
            .map(|b: &[u8]| b.to_vec())
            .skip(crlf()),
    )
}

fn number<'a, I>() -> impl Parser<I, Output = i64, PartialState = AnySendSyncPartialState> + use<'a, I>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    any_send_sync_partial_state(line().and_then(|l: Vec<u8>| {
        std::str::from_utf8(&l)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| StreamErrorFor::<I>::message_static_message("expected integer"))
    }))
}

fn bulk<'a, I>() -> impl Parser<I, Output = Vec<u8>, PartialState = AnySendSyncPartialState> + use<'a, I>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    any_send_sync_partial_state(
        byte(b'$')
            .with(number().and_then(|len| {
                if (0..=MAX_BULK_LEN).contains(&len) {
                    Ok(len)
                } else {
                    Err(StreamErrorFor::<I>::message_static_message("invalid bulk length"))
                }
            }))
            .then_partial(|&mut len| {
                take(len as usize).map(|b: &[u8]| b.to_vec()).skip(crlf())
            }),
    )
}

fn multibulk<'a, I>(
) -> impl Parser<I, Output = Vec<Vec<u8>>, PartialState = AnySendSyncPartialState> + use<'a, I>
where
    I: RangeStream<Token = u8, Range = &'a [u8]>,
    I::Error: ParseError<I::Token, I::Range, I::Position>,
{
    any_send_sync_partial_state(
        byte(b'*')
            .with(number().and_then(|n| {
                if (0..=MAX_MULTIBULK).contains(&n) {
                    Ok(n)
                } else {
                    Err(StreamErrorFor::<I>::message_static_message(
                        "invalid multibulk length",
                    ))
                }
            }))
            .then_partial(|&mut n| count_min_max(n as usize, n as usize, bulk())),
    )
}

#[derive(Default)]
pub struct RequestParser {
    state: AnySendSyncPartialState,
    /// True while the partial state holds a half-consumed multibulk frame;
    /// the inline fallback must not fire then.
    in_multibulk: bool,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser::default()
    }

    /// Extract the next complete request from `buf`, consuming its bytes.
    ///
    /// `Ok(None)` means more input is needed. An empty argv (blank inline
    /// line) should simply be skipped by the caller.
    pub fn parse(&mut self, buf: &mut BytesMut) -> ServerResult<Option<Vec<Bytes>>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if self.in_multibulk || buf[0] == b'*' {
            self.parse_multibulk(buf)
        } else {
            self.parse_inline(buf)
        }
    }

    fn parse_multibulk(&mut self, buf: &mut BytesMut) -> ServerResult<Option<Vec<Bytes>>> {
        let (opt, removed) = {
            let buffer = &buf[..];
            let mut stream = combine::easy::Stream(PartialStream(buffer));
            match combine::stream::decode(multibulk(), &mut stream, &mut self.state) {
                Ok(x) => x,
                Err(err) => {
                    let err = err
                        .map_position(|pos| pos.translate_position(buffer))
                        .map_range(|range| format!("{:?}", range))
                        .to_string();
                    self.state = AnySendSyncPartialState::default();
                    self.in_multibulk = false;
                    return Err(ServerError::new(
                        ErrorKind::Protocol,
                        format!("Protocol error: {}", err.replace("\r\n", " ")),
                    ));
                }
            }
        };
        buf.advance(removed);
        match opt {
            Some(argv) => {
                self.in_multibulk = false;
                Ok(Some(argv.into_iter().map(Bytes::from).collect()))
            }
            None => {
                self.in_multibulk = true;
                Ok(None)
            }
        }
    }

    fn parse_inline(&mut self, buf: &mut BytesMut) -> ServerResult<Option<Vec<Bytes>>> {
        let newline = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => {
                if buf.len() > MAX_INLINE_LEN {
                    return Err(ServerError::new(
                        ErrorKind::Protocol,
                        "Protocol error: too big inline request",
                    ));
                }
                return Ok(None);
            }
        };
        let mut line = buf.split_to(newline + 1);
        line.truncate(newline);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        let frozen = line.freeze();
        let mut argv = Vec::new();
        let mut start = None;
        for (i, &b) in frozen.iter().enumerate() {
            if b == b' ' || b == b'\t' {
                if let Some(s) = start.take() {
                    argv.push(frozen.slice(s..i));
                }
            } else if start.is_none() {
                start = Some(i);
            }
        }
        if let Some(s) = start {
            argv.push(frozen.slice(s..));
        }
        Ok(Some(argv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut RequestParser, bytes: &[u8]) -> (BytesMut, Option<Vec<Bytes>>) {
        let mut buf = BytesMut::from(bytes);
        let out = parser.parse(&mut buf).unwrap();
        (buf, out)
    }

    #[test]
    fn whole_multibulk_in_one_read() {
        let mut p = RequestParser::new();
        let (rest, out) = feed(&mut p, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
        assert_eq!(out, Some(vec![Bytes::from_static(b"GET"), Bytes::from_static(b"a")]));
        assert!(rest.is_empty());
    }

    #[test]
    fn split_frame_resumes() {
        let mut p = RequestParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nSE"[..]);
        assert_eq!(p.parse(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"T\r\n$1\r\nk\r\n");
        let out = p.parse(&mut buf).unwrap();
        assert_eq!(out, Some(vec![Bytes::from_static(b"SET"), Bytes::from_static(b"k")]));
        assert!(buf.is_empty());
    }

    #[test]
    fn binary_safe_bulks() {
        let mut p = RequestParser::new();
        let (_, out) = feed(&mut p, b"*1\r\n$4\r\na\r\nb\r\n");
        assert_eq!(out, Some(vec![Bytes::from_static(b"a\r\nb")]));
    }

    #[test]
    fn pipelined_requests_come_out_one_at_a_time() {
        let mut p = RequestParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        assert!(p.parse(&mut buf).unwrap().is_some());
        assert!(p.parse(&mut buf).unwrap().is_some());
        assert_eq!(p.parse(&mut buf).unwrap(), None);
    }

    #[test]
    fn inline_fallback() {
        let mut p = RequestParser::new();
        let (_, out) = feed(&mut p, b"set  foo   bar\r\n");
        assert_eq!(
            out,
            Some(vec![
                Bytes::from_static(b"set"),
                Bytes::from_static(b"foo"),
                Bytes::from_static(b"bar"),
            ])
        );
    }

    #[test]
    fn blank_inline_line_yields_empty_argv() {
        let mut p = RequestParser::new();
        let (_, out) = feed(&mut p, b"\r\n");
        assert_eq!(out, Some(vec![]));
    }

    #[test]
    fn negative_bulk_length_is_a_protocol_error() {
        let mut p = RequestParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n$-1\r\n"[..]);
        assert!(p.parse(&mut buf).is_err());
    }

    #[test]
    fn oversized_multibulk_count_is_rejected() {
        let mut p = RequestParser::new();
        let mut buf = BytesMut::from(&b"*99999999\r\n"[..]);
        assert!(p.parse(&mut buf).is_err());
    }
}
