//! The slow log and the fat log: bounded rings of expensive commands and
//! oversized replies, newest first. One implementation serves both; only
//! the threshold semantics differ (microseconds vs reply bytes).

use bytes::Bytes;

use crate::resp::Reply;
use crate::server::Server;
use crate::types::{ErrorKind, ServerError, ServerResult};
use std::collections::VecDeque;

/// Keep at most this many arguments per logged entry...
const ENTRY_MAX_ARGC: usize = 32;
/// ...and at most this many bytes per argument.
const ENTRY_MAX_STRING: usize = 128;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: u64,
    /// Unix time (seconds) the entry was created.
    pub time: i64,
    /// Duration in microseconds (slow log) or reply size in bytes (fat log).
    pub statistic: i64,
    pub argv: Vec<Bytes>,
    pub peer_id: String,
    pub client_name: Bytes,
}

#[derive(Debug)]
pub struct BoundedLog {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    pub threshold: i64,
    pub max_len: usize,
}

impl BoundedLog {
    pub fn new(threshold: i64, max_len: usize) -> Self {
        BoundedLog { entries: VecDeque::new(), next_id: 0, threshold, max_len }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    fn trim_argv(argv: &[Bytes]) -> Vec<Bytes> {
        let keep = argv.len().min(ENTRY_MAX_ARGC);
        let mut out = Vec::with_capacity(keep);
        for (i, arg) in argv.iter().take(keep).enumerate() {
            if keep < argv.len() && i == keep - 1 {
                out.push(Bytes::from(format!(
                    "... ({} more arguments)",
                    argv.len() - keep + 1
                )));
            } else if arg.len() > ENTRY_MAX_STRING {
                let mut v = arg[..ENTRY_MAX_STRING].to_vec();
                v.extend_from_slice(
                    format!("... ({} more bytes)", arg.len() - ENTRY_MAX_STRING).as_bytes(),
                );
                out.push(Bytes::from(v));
            } else {
                out.push(arg.clone());
            }
        }
        out
    }

    /// Insert when `statistic` crosses the threshold (negative threshold
    /// disables the log), then trim the tail to `max_len`.
    pub fn push_if_needed(
        &mut self,
        argv: &[Bytes],
        statistic: i64,
        peer_id: String,
        client_name: Bytes,
        now_s: i64,
    ) {
        if self.threshold >= 0 && statistic >= self.threshold {
            let id = self.next_id;
            self.next_id += 1;
            self.entries.push_front(LogEntry {
                id,
                time: now_s,
                statistic,
                argv: Self::trim_argv(argv),
                peer_id,
                client_name,
            });
        }
        while self.entries.len() > self.max_len {
            self.entries.pop_back();
        }
    }
}

/// `SLOWLOG` and `FATLOG` share subcommands: GET [count], LEN, RESET, HELP.
pub fn slowfatlog_command(srv: &mut Server, cid: u64) -> ServerResult<Reply> {
    let argv = srv.argv(cid);
    let is_slow = argv[0].eq_ignore_ascii_case(b"slowlog");
    let sub = argv[1].to_ascii_uppercase();

    match sub.as_slice() {
        b"HELP" if argv.len() == 2 => {
            let (noun, unit) = if is_slow {
                ("slowlog", "time in microseconds")
            } else {
                ("fatlog", "size in bytes")
            };
            Ok(Reply::Array(vec![
                Reply::simple(format!("GET [<count>] -- Return top <count> entries from the {} (default: 10, -1 means all).", noun)),
                Reply::simple(format!("    Entries are made of: id, timestamp, {}, arguments array, client IP and port, client name", unit)),
                Reply::simple(format!("LEN -- Return the length of the {}.", noun)),
                Reply::simple(format!("RESET -- Reset the {}.", noun)),
            ]))
        }
        b"RESET" if argv.len() == 2 => {
            let log = if is_slow { &mut srv.slowlog } else { &mut srv.fatlog };
            log.reset();
            Ok(Reply::Ok)
        }
        b"LEN" if argv.len() == 2 => {
            let log = if is_slow { &srv.slowlog } else { &srv.fatlog };
            Ok(Reply::Int(log.len() as i64))
        }
        b"GET" if argv.len() <= 3 => {
            let log = if is_slow { &srv.slowlog } else { &srv.fatlog };
            let mut count = 10i64;
            if argv.len() == 3 {
                count = crate::util::parse_i64(&argv[2])?;
                if count < -1 {
                    return Err(ServerError::new(
                        ErrorKind::Generic,
                        "count should be greater than or equal to -1",
                    ));
                }
                if count == -1 {
                    count = log.len() as i64;
                }
            }
            let count = (count as usize).min(log.len());
            let out = log
                .iter()
                .take(count)
                .map(|e| {
                    Reply::Array(vec![
                        Reply::Int(e.id as i64),
                        Reply::Int(e.time),
                        Reply::Int(e.statistic),
                        Reply::Array(e.argv.iter().cloned().map(Reply::Bulk).collect()),
                        Reply::bulk(e.peer_id.clone().into_bytes()),
                        Reply::Bulk(e.client_name.clone()),
                    ])
                })
                .collect();
            Ok(Reply::Array(out))
        }
        _ => Err(ServerError::new(
            ErrorKind::Generic,
            format!(
                "Unknown subcommand or wrong number of arguments for '{}'. Try {} HELP.",
                String::from_utf8_lossy(&argv[1]),
                if is_slow { "SLOWLOG" } else { "FATLOG" },
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn threshold_gates_insertion() {
        let mut log = BoundedLog::new(100, 8);
        log.push_if_needed(&[b("GET"), b("k")], 99, "p".into(), b(""), 0);
        assert!(log.is_empty());
        log.push_if_needed(&[b("GET"), b("k")], 100, "p".into(), b(""), 0);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn negative_threshold_disables() {
        let mut log = BoundedLog::new(-1, 8);
        log.push_if_needed(&[b("GET")], i64::MAX, "p".into(), b(""), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn trims_to_max_len_after_every_insertion() {
        let mut log = BoundedLog::new(0, 3);
        for i in 0..10 {
            log.push_if_needed(&[b("n")], i, "p".into(), b(""), 0);
            assert!(log.len() <= 3);
        }
        assert_eq!(log.len(), 3);
        // Newest first.
        let stats: Vec<_> = log.iter().map(|e| e.statistic).collect();
        assert_eq!(stats, vec![9, 8, 7]);
    }

    #[test]
    fn long_arguments_are_truncated() {
        let mut log = BoundedLog::new(0, 8);
        let big = Bytes::from(vec![b'x'; 500]);
        log.push_if_needed(&[b("SET"), b("k"), big], 1, "p".into(), b(""), 0);
        let entry = log.iter().next().unwrap();
        let arg = &entry.argv[2];
        assert!(arg.len() < 200);
        assert!(arg.ends_with(b"... (372 more bytes)"));
    }

    #[test]
    fn oversized_argv_is_capped_with_marker() {
        let mut log = BoundedLog::new(0, 8);
        let argv: Vec<Bytes> = (0..40).map(|i| b(&format!("a{}", i))).collect();
        log.push_if_needed(&argv, 1, "p".into(), b(""), 0);
        let entry = log.iter().next().unwrap();
        assert_eq!(entry.argv.len(), 32);
        assert_eq!(&entry.argv[31][..], b"... (9 more arguments)");
    }
}
