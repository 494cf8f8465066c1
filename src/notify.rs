//! Keyspace event notifications.
//!
//! Mutations publish to `__keyspace@<db>__:<key>` (payload = event name)
//! and `__keyevent@<db>__:<event>` (payload = key), filtered by the class
//! bitmask configured with `--notify-keyspace-events`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::server::Server;
use crate::types::Key;

pub const NOTIFY_KEYSPACE: u32 = 1 << 0; // K
pub const NOTIFY_KEYEVENT: u32 = 1 << 1; // E
pub const NOTIFY_GENERIC: u32 = 1 << 2; // g
pub const NOTIFY_STRING: u32 = 1 << 3; // $
pub const NOTIFY_LIST: u32 = 1 << 4; // l
pub const NOTIFY_SET: u32 = 1 << 5; // s
pub const NOTIFY_HASH: u32 = 1 << 6; // h
pub const NOTIFY_ZSET: u32 = 1 << 7; // z
pub const NOTIFY_EXPIRED: u32 = 1 << 8; // x
pub const NOTIFY_EVICTED: u32 = 1 << 9; // e
pub const NOTIFY_STREAM: u32 = 1 << 10; // t
pub const NOTIFY_KEY_MISS: u32 = 1 << 11; // m
pub const NOTIFY_ALL: u32 = NOTIFY_GENERIC
    | NOTIFY_STRING
    | NOTIFY_LIST
    | NOTIFY_SET
    | NOTIFY_HASH
    | NOTIFY_ZSET
    | NOTIFY_EXPIRED
    | NOTIFY_EVICTED
    | NOTIFY_STREAM; // A (everything but key-miss)

/// Parse a class string like `"KEA"`; `None` on an unknown character.
pub fn parse_notify_flags(s: &str) -> Option<u32> {
    let mut flags = 0;
    for c in s.chars() {
        flags |= match c {
            'K' => NOTIFY_KEYSPACE,
            'E' => NOTIFY_KEYEVENT,
            'g' => NOTIFY_GENERIC,
            '$' => NOTIFY_STRING,
            'l' => NOTIFY_LIST,
            's' => NOTIFY_SET,
            'h' => NOTIFY_HASH,
            'z' => NOTIFY_ZSET,
            'x' => NOTIFY_EXPIRED,
            'e' => NOTIFY_EVICTED,
            't' => NOTIFY_STREAM,
            'm' => NOTIFY_KEY_MISS,
            'A' => NOTIFY_ALL,
            _ => return None,
        };
    }
    Some(flags)
}

/// Inverse of `parse_notify_flags`, used by introspection and tests.
pub fn notify_flags_to_string(flags: u32) -> String {
    let mut out = String::new();
    if flags & NOTIFY_ALL == NOTIFY_ALL {
        out.push('A');
    } else {
        for (bit, c) in [
            (NOTIFY_GENERIC, 'g'),
            (NOTIFY_STRING, '$'),
            (NOTIFY_LIST, 'l'),
            (NOTIFY_SET, 's'),
            (NOTIFY_HASH, 'h'),
            (NOTIFY_ZSET, 'z'),
            (NOTIFY_EXPIRED, 'x'),
            (NOTIFY_EVICTED, 'e'),
            (NOTIFY_STREAM, 't'),
        ] {
            if flags & bit != 0 {
                out.push(c);
            }
        }
    }
    if flags & NOTIFY_KEY_MISS != 0 {
        out.push('m');
    }
    if flags & NOTIFY_KEYSPACE != 0 {
        out.push('K');
    }
    if flags & NOTIFY_KEYEVENT != 0 {
        out.push('E');
    }
    out
}

fn channel(prefix: &str, dbid: usize, suffix: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(prefix.len() + 24 + suffix.len());
    buf.put_slice(prefix.as_bytes());
    buf.put_slice(itoa::Buffer::new().format(dbid).as_bytes());
    buf.put_slice(b"__:");
    buf.put_slice(suffix);
    buf.freeze()
}

impl Server {
    /// Publish a keyspace event if its class is enabled. Publish order for
    /// one key follows the mutation order since this runs synchronously
    /// inside the mutation path.
    pub fn notify_keyspace_event(&mut self, class: u32, event: &str, key: &Key, dbid: usize) {
        let flags = self.notify_flags;
        if flags & class == 0 {
            return;
        }
        if flags & NOTIFY_KEYSPACE != 0 {
            let chan = channel("__keyspace@", dbid, key);
            self.publish_message(&chan, Bytes::copy_from_slice(event.as_bytes()));
        }
        if flags & NOTIFY_KEYEVENT != 0 {
            let chan = channel("__keyevent@", dbid, event.as_bytes());
            self.publish_message(&chan, key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print_round_trip() {
        let flags = parse_notify_flags("KEA").unwrap();
        assert_ne!(flags & NOTIFY_KEYSPACE, 0);
        assert_ne!(flags & NOTIFY_KEYEVENT, 0);
        assert_eq!(flags & NOTIFY_KEY_MISS, 0);
        assert_eq!(notify_flags_to_string(flags), "AKE");
    }

    #[test]
    fn unknown_class_rejected() {
        assert!(parse_notify_flags("Kq").is_none());
        assert_eq!(parse_notify_flags(""), Some(0));
    }

    #[test]
    fn channel_names() {
        assert_eq!(&channel("__keyspace@", 0, b"foo")[..], b"__keyspace@0__:foo");
        assert_eq!(&channel("__keyevent@", 3, b"expired")[..], b"__keyevent@3__:expired");
    }
}
